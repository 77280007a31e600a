//! Task executor
//!
//! Decides what happens to a decoded task once the dispatcher has settled
//! its job status: run it, forward it, park it or drop it.

use std::sync::Arc;

use taskmill_api::{
    DivertedTaskAction, FactoryCapabilities, ForwardingDecision, Headers, TaskInformation,
    TaskMessage, TaskRejectedError,
};
use tracing::{debug, warn};

use crate::engine::ExecutionEngine;
use crate::task::{DispatchContext, WorkerTaskImpl};

pub struct TaskExecutor {
    ctx: Arc<DispatchContext>,
    engine: Arc<dyn ExecutionEngine>,
    capabilities: FactoryCapabilities,
}

impl TaskExecutor {
    pub fn new(
        ctx: Arc<DispatchContext>,
        engine: Arc<dyn ExecutionEngine>,
        capabilities: FactoryCapabilities,
    ) -> Self {
        Self {
            ctx,
            engine,
            capabilities,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    /// Queue the task for execution
    pub fn execute_task(
        &self,
        message: TaskMessage,
        task_information: Arc<TaskInformation>,
        poison: bool,
        headers: Headers,
    ) -> Result<(), TaskRejectedError> {
        debug!(task_id = %message.task_id, classifier = %message.task_classifier, poison, "Submitting task");
        let task = WorkerTaskImpl::new(message, task_information, headers, poison, self.ctx.clone());
        self.engine.submit(Arc::new(task))
    }

    /// Handle a task addressed to another queue
    pub async fn handle_diverted_task(
        &self,
        message: TaskMessage,
        task_information: Arc<TaskInformation>,
        poison: bool,
        headers: Headers,
    ) -> Result<(), TaskRejectedError> {
        let input_queue = self.ctx.input_queue.as_str();

        if let Some(handler) = &self.capabilities.diversion {
            let action = handler
                .handle_diverted_task(&message, input_queue, &headers)
                .await;
            debug!(task_id = %message.task_id, ?action, "Diverted task handler decided");
            return match action {
                DivertedTaskAction::Discard => {
                    self.discard_task(&task_information).await;
                    Ok(())
                }
                DivertedTaskAction::Execute => {
                    self.execute_task(message, task_information, poison, headers)
                }
                DivertedTaskAction::Forward => {
                    self.forward_to_destination(message, &task_information, &headers)
                        .await;
                    Ok(())
                }
                other => {
                    warn!(task_id = %message.task_id, ?other, "Unknown diverted task action, forwarding");
                    self.forward_to_destination(message, &task_information, &headers)
                        .await;
                    Ok(())
                }
            };
        }

        if let Some(evaluator) = &self.capabilities.forwarding {
            match evaluator
                .determine_forwarding_action(&message, input_queue, &headers)
                .await
            {
                ForwardingDecision::Forward { to } => {
                    task_information.increment_response_count(true);
                    self.ctx
                        .callback
                        .forward(&task_information, to.as_deref(), message, &headers)
                        .await;
                }
                ForwardingDecision::Discard => self.discard_task(&task_information).await,
            }
            return Ok(());
        }

        self.forward_to_destination(message, &task_information, &headers)
            .await;
        Ok(())
    }

    /// Park the task on the paused queue
    pub async fn pause_task(
        &self,
        paused_queue: &str,
        message: TaskMessage,
        task_information: &Arc<TaskInformation>,
        headers: &Headers,
    ) {
        task_information.increment_response_count(true);
        self.ctx
            .callback
            .pause(task_information, paused_queue, message, headers)
            .await;
    }

    pub async fn discard_task(&self, task_information: &Arc<TaskInformation>) {
        task_information.increment_response_count(true);
        self.ctx.callback.discard(task_information).await;
    }

    async fn forward_to_destination(
        &self,
        message: TaskMessage,
        task_information: &Arc<TaskInformation>,
        headers: &Headers,
    ) {
        let to = message.to.clone();
        debug!(task_id = %message.task_id, to = ?to, "Forwarding diverted task");
        task_information.increment_response_count(true);
        self.ctx
            .callback
            .forward(task_information, to.as_deref(), message, headers)
            .await;
    }
}
