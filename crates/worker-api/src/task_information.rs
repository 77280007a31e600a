//! Response and acknowledgement accounting for one inbound message

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct ResponseCounts {
    responses: u32,
    finalized: bool,
    acknowledged: u32,
}

/// Tracks how many responses an inbound message produces and how many of
/// them the queue has acknowledged
///
/// The response count grows while a task is producing responses and becomes
/// fixed when the final response is counted. The queue transport
/// acknowledges the inbound message once every counted response has been
/// acknowledged.
#[derive(Debug)]
pub struct TaskInformation {
    inbound_message_id: String,
    counts: Mutex<ResponseCounts>,
}

impl TaskInformation {
    /// Create accounting for an inbound message
    pub fn new(inbound_message_id: impl Into<String>) -> Self {
        Self {
            inbound_message_id: inbound_message_id.into(),
            counts: Mutex::new(ResponseCounts::default()),
        }
    }

    /// Transport reference of the inbound message
    pub fn inbound_message_id(&self) -> &str {
        &self.inbound_message_id
    }

    /// Count one more response, fixing the total when `is_final` is set
    ///
    /// Returns the number of responses counted so far.
    ///
    /// # Panics
    ///
    /// Panics if the count has already been finalized.
    pub fn increment_response_count(&self, is_final: bool) -> u32 {
        let mut counts = self.counts.lock();
        assert!(
            !counts.finalized,
            "response count of message {} incremented after it was finalized",
            self.inbound_message_id
        );
        counts.responses += 1;
        counts.finalized = is_final;
        counts.responses
    }

    /// Count one acknowledged response
    ///
    /// Returns true when the total is known and every response has now been
    /// acknowledged, i.e. the inbound message itself can be acknowledged.
    pub fn increment_acknowledgement_count(&self) -> bool {
        let mut counts = self.counts.lock();
        counts.acknowledged += 1;
        counts.finalized && counts.acknowledged >= counts.responses
    }

    /// Whether the total is known and every response has been acknowledged
    pub fn are_all_responses_acknowledged(&self) -> bool {
        let counts = self.counts.lock();
        counts.finalized && counts.acknowledged >= counts.responses
    }

    /// Number of responses counted so far
    pub fn response_count(&self) -> u32 {
        self.counts.lock().responses
    }

    /// Total number of responses, once known
    pub fn final_response_count(&self) -> Option<u32> {
        let counts = self.counts.lock();
        counts.finalized.then_some(counts.responses)
    }

    /// Number of acknowledged responses
    pub fn acknowledgement_count(&self) -> u32 {
        self.counts.lock().acknowledged
    }
}
