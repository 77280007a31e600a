//! Shared task backlog
//!
//! Producers push without blocking. Consumers wait for an item to become
//! available and then claim it with [`TaskBacklog::try_pop`], which lets an
//! engine claim tasks under its own lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct TaskBacklog<T> {
    items: Mutex<VecDeque<T>>,
    capacity: Option<usize>,
    available: Notify,
    closed: AtomicBool,
}

impl<T> TaskBacklog<T> {
    /// Create a backlog holding at most `capacity` items (`None` = unbounded)
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append an item; gives it back if the backlog is full or closed
    pub fn push(&self, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }
        {
            let mut items = self.items.lock();
            if self.capacity.is_some_and(|capacity| items.len() >= capacity) {
                return Err(item);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait until an item may be available
    ///
    /// Returns false once the backlog is closed.
    pub async fn wait_available(&self) -> bool {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return false;
            }
            if !self.items.lock().is_empty() {
                return true;
            }
            notified.await;
        }
    }

    /// Wait for an item and take it
    pub async fn pop(&self) -> Option<T> {
        while self.wait_available().await {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
        }
        None
    }

    /// Remove every queued item
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Refuse new items and release every waiting consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_bounded_push() {
        let backlog = TaskBacklog::new(Some(2));
        assert!(backlog.push(1).is_ok());
        assert!(backlog.push(2).is_ok());
        assert_eq!(backlog.push(3), Err(3));
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn test_drain() {
        let backlog = TaskBacklog::new(None);
        for i in 0..5 {
            backlog.push(i).unwrap();
        }
        assert_eq!(backlog.drain(), vec![0, 1, 2, 3, 4]);
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let backlog = Arc::new(TaskBacklog::new(None));
        let consumer = {
            let backlog = backlog.clone();
            tokio::spawn(async move { backlog.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backlog.push("task").unwrap();

        assert_eq!(consumer.await.unwrap(), Some("task"));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let backlog: Arc<TaskBacklog<u32>> = Arc::new(TaskBacklog::new(None));
        let consumer = {
            let backlog = backlog.clone();
            tokio::spawn(async move { backlog.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backlog.close();

        assert_eq!(consumer.await.unwrap(), None);
        assert!(backlog.push(1).is_err());
    }
}
