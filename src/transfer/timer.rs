//! One-shot timers that post an event to a queue when they expire.
//!
//! A fired timer never touches engine state; it only enqueues. Cancelling can
//! race with firing, so [`TimerHandle::cancel`] reports which side won and the
//! consumer must treat a late event as possibly stale.

use super::queue::BoundedQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFired,
}

#[derive(Debug)]
pub struct TimerHandle {
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn cancel(self) -> CancelOutcome {
        self.task.abort();
        if self.fired.load(Ordering::Acquire) {
            CancelOutcome::AlreadyFired
        } else {
            CancelOutcome::Cancelled
        }
    }
}

/// Post `event` to `queue` after `after`, unless cancelled first.
pub fn schedule<T>(after: Duration, queue: Arc<BoundedQueue<T>>, event: T) -> TimerHandle
where
    T: Send + 'static,
{
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(after).await;
        flag.store(true, Ordering::Release);
        queue.push(event);
    });
    TimerHandle { fired, task }
}
