//! Counting completion barrier for fan-out/fan-in dispatch

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::Notify;

/// Blocks a single waiter until a pre-declared number of units have signalled completion.
#[derive(Debug)]
pub struct CompletionBarrier {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionBarrier {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Signals one completion. The final decrement wakes the waiter.
    pub fn done(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                value.checked_sub(1)
            });

        match previous {
            Ok(1) => self.notify.notify_one(),
            Ok(_) => {}
            Err(_) => tracing::warn!("completion barrier signalled more times than declared"),
        }
    }

    pub async fn wait(&self) {
        while self.remaining() > 0 {
            self.notify.notified().await;
        }
    }

    /// Guard that signals completion when dropped, including on unwind.
    pub fn guard(self: &Arc<Self>) -> BarrierGuard {
        BarrierGuard {
            barrier: Arc::clone(self),
        }
    }
}

pub struct BarrierGuard {
    barrier: Arc<CompletionBarrier>,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        self.barrier.done();
    }
}
