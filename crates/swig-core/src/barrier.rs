//! A small async wait-group: workers register on spawn and mark done on exit;
//! shutdown waits for the count to hit zero or its own deadline to elapse.
//!
//! Backed by a `watch` channel rather than raw `Notify` so a worker exiting
//! between the caller's zero-check and its wait can never be missed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

struct Inner {
    count: AtomicUsize,
    tx: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct WorkerBarrier {
    inner: Arc<Inner>,
}

impl Default for WorkerBarrier {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                count: AtomicUsize::new(0),
                tx,
            }),
        }
    }
}

impl WorkerBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        let n = self.inner.count.fetch_add(1, Ordering::SeqCst) + 1;
        // `send` is a no-op (and silently drops the value) when there are no
        // receivers yet, which is exactly the state before `drained()` has
        // ever been called. `send_replace` updates the stored value
        // unconditionally so a late subscriber still observes it.
        self.inner.tx.send_replace(n);
    }

    pub fn exit(&self) {
        let n = self.inner.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.inner.tx.send_replace(n);
    }

    pub fn outstanding(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until the count reaches zero.
    pub async fn drained(&self) {
        let mut rx = self.inner.tx.subscribe();
        if *rx.borrow() == 0 {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() == 0 {
                return;
            }
        }
    }
}
