use std::sync::RwLock;

use tokio::sync::watch;

use crate::telemetry;

/// Replaceable one-shot readiness signal protecting the proxy path.
///
/// The gate starts closed. `open` lets every current and future waiter pass;
/// `close` swaps in a fresh channel so later `wait` calls block again.
/// Waiters that subscribed before a `close` have already observed the open
/// signal, so nobody is stranded on a stale channel.
///
/// Many tasks `wait`; only the ops loop calls `open`/`close`. Caller
/// cancellation is the caller's concern (`tokio::select!` around `wait`).
pub struct ReadinessGate {
    tx: RwLock<watch::Sender<bool>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: RwLock::new(tx) }
    }

    pub fn is_open(&self) -> bool {
        let tx = self.tx.read().expect("gate lock poisoned");
        let value = *tx.borrow();
        value
    }

    /// Idempotent. A successful `open` happens-before any waiter's return.
    pub fn open(&self) {
        let tx = self.tx.read().expect("gate lock poisoned");
        tx.send_replace(true);
        telemetry::record_gate_state(true);
    }

    /// Idempotent. Only an open gate is replaced; a closed gate is left
    /// alone so waiters keep blocking on the same channel.
    pub fn close(&self) {
        let mut tx = self.tx.write().expect("gate lock poisoned");
        if *tx.borrow() {
            let (fresh, _rx) = watch::channel(false);
            *tx = fresh;
        }
        telemetry::record_gate_state(false);
    }

    /// Blocks until the gate is open. The lock is released before awaiting.
    pub async fn wait(&self) {
        let mut rx = {
            let tx = self.tx.read().expect("gate lock poisoned");
            tx.subscribe()
        };
        // wait_for returns the current value when it already matches, even
        // if the sender has since been replaced.
        let _ = rx.wait_for(|open| *open).await;
    }
}
