//! Cooperative interruption of running work.

use tokio::sync::watch;

/// A cloneable interruption flag shared between an executor slot and the
/// executable it is running.
///
/// Firing the interrupt is asynchronous from the caller's point of view:
/// the running task observes it at its next checkpoint and must wind down
/// promptly, reporting the build as aborted. Callers must not assume
/// immediate termination.
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: watch::Sender<bool>,
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Flip the flag and wake anything awaiting it.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the interrupt has been fired. Safe to call from
    /// multiple places concurrently.
    pub async fn interrupted(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            // The sender cannot drop while `self` holds a clone of it.
            let _ = rx.changed().await;
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fire_wakes_waiters() {
        let interrupt = Interrupt::new();
        let waiter = interrupt.clone();
        let handle = tokio::spawn(async move { waiter.interrupted().await });
        interrupt.fire();
        handle.await.unwrap();
        assert!(interrupt.is_interrupted());
    }

    #[tokio::test]
    async fn test_fire_before_wait() {
        let interrupt = Interrupt::new();
        interrupt.fire();
        interrupt.interrupted().await;
    }
}
