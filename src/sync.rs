//! Awaitable counting latch used to gate termination segments.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// A wait-group: `add` registers pending work, `done` retires it, and
/// `wait` resolves once the count is zero or below.
///
/// Unlike a barrier, the count may grow again after waiters were admitted;
/// waiters observe the instantaneous count. The waiter registers with the
/// notifier before re-reading the count, so a concurrent `done` cannot be
/// missed.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
    count: AtomicI64,
    notify: Notify,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) - 1 <= 0 {
            self.notify.notify_waiters();
        }
    }

    #[allow(dead_code)]
    pub(crate) fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Resolve once the count reaches zero; returns immediately if it
    /// already has.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register for wakeups before re-reading the count; a waiter not
            // yet enabled would miss a concurrent notify_waiters
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_wait_on_zero_returns_immediately() {
        let wg = WaitGroup::new();
        timeout(Duration::from_millis(50), wg.wait())
            .await
            .expect("wait on an empty group must not block");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);

        let waiter = {
            let wg = Arc::clone(&wg);
            tokio::spawn(async move { wg.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        wg.done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        wg.done();
        timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter must resolve after the final done")
            .unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_waiters_released_together() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(1);

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let wg = Arc::clone(&wg);
            waiters.push(tokio::spawn(async move { wg.wait().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        wg.done();

        for waiter in waiters {
            timeout(Duration::from_millis(200), waiter)
                .await
                .expect("all waiters must resolve")
                .unwrap();
        }
    }
}
