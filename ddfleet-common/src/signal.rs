// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::sync::Notify;

/// Suspension point shared between a worker and the components that wake it.
///
/// Workers park on [`Signal::wait`] or [`Signal::wait_with_predicate`] at
/// loop boundaries only; `notify` wakes every parked waiter. A notification
/// arriving while nobody waits is absorbed by the predicate re-check, not
/// stored.
#[derive(Debug, Default)]
pub struct Signal {
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake all currently parked waiters.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    /// Park until notified or until `timeout` elapses. Returns true when the
    /// wakeup came from a notification.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }

    /// Park until `predicate` returns true, re-checking after every
    /// notification. The predicate is registered before it is first checked,
    /// so a notification racing the check is never lost.
    pub async fn wait_with_predicate(&self, mut predicate: impl FnMut() -> bool) {
        loop {
            let notified = self.notify.notified();
            if predicate() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let signal = Signal::new();
        assert!(!signal.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        signal.notify();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_predicate_rechecked_on_notify() {
        let signal = Arc::new(Signal::new());
        let flag = Arc::new(AtomicBool::new(false));
        let waiter = {
            let signal = signal.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                signal
                    .wait_with_predicate(|| flag.load(Ordering::SeqCst))
                    .await
            })
        };
        tokio::task::yield_now().await;
        flag.store(true, Ordering::SeqCst);
        signal.notify();
        waiter.await.unwrap();
    }
}
