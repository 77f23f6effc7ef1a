// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

/// Time source injected into every component so tests can drive the clock.
pub trait Clock: Send + Sync + Debug {
    /// Wall-clock time. Subject to adjustment, used for campaign windows and
    /// record timestamps.
    fn system_time_ms(&self) -> Timestamp;

    /// Monotonic time anchored at the unix epoch of process start. Used for
    /// intervals and deadlines.
    fn monotonic_ms(&self) -> Timestamp;
}

#[derive(Debug)]
pub struct SystemClock {
    epoch_anchor_ms: u64,
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(SystemClock {
            epoch_anchor_ms: SystemTime::UNIX_EPOCH
                .elapsed()
                .unwrap_or_default()
                .as_millis() as u64,
            start: Instant::now(),
        })
    }
}

impl Clock for SystemClock {
    fn system_time_ms(&self) -> Timestamp {
        SystemTime::UNIX_EPOCH
            .elapsed()
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn monotonic_ms(&self) -> Timestamp {
        self.epoch_anchor_ms + self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for tests. Both time bases tick together.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn starting_at(now_ms: Timestamp) -> Arc<Self> {
        Arc::new(ManualClock {
            now_ms: AtomicU64::new(now_ms),
        })
    }

    pub fn advance(&self, delta: Duration) {
        self.now_ms
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: Timestamp) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn system_time_ms(&self) -> Timestamp {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn monotonic_ms(&self) -> Timestamp {
        self.now_ms.load(Ordering::SeqCst)
    }
}
