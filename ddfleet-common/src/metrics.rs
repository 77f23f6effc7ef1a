// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counter sink injected into every component. Dropped data increments a
//! counter here instead of propagating an error up the pipeline.

use crate::MutexExt;
use std::collections::HashMap;
use std::sync::Mutex;

/// Health metric names emitted by the core.
pub mod names {
    /// Triggers evicted from the full output queue.
    pub const TRIGGERS_DROPPED: &str = "ddfleet.inspection.triggers_dropped";
    /// Samples arriving for signals no enabled scheme needs.
    pub const SAMPLES_DROPPED: &str = "ddfleet.inspection.samples_dropped";
    /// Raw buffer pushes rejected by the byte caps.
    pub const RAW_BUFFER_REJECTED: &str = "ddfleet.raw_buffer.rejected";
    /// Payloads dropped after exceeding the split recursion limit.
    pub const PAYLOADS_DROPPED_OVERSIZE: &str = "ddfleet.telemetry.payloads_dropped_oversize";
    /// Payloads published to the transport.
    pub const PAYLOADS_PUBLISHED: &str = "ddfleet.telemetry.payloads_published";
    /// Bytes published to the transport.
    pub const BYTES_PUBLISHED: &str = "ddfleet.telemetry.bytes_published";
    /// Stream appends rejected for quota.
    pub const STREAM_QUOTA_EXCEEDED: &str = "ddfleet.store.quota_exceeded";
    /// Records forwarded out of streams.
    pub const STREAM_RECORDS_FORWARDED: &str = "ddfleet.store.records_forwarded";
    /// Campaign artifact rebuilds.
    pub const CAMPAIGN_REBUILDS: &str = "ddfleet.campaign.rebuilds";
    /// Checkins sent successfully.
    pub const CHECKINS_SENT: &str = "ddfleet.campaign.checkins_sent";
}

pub trait Metrics: Send + Sync + std::fmt::Debug {
    fn increment(&self, name: &'static str) {
        self.add(name, 1);
    }

    fn add(&self, name: &'static str, delta: u64);
}

/// Sink that discards every point.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn add(&self, _name: &'static str, _delta: u64) {}
}

/// In-memory sink, used by tests and by hosts that poll counters out.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &'static str) -> u64 {
        *self.counters.lock_or_panic().get(name).unwrap_or(&0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters.lock_or_panic().clone()
    }
}

impl Metrics for InMemoryMetrics {
    fn add(&self, name: &'static str, delta: u64) {
        *self.counters.lock_or_panic().entry(name).or_insert(0) += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counts() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(names::TRIGGERS_DROPPED);
        metrics.add(names::TRIGGERS_DROPPED, 2);
        assert_eq!(metrics.value(names::TRIGGERS_DROPPED), 3);
        assert_eq!(metrics.value(names::SAMPLES_DROPPED), 0);
    }
}
