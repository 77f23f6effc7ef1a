// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded arena for variable-sized signal values (strings, complex
//! frames). Every entry carries a staged reference count so a leak in any
//! pipeline stage is diagnosable; memory is reclaimable only when the sum
//! across stages is zero.

use bytes::Bytes;
use ddfleet_campaign::inspection_matrix::RawBufferOverride;
use ddfleet_common::ids::SignalId;
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::time::Timestamp;
use ddfleet_common::value::RawBufferHandle;
use ddfleet_common::{EdgeError, MutexExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Pipeline stage holding a reference to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStage {
    InHistoryBuffer,
    SelectedForUpload,
    HandedOverToSender,
}

#[derive(Debug, Default, Clone, Copy)]
struct StageCounts {
    in_history: u32,
    selected_for_upload: u32,
    handed_to_sender: u32,
}

impl StageCounts {
    fn total(&self) -> u32 {
        self.in_history + self.selected_for_upload + self.handed_to_sender
    }

    fn slot(&mut self, stage: UsageStage) -> &mut u32 {
        match stage {
            UsageStage::InHistoryBuffer => &mut self.in_history,
            UsageStage::SelectedForUpload => &mut self.selected_for_upload,
            UsageStage::HandedOverToSender => &mut self.handed_to_sender,
        }
    }

    /// An entry is evictable only while nothing beyond the history holds it.
    fn upload_in_flight(&self) -> bool {
        self.selected_for_upload > 0 || self.handed_to_sender > 0
    }
}

#[derive(Debug)]
struct Entry {
    signal_id: SignalId,
    bytes: Bytes,
    timestamp: Timestamp,
    counts: StageCounts,
}

#[derive(Debug, Clone)]
pub struct RawBufferConfig {
    pub max_total_bytes: u64,
    /// Per-signal default byte cap; overridden per scheme.
    pub max_bytes_per_signal: u64,
    pub max_samples_per_signal: u32,
    pub overrides: Vec<RawBufferOverride>,
}

impl Default for RawBufferConfig {
    fn default() -> Self {
        RawBufferConfig {
            max_total_bytes: 16 * 1024 * 1024,
            max_bytes_per_signal: 1024 * 1024,
            max_samples_per_signal: 32,
            overrides: Vec::new(),
        }
    }
}

impl RawBufferConfig {
    fn signal_caps(&self, signal: SignalId) -> (u64, u32) {
        for over in &self.overrides {
            if over.signal_id == signal {
                return (
                    over.max_bytes.unwrap_or(self.max_bytes_per_signal),
                    over.max_samples.max(1),
                );
            }
        }
        (self.max_bytes_per_signal, self.max_samples_per_signal)
    }
}

#[derive(Debug)]
struct Inner {
    config: RawBufferConfig,
    entries: HashMap<RawBufferHandle, Entry>,
    /// Handles per signal in push order; front is the eviction candidate.
    per_signal: HashMap<SignalId, VecDeque<RawBufferHandle>>,
    next_handle: RawBufferHandle,
    total_bytes: u64,
}

#[derive(Debug)]
pub struct RawBufferManager {
    inner: Mutex<Inner>,
    metrics: Arc<dyn Metrics>,
}

impl RawBufferManager {
    pub fn new(config: RawBufferConfig, metrics: Arc<dyn Metrics>) -> Self {
        RawBufferManager {
            inner: Mutex::new(Inner {
                config,
                entries: HashMap::new(),
                per_signal: HashMap::new(),
                next_handle: 0,
                total_bytes: 0,
            }),
            metrics,
        }
    }

    /// Stores `bytes` for `signal_id`, evicting the oldest entries of that
    /// signal that are not currently uploading until the insert fits. The
    /// returned handle starts with one `InHistoryBuffer` reference.
    pub fn push(
        &self,
        signal_id: SignalId,
        bytes: Bytes,
        timestamp: Timestamp,
    ) -> Result<RawBufferHandle, EdgeError> {
        let mut inner = self.inner.lock_or_panic();
        let (max_signal_bytes, max_signal_samples) = inner.config.signal_caps(signal_id);
        if bytes.len() as u64 > max_signal_bytes || bytes.len() as u64 > inner.config.max_total_bytes
        {
            self.metrics.increment(names::RAW_BUFFER_REJECTED);
            return Err(EdgeError::QuotaExceeded("raw buffer entry larger than cap"));
        }

        let needs_eviction = |inner: &Inner| {
            let signal_bytes: u64 = inner
                .per_signal
                .get(&signal_id)
                .map(|handles| {
                    handles
                        .iter()
                        .map(|h| inner.entries[h].bytes.len() as u64)
                        .sum()
                })
                .unwrap_or(0);
            let signal_samples = inner
                .per_signal
                .get(&signal_id)
                .map(|h| h.len() as u32)
                .unwrap_or(0);
            inner.total_bytes + bytes.len() as u64 > inner.config.max_total_bytes
                || signal_bytes + bytes.len() as u64 > max_signal_bytes
                || signal_samples + 1 > max_signal_samples
        };

        while needs_eviction(&inner) {
            let candidate = inner.per_signal.get(&signal_id).and_then(|handles| {
                handles
                    .iter()
                    .find(|h| !inner.entries[*h].counts.upload_in_flight())
                    .copied()
            });
            match candidate {
                Some(handle) => {
                    debug!(
                        component = "raw_buffer",
                        signal = %signal_id,
                        handle,
                        "evicting oldest entry to make room"
                    );
                    Self::remove_entry(&mut inner, handle);
                }
                None => {
                    // Only protected entries remain.
                    self.metrics.increment(names::RAW_BUFFER_REJECTED);
                    return Err(EdgeError::QuotaExceeded("raw buffer"));
                }
            }
        }

        inner.next_handle = inner.next_handle.wrapping_add(1).max(1);
        let handle = inner.next_handle;
        inner.total_bytes += bytes.len() as u64;
        inner.entries.insert(
            handle,
            Entry {
                signal_id,
                bytes,
                timestamp,
                counts: StageCounts {
                    in_history: 1,
                    ..Default::default()
                },
            },
        );
        inner.per_signal.entry(signal_id).or_default().push_back(handle);
        Ok(handle)
    }

    /// A cheap view of the stored bytes; `None` once the entry is gone.
    pub fn borrow(&self, handle: RawBufferHandle) -> Option<Bytes> {
        self.inner
            .lock_or_panic()
            .entries
            .get(&handle)
            .map(|e| e.bytes.clone())
    }

    pub fn increase_usage(&self, handle: RawBufferHandle, stage: UsageStage) {
        let mut inner = self.inner.lock_or_panic();
        if let Some(entry) = inner.entries.get_mut(&handle) {
            *entry.counts.slot(stage) += 1;
        }
    }

    /// Drops one reference at `stage`; the entry is reclaimed when the sum
    /// across stages reaches zero.
    pub fn decrease_usage(&self, handle: RawBufferHandle, stage: UsageStage) {
        let mut inner = self.inner.lock_or_panic();
        let Some(entry) = inner.entries.get_mut(&handle) else {
            return;
        };
        let slot = entry.counts.slot(stage);
        *slot = slot.saturating_sub(1);
        if entry.counts.total() == 0 {
            Self::remove_entry(&mut inner, handle);
        }
    }

    /// Swaps the configuration on scheme change. History references of
    /// signals that are no longer configured are released; entries kept
    /// alive by an upload in flight survive until that reference drops.
    pub fn reconfigure(&self, config: RawBufferConfig) {
        let mut inner = self.inner.lock_or_panic();
        let retained: Vec<SignalId> = config.overrides.iter().map(|o| o.signal_id).collect();
        let retired: Vec<RawBufferHandle> = inner
            .entries
            .iter()
            .filter(|(_, e)| !retained.contains(&e.signal_id))
            .map(|(h, _)| *h)
            .collect();
        for handle in retired {
            let Some(entry) = inner.entries.get_mut(&handle) else {
                continue;
            };
            entry.counts.in_history = 0;
            if entry.counts.total() == 0 {
                Self::remove_entry(&mut inner, handle);
            }
        }
        inner.config = config;
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock_or_panic().total_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock_or_panic().entries.len()
    }

    pub fn entry_timestamp(&self, handle: RawBufferHandle) -> Option<Timestamp> {
        self.inner
            .lock_or_panic()
            .entries
            .get(&handle)
            .map(|e| e.timestamp)
    }

    fn remove_entry(inner: &mut Inner, handle: RawBufferHandle) {
        if let Some(entry) = inner.entries.remove(&handle) {
            inner.total_bytes -= entry.bytes.len() as u64;
            if let Some(handles) = inner.per_signal.get_mut(&entry.signal_id) {
                handles.retain(|h| *h != handle);
                if handles.is_empty() {
                    inner.per_signal.remove(&entry.signal_id);
                }
            }
        }
    }
}
