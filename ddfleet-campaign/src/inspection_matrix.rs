// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compilation of the enabled scheme set into the snapshot consumed by the
//! inspection engine.

use crate::collection_scheme::{CollectionScheme, PartitionId};
use crate::condition::ConditionArena;
use crate::decoder_manifest::DecoderManifest;
use ddfleet_common::ids::{SignalId, SyncId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// One signal an enabled condition collects on trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedSignalSpec {
    pub signal_id: SignalId,
    pub sample_buffer_size: u32,
    /// Condition-only signals feed evaluation but are never uploaded.
    pub condition_only: bool,
    pub partition_id: Option<PartitionId>,
}

/// A compiled condition plus everything the engine needs to act on it.
#[derive(Debug, Clone)]
pub struct ConditionWithMetadata {
    pub condition: Arc<ConditionArena>,
    pub campaign_sync_id: SyncId,
    pub campaign_name: String,
    pub decoder_manifest_id: SyncId,
    pub signals: Vec<CollectedSignalSpec>,
    pub minimum_publish_interval_ms: u64,
    pub after_duration_ms: u64,
    pub trigger_only_on_rising_edge: bool,
    pub include_active_dtcs: bool,
    pub persist: bool,
    pub compress: bool,
    pub priority: u32,
}

/// Union of buffer requirements for one signal across all enabled schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalBufferSpec {
    pub signal_id: SignalId,
    /// Max of all requested sizes.
    pub sample_buffer_size: u32,
    /// Min of all requested intervals.
    pub min_sample_interval_ms: u64,
    /// Identical across schemes; conflicting schemes are rejected.
    pub fixed_window_ms: u64,
}

/// Per-signal raw buffer arena override for variable-sized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBufferOverride {
    pub signal_id: SignalId,
    pub max_bytes: Option<u64>,
    pub max_samples: u32,
}

#[derive(Debug, Default)]
pub struct InspectionMatrix {
    pub conditions: Vec<ConditionWithMetadata>,
    pub buffers: HashMap<SignalId, SignalBufferSpec>,
    pub raw_buffer_overrides: Vec<RawBufferOverride>,
}

impl InspectionMatrix {
    /// Every signal the matrix needs decoded, collected or condition-only.
    pub fn required_signals(&self) -> HashSet<SignalId> {
        self.buffers.keys().copied().collect()
    }
}

/// Builds the inspection matrix from the enabled schemes.
///
/// Signals the manifest cannot decode are dropped with one aggregated
/// warning per scheme; internally generated ids (custom function outputs)
/// are exempt. A scheme whose `fixed_window_ms` for a signal conflicts with
/// an already accepted scheme is rejected wholesale.
pub fn build_inspection_matrix(
    schemes: &[Arc<CollectionScheme>],
    manifest: &DecoderManifest,
) -> Arc<InspectionMatrix> {
    let mut matrix = InspectionMatrix::default();
    let mut raw_overrides: HashMap<SignalId, RawBufferOverride> = HashMap::new();

    'schemes: for scheme in schemes {
        let mut dropped: Vec<SignalId> = Vec::new();
        let mut kept = Vec::with_capacity(scheme.signals.len());
        for signal in &scheme.signals {
            if !signal.signal_id.is_internal() && !manifest.knows_signal(signal.signal_id) {
                dropped.push(signal.signal_id);
            } else {
                kept.push(signal);
            }
        }

        // Validate window agreement before mutating the matrix, so a
        // rejected scheme leaves no partial state behind.
        for signal in &kept {
            if let Some(existing) = matrix.buffers.get(&signal.signal_id) {
                if existing.fixed_window_ms != signal.fixed_window_ms {
                    warn!(
                        component = "campaign",
                        scheme = %scheme.sync_id,
                        signal = %signal.signal_id,
                        "rejecting scheme: fixed_window_ms conflicts with an already enabled scheme"
                    );
                    continue 'schemes;
                }
            }
        }

        if !dropped.is_empty() {
            warn!(
                component = "campaign",
                scheme = %scheme.sync_id,
                dropped = ?dropped,
                "scheme references signals absent from decoder manifest; dropping them"
            );
        }

        for signal in &kept {
            let entry = matrix
                .buffers
                .entry(signal.signal_id)
                .or_insert(SignalBufferSpec {
                    signal_id: signal.signal_id,
                    sample_buffer_size: signal.sample_buffer_size,
                    min_sample_interval_ms: signal.min_sample_interval_ms,
                    fixed_window_ms: signal.fixed_window_ms,
                });
            entry.sample_buffer_size = entry.sample_buffer_size.max(signal.sample_buffer_size);
            entry.min_sample_interval_ms =
                entry.min_sample_interval_ms.min(signal.min_sample_interval_ms);

            if signal.max_raw_bytes.is_some() || signal.signal_id.kind().is_variable_size() {
                let over = raw_overrides
                    .entry(signal.signal_id)
                    .or_insert(RawBufferOverride {
                        signal_id: signal.signal_id,
                        max_bytes: signal.max_raw_bytes,
                        max_samples: signal.sample_buffer_size,
                    });
                over.max_samples = over.max_samples.max(signal.sample_buffer_size);
                over.max_bytes = match (over.max_bytes, signal.max_raw_bytes) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
        }

        matrix.conditions.push(ConditionWithMetadata {
            condition: scheme.condition.clone(),
            campaign_sync_id: scheme.sync_id.clone(),
            campaign_name: scheme.campaign_name(),
            decoder_manifest_id: scheme.decoder_manifest_id.clone(),
            signals: kept
                .iter()
                .map(|s| CollectedSignalSpec {
                    signal_id: s.signal_id,
                    sample_buffer_size: s.sample_buffer_size,
                    condition_only: s.condition_only,
                    partition_id: s.partition_id,
                })
                .collect(),
            minimum_publish_interval_ms: scheme.minimum_publish_interval_ms,
            after_duration_ms: scheme.after_duration_ms,
            trigger_only_on_rising_edge: scheme.trigger_only_on_rising_edge,
            include_active_dtcs: scheme.include_active_dtcs,
            persist: scheme.persist,
            compress: scheme.compress,
            priority: scheme.priority,
        });
    }

    matrix.raw_buffer_overrides = raw_overrides.into_values().collect();
    Arc::new(matrix)
}

trait VariableSize {
    fn is_variable_size(&self) -> bool;
}

impl VariableSize for ddfleet_common::ids::SignalIdKind {
    fn is_variable_size(&self) -> bool {
        matches!(
            self,
            ddfleet_common::ids::SignalIdKind::Complex | ddfleet_common::ids::SignalIdKind::Internal
        )
    }
}
