// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use ddfleet_common::ids::{SignalId, SyncId};
use ddfleet_common::time::Timestamp;
use ddfleet_common::value::SampleValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One decoded sample as pushed by an adapter into the engine's input queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSample {
    pub signal_id: SignalId,
    pub timestamp_ms: Timestamp,
    pub value: SampleValue,
}

/// A sample captured into a trigger window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectedSignal {
    pub signal_id: SignalId,
    pub receive_time_ms: Timestamp,
    pub value: SampleValue,
}

/// Diagnostic trouble codes active when the trigger fired. One snapshot is
/// captured per inspection tick and shared by every trigger of that tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcInfo {
    pub receive_time_ms: Timestamp,
    pub codes: Vec<String>,
}

/// Campaign attributes the downstream senders need to route a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMetadata {
    pub campaign_sync_id: SyncId,
    pub campaign_name: String,
    pub decoder_manifest_id: SyncId,
    pub persist: bool,
    pub compress: bool,
    pub priority: u32,
}

/// One condition firing: a deep copy of the collected signal windows plus
/// the metadata needed to serialize and route it.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredData {
    pub event_id: u32,
    pub trigger_time_ms: Timestamp,
    pub metadata: TriggerMetadata,
    pub signals: Vec<CollectedSignal>,
    pub dtc_info: Option<Arc<DtcInfo>>,
}

impl TriggeredData {
    /// A trigger with neither samples nor DTCs carries nothing to upload.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
            && self
                .dtc_info
                .as_ref()
                .map(|d| d.codes.is_empty())
                .unwrap_or(true)
    }
}
