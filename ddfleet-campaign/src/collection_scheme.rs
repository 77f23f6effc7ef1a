// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion of cloud-delivered collection schemes: activation window,
//! signal buffer requirements, trigger condition, fetch plan and stream
//! partitioning.

use crate::condition::ConditionArena;
use ddfleet_common::ids::{SignalId, SyncId};
use ddfleet_common::time::Timestamp;
use ddfleet_common::EdgeError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Hard ceiling protecting against malformed scheme lists.
pub const MAX_SCHEME_LIST_SIZE: usize = 128 * 1024 * 1024;

pub type PartitionId = u32;

/// The default partition receives DTCs and raw frames.
pub const DEFAULT_PARTITION_ID: PartitionId = 0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignalCollectionConfig {
    pub signal_id: SignalId,
    #[serde(default = "default_sample_buffer_size")]
    pub sample_buffer_size: u32,
    #[serde(default)]
    pub min_sample_interval_ms: u64,
    #[serde(default)]
    pub fixed_window_ms: u64,
    /// The signal feeds condition evaluation but is not uploaded.
    #[serde(default)]
    pub condition_only: bool,
    #[serde(default)]
    pub fetch_request_ids: Vec<String>,
    #[serde(default)]
    pub partition_id: Option<PartitionId>,
    /// Byte budget for variable-sized values of this signal in the raw
    /// buffer arena.
    #[serde(default)]
    pub max_raw_bytes: Option<u64>,
}

fn default_sample_buffer_size() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PartitionConfig {
    /// Path fragment under the stream root, relative to the campaign dir.
    pub storage_location: String,
    pub max_bytes: u64,
    pub min_ttl_s: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralArg {
    Number(f64),
    String(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetchAction {
    pub function_name: String,
    #[serde(default)]
    pub literal_args: Vec<LiteralArg>,
}

#[derive(Debug, Clone, Deserialize)]
struct FetchPlanEntryDocument {
    fetch_request_id: String,
    signal_id: SignalId,
    #[serde(default)]
    actions: Vec<FetchAction>,
    #[serde(default)]
    max_executions: Option<u64>,
    #[serde(default)]
    period_ms: Option<u64>,
    #[serde(default)]
    reset_interval_ms: Option<u64>,
    #[serde(default)]
    condition: Option<Value>,
    #[serde(default)]
    trigger_only_on_rising_edge: bool,
}

/// How a fetch request is scheduled.
#[derive(Debug, Clone)]
pub enum FetchSchedule {
    Periodic {
        max_executions: Option<u64>,
        period_ms: u64,
        reset_interval_ms: u64,
    },
    Conditional {
        condition: Arc<ConditionArena>,
        trigger_only_on_rising_edge: bool,
    },
}

#[derive(Debug, Clone)]
pub struct FetchPlanEntry {
    pub fetch_request_id: String,
    pub signal_id: SignalId,
    pub actions: Vec<FetchAction>,
    pub schedule: FetchSchedule,
}

#[derive(Debug, Deserialize)]
struct SchemeDocument {
    sync_id: SyncId,
    decoder_manifest_id: SyncId,
    start_time: Timestamp,
    expiry_time: Timestamp,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    persist: bool,
    #[serde(default)]
    compress: bool,
    #[serde(default)]
    minimum_publish_interval_ms: u64,
    #[serde(default)]
    after_duration_ms: u64,
    #[serde(default)]
    include_active_dtcs: bool,
    #[serde(default)]
    trigger_only_on_rising_edge: bool,
    #[serde(default)]
    signals: Vec<SignalCollectionConfig>,
    #[serde(default)]
    condition: Option<Value>,
    #[serde(default)]
    fetch_plan: Vec<FetchPlanEntryDocument>,
    #[serde(default)]
    partitions: HashMap<PartitionId, PartitionConfig>,
}

/// Immutable, validated collection scheme.
#[derive(Debug)]
pub struct CollectionScheme {
    pub sync_id: SyncId,
    pub decoder_manifest_id: SyncId,
    pub start_time: Timestamp,
    pub expiry_time: Timestamp,
    pub priority: u32,
    pub persist: bool,
    pub compress: bool,
    pub minimum_publish_interval_ms: u64,
    pub after_duration_ms: u64,
    pub include_active_dtcs: bool,
    pub trigger_only_on_rising_edge: bool,
    pub signals: Vec<SignalCollectionConfig>,
    pub condition: Arc<ConditionArena>,
    pub fetch_plan: Vec<FetchPlanEntry>,
    pub partitions: HashMap<PartitionId, PartitionConfig>,
    /// Digest of the source document; same sync id with a different digest
    /// means the definition changed and the old scheme is retired.
    pub content_digest: u64,
}

impl CollectionScheme {
    /// Directory-safe name used for the campaign's stream subtree.
    pub fn campaign_name(&self) -> String {
        self.sync_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    pub fn signal_config(&self, signal: SignalId) -> Option<&SignalCollectionConfig> {
        self.signals.iter().find(|s| s.signal_id == signal)
    }

    /// Partition a collected signal is routed to, when the scheme is
    /// partitioned at all.
    pub fn partition_of(&self, signal: SignalId) -> Option<PartitionId> {
        self.signal_config(signal).and_then(|s| s.partition_id)
    }

    fn from_document(doc: SchemeDocument, digest: u64) -> Result<Self, EdgeError> {
        if doc.sync_id.is_empty() || doc.decoder_manifest_id.is_empty() {
            return Err(EdgeError::invalid_format(
                "collection scheme is missing sync_id or decoder_manifest_id",
            ));
        }
        if doc.expiry_time <= doc.start_time {
            return Err(EdgeError::invalid_format(format!(
                "scheme {}: expiry_time must be after start_time",
                doc.sync_id
            )));
        }
        let mut fixed_windows = HashMap::new();
        for signal in &doc.signals {
            if signal.sample_buffer_size == 0 {
                return Err(EdgeError::invalid_format(format!(
                    "scheme {}: sample_buffer_size must be at least 1 for signal {}",
                    doc.sync_id, signal.signal_id
                )));
            }
            if signal.fixed_window_ms > 0 {
                fixed_windows.insert(signal.signal_id, signal.fixed_window_ms);
            }
            if let Some(partition) = signal.partition_id {
                if !doc.partitions.contains_key(&partition) {
                    return Err(EdgeError::invalid_format(format!(
                        "scheme {}: signal {} routed to undeclared partition {}",
                        doc.sync_id, signal.signal_id, partition
                    )));
                }
            }
        }

        let mut condition = match &doc.condition {
            Some(value) => ConditionArena::from_document(value)?,
            None => ConditionArena::always_true(),
        };
        condition.resolve_windows(&fixed_windows)?;

        let mut fetch_plan = Vec::with_capacity(doc.fetch_plan.len());
        for entry in doc.fetch_plan {
            let schedule = match (&entry.condition, entry.period_ms) {
                (Some(value), None) => {
                    let mut condition = ConditionArena::from_document(value)?;
                    condition.resolve_windows(&fixed_windows)?;
                    FetchSchedule::Conditional {
                        condition: Arc::new(condition),
                        trigger_only_on_rising_edge: entry.trigger_only_on_rising_edge,
                    }
                }
                (None, Some(period_ms)) => {
                    if period_ms == 0 {
                        return Err(EdgeError::invalid_format(format!(
                            "scheme {}: fetch request {} has a zero period",
                            doc.sync_id, entry.fetch_request_id
                        )));
                    }
                    FetchSchedule::Periodic {
                        max_executions: entry.max_executions,
                        period_ms,
                        reset_interval_ms: entry.reset_interval_ms.unwrap_or(0),
                    }
                }
                _ => {
                    return Err(EdgeError::invalid_format(format!(
                        "scheme {}: fetch request {} must be either periodic or conditional",
                        doc.sync_id, entry.fetch_request_id
                    )))
                }
            };
            fetch_plan.push(FetchPlanEntry {
                fetch_request_id: entry.fetch_request_id,
                signal_id: entry.signal_id,
                actions: entry.actions,
                schedule,
            });
        }

        Ok(CollectionScheme {
            sync_id: doc.sync_id,
            decoder_manifest_id: doc.decoder_manifest_id,
            start_time: doc.start_time,
            expiry_time: doc.expiry_time,
            priority: doc.priority,
            persist: doc.persist,
            compress: doc.compress,
            minimum_publish_interval_ms: doc.minimum_publish_interval_ms,
            after_duration_ms: doc.after_duration_ms,
            include_active_dtcs: doc.include_active_dtcs,
            trigger_only_on_rising_edge: doc.trigger_only_on_rising_edge,
            signals: doc.signals,
            condition: Arc::new(condition),
            fetch_plan,
            partitions: doc.partitions,
            content_digest: digest,
        })
    }
}

/// The accepted list of schemes, in document order.
#[derive(Debug, Default, Clone)]
pub struct CollectionSchemeList {
    pub schemes: Vec<Arc<CollectionScheme>>,
}

/// Two-phase ingestion of a scheme list document, mirroring
/// [`crate::decoder_manifest::DecoderManifestIngestion`].
#[derive(Debug, Default)]
pub struct CollectionSchemeListIngestion {
    data: Vec<u8>,
    list: Option<CollectionSchemeList>,
}

impl CollectionSchemeListIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy_data(&mut self, bytes: &[u8]) -> Result<(), EdgeError> {
        if bytes.len() > MAX_SCHEME_LIST_SIZE {
            return Err(EdgeError::invalid_format(format!(
                "collection scheme list of {} bytes exceeds the {} byte ceiling",
                bytes.len(),
                MAX_SCHEME_LIST_SIZE
            )));
        }
        self.data = bytes.to_vec();
        self.list = None;
        Ok(())
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn build(&mut self) -> Result<(), EdgeError> {
        let docs: Vec<Value> = serde_json::from_slice(&self.data)
            .map_err(|e| EdgeError::invalid_format(format!("collection scheme list: {e}")))?;
        let mut schemes = Vec::with_capacity(docs.len());
        for value in docs {
            // serde_json maps are sorted, so the digest is stable across
            // re-serialization of the same document.
            let mut hasher = DefaultHasher::new();
            value.to_string().hash(&mut hasher);
            let digest = hasher.finish();
            let doc: SchemeDocument = serde_json::from_value(value)
                .map_err(|e| EdgeError::invalid_format(format!("collection scheme: {e}")))?;
            schemes.push(Arc::new(CollectionScheme::from_document(doc, digest)?));
        }
        self.list = Some(CollectionSchemeList { schemes });
        Ok(())
    }

    pub fn list(&self) -> Option<&CollectionSchemeList> {
        self.list.as_ref()
    }

    pub fn into_list(self) -> Option<CollectionSchemeList> {
        self.list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_list, scheme_json};
    use serde_json::json;

    #[test]
    fn test_build_minimal_scheme() {
        let list = build_list(&[scheme_json("cs-1", 100, 200)]);
        assert_eq!(list.schemes.len(), 1);
        let scheme = &list.schemes[0];
        assert_eq!(scheme.sync_id, "cs-1");
        assert_eq!(scheme.decoder_manifest_id, "dm-1");
        assert_eq!(scheme.signals[0].sample_buffer_size, 10);
        assert_eq!(scheme.campaign_name(), "cs-1");
    }

    #[test]
    fn test_digest_distinguishes_content() {
        let a = build_list(&[scheme_json("cs-1", 100, 200)]);
        let mut changed = scheme_json("cs-1", 100, 200);
        changed["priority"] = json!(7);
        let b = build_list(&[changed]);
        assert_ne!(a.schemes[0].content_digest, b.schemes[0].content_digest);

        let same = build_list(&[scheme_json("cs-1", 100, 200)]);
        assert_eq!(a.schemes[0].content_digest, same.schemes[0].content_digest);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let mut doc = scheme_json("cs-1", 100, 200);
        doc["signals"][0]["sample_buffer_size"] = json!(0);
        let mut ingestion = CollectionSchemeListIngestion::new();
        ingestion
            .copy_data(&serde_json::to_vec(&[doc]).unwrap())
            .unwrap();
        assert!(matches!(
            ingestion.build(),
            Err(EdgeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let doc = scheme_json("cs-1", 200, 200);
        let mut ingestion = CollectionSchemeListIngestion::new();
        ingestion
            .copy_data(&serde_json::to_vec(&[doc]).unwrap())
            .unwrap();
        assert!(matches!(
            ingestion.build(),
            Err(EdgeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_zero_period_fetch_rejected() {
        let mut doc = scheme_json("cs-1", 100, 200);
        doc["fetch_plan"] = json!([
            {"fetch_request_id": "f-1", "signal_id": 1, "period_ms": 0}
        ]);
        let mut ingestion = CollectionSchemeListIngestion::new();
        ingestion
            .copy_data(&serde_json::to_vec(&[doc]).unwrap())
            .unwrap();
        assert!(matches!(
            ingestion.build(),
            Err(EdgeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_undeclared_partition_rejected() {
        let mut doc = scheme_json("cs-1", 100, 200);
        doc["signals"][0]["partition_id"] = json!(3);
        let mut ingestion = CollectionSchemeListIngestion::new();
        ingestion
            .copy_data(&serde_json::to_vec(&[doc]).unwrap())
            .unwrap();
        assert!(matches!(
            ingestion.build(),
            Err(EdgeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_missing_condition_defaults_to_always_true() {
        let mut doc = scheme_json("cs-1", 100, 200);
        doc.as_object_mut().unwrap().remove("condition");
        let list = build_list(&[doc]);
        assert_eq!(
            list.schemes[0].condition.nodes().len(),
            1,
            "heartbeat schemes compile to a single literal"
        );
    }
}
