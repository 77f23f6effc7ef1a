// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of durable streams, one per enabled (campaign, partition).
//! Writers and the forwarder share it; per-partition locks keep a slow
//! reader from blocking writers on other partitions.

use crate::stream::{PartitionStream, StreamLimits, StreamRecord};
use bytes::Bytes;
use ddfleet_campaign::collection_scheme::{CollectionScheme, PartitionConfig, PartitionId};
use ddfleet_common::ids::SyncId;
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::time::{Clock, Timestamp};
use ddfleet_common::{EdgeError, MutexExt};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    pub root: PathBuf,
    pub soft_segment_bytes: u64,
}

impl StreamManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StreamManagerConfig {
            root: root.into(),
            soft_segment_bytes: 256 * 1024,
        }
    }
}

/// One serialized chunk routed to a partition.
#[derive(Debug, Clone)]
pub struct PartitionPayload {
    pub partition_id: PartitionId,
    pub trigger_time_ms: Timestamp,
    pub payload: Bytes,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Success,
    EmptyData,
    StreamNotFound,
    QuotaExceeded,
}

#[derive(Debug)]
struct CampaignEntry {
    campaign_name: String,
    scheme: Arc<CollectionScheme>,
    partitions: HashMap<PartitionId, Arc<Mutex<PartitionStream>>>,
}

#[derive(Debug)]
pub struct StreamManager {
    config: StreamManagerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
    campaigns: Mutex<HashMap<SyncId, CampaignEntry>>,
}

impl StreamManager {
    pub fn new(
        config: StreamManagerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, EdgeError> {
        fs::create_dir_all(&config.root).map_err(EdgeError::FatalIo)?;
        Ok(StreamManager {
            config,
            clock,
            metrics,
            campaigns: Mutex::new(HashMap::new()),
        })
    }

    fn partition_dir(&self, campaign_name: &str, location: &str) -> PathBuf {
        self.config.root.join(campaign_name).join(location)
    }

    fn limits_for(&self, config: &PartitionConfig) -> StreamLimits {
        let mut hasher = DefaultHasher::new();
        config.storage_location.hash(&mut hasher);
        config.max_bytes.hash(&mut hasher);
        config.min_ttl_s.hash(&mut hasher);
        StreamLimits {
            max_bytes: config.max_bytes,
            min_ttl_ms: config.min_ttl_s * 1000,
            soft_segment_bytes: self.config.soft_segment_bytes,
            config_hash: hasher.finish(),
        }
    }

    /// Aligns the stream set with the enabled schemes: opens streams for new
    /// partitions, drops streams (and their files) for campaigns or
    /// partitions that disappeared, and removes orphaned directories left by
    /// retired campaigns.
    pub fn apply_schemes(&self, schemes: &[Arc<CollectionScheme>]) {
        let mut campaigns = self.campaigns.lock_or_panic();
        let mut keep_dirs: HashSet<String> = HashSet::new();

        for scheme in schemes {
            if scheme.partitions.is_empty() {
                continue;
            }
            let campaign_name = scheme.campaign_name();
            keep_dirs.insert(campaign_name.clone());
            let entry = campaigns
                .entry(scheme.sync_id.clone())
                .or_insert_with(|| CampaignEntry {
                    campaign_name: campaign_name.clone(),
                    scheme: scheme.clone(),
                    partitions: HashMap::new(),
                });
            entry.scheme = scheme.clone();
            entry
                .partitions
                .retain(|id, _| scheme.partitions.contains_key(id));
            for (partition_id, partition_config) in &scheme.partitions {
                if entry.partitions.contains_key(partition_id) {
                    continue;
                }
                let dir = self.partition_dir(&campaign_name, &partition_config.storage_location);
                match PartitionStream::open(&dir, self.limits_for(partition_config)) {
                    Ok(stream) => {
                        info!(component = "store", campaign = %scheme.sync_id, partition = partition_id,
                            "opened partition stream");
                        entry
                            .partitions
                            .insert(*partition_id, Arc::new(Mutex::new(stream)));
                    }
                    Err(e) => {
                        // Quarantine this partition; others continue.
                        error!(component = "store", campaign = %scheme.sync_id, partition = partition_id,
                            error = %e, "cannot open partition stream");
                    }
                }
            }
        }

        let enabled: HashSet<&SyncId> = schemes.iter().map(|s| &s.sync_id).collect();
        campaigns.retain(|sync_id, entry| {
            if enabled.contains(sync_id) {
                true
            } else {
                info!(component = "store", campaign = %sync_id, "campaign retired, deleting streams");
                let dir = self.config.root.join(&entry.campaign_name);
                if let Err(e) = fs::remove_dir_all(&dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(component = "store", error = %e, "removing retired campaign dir");
                    }
                }
                false
            }
        });

        // Orphaned directories (crash leftovers, renamed campaigns) go too.
        if let Ok(entries) = fs::read_dir(&self.config.root) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().is_dir() && !keep_dirs.contains(&name) {
                    if let Err(e) = fs::remove_dir_all(entry.path()) {
                        warn!(component = "store", dir = %name, error = %e, "removing orphaned stream dir");
                    }
                }
            }
        }
    }

    pub fn has_campaign(&self, campaign_sync_id: &str) -> bool {
        self.campaigns.lock_or_panic().contains_key(campaign_sync_id)
    }

    pub fn partitions_of(&self, campaign_sync_id: &str) -> Vec<PartitionId> {
        self.campaigns
            .lock_or_panic()
            .get(campaign_sync_id)
            .map(|entry| {
                let mut ids: Vec<PartitionId> = entry.partitions.keys().copied().collect();
                ids.sort_unstable();
                ids
            })
            .unwrap_or_default()
    }

    fn stream(
        &self,
        campaign_sync_id: &str,
        partition_id: PartitionId,
    ) -> Option<Arc<Mutex<PartitionStream>>> {
        self.campaigns
            .lock_or_panic()
            .get(campaign_sync_id)
            .and_then(|entry| entry.partitions.get(&partition_id))
            .cloned()
    }

    /// Appends one serialized record per partition payload. Durably visible
    /// once this returns `Success`.
    pub fn append_to_streams(
        &self,
        campaign_sync_id: &str,
        payloads: &[PartitionPayload],
    ) -> AppendResult {
        if payloads.is_empty() {
            return AppendResult::EmptyData;
        }
        if !self.has_campaign(campaign_sync_id) {
            return AppendResult::StreamNotFound;
        }
        let now = self.clock.system_time_ms();
        let mut result = AppendResult::Success;
        for payload in payloads {
            let Some(stream) = self.stream(campaign_sync_id, payload.partition_id) else {
                result = AppendResult::StreamNotFound;
                continue;
            };
            let mut stream = stream.lock_or_panic();
            match stream.append(
                payload.trigger_time_ms,
                payload.payload.to_vec(),
                payload.compressed,
                now,
            ) {
                Ok(_) => {}
                Err(EdgeError::QuotaExceeded(_)) => {
                    self.metrics.increment(names::STREAM_QUOTA_EXCEEDED);
                    warn!(component = "store", campaign = %campaign_sync_id,
                        partition = payload.partition_id, "append rejected by quota");
                    result = AppendResult::QuotaExceeded;
                }
                Err(e) => {
                    error!(component = "store", campaign = %campaign_sync_id,
                        partition = payload.partition_id, error = %e, "append failed");
                    result = AppendResult::QuotaExceeded;
                }
            }
        }
        result
    }

    /// Oldest unread record of the partition; the caller acknowledges it via
    /// [`StreamManager::checkpoint`] once it was handed off successfully.
    pub fn read_from_stream(
        &self,
        campaign_sync_id: &str,
        partition_id: PartitionId,
    ) -> Result<Option<StreamRecord>, EdgeError> {
        let stream = self
            .stream(campaign_sync_id, partition_id)
            .ok_or_else(|| EdgeError::not_found(format!("{campaign_sync_id}/{partition_id}")))?;
        let mut stream = stream.lock_or_panic();
        stream.read_next()
    }

    /// Advances the read pointer past `seq`; durably persisted.
    pub fn checkpoint(
        &self,
        campaign_sync_id: &str,
        partition_id: PartitionId,
        seq: u64,
    ) -> Result<(), EdgeError> {
        let stream = self
            .stream(campaign_sync_id, partition_id)
            .ok_or_else(|| EdgeError::not_found(format!("{campaign_sync_id}/{partition_id}")))?;
        let mut stream = stream.lock_or_panic();
        stream.checkpoint(seq)
    }

    /// The partition routing scheme of a stored campaign, for the sender's
    /// per-partition serialization.
    pub fn scheme_of(&self, campaign_sync_id: &str) -> Option<Arc<CollectionScheme>> {
        self.campaigns
            .lock_or_panic()
            .get(campaign_sync_id)
            .map(|entry| entry.scheme.clone())
    }

    pub fn campaign_ids(&self) -> Vec<SyncId> {
        let mut ids: Vec<SyncId> = self.campaigns.lock_or_panic().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddfleet_campaign::test_support::{build_list, scheme_json};
    use ddfleet_common::metrics::InMemoryMetrics;
    use ddfleet_common::time::ManualClock;
    use serde_json::json;

    fn partitioned_scheme(sync_id: &str) -> serde_json::Value {
        let mut doc = scheme_json(sync_id, 0, 1_000_000);
        doc["partitions"] = json!({
            "0": {"storage_location": "default", "max_bytes": 1_048_576, "min_ttl_s": 0},
            "1": {"storage_location": "gps", "max_bytes": 1_048_576, "min_ttl_s": 0}
        });
        doc["signals"][0]["partition_id"] = json!(1);
        doc
    }

    fn manager(dir: &tempfile::TempDir) -> StreamManager {
        StreamManager::new(
            StreamManagerConfig::new(dir.path()),
            ManualClock::starting_at(0),
            Arc::new(InMemoryMetrics::new()),
        )
        .unwrap()
    }

    fn payload(partition_id: PartitionId, bytes: &[u8]) -> PartitionPayload {
        PartitionPayload {
            partition_id,
            trigger_time_ms: 42,
            payload: Bytes::copy_from_slice(bytes),
            compressed: false,
        }
    }

    #[test]
    fn test_append_and_read_per_partition() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let list = build_list(&[partitioned_scheme("cs-1")]);
        manager.apply_schemes(&list.schemes);

        assert!(manager.has_campaign("cs-1"));
        assert_eq!(manager.partitions_of("cs-1"), vec![0, 1]);

        let result = manager.append_to_streams(
            "cs-1",
            &[payload(0, b"default-data"), payload(1, b"gps-data")],
        );
        assert_eq!(result, AppendResult::Success);

        let record = manager.read_from_stream("cs-1", 1).unwrap().unwrap();
        assert_eq!(record.payload, b"gps-data");
        manager.checkpoint("cs-1", 1, record.seq).unwrap();
        assert!(manager.read_from_stream("cs-1", 1).unwrap().is_none());
        // Partition 0 is independent.
        assert!(manager.read_from_stream("cs-1", 0).unwrap().is_some());
    }

    #[test]
    fn test_unknown_campaign_and_empty_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        assert_eq!(manager.append_to_streams("ghost", &[]), AppendResult::EmptyData);
        assert_eq!(
            manager.append_to_streams("ghost", &[payload(0, b"x")]),
            AppendResult::StreamNotFound
        );
        assert!(!manager.has_campaign("ghost"));
    }

    #[test]
    fn test_retired_campaign_files_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let list = build_list(&[partitioned_scheme("cs-1")]);
        manager.apply_schemes(&list.schemes);
        manager.append_to_streams("cs-1", &[payload(0, b"x")]);
        assert!(dir.path().join("cs-1").exists());

        manager.apply_schemes(&[]);
        assert!(!manager.has_campaign("cs-1"));
        assert!(!dir.path().join("cs-1").exists());
    }

    #[test]
    fn test_orphaned_dirs_removed_on_swap() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("stale-campaign/default")).unwrap();
        let manager = manager(&dir);
        let list = build_list(&[partitioned_scheme("cs-1")]);
        manager.apply_schemes(&list.schemes);
        assert!(!dir.path().join("stale-campaign").exists());
        assert!(dir.path().join("cs-1").exists());
    }

    #[test]
    fn test_checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let list = build_list(&[partitioned_scheme("cs-1")]);
        {
            let manager = manager(&dir);
            manager.apply_schemes(&list.schemes);
            manager.append_to_streams("cs-1", &[payload(0, b"a")]);
            manager.append_to_streams("cs-1", &[payload(0, b"b")]);
            let record = manager.read_from_stream("cs-1", 0).unwrap().unwrap();
            manager.checkpoint("cs-1", 0, record.seq).unwrap();
        }
        let manager = manager(&dir);
        manager.apply_schemes(&list.schemes);
        let record = manager.read_from_stream("cs-1", 0).unwrap().unwrap();
        assert_eq!(record.payload, b"b");
    }
}
