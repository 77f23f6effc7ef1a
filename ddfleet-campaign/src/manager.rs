// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single authority over which collection schemes are enabled, idle or
//! retired. Runs a state machine that waits for actions, either from the
//! worker's mailbox or from its time-ordered event queue, and republishes
//! immutable artifact snapshots whenever the enabled set changes.

use crate::collection_scheme::{CollectionScheme, CollectionSchemeListIngestion};
use crate::decoder_dictionary::{build_decoder_dictionaries, DecoderDictionarySet};
use crate::decoder_manifest::{DecoderManifest, DecoderManifestIngestion};
use crate::fetch_matrix::{build_fetch_matrix, FetchMatrix};
use crate::inspection_matrix::{build_inspection_matrix, InspectionMatrix};
use async_trait::async_trait;
use ddfleet_common::ids::SyncId;
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::persistency::{DataKind, PersistencyStore};
use ddfleet_common::time::{Clock, Timestamp};
use ddfleet_common::worker::Worker;
use ddfleet_common::EdgeError;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const PERSISTED_ARTIFACT_NAME: &str = "default";
const CONTINUE: ControlFlow<()> = ControlFlow::Continue(());
const BREAK: ControlFlow<()> = ControlFlow::Break(());

/// Mailbox actions accepted by the campaign manager.
#[derive(Debug)]
pub enum CampaignAction {
    /// A collection scheme list document arrived from the cloud.
    UpdateSchemeList(Vec<u8>),
    /// A decoder manifest document arrived from the cloud.
    UpdateDecoderManifest(Vec<u8>),
    /// Re-run the scheduling pass now.
    Review,
    CollectStats(oneshot::Sender<CampaignStats>),
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignStats {
    pub enabled: usize,
    pub idle: usize,
    pub rebuilds: u64,
}

/// Heartbeat document content: every known artifact id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckinDocument {
    pub document_sync_ids: Vec<SyncId>,
}

/// Snapshot subscriptions handed to the rest of the pipeline. Receivers see
/// a fresh `Arc` on every rebuild and must never assume two snapshots share
/// state.
#[derive(Debug, Clone)]
pub struct CampaignSnapshots {
    pub inspection_matrix: watch::Receiver<Arc<InspectionMatrix>>,
    pub fetch_matrix: watch::Receiver<Arc<FetchMatrix>>,
    pub decoder_dictionary: watch::Receiver<Arc<DecoderDictionarySet>>,
    pub enabled_schemes: watch::Receiver<Arc<Vec<Arc<CollectionScheme>>>>,
    pub checkin_document: watch::Receiver<Option<Arc<CheckinDocument>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Enabled,
}

#[derive(Debug)]
struct SchemeState {
    scheme: Arc<CollectionScheme>,
    phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WakeTarget {
    Scheme(SyncId),
    Checkin,
}

#[derive(Debug)]
struct TimeEvent {
    wake_ms: Timestamp,
    target: WakeTarget,
}

pub struct CampaignManager {
    clock: Arc<dyn Clock>,
    store: Arc<PersistencyStore>,
    metrics: Arc<dyn Metrics>,
    mailbox: mpsc::Receiver<CampaignAction>,
    cancellation_token: CancellationToken,
    checkin_interval_ms: u64,

    schemes: HashMap<SyncId, SchemeState>,
    manifest: Option<Arc<DecoderManifest>>,
    /// Time-ordered queue; earliest wake first.
    events: Vec<TimeEvent>,
    rebuilds: u64,

    inspection_tx: watch::Sender<Arc<InspectionMatrix>>,
    fetch_tx: watch::Sender<Arc<FetchMatrix>>,
    decoder_tx: watch::Sender<Arc<DecoderDictionarySet>>,
    enabled_tx: watch::Sender<Arc<Vec<Arc<CollectionScheme>>>>,
    checkin_tx: watch::Sender<Option<Arc<CheckinDocument>>>,
}

impl CampaignManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<PersistencyStore>,
        metrics: Arc<dyn Metrics>,
        checkin_interval_ms: u64,
        cancellation_token: CancellationToken,
    ) -> (Self, mpsc::Sender<CampaignAction>, CampaignSnapshots) {
        let (action_tx, mailbox) = mpsc::channel(16);
        let (inspection_tx, inspection_rx) = watch::channel(Arc::new(InspectionMatrix::default()));
        let (fetch_tx, fetch_rx) = watch::channel(Arc::new(FetchMatrix::default()));
        let (decoder_tx, decoder_rx) = watch::channel(Arc::new(DecoderDictionarySet::default()));
        let (enabled_tx, enabled_rx) = watch::channel(Arc::new(Vec::new()));
        let (checkin_tx, checkin_rx) = watch::channel(None);
        let snapshots = CampaignSnapshots {
            inspection_matrix: inspection_rx,
            fetch_matrix: fetch_rx,
            decoder_dictionary: decoder_rx,
            enabled_schemes: enabled_rx,
            checkin_document: checkin_rx,
        };
        let manager = CampaignManager {
            clock,
            store,
            metrics,
            mailbox,
            cancellation_token,
            checkin_interval_ms,
            schemes: HashMap::new(),
            manifest: None,
            events: Vec::new(),
            rebuilds: 0,
            inspection_tx,
            fetch_tx,
            decoder_tx,
            enabled_tx,
            checkin_tx,
        };
        (manager, action_tx, snapshots)
    }

    /// Re-ingest the artifacts accepted before the last restart, if any.
    fn restore_persisted(&mut self) {
        match self.store.read(DataKind::DecoderManifest, PERSISTED_ARTIFACT_NAME) {
            Ok(bytes) => {
                if let Err(e) = self.ingest_manifest(&bytes, false) {
                    error!(component = "campaign", error = %e, "persisted decoder manifest is unreadable");
                }
            }
            Err(EdgeError::NotFound(_)) => {}
            Err(e) => error!(component = "campaign", error = %e, "reading persisted decoder manifest"),
        }
        match self
            .store
            .read(DataKind::CollectionSchemeList, PERSISTED_ARTIFACT_NAME)
        {
            Ok(bytes) => {
                if let Err(e) = self.ingest_scheme_list(&bytes, false) {
                    error!(component = "campaign", error = %e, "persisted scheme list is unreadable");
                }
            }
            Err(EdgeError::NotFound(_)) => {}
            Err(e) => error!(component = "campaign", error = %e, "reading persisted scheme list"),
        }
    }

    fn persist(&self, kind: DataKind, bytes: &[u8]) {
        // In-memory state stays authoritative when persistence fails.
        if let Err(e) = self.store.write(kind, PERSISTED_ARTIFACT_NAME, bytes) {
            error!(component = "campaign", error = %e, ?kind, "persisting accepted artifact failed");
        }
    }

    fn ingest_manifest(&mut self, bytes: &[u8], persist: bool) -> Result<(), EdgeError> {
        let mut ingestion = DecoderManifestIngestion::new();
        ingestion.copy_data(bytes)?;
        ingestion.build()?;
        #[allow(clippy::unwrap_used)] // build() success guarantees a manifest
        let manifest = Arc::new(ingestion.into_manifest().unwrap());
        info!(component = "campaign", manifest = %manifest.sync_id(), "accepted decoder manifest");
        self.manifest = Some(manifest);
        if persist {
            self.persist(DataKind::DecoderManifest, bytes);
        }
        Ok(())
    }

    fn ingest_scheme_list(&mut self, bytes: &[u8], persist: bool) -> Result<(), EdgeError> {
        let mut ingestion = CollectionSchemeListIngestion::new();
        ingestion.copy_data(bytes)?;
        ingestion.build()?;
        #[allow(clippy::unwrap_used)] // build() success guarantees a list
        let list = ingestion.into_list().unwrap();
        let now = self.clock.system_time_ms();

        let mut incoming: HashMap<&SyncId, &Arc<CollectionScheme>> =
            list.schemes.iter().map(|s| (&s.sync_id, s)).collect();

        // Known schemes absent from the new list, or redefined with new
        // content, are retired.
        let retired: Vec<SyncId> = self
            .schemes
            .iter()
            .filter(|(id, state)| {
                incoming
                    .get(id)
                    .map(|s| s.content_digest != state.scheme.content_digest)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &retired {
            debug!(component = "campaign", scheme = %id, "retiring scheme");
            self.schemes.remove(id);
            self.events.retain(|e| e.target != WakeTarget::Scheme(id.clone()));
        }
        incoming.retain(|id, _| !self.schemes.contains_key(*id));

        for scheme in incoming.into_values() {
            self.classify(scheme.clone(), now);
        }
        info!(
            component = "campaign",
            schemes = list.schemes.len(),
            "accepted collection scheme list"
        );
        if persist {
            self.persist(DataKind::CollectionSchemeList, bytes);
        }
        Ok(())
    }

    /// Places a new scheme into idle or enabled according to its window and
    /// the active decoder manifest, enqueueing the next transition.
    fn classify(&mut self, scheme: Arc<CollectionScheme>, now: Timestamp) {
        let id = scheme.sync_id.clone();
        if scheme.expiry_time <= now {
            debug!(component = "campaign", scheme = %id, "dropping already expired scheme");
            return;
        }
        let manifest_matches = self
            .manifest
            .as_ref()
            .map(|m| *m.sync_id() == scheme.decoder_manifest_id)
            .unwrap_or(false);
        let phase = if scheme.start_time > now {
            self.enqueue(scheme.start_time, WakeTarget::Scheme(id.clone()));
            Phase::Idle
        } else if !manifest_matches {
            // Stays idle until its manifest arrives, but must still retire.
            self.enqueue(scheme.expiry_time, WakeTarget::Scheme(id.clone()));
            Phase::Idle
        } else {
            self.enqueue(scheme.expiry_time, WakeTarget::Scheme(id.clone()));
            Phase::Enabled
        };
        self.schemes.insert(id, SchemeState { scheme, phase });
    }

    fn enqueue(&mut self, wake_ms: Timestamp, target: WakeTarget) {
        if let Some(idx) = self.events.iter().position(|e| e.target == target) {
            self.events.remove(idx);
        }
        let insert_idx = self
            .events
            .binary_search_by(|e| e.wake_ms.cmp(&wake_ms))
            .unwrap_or_else(|i| i);
        self.events.insert(insert_idx, TimeEvent { wake_ms, target });
    }

    /// Pops every due event and applies the idle/enabled/retired moves.
    /// Returns true when the enabled set changed.
    fn process_due_events(&mut self, now: Timestamp) -> bool {
        let mut changed = false;
        while self.events.first().map(|e| e.wake_ms <= now).unwrap_or(false) {
            let event = self.events.remove(0);
            match event.target {
                WakeTarget::Checkin => {
                    self.publish_checkin_document();
                    self.enqueue(now + self.checkin_interval_ms, WakeTarget::Checkin);
                }
                WakeTarget::Scheme(id) => {
                    let Some(state) = self.schemes.get_mut(&id) else {
                        continue;
                    };
                    if state.scheme.expiry_time <= now {
                        info!(component = "campaign", scheme = %id, "scheme expired, retiring");
                        changed |= state.phase == Phase::Enabled;
                        self.schemes.remove(&id);
                    } else if state.phase == Phase::Idle {
                        let manifest_matches = self
                            .manifest
                            .as_ref()
                            .map(|m| *m.sync_id() == state.scheme.decoder_manifest_id)
                            .unwrap_or(false);
                        let expiry = state.scheme.expiry_time;
                        if state.scheme.start_time <= now && manifest_matches {
                            info!(component = "campaign", scheme = %id, "scheme window opened, enabling");
                            state.phase = Phase::Enabled;
                            changed = true;
                        }
                        // Either way the scheme must wake again to retire.
                        self.enqueue(expiry, WakeTarget::Scheme(id));
                    }
                }
            }
        }
        changed
    }

    /// Re-examines idle schemes whose decoder manifest may now match.
    fn reexamine_idle(&mut self, now: Timestamp) -> bool {
        let ids: Vec<SyncId> = self
            .schemes
            .iter()
            .filter(|(_, s)| s.phase == Phase::Idle)
            .map(|(id, _)| id.clone())
            .collect();
        let mut changed = false;
        for id in ids {
            let Some(state) = self.schemes.get(&id) else { continue };
            let scheme = state.scheme.clone();
            let manifest_matches = self
                .manifest
                .as_ref()
                .map(|m| *m.sync_id() == scheme.decoder_manifest_id)
                .unwrap_or(false);
            if manifest_matches && scheme.start_time <= now && scheme.expiry_time > now {
                #[allow(clippy::unwrap_used)] // checked above
                let state = self.schemes.get_mut(&id).unwrap();
                state.phase = Phase::Enabled;
                self.enqueue(scheme.expiry_time, WakeTarget::Scheme(id));
                changed = true;
            }
        }
        changed
    }

    fn enabled_schemes(&self) -> Vec<Arc<CollectionScheme>> {
        let mut enabled: Vec<_> = self
            .schemes
            .values()
            .filter(|s| s.phase == Phase::Enabled)
            .map(|s| s.scheme.clone())
            .collect();
        enabled.sort_by(|a, b| a.sync_id.cmp(&b.sync_id));
        enabled
    }

    /// Rebuilds and publishes every artifact snapshot. Never mutates a
    /// previously published snapshot.
    pub(crate) fn rebuild(&mut self) {
        let enabled = self.enabled_schemes();
        let empty_manifest = DecoderManifest::default();
        let manifest = self.manifest.as_deref().unwrap_or(&empty_manifest);
        let matrix = build_inspection_matrix(&enabled, manifest);
        let fetch = build_fetch_matrix(&enabled);
        let required = matrix.required_signals();
        let dictionary = build_decoder_dictionaries(manifest, &required);

        info!(
            component = "campaign",
            enabled = enabled.len(),
            conditions = matrix.conditions.len(),
            signals = required.len(),
            "publishing rebuilt artifacts"
        );
        self.inspection_tx.send_replace(matrix);
        self.fetch_tx.send_replace(fetch);
        self.decoder_tx.send_replace(dictionary);
        self.enabled_tx.send_replace(Arc::new(enabled));
        self.rebuilds += 1;
        self.metrics.increment(names::CAMPAIGN_REBUILDS);
        self.publish_checkin_document();
    }

    fn publish_checkin_document(&self) {
        let mut ids: Vec<SyncId> = self.schemes.keys().cloned().collect();
        ids.sort();
        if let Some(manifest) = &self.manifest {
            ids.push(manifest.sync_id().clone());
        }
        let doc = Arc::new(CheckinDocument {
            document_sync_ids: ids,
        });
        self.checkin_tx.send_if_modified(|current| {
            if current.as_ref().map(|c| **c == *doc).unwrap_or(false) {
                false
            } else {
                *current = Some(doc.clone());
                true
            }
        });
    }

    /// One scheduling pass: apply due transitions and rebuild artifacts if
    /// the enabled set changed.
    pub(crate) fn review(&mut self, now: Timestamp) {
        let mut changed = self.process_due_events(now);
        changed |= self.reexamine_idle(now);
        if changed {
            self.rebuild();
        } else {
            self.publish_checkin_document();
        }
    }

    fn stats(&self) -> CampaignStats {
        CampaignStats {
            enabled: self
                .schemes
                .values()
                .filter(|s| s.phase == Phase::Enabled)
                .count(),
            idle: self
                .schemes
                .values()
                .filter(|s| s.phase == Phase::Idle)
                .count(),
            rebuilds: self.rebuilds,
        }
    }

    async fn recv_next_action(&mut self) -> CampaignAction {
        let action = if let Some(wake_ms) = self.events.first().map(|e| e.wake_ms) {
            let now = self.clock.system_time_ms();
            if wake_ms <= now {
                return CampaignAction::Review;
            }
            match tokio::time::timeout(
                Duration::from_millis(wake_ms - now),
                self.mailbox.recv(),
            )
            .await
            {
                Ok(action) => action,
                Err(_) => Some(CampaignAction::Review),
            }
        } else {
            self.mailbox.recv().await
        };
        // A closed mailbox means the handle is gone; shut down.
        action.unwrap_or(CampaignAction::Stop)
    }

    fn dispatch(&mut self, action: CampaignAction) -> ControlFlow<()> {
        let now = self.clock.system_time_ms();
        match action {
            CampaignAction::UpdateSchemeList(bytes) => {
                match self.ingest_scheme_list(&bytes, true) {
                    // Any update can change the enabled set.
                    Ok(()) => {
                        self.reexamine_idle(now);
                        self.process_due_events(now);
                        self.rebuild();
                    }
                    Err(e) => {
                        error!(component = "campaign", error = %e, "rejected scheme list, keeping previous");
                    }
                }
            }
            CampaignAction::UpdateDecoderManifest(bytes) => {
                match self.ingest_manifest(&bytes, true) {
                    Ok(()) => {
                        // Enabled schemes bound to a superseded manifest id
                        // fall back to idle.
                        let current = self
                            .manifest
                            .as_ref()
                            .map(|m| m.sync_id().clone())
                            .unwrap_or_default();
                        for state in self.schemes.values_mut() {
                            if state.phase == Phase::Enabled
                                && state.scheme.decoder_manifest_id != current
                            {
                                state.phase = Phase::Idle;
                            }
                        }
                        self.reexamine_idle(now);
                        self.process_due_events(now);
                        self.rebuild();
                    }
                    Err(e) => {
                        error!(component = "campaign", error = %e, "rejected decoder manifest, keeping previous");
                    }
                }
            }
            CampaignAction::Review => self.review(now),
            CampaignAction::CollectStats(reply) => {
                let _ = reply.send(self.stats());
            }
            CampaignAction::Stop => return BREAK,
        }
        CONTINUE
    }
}

#[async_trait]
impl Worker for CampaignManager {
    async fn run(&mut self) {
        self.restore_persisted();
        let now = self.clock.system_time_ms();
        self.enqueue(now + self.checkin_interval_ms, WakeTarget::Checkin);
        self.review(now);
        self.rebuild();
        loop {
            if self.cancellation_token.is_cancelled() {
                return;
            }
            let cancelled = self.cancellation_token.clone();
            let action = tokio::select! {
                _ = cancelled.cancelled() => return,
                action = self.recv_next_action() => action,
            };
            match self.dispatch(action) {
                ControlFlow::Continue(()) => {}
                ControlFlow::Break(()) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scheme_json;
    use crate::test_support::sample_manifest_json;
    use ddfleet_common::metrics::InMemoryMetrics;
    use ddfleet_common::time::ManualClock;

    fn manager(
        clock: Arc<ManualClock>,
        dir: &tempfile::TempDir,
    ) -> (CampaignManager, mpsc::Sender<CampaignAction>, CampaignSnapshots) {
        let store = Arc::new(PersistencyStore::new(dir.path(), 16 * 1024 * 1024).unwrap());
        CampaignManager::new(
            clock,
            store,
            Arc::new(InMemoryMetrics::new()),
            300_000,
            CancellationToken::new(),
        )
    }

    fn manifest_bytes() -> Vec<u8> {
        serde_json::to_vec(&sample_manifest_json()).unwrap()
    }

    fn list_bytes(docs: &[serde_json::Value]) -> Vec<u8> {
        serde_json::to_vec(docs).unwrap()
    }

    #[test]
    fn test_idle_enabled_retired_lifecycle() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _tx, snapshots) = manager(clock.clone(), &dir);

        manager.ingest_manifest(&manifest_bytes(), false).unwrap();
        // Window opens at 1_010 and closes at 1_050.
        manager
            .ingest_scheme_list(&list_bytes(&[scheme_json("cs-1", 1_010, 1_050)]), false)
            .unwrap();
        manager.review(1_005);
        assert_eq!(manager.stats().idle, 1);
        assert_eq!(manager.stats().enabled, 0);

        clock.set(1_015);
        manager.review(1_015);
        assert_eq!(manager.stats().enabled, 1);
        assert_eq!(snapshots.inspection_matrix.borrow().conditions.len(), 1);

        clock.set(1_060);
        manager.review(1_060);
        assert_eq!(manager.stats().enabled, 0);
        assert_eq!(manager.stats().idle, 0);
        assert!(snapshots.inspection_matrix.borrow().conditions.is_empty());
        // Exactly two artifact publications: enable and retire.
        assert_eq!(manager.stats().rebuilds, 2);
    }

    #[test]
    fn test_expired_scheme_dropped_on_ingest() {
        let clock = ManualClock::starting_at(10_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _tx, _snapshots) = manager(clock, &dir);
        manager.ingest_manifest(&manifest_bytes(), false).unwrap();
        manager
            .ingest_scheme_list(&list_bytes(&[scheme_json("cs-old", 100, 200)]), false)
            .unwrap();
        assert_eq!(manager.stats().idle + manager.stats().enabled, 0);
    }

    #[test]
    fn test_scheme_stays_idle_without_matching_manifest() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _tx, snapshots) = manager(clock, &dir);
        // No manifest ingested: in-window scheme stays idle.
        manager
            .ingest_scheme_list(&list_bytes(&[scheme_json("cs-1", 0, 10_000)]), false)
            .unwrap();
        manager.review(1_000);
        assert_eq!(manager.stats().idle, 1);
        assert_eq!(manager.stats().enabled, 0);

        // The matching manifest arrives and the scheme becomes enabled.
        manager.ingest_manifest(&manifest_bytes(), false).unwrap();
        manager.review(1_001);
        assert_eq!(manager.stats().enabled, 1);
        assert_eq!(
            snapshots
                .decoder_dictionary
                .borrow()
                .raw_bus
                .signal_ids
                .len(),
            1
        );
    }

    #[test]
    fn test_redefined_scheme_is_replaced() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _tx, _snapshots) = manager(clock, &dir);
        manager.ingest_manifest(&manifest_bytes(), false).unwrap();
        manager
            .ingest_scheme_list(&list_bytes(&[scheme_json("cs-1", 0, 10_000)]), false)
            .unwrap();
        manager.review(1_000);
        let digest_before = manager.schemes["cs-1"].scheme.content_digest;

        let mut changed = scheme_json("cs-1", 0, 10_000);
        changed["priority"] = serde_json::json!(9);
        manager
            .ingest_scheme_list(&list_bytes(&[changed]), false)
            .unwrap();
        manager.review(1_001);
        let state = &manager.schemes["cs-1"];
        assert_ne!(state.scheme.content_digest, digest_before);
        assert_eq!(state.scheme.priority, 9);
        assert_eq!(state.phase, Phase::Enabled);
    }

    #[test]
    fn test_replay_of_same_list_is_idempotent() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _tx, _snapshots) = manager(clock, &dir);
        manager.ingest_manifest(&manifest_bytes(), false).unwrap();
        let bytes = list_bytes(&[scheme_json("cs-1", 0, 10_000)]);
        manager.ingest_scheme_list(&bytes, false).unwrap();
        manager.review(1_000);
        let rebuilds = manager.stats().rebuilds;

        manager.ingest_scheme_list(&bytes, false).unwrap();
        manager.review(1_001);
        assert_eq!(manager.stats().enabled, 1);
        // Nothing changed, so nothing was republished.
        assert_eq!(manager.stats().rebuilds, rebuilds);
    }

    #[test]
    fn test_invalid_update_keeps_previous_artifacts() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _tx, _snapshots) = manager(clock, &dir);
        manager.ingest_manifest(&manifest_bytes(), false).unwrap();
        manager
            .ingest_scheme_list(&list_bytes(&[scheme_json("cs-1", 0, 10_000)]), false)
            .unwrap();
        manager.review(1_000);

        assert!(manager.ingest_scheme_list(b"{broken", false).is_err());
        assert_eq!(manager.stats().enabled, 1);
    }

    #[test]
    fn test_checkin_document_lists_all_artifacts() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _tx, snapshots) = manager(clock, &dir);
        manager.ingest_manifest(&manifest_bytes(), false).unwrap();
        manager
            .ingest_scheme_list(
                &list_bytes(&[
                    scheme_json("cs-1", 0, 10_000),
                    scheme_json("cs-2", 5_000, 10_000),
                ]),
                false,
            )
            .unwrap();
        manager.review(1_000);
        let doc = snapshots.checkin_document.borrow().clone().unwrap();
        assert_eq!(
            doc.document_sync_ids,
            vec!["cs-1".to_string(), "cs-2".to_string(), "dm-1".to_string()]
        );
    }

    #[test]
    fn test_persistence_roundtrip_restores_state() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut manager, _tx, _snapshots) = manager(clock.clone(), &dir);
            manager.ingest_manifest(&manifest_bytes(), true).unwrap();
            manager
                .ingest_scheme_list(&list_bytes(&[scheme_json("cs-1", 0, 10_000)]), true)
                .unwrap();
        }
        let (mut restored, _tx, _snapshots) = manager(clock, &dir);
        restored.restore_persisted();
        restored.review(1_500);
        assert_eq!(restored.stats().enabled, 1);
    }

    #[tokio::test]
    async fn test_worker_loop_processes_actions() {
        let clock = ManualClock::starting_at(1_000);
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, tx, snapshots) = manager(clock, &dir);
        let handle = tokio::spawn(async move {
            manager.run().await;
        });
        tx.send(CampaignAction::UpdateDecoderManifest(manifest_bytes()))
            .await
            .unwrap();
        tx.send(CampaignAction::UpdateSchemeList(list_bytes(&[scheme_json(
            "cs-1", 0, 10_000,
        )])))
        .await
        .unwrap();
        let (stats_tx, stats_rx) = oneshot::channel();
        tx.send(CampaignAction::CollectStats(stats_tx)).await.unwrap();
        let stats = stats_rx.await.unwrap();
        assert_eq!(stats.enabled, 1);
        assert_eq!(snapshots.inspection_matrix.borrow().conditions.len(), 1);

        tx.send(CampaignAction::Stop).await.unwrap();
        handle.await.unwrap();
    }
}
