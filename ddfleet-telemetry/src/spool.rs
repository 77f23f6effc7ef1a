// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk spool for payloads whose publish failed: flat files named
//! `<event_id>-<trigger_time>.bin` plus a JSON metadata sidecar listing
//! `{filename, payloadSize, compressionRequired}`.

use crate::sender::{PayloadChunk, TelemetryDataSender};
use bytes::Bytes;
use ddfleet_common::persistency::{DataKind, PersistencyStore};
use ddfleet_common::EdgeError;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct PayloadSpool {
    store: Arc<PersistencyStore>,
}

impl PayloadSpool {
    pub fn new(store: Arc<PersistencyStore>) -> Self {
        PayloadSpool { store }
    }

    fn chunk_filename(chunk: &PayloadChunk) -> String {
        if chunk.part_number <= 1 {
            format!("{}-{}.bin", chunk.event_id, chunk.trigger_time_ms)
        } else {
            format!(
                "{}-{}-{}.bin",
                chunk.event_id, chunk.trigger_time_ms, chunk.part_number
            )
        }
    }

    pub fn store_chunk(&self, chunk: &PayloadChunk) -> Result<(), EdgeError> {
        let filename = Self::chunk_filename(chunk);
        self.store
            .write(DataKind::EdgeToCloudPayload, &filename, &chunk.data)?;
        self.store.add_metadata(json!({
            "filename": filename,
            "payloadSize": chunk.data.len(),
            "compressionRequired": chunk.compressed,
        }))?;
        info!(
            component = "telemetry",
            filename = %Self::chunk_filename(chunk),
            size = chunk.data.len(),
            "payload spooled for later upload"
        );
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.store.get_metadata().map(|m| m.len()).unwrap_or(0)
    }

    /// Republishes every spooled payload, deleting files on success.
    /// Entries whose file vanished are dropped; failures stay queued.
    pub async fn replay(&self, sender: &TelemetryDataSender) {
        let entries = match self.store.get_metadata() {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => return,
            Err(e) => {
                warn!(component = "telemetry", error = %e, "cannot read spool metadata");
                return;
            }
        };
        let mut remaining = Vec::new();
        for entry in entries {
            let Some(filename) = entry["filename"].as_str().map(str::to_owned) else {
                // Corrupt entry, drop it.
                continue;
            };
            let bytes = match self.store.read(DataKind::EdgeToCloudPayload, &filename) {
                Ok(bytes) => bytes,
                Err(EdgeError::NotFound(_)) => {
                    debug!(component = "telemetry", filename = %filename,
                        "spooled file vanished, dropping its metadata entry");
                    continue;
                }
                Err(e) => {
                    warn!(component = "telemetry", filename = %filename, error = %e,
                        "cannot read spooled payload");
                    remaining.push(entry);
                    continue;
                }
            };
            match sender.process_persisted_data(Bytes::from(bytes)).await {
                Ok(()) => {
                    if let Err(e) = self.store.erase(DataKind::EdgeToCloudPayload, &filename) {
                        warn!(component = "telemetry", filename = %filename, error = %e,
                            "cannot delete uploaded spool file");
                    }
                }
                Err(e) => {
                    debug!(component = "telemetry", filename = %filename, error = %e,
                        "spooled payload still cannot be sent");
                    remaining.push(entry);
                }
            }
        }
        if let Err(e) = self.store.clear_metadata() {
            warn!(component = "telemetry", error = %e, "cannot rewrite spool metadata");
            return;
        }
        for entry in remaining {
            if let Err(e) = self.store.add_metadata(entry) {
                warn!(component = "telemetry", error = %e, "cannot rewrite spool metadata");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload_writer::JsonPayloadWriter;
    use crate::sender::test_support::MockTransport;
    use crate::sender::PayloadAdaptionConfig;
    use ddfleet_common::metrics::InMemoryMetrics;
    use ddfleet_common::MutexExt;
    use ddfleet_inspection::raw_buffer::{RawBufferConfig, RawBufferManager};
    use std::sync::atomic::Ordering;

    fn spool(dir: &tempfile::TempDir) -> (Arc<PersistencyStore>, PayloadSpool) {
        let store = Arc::new(PersistencyStore::new(dir.path(), 1 << 20).unwrap());
        (store.clone(), PayloadSpool::new(store))
    }

    fn chunk(event_id: u32, data: &[u8]) -> PayloadChunk {
        PayloadChunk {
            data: Bytes::copy_from_slice(data),
            compressed: false,
            persist: true,
            partition_id: None,
            part_number: 1,
            event_id,
            trigger_time_ms: 777,
        }
    }

    fn sender(transport: Arc<MockTransport>) -> TelemetryDataSender {
        let raw = Arc::new(RawBufferManager::new(
            RawBufferConfig::default(),
            Arc::new(InMemoryMetrics::new()),
        ));
        TelemetryDataSender::new(
            transport,
            Box::new(JsonPayloadWriter::new(raw.clone())),
            PayloadAdaptionConfig::default_uncompressed(),
            PayloadAdaptionConfig::default_compressed(),
            None,
            None,
            raw,
            Arc::new(InMemoryMetrics::new()),
        )
    }

    #[test]
    fn test_store_writes_file_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let (store, spool) = spool(&dir);
        spool.store_chunk(&chunk(5, b"payload-bytes")).unwrap();

        assert_eq!(
            store
                .read(DataKind::EdgeToCloudPayload, "5-777.bin")
                .unwrap(),
            b"payload-bytes"
        );
        let metadata = store.get_metadata().unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0]["filename"], "5-777.bin");
        assert_eq!(metadata[0]["payloadSize"], 13);
        assert_eq!(metadata[0]["compressionRequired"], false);
    }

    #[tokio::test]
    async fn test_replay_uploads_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        let (store, spool) = spool(&dir);
        spool.store_chunk(&chunk(1, b"first")).unwrap();
        spool.store_chunk(&chunk(2, b"second")).unwrap();

        let transport = MockTransport::new(1_000);
        let sender = sender(transport.clone());
        spool.replay(&sender).await;

        assert_eq!(transport.sent.lock_or_panic().len(), 2);
        assert_eq!(spool.pending(), 0);
        assert!(matches!(
            store.read(DataKind::EdgeToCloudPayload, "1-777.bin"),
            Err(EdgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_keeps_failed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, spool) = spool(&dir);
        spool.store_chunk(&chunk(1, b"first")).unwrap();
        spool.store_chunk(&chunk(2, b"second")).unwrap();

        let transport = MockTransport::new(1_000);
        transport.failures_left.store(1, Ordering::SeqCst);
        let sender = sender(transport.clone());
        spool.replay(&sender).await;

        // One made it, one is still pending for the next sweep.
        assert_eq!(transport.sent.lock_or_panic().len(), 1);
        assert_eq!(spool.pending(), 1);

        spool.replay(&sender).await;
        assert_eq!(spool.pending(), 0);
    }

    #[tokio::test]
    async fn test_vanished_file_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, spool) = spool(&dir);
        spool.store_chunk(&chunk(1, b"gone")).unwrap();
        store.erase(DataKind::EdgeToCloudPayload, "1-777.bin").unwrap();

        let transport = MockTransport::new(1_000);
        let sender = sender(transport.clone());
        spool.replay(&sender).await;
        assert_eq!(spool.pending(), 0);
        assert!(transport.sent.lock_or_panic().is_empty());
    }
}
