// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One durable append-only partition stream: size-bounded segment files
//! plus a small key-value store holding the read checkpoint and the config
//! hash. Records are durably visible once `append` returns.

use ddfleet_common::time::Timestamp;
use ddfleet_common::EdgeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const KV_DIR: &str = "kv";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const SEGMENT_SUFFIX: &str = ".log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub seq: u64,
    pub trigger_time_ms: Timestamp,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Checkpoint {
    last_read_seq: u64,
    config_hash: u64,
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    first_seq: u64,
    last_seq: u64,
    bytes: u64,
    /// Append time of the newest record, for TTL checks.
    newest_append_ms: Timestamp,
}

/// Stream limits derived from the partition config.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub max_bytes: u64,
    pub min_ttl_ms: u64,
    /// A new segment starts once the active one crosses this size.
    pub soft_segment_bytes: u64,
    pub config_hash: u64,
}

#[derive(Debug)]
pub struct PartitionStream {
    dir: PathBuf,
    limits: StreamLimits,
    segments: Vec<Segment>,
    next_seq: u64,
    read_seq: u64,
    total_bytes: u64,
}

impl PartitionStream {
    /// Opens (or creates) the stream under `dir`, replaying existing
    /// segments. A config hash mismatch wipes the stream: the partition was
    /// reconfigured and old records no longer match it.
    pub fn open(dir: impl Into<PathBuf>, limits: StreamLimits) -> Result<Self, EdgeError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(KV_DIR)).map_err(EdgeError::FatalIo)?;

        let checkpoint = read_checkpoint(&dir).unwrap_or_default();
        if checkpoint.config_hash != 0 && checkpoint.config_hash != limits.config_hash {
            debug!(
                component = "store",
                dir = %dir.display(),
                "partition config changed, wiping stream"
            );
            wipe_segments(&dir)?;
            let mut stream = PartitionStream {
                dir,
                limits,
                segments: Vec::new(),
                next_seq: 0,
                read_seq: 0,
                total_bytes: 0,
            };
            stream.write_checkpoint()?;
            return Ok(stream);
        }

        let had_checkpoint = checkpoint.config_hash != 0;
        let mut stream = PartitionStream {
            dir,
            limits,
            segments: Vec::new(),
            next_seq: 0,
            read_seq: checkpoint.last_read_seq,
            total_bytes: 0,
        };
        stream.replay()?;
        if !had_checkpoint {
            // Record the config hash now so a later reconfigure is detected
            // even if nothing was ever read.
            stream.write_checkpoint()?;
        }
        Ok(stream)
    }

    /// Rebuilds the segment index from disk. Unparseable segment files are
    /// quarantined by deletion; the rest of the stream stays readable.
    fn replay(&mut self) -> Result<(), EdgeError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(EdgeError::FatalIo)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
            .collect();
        paths.sort();
        for path in paths {
            match read_segment(&path) {
                Ok(records) if records.is_empty() => {
                    let _ = fs::remove_file(&path);
                }
                Ok(records) => {
                    let bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    #[allow(clippy::unwrap_used)] // non-empty checked above
                    let segment = Segment {
                        path,
                        first_seq: records.first().unwrap().seq,
                        last_seq: records.last().unwrap().seq,
                        bytes,
                        newest_append_ms: records.last().unwrap().trigger_time_ms,
                    };
                    self.next_seq = self.next_seq.max(segment.last_seq + 1);
                    self.total_bytes += segment.bytes;
                    self.segments.push(segment);
                }
                Err(e) => {
                    warn!(component = "store", path = %path.display(), error = %e,
                        "unreadable segment file, deleting");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        self.read_seq = self
            .read_seq
            .max(self.segments.first().map(|s| s.first_seq).unwrap_or(0));
        Ok(())
    }

    /// Appends one record, enforcing the byte quota. Oldest segments are
    /// deleted first, but only when every record in them has outlived the
    /// partition TTL; otherwise the append fails with `QuotaExceeded`.
    pub fn append(
        &mut self,
        trigger_time_ms: Timestamp,
        payload: Vec<u8>,
        compressed: bool,
        now_ms: Timestamp,
    ) -> Result<u64, EdgeError> {
        let record = StreamRecord {
            seq: self.next_seq,
            trigger_time_ms,
            payload,
            compressed,
        };
        let encoded = encode_record(&record)?;

        while self.total_bytes + encoded.len() as u64 > self.limits.max_bytes {
            let Some(oldest) = self.segments.first() else {
                return Err(EdgeError::QuotaExceeded("stream partition"));
            };
            let is_active = self.segments.len() == 1;
            if is_active && oldest.bytes + (encoded.len() as u64) <= self.limits.soft_segment_bytes
            {
                // The record fits the active segment; quota is simply too
                // small for it.
                return Err(EdgeError::QuotaExceeded("stream partition"));
            }
            if oldest.newest_append_ms + self.limits.min_ttl_ms > now_ms {
                return Err(EdgeError::QuotaExceeded("stream partition"));
            }
            let oldest = self.segments.remove(0);
            self.total_bytes -= oldest.bytes;
            fs::remove_file(&oldest.path).map_err(EdgeError::TransientIo)?;
            debug!(component = "store", path = %oldest.path.display(), "evicted oldest segment for quota");
        }

        let segment_path = match self.segments.last() {
            Some(active) if active.bytes < self.limits.soft_segment_bytes => active.path.clone(),
            _ => {
                let path = self
                    .dir
                    .join(format!("{:010}{}", record.seq, SEGMENT_SUFFIX));
                self.segments.push(Segment {
                    path: path.clone(),
                    first_seq: record.seq,
                    last_seq: record.seq,
                    bytes: 0,
                    newest_append_ms: now_ms,
                });
                path
            }
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)
            .map_err(EdgeError::TransientIo)?;
        file.write_all(&encoded).map_err(EdgeError::TransientIo)?;
        file.sync_data().map_err(EdgeError::TransientIo)?;

        #[allow(clippy::unwrap_used)] // an active segment exists here
        let active = self.segments.last_mut().unwrap();
        active.bytes += encoded.len() as u64;
        active.last_seq = record.seq;
        active.newest_append_ms = now_ms;
        self.total_bytes += encoded.len() as u64;
        self.next_seq += 1;
        Ok(record.seq)
    }

    /// Oldest unread record, if any. Does not advance the read pointer.
    pub fn read_next(&mut self) -> Result<Option<StreamRecord>, EdgeError> {
        // Skip past records that quota eviction removed underneath us.
        if let Some(first) = self.segments.first() {
            if self.read_seq < first.first_seq {
                self.read_seq = first.first_seq;
            }
        }
        let Some(segment) = self
            .segments
            .iter()
            .find(|s| s.last_seq >= self.read_seq)
        else {
            return Ok(None);
        };
        let records = read_segment(&segment.path)?;
        Ok(records.into_iter().find(|r| r.seq >= self.read_seq))
    }

    /// Advances the read pointer past `seq` and persists it. The pointer
    /// survives restarts; unacknowledged records are redelivered.
    pub fn checkpoint(&mut self, seq: u64) -> Result<(), EdgeError> {
        self.read_seq = self.read_seq.max(seq + 1);
        self.write_checkpoint()
    }

    pub fn unread_count(&self) -> u64 {
        self.next_seq.saturating_sub(self.read_seq.max(
            self.segments.first().map(|s| s.first_seq).unwrap_or(0),
        ))
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn write_checkpoint(&self) -> Result<(), EdgeError> {
        let checkpoint = Checkpoint {
            last_read_seq: self.read_seq,
            config_hash: self.limits.config_hash,
        };
        let path = self.dir.join(KV_DIR).join(CHECKPOINT_FILE);
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec(&checkpoint)
            .map_err(|e| EdgeError::invalid_format(e.to_string()))?;
        fs::write(&tmp, bytes).map_err(EdgeError::TransientIo)?;
        fs::rename(&tmp, &path).map_err(EdgeError::TransientIo)?;
        Ok(())
    }
}

fn read_checkpoint(dir: &Path) -> Option<Checkpoint> {
    let bytes = fs::read(dir.join(KV_DIR).join(CHECKPOINT_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn wipe_segments(dir: &Path) -> Result<(), EdgeError> {
    for entry in fs::read_dir(dir).map_err(EdgeError::FatalIo)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("log") {
            fs::remove_file(&path).map_err(EdgeError::TransientIo)?;
        }
    }
    Ok(())
}

fn encode_record(record: &StreamRecord) -> Result<Vec<u8>, EdgeError> {
    let body = bincode::serialize(record)
        .map_err(|e| EdgeError::invalid_format(e.to_string()))?;
    let mut framed = Vec::with_capacity(body.len() + 4);
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

fn read_segment(path: &Path) -> Result<Vec<StreamRecord>, EdgeError> {
    let mut file = fs::File::open(path).map_err(EdgeError::TransientIo)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).map_err(EdgeError::TransientIo)?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= buffer.len() {
        let len = u32::from_le_bytes(
            buffer[offset..offset + 4]
                .try_into()
                .map_err(|_| EdgeError::invalid_format("segment framing"))?,
        ) as usize;
        offset += 4;
        if offset + len > buffer.len() {
            // Torn tail write; everything before it is still valid.
            warn!(component = "store", path = %path.display(), "truncated record at segment tail");
            break;
        }
        let record: StreamRecord = bincode::deserialize(&buffer[offset..offset + len])
            .map_err(|e| EdgeError::invalid_format(e.to_string()))?;
        records.push(record);
        offset += len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_bytes: u64, min_ttl_ms: u64, soft: u64) -> StreamLimits {
        StreamLimits {
            max_bytes,
            min_ttl_ms,
            soft_segment_bytes: soft,
            config_hash: 0xABCD,
        }
    }

    #[test]
    fn test_append_read_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = PartitionStream::open(dir.path(), limits(1 << 20, 0, 4096)).unwrap();
        stream.append(100, b"first".to_vec(), false, 1_000).unwrap();
        stream.append(200, b"second".to_vec(), true, 1_001).unwrap();

        let record = stream.read_next().unwrap().unwrap();
        assert_eq!(record.seq, 0);
        assert_eq!(record.payload, b"first");
        assert!(!record.compressed);
        // Reading again before checkpoint redelivers the same record.
        assert_eq!(stream.read_next().unwrap().unwrap().seq, 0);

        stream.checkpoint(0).unwrap();
        let record = stream.read_next().unwrap().unwrap();
        assert_eq!(record.seq, 1);
        assert_eq!(record.payload, b"second");
        assert!(record.compressed);
        stream.checkpoint(1).unwrap();
        assert!(stream.read_next().unwrap().is_none());
    }

    #[test]
    fn test_restart_preserves_records_and_pointer() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut stream = PartitionStream::open(dir.path(), limits(1 << 20, 0, 64)).unwrap();
            for i in 0..5u64 {
                stream.append(i, vec![i as u8; 16], false, i).unwrap();
            }
            stream.checkpoint(1).unwrap();
        }
        let mut stream = PartitionStream::open(dir.path(), limits(1 << 20, 0, 64)).unwrap();
        assert_eq!(stream.unread_count(), 3);
        let record = stream.read_next().unwrap().unwrap();
        assert_eq!(record.seq, 2);
        // New appends continue the sequence.
        let seq = stream.append(99, b"after".to_vec(), false, 99).unwrap();
        assert_eq!(seq, 5);
    }

    #[test]
    fn test_quota_evicts_expired_records_first() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny soft limit: every record gets its own segment.
        let mut stream =
            PartitionStream::open(dir.path(), limits(4096, 60_000, 1)).unwrap();
        let payload = vec![0u8; 1500];
        stream.append(0, payload.clone(), false, 0).unwrap();
        stream.append(1, payload.clone(), false, 70_000).unwrap();
        // The third append exceeds 4096 bytes; the first record is past its
        // TTL by now and gets evicted.
        stream.append(2, payload.clone(), false, 140_000).unwrap();
        let record = stream.read_next().unwrap().unwrap();
        assert_eq!(record.seq, 1);
        assert!(stream.total_bytes() <= 4096);
    }

    #[test]
    fn test_quota_fails_when_ttl_protects_records() {
        let dir = tempfile::tempdir().unwrap();
        let one_hour_ms = 3_600_000;
        let mut stream =
            PartitionStream::open(dir.path(), limits(4096, one_hour_ms, 1)).unwrap();
        let payload = vec![0u8; 1500];
        stream.append(0, payload.clone(), false, 0).unwrap();
        stream.append(1, payload.clone(), false, 70_000).unwrap();
        let err = stream.append(2, payload, false, 140_000).unwrap_err();
        assert!(matches!(err, EdgeError::QuotaExceeded(_)));
        // Nothing was lost.
        assert_eq!(stream.read_next().unwrap().unwrap().seq, 0);
    }

    #[test]
    fn test_config_change_wipes_stream() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut stream = PartitionStream::open(dir.path(), limits(1 << 20, 0, 64)).unwrap();
            stream.append(1, b"old".to_vec(), false, 1).unwrap();
        }
        let mut changed = limits(1 << 20, 0, 64);
        changed.config_hash = 0x9999;
        let mut stream = PartitionStream::open(dir.path(), changed).unwrap();
        assert!(stream.read_next().unwrap().is_none());
    }

    #[test]
    fn test_reader_skips_evicted_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = PartitionStream::open(dir.path(), limits(4000, 0, 1)).unwrap();
        let payload = vec![0u8; 1500];
        stream.append(0, payload.clone(), false, 0).unwrap();
        stream.append(1, payload.clone(), false, 1).unwrap();
        stream.append(2, payload, false, 2).unwrap();
        // Record 0 was evicted; the reader starts at the oldest survivor.
        assert_eq!(stream.read_next().unwrap().unwrap().seq, 1);
    }
}
