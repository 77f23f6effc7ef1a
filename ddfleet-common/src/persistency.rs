// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keyed blob store over a local directory, namespaced by [`DataKind`], with
//! a global byte quota and atomic replace (write-to-temp, rename). The
//! payload spool is a flat set of files plus a JSON metadata sidecar.

use crate::error::EdgeError;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const PAYLOAD_SPOOL_DIR: &str = "edge-to-cloud-payloads";
const METADATA_FILE: &str = "metadata.json";

/// Namespaces of the store. No ordering guarantees across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    DecoderManifest,
    CollectionSchemeList,
    StateTemplateList,
    EdgeToCloudPayload,
    Metadata,
}

impl DataKind {
    fn dir(self) -> &'static str {
        match self {
            DataKind::DecoderManifest => "decoder_manifest",
            DataKind::CollectionSchemeList => "collection_scheme_list",
            DataKind::StateTemplateList => "state_template_list",
            // The metadata sidecar lives next to the payloads it describes.
            DataKind::EdgeToCloudPayload | DataKind::Metadata => PAYLOAD_SPOOL_DIR,
        }
    }
}

#[derive(Debug)]
pub struct PersistencyStore {
    root: PathBuf,
    max_bytes: u64,
}

impl PersistencyStore {
    /// Opens (and creates) the store under `root`. A failure here invalidates
    /// the persistency root and is surfaced to the host as `FatalIo`.
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, EdgeError> {
        let root = root.into();
        for kind in [
            DataKind::DecoderManifest,
            DataKind::CollectionSchemeList,
            DataKind::StateTemplateList,
            DataKind::EdgeToCloudPayload,
        ] {
            fs::create_dir_all(root.join(kind.dir())).map_err(EdgeError::FatalIo)?;
        }
        Ok(PersistencyStore { root, max_bytes })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding spooled payload files.
    pub fn spool_dir(&self) -> PathBuf {
        self.root.join(PAYLOAD_SPOOL_DIR)
    }

    fn path_for(&self, kind: DataKind, name: &str) -> PathBuf {
        match kind {
            DataKind::Metadata => self.root.join(kind.dir()).join(METADATA_FILE),
            _ => self.root.join(kind.dir()).join(name),
        }
    }

    /// Atomically replaces the blob stored under `(kind, name)`.
    pub fn write(&self, kind: DataKind, name: &str, bytes: &[u8]) -> Result<(), EdgeError> {
        let path = self.path_for(kind, name);
        let replaced = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let used = self.total_size();
        if used - replaced + bytes.len() as u64 > self.max_bytes {
            return Err(EdgeError::QuotaExceeded("persistency store"));
        }
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(EdgeError::TransientIo)?;
        file.write_all(bytes).map_err(EdgeError::TransientIo)?;
        file.sync_all().map_err(EdgeError::TransientIo)?;
        fs::rename(&tmp, &path).map_err(EdgeError::TransientIo)?;
        Ok(())
    }

    pub fn read(&self, kind: DataKind, name: &str) -> Result<Vec<u8>, EdgeError> {
        let path = self.path_for(kind, name);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EdgeError::not_found(path.display().to_string()))
            }
            Err(e) => Err(EdgeError::TransientIo(e)),
        }
    }

    pub fn size(&self, kind: DataKind, name: &str) -> Result<u64, EdgeError> {
        let path = self.path_for(kind, name);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EdgeError::not_found(path.display().to_string()))
            }
            Err(e) => Err(EdgeError::TransientIo(e)),
        }
    }

    /// Removes the blob. Erasing a missing entry is not an error.
    pub fn erase(&self, kind: DataKind, name: &str) -> Result<(), EdgeError> {
        match fs::remove_file(self.path_for(kind, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EdgeError::TransientIo(e)),
        }
    }

    /// Bytes currently stored across all kinds.
    pub fn total_size(&self) -> u64 {
        let mut total = 0;
        for dir in ["decoder_manifest", "collection_scheme_list", "state_template_list", PAYLOAD_SPOOL_DIR] {
            if let Ok(entries) = fs::read_dir(self.root.join(dir)) {
                for entry in entries.flatten() {
                    if let Ok(meta) = entry.metadata() {
                        if meta.is_file() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }

    /// Appends an entry to the spool metadata sidecar.
    pub fn add_metadata(&self, entry: Value) -> Result<(), EdgeError> {
        let mut entries = self.get_metadata()?;
        entries.push(entry);
        let bytes = serde_json::to_vec(&entries)
            .map_err(|e| EdgeError::invalid_format(e.to_string()))?;
        self.write(DataKind::Metadata, METADATA_FILE, &bytes)
    }

    /// Returns all sidecar entries; a missing or corrupt sidecar reads as
    /// empty (the corrupt file is reported once at error level).
    pub fn get_metadata(&self) -> Result<Vec<Value>, EdgeError> {
        let bytes = match self.read(DataKind::Metadata, METADATA_FILE) {
            Ok(bytes) => bytes,
            Err(EdgeError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(Value::Array(entries)) => Ok(entries),
            Ok(_) | Err(_) => {
                tracing::error!(
                    component = "persistency",
                    "payload metadata sidecar is corrupt, discarding it"
                );
                self.erase(DataKind::Metadata, METADATA_FILE)?;
                Ok(Vec::new())
            }
        }
    }

    pub fn clear_metadata(&self) -> Result<(), EdgeError> {
        self.erase(DataKind::Metadata, METADATA_FILE)
    }
}
