// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion of cloud-delivered decoder manifests: tables mapping raw
//! frames, OBD PIDs and custom decoder keys to typed signals.

use ddfleet_common::ids::{InterfaceId, SignalId, SyncId};
use ddfleet_common::EdgeError;
use serde::Deserialize;
use std::collections::HashMap;

/// Hard ceiling protecting against malformed input.
pub const MAX_MANIFEST_SIZE: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodedType {
    Bool,
    Integer,
    Float,
    String,
    Complex,
}

/// How one signal is carved out of a raw frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignalDecoding {
    pub signal_id: SignalId,
    pub start_bit: u16,
    pub length: u16,
    pub endianness: Endianness,
    #[serde(default = "default_scaling")]
    pub scaling: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(rename = "type")]
    pub decoded_type: DecodedType,
}

fn default_scaling() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameFormat {
    pub frame_id: u32,
    pub interface_id: InterfaceId,
    /// Expected frame length in bytes.
    pub length: u8,
    pub signals: Vec<SignalDecoding>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PidSignalFormat {
    pub signal_id: SignalId,
    pub pid: u16,
    pub mode: u8,
    pub start_byte: u8,
    pub byte_length: u8,
    #[serde(default = "default_scaling")]
    pub scaling: f64,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomSignalFormat {
    pub signal_id: SignalId,
    pub interface_id: InterfaceId,
    /// Opaque key understood by the custom decoder on that interface.
    pub decoder_key: String,
    #[serde(rename = "type")]
    pub decoded_type: DecodedType,
}

/// One node of the complex-type graph used for vision payloads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ComplexType {
    Primitive { primitive: DecodedType },
    Array { element_type_id: u32 },
    Struct { members: Vec<ComplexMember> },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComplexMember {
    pub name: String,
    pub type_id: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComplexSignalFormat {
    pub signal_id: SignalId,
    pub interface_id: InterfaceId,
    pub root_type_id: u32,
    /// Message path on the source middleware (e.g. a topic name).
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    sync_id: SyncId,
    #[serde(default)]
    frames: Vec<FrameFormat>,
    #[serde(default)]
    pid_signals: Vec<PidSignalFormat>,
    #[serde(default)]
    custom_signals: Vec<CustomSignalFormat>,
    #[serde(default)]
    complex_types: Vec<(u32, ComplexType)>,
    #[serde(default)]
    complex_signals: Vec<ComplexSignalFormat>,
}

/// Immutable, validated decoder manifest.
#[derive(Debug, Default)]
pub struct DecoderManifest {
    sync_id: SyncId,
    frame_format: HashMap<InterfaceId, HashMap<u32, FrameFormat>>,
    signal_to_frame: HashMap<SignalId, (u32, InterfaceId)>,
    pid_format: HashMap<SignalId, PidSignalFormat>,
    custom_format: HashMap<SignalId, CustomSignalFormat>,
    complex_types: HashMap<u32, ComplexType>,
    complex_format: HashMap<SignalId, ComplexSignalFormat>,
}

impl DecoderManifest {
    pub fn sync_id(&self) -> &SyncId {
        &self.sync_id
    }

    pub fn frame_format(&self) -> &HashMap<InterfaceId, HashMap<u32, FrameFormat>> {
        &self.frame_format
    }

    pub fn frame_of(&self, signal: SignalId) -> Option<&(u32, InterfaceId)> {
        self.signal_to_frame.get(&signal)
    }

    pub fn pid_format(&self, signal: SignalId) -> Option<&PidSignalFormat> {
        self.pid_format.get(&signal)
    }

    pub fn custom_format(&self, signal: SignalId) -> Option<&CustomSignalFormat> {
        self.custom_format.get(&signal)
    }

    pub fn complex_format(&self, signal: SignalId) -> Option<&ComplexSignalFormat> {
        self.complex_format.get(&signal)
    }

    pub fn complex_type(&self, type_id: u32) -> Option<&ComplexType> {
        self.complex_types.get(&type_id)
    }

    /// True when the manifest can decode the signal through any protocol.
    pub fn knows_signal(&self, signal: SignalId) -> bool {
        self.signal_to_frame.contains_key(&signal)
            || self.pid_format.contains_key(&signal)
            || self.custom_format.contains_key(&signal)
            || self.complex_format.contains_key(&signal)
    }

    pub fn pid_signals(&self) -> impl Iterator<Item = &PidSignalFormat> {
        self.pid_format.values()
    }

    pub fn custom_signals(&self) -> impl Iterator<Item = &CustomSignalFormat> {
        self.custom_format.values()
    }

    pub fn complex_signals(&self) -> impl Iterator<Item = &ComplexSignalFormat> {
        self.complex_format.values()
    }
}

/// Two-phase ingestion: `copy_data` stages the raw bytes, `build` validates
/// them. After a successful `build` the manifest is immutable and exposes
/// only accessors.
#[derive(Debug, Default)]
pub struct DecoderManifestIngestion {
    data: Vec<u8>,
    manifest: Option<DecoderManifest>,
}

impl DecoderManifestIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy_data(&mut self, bytes: &[u8]) -> Result<(), EdgeError> {
        if bytes.len() > MAX_MANIFEST_SIZE {
            return Err(EdgeError::invalid_format(format!(
                "decoder manifest of {} bytes exceeds the {} byte ceiling",
                bytes.len(),
                MAX_MANIFEST_SIZE
            )));
        }
        self.data = bytes.to_vec();
        self.manifest = None;
        Ok(())
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn build(&mut self) -> Result<(), EdgeError> {
        let doc: ManifestDocument = serde_json::from_slice(&self.data)
            .map_err(|e| EdgeError::invalid_format(format!("decoder manifest: {e}")))?;
        if doc.sync_id.is_empty() {
            return Err(EdgeError::invalid_format("decoder manifest has no sync_id"));
        }

        let mut manifest = DecoderManifest {
            sync_id: doc.sync_id,
            complex_types: doc.complex_types.into_iter().collect(),
            ..Default::default()
        };

        let claim = |signal: SignalId, manifest: &DecoderManifest| {
            if manifest.knows_signal(signal) {
                Err(EdgeError::invalid_format(format!(
                    "signal {signal} has more than one decoding entry"
                )))
            } else {
                Ok(())
            }
        };

        for frame in doc.frames {
            for signal in &frame.signals {
                claim(signal.signal_id, &manifest)?;
                manifest
                    .signal_to_frame
                    .insert(signal.signal_id, (frame.frame_id, frame.interface_id.clone()));
            }
            manifest
                .frame_format
                .entry(frame.interface_id.clone())
                .or_default()
                .insert(frame.frame_id, frame);
        }
        for pid in doc.pid_signals {
            claim(pid.signal_id, &manifest)?;
            manifest.pid_format.insert(pid.signal_id, pid);
        }
        for custom in doc.custom_signals {
            claim(custom.signal_id, &manifest)?;
            manifest.custom_format.insert(custom.signal_id, custom);
        }
        for complex in doc.complex_signals {
            claim(complex.signal_id, &manifest)?;
            if !manifest.complex_types.contains_key(&complex.root_type_id) {
                return Err(EdgeError::invalid_format(format!(
                    "complex signal {} references unknown type id {}",
                    complex.signal_id, complex.root_type_id
                )));
            }
            manifest.complex_format.insert(complex.signal_id, complex);
        }

        self.manifest = Some(manifest);
        Ok(())
    }

    pub fn manifest(&self) -> Option<&DecoderManifest> {
        self.manifest.as_ref()
    }

    pub fn into_manifest(self) -> Option<DecoderManifest> {
        self.manifest
    }
}
