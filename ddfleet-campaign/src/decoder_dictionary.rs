// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-protocol decoder tables projected from the active manifest through
//! the signals the enabled schemes actually need. Pure function of its
//! inputs; adapters receive the smallest tables that cover their protocol.

use crate::decoder_manifest::{
    ComplexSignalFormat, ComplexType, CustomSignalFormat, DecoderManifest, FrameFormat,
    PidSignalFormat,
};
use ddfleet_common::ids::{InterfaceId, SignalId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehicleDataSourceProtocol {
    RawBus,
    Obd,
    Custom,
    Complex,
}

/// Frame decoding tables for raw-bus adapters, filtered per interface.
#[derive(Debug, Default)]
pub struct RawBusDecoderDictionary {
    pub decoders: HashMap<InterfaceId, HashMap<u32, FrameFormat>>,
    pub signal_ids: HashSet<SignalId>,
}

#[derive(Debug, Default)]
pub struct ObdDecoderDictionary {
    pub pid_signals: HashMap<SignalId, PidSignalFormat>,
}

/// Custom decoders are looked up by (interface, decoder key).
#[derive(Debug, Default)]
pub struct CustomDecoderDictionary {
    pub decoders: HashMap<InterfaceId, HashMap<String, CustomSignalFormat>>,
}

#[derive(Debug, Default)]
pub struct ComplexDecoderDictionary {
    pub signals: HashMap<SignalId, ComplexSignalFormat>,
    pub types: HashMap<u32, ComplexType>,
}

#[derive(Debug, Default)]
pub struct DecoderDictionarySet {
    pub raw_bus: RawBusDecoderDictionary,
    pub obd: ObdDecoderDictionary,
    pub custom: CustomDecoderDictionary,
    pub complex: ComplexDecoderDictionary,
}

impl DecoderDictionarySet {
    /// True when any protocol can decode the signal.
    pub fn covers(&self, signal: SignalId) -> bool {
        self.raw_bus.signal_ids.contains(&signal)
            || self.obd.pid_signals.contains_key(&signal)
            || self
                .custom
                .decoders
                .values()
                .any(|by_key| by_key.values().any(|f| f.signal_id == signal))
            || self.complex.signals.contains_key(&signal)
    }
}

pub fn build_decoder_dictionaries(
    manifest: &DecoderManifest,
    required: &HashSet<SignalId>,
) -> Arc<DecoderDictionarySet> {
    let mut set = DecoderDictionarySet::default();

    for (interface, frames) in manifest.frame_format() {
        for (frame_id, format) in frames {
            let needed: Vec<_> = format
                .signals
                .iter()
                .filter(|s| required.contains(&s.signal_id))
                .cloned()
                .collect();
            if needed.is_empty() {
                continue;
            }
            for signal in &needed {
                set.raw_bus.signal_ids.insert(signal.signal_id);
            }
            set.raw_bus
                .decoders
                .entry(interface.clone())
                .or_default()
                .insert(
                    *frame_id,
                    FrameFormat {
                        signals: needed,
                        ..format.clone()
                    },
                );
        }
    }

    for pid in manifest.pid_signals() {
        if required.contains(&pid.signal_id) {
            set.obd.pid_signals.insert(pid.signal_id, pid.clone());
        }
    }

    for custom in manifest.custom_signals() {
        if required.contains(&custom.signal_id) {
            set.custom
                .decoders
                .entry(custom.interface_id.clone())
                .or_default()
                .insert(custom.decoder_key.clone(), custom.clone());
        }
    }

    for complex in manifest.complex_signals() {
        if required.contains(&complex.signal_id) {
            set.complex
                .signals
                .insert(complex.signal_id, complex.clone());
            collect_types(manifest, complex.root_type_id, &mut set.complex.types);
        }
    }

    Arc::new(set)
}

fn collect_types(manifest: &DecoderManifest, type_id: u32, out: &mut HashMap<u32, ComplexType>) {
    if out.contains_key(&type_id) {
        return;
    }
    let Some(ty) = manifest.complex_type(type_id) else {
        return;
    };
    out.insert(type_id, ty.clone());
    match ty {
        ComplexType::Array { element_type_id } => collect_types(manifest, *element_type_id, out),
        ComplexType::Struct { members } => {
            for member in members {
                collect_types(manifest, member.type_id, out);
            }
        }
        ComplexType::Primitive { .. } => {}
    }
}
