// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// Flat 32-bit signal id space, partitioned by numeric range. The kind is
/// derived from the value, never stored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SignalId(pub u32);

/// Range boundaries of the signal id space.
const OBD_PID_BASE: u32 = 0x2000_0000;
const CUSTOM_DECODED_BASE: u32 = 0x4000_0000;
const COMPLEX_BASE: u32 = 0x6000_0000;
/// Ids with the top bit set are generated internally (e.g. custom function
/// outputs) and never appear in decoder manifests.
const INTERNAL_BITMASK: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalIdKind {
    RawBus,
    ObdPid,
    CustomDecoded,
    Complex,
    Internal,
}

impl SignalId {
    pub fn kind(self) -> SignalIdKind {
        if self.0 & INTERNAL_BITMASK != 0 {
            SignalIdKind::Internal
        } else if self.0 >= COMPLEX_BASE {
            SignalIdKind::Complex
        } else if self.0 >= CUSTOM_DECODED_BASE {
            SignalIdKind::CustomDecoded
        } else if self.0 >= OBD_PID_BASE {
            SignalIdKind::ObdPid
        } else {
            SignalIdKind::RawBus
        }
    }

    pub fn is_internal(self) -> bool {
        self.0 & INTERNAL_BITMASK != 0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Content address of a cloud-delivered document (decoder manifest or
/// collection scheme).
pub type SyncId = String;

/// Short string naming a physical or logical signal source.
pub type InterfaceId = String;
