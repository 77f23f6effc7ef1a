// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Handle into the raw buffer arena for variable-sized values. Zero is never
/// handed out.
pub type RawBufferHandle = u32;

pub const INVALID_RAW_BUFFER_HANDLE: RawBufferHandle = 0;

/// A decoded sample as it travels from the adapters into the inspection
/// engine. Variable-sized values (strings, complex frames) live in the raw
/// buffer arena and travel by handle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    Number(f64),
    Bool(bool),
    Raw(RawBufferHandle),
}

impl SampleValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SampleValue::Number(n) => Some(*n),
            SampleValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SampleValue::Raw(_) => None,
        }
    }

    pub fn raw_handle(&self) -> Option<RawBufferHandle> {
        match self {
            SampleValue::Raw(handle) => Some(*handle),
            _ => None,
        }
    }
}

impl From<f64> for SampleValue {
    fn from(value: f64) -> Self {
        SampleValue::Number(value)
    }
}

impl From<bool> for SampleValue {
    fn from(value: bool) -> Self {
        SampleValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_coerces_to_number() {
        assert_eq!(SampleValue::Bool(true).as_number(), Some(1.0));
        assert_eq!(SampleValue::Bool(false).as_number(), Some(0.0));
        assert_eq!(SampleValue::Raw(3).as_number(), None);
    }
}
