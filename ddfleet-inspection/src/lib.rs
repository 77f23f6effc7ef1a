// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collection inspection engine: consumes decoded signal samples, maintains
//! per-signal ring buffers and fixed-window aggregates, evaluates campaign
//! trigger conditions and emits triggered data windows onto a bounded
//! priority queue.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffers;
pub mod custom_function;
pub mod engine;
pub mod eval;
pub mod fetch;
pub mod output;
pub mod raw_buffer;
pub mod types;

pub use engine::{DtcProvider, InspectionEngine, InspectionEngineConfig};
pub use output::TriggerQueue;
pub use raw_buffer::{RawBufferConfig, RawBufferManager, UsageStage};
pub use types::{CollectedSignal, DtcInfo, SignalSample, TriggeredData};
