// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry upload pipeline: triggered data is serialized through an
//! injected payload writer, optionally compressed, size-adapted into chunks
//! and published; failures spool to disk for later replay.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod payload_writer;
pub mod sender;
pub mod spool;
pub mod worker;

pub use payload_writer::{JsonPayloadWriter, PayloadWriter};
pub use sender::{PayloadAdaptionConfig, PersistedUploader, TelemetryDataSender};
pub use spool::PayloadSpool;
pub use worker::TelemetrySenderWorker;
