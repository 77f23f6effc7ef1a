// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Vehicle edge telemetry core, callable from any host.
//!
//! The agent collects decoded vehicle signals, evaluates cloud-defined
//! collection campaigns, buffers and compresses triggered data, and either
//! uploads it directly or stores it in durable streams for later
//! forwarding. The transports (MQTT, IPC, ...) and the vehicle bus
//! adapters are injected by the host; this crate only fixes the contracts
//! they implement.
//!
//! ```no_run
//! # async fn start(transport: std::sync::Arc<dyn ddfleet_common::transport::Sender>) {
//! use ddfleet::{AgentConfig, AgentHooks, EdgeAgent};
//! use ddfleet_common::metrics::NoopMetrics;
//! use ddfleet_common::time::SystemClock;
//! use std::sync::Arc;
//!
//! let agent = EdgeAgent::start(
//!     AgentConfig::from_env(),
//!     transport,
//!     SystemClock::new(),
//!     Arc::new(NoopMetrics),
//!     AgentHooks::default(),
//! )
//! .unwrap();
//! // Adapters push decoded samples through agent.sample_sender().
//! agent.stop().await;
//! # }
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;

pub use agent::{AgentHooks, EdgeAgent, MULTI_RISING_EDGE_TRIGGER_SIGNAL};
pub use config::AgentConfig;

pub use ddfleet_campaign as campaign;
pub use ddfleet_common as common;
pub use ddfleet_inspection as inspection;
pub use ddfleet_store as store;
pub use ddfleet_telemetry as telemetry;
