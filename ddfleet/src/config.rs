// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent settings with defaults and environment overrides.

use ddfleet_inspection::raw_buffer::RawBufferConfig;
use ddfleet_telemetry::sender::PayloadAdaptionConfig;
use std::path::PathBuf;
use std::time::Duration;

pub mod env {
    pub const PERSISTENCY_PATH: &str = "DDFLEET_PERSISTENCY_PATH";
    pub const PERSISTENCY_MAX_BYTES: &str = "DDFLEET_PERSISTENCY_MAX_BYTES";
    pub const CHECKIN_INTERVAL_MS: &str = "DDFLEET_CHECKIN_INTERVAL_MS";
    pub const FLUSH_INTERVAL_MS: &str = "DDFLEET_FLUSH_INTERVAL_MS";
    pub const SPOOL_RETRY_INTERVAL_MS: &str = "DDFLEET_SPOOL_RETRY_INTERVAL_MS";
    pub const INPUT_QUEUE_CAPACITY: &str = "DDFLEET_INPUT_QUEUE_CAPACITY";
    pub const OUTPUT_QUEUE_CAPACITY: &str = "DDFLEET_OUTPUT_QUEUE_CAPACITY";
    pub const RAW_BUFFER_MAX_BYTES: &str = "DDFLEET_RAW_BUFFER_MAX_BYTES";
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root of every persisted artifact; streams live under `streams/`.
    pub persistency_path: PathBuf,
    pub persistency_max_bytes: u64,
    pub checkin_interval: Duration,
    /// How often a partial telemetry batch is flushed.
    pub flush_interval: Duration,
    pub spool_retry_interval: Duration,
    /// Upper bound between inspection passes when no samples arrive.
    pub inspection_tick_interval: Duration,
    pub input_queue_capacity: usize,
    pub output_queue_capacity: usize,
    pub raw_buffer: RawBufferConfig,
    pub uncompressed: PayloadAdaptionConfig,
    pub compressed: PayloadAdaptionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            persistency_path: PathBuf::from("/var/lib/ddfleet"),
            persistency_max_bytes: 256 * 1024 * 1024,
            checkin_interval: Duration::from_secs(5 * 60),
            flush_interval: Duration::from_secs(1),
            spool_retry_interval: Duration::from_secs(30),
            inspection_tick_interval: Duration::from_millis(100),
            input_queue_capacity: 10_000,
            output_queue_capacity: 256,
            raw_buffer: RawBufferConfig::default(),
            uncompressed: PayloadAdaptionConfig::default_uncompressed(),
            compressed: PayloadAdaptionConfig::default_compressed(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl AgentConfig {
    /// Defaults overridden by `DDFLEET_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = AgentConfig::default();
        if let Some(path) = parse_env::<PathBuf>(env::PERSISTENCY_PATH) {
            config.persistency_path = path;
        }
        if let Some(bytes) = parse_env(env::PERSISTENCY_MAX_BYTES) {
            config.persistency_max_bytes = bytes;
        }
        if let Some(ms) = parse_env(env::CHECKIN_INTERVAL_MS) {
            config.checkin_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env(env::FLUSH_INTERVAL_MS) {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env(env::SPOOL_RETRY_INTERVAL_MS) {
            config.spool_retry_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_env(env::INPUT_QUEUE_CAPACITY) {
            config.input_queue_capacity = capacity;
        }
        if let Some(capacity) = parse_env(env::OUTPUT_QUEUE_CAPACITY) {
            config.output_queue_capacity = capacity;
        }
        if let Some(bytes) = parse_env(env::RAW_BUFFER_MAX_BYTES) {
            config.raw_buffer.max_total_bytes = bytes;
        }
        config
    }

    pub fn stream_root(&self) -> PathBuf {
        self.persistency_path.join("streams")
    }
}
