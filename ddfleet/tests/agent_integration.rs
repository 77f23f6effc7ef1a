// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the assembled agent: cloud documents in, decoded
//! samples in, telemetry and checkins out.

use async_trait::async_trait;
use bytes::Bytes;
use ddfleet::{AgentConfig, AgentHooks, EdgeAgent};
use ddfleet_campaign::manager::CampaignAction;
use ddfleet_common::ids::SignalId;
use ddfleet_common::metrics::InMemoryMetrics;
use ddfleet_common::time::ManualClock;
use ddfleet_common::transport::{SendError, Sender, TopicConfig};
use ddfleet_common::value::SampleValue;
use ddfleet_common::MutexExt;
use ddfleet_inspection::types::SignalSample;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct MockTransport {
    topics: TopicConfig,
    sent: Mutex<Vec<(String, Bytes)>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            topics: TopicConfig {
                telemetry_data_topic: "dt/v1/telemetry".into(),
                checkin_topic: "dt/v1/checkins".into(),
                collection_scheme_topic: "dt/v1/schemes".into(),
                decoder_manifest_topic: "dt/v1/manifests".into(),
                jobs_topic: "dt/v1/jobs".into(),
            },
            sent: Mutex::new(Vec::new()),
        })
    }

    fn on_topic(&self, topic: &str) -> Vec<Bytes> {
        self.sent
            .lock_or_panic()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[async_trait]
impl Sender for MockTransport {
    fn is_alive(&self) -> bool {
        true
    }

    fn max_send_size(&self) -> usize {
        128 * 1024
    }

    fn topic_config(&self) -> &TopicConfig {
        &self.topics
    }

    async fn send(&self, topic: &str, data: Bytes) -> Result<(), SendError> {
        self.sent.lock_or_panic().push((topic.to_string(), data));
        Ok(())
    }
}

fn manifest_bytes() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "sync_id": "dm-1",
        "frames": [{
            "frame_id": 0x100,
            "interface_id": "can0",
            "length": 8,
            "signals": [
                {"signal_id": 1, "start_bit": 0, "length": 16,
                 "endianness": "little", "scaling": 0.1, "offset": 0.0, "type": "float"}
            ]
        }]
    }))
    .unwrap()
}

fn scheme_bytes(partitioned: bool) -> Vec<u8> {
    let mut doc = json!({
        "sync_id": "cs-e2e",
        "decoder_manifest_id": "dm-1",
        "start_time": 0u64,
        "expiry_time": u64::MAX,
        "persist": true,
        "signals": [
            {"signal_id": 1, "sample_buffer_size": 16}
        ],
        "condition": {"op": "gt", "left": {"signal": 1}, "right": {"number": 100.0}}
    });
    if partitioned {
        doc["partitions"] = json!({
            "0": {"storage_location": "default", "max_bytes": 1_048_576, "min_ttl_s": 0}
        });
        doc["signals"][0]["partition_id"] = json!(0);
    }
    serde_json::to_vec(&[doc]).unwrap()
}

struct Rig {
    agent: EdgeAgent,
    transport: Arc<MockTransport>,
    clock: Arc<ManualClock>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn start_agent(dir: &tempfile::TempDir, partitioned: bool) -> Rig {
    init_tracing();
    let transport = MockTransport::new();
    let clock = ManualClock::starting_at(10_000);
    let config = AgentConfig {
        persistency_path: dir.path().to_path_buf(),
        flush_interval: Duration::from_millis(200),
        inspection_tick_interval: Duration::from_millis(50),
        ..AgentConfig::default()
    };
    let agent = EdgeAgent::start(
        config,
        transport.clone(),
        clock.clone(),
        Arc::new(InMemoryMetrics::new()),
        AgentHooks::default(),
    )
    .unwrap();

    let actions = agent.campaign_actions();
    actions
        .send(CampaignAction::UpdateDecoderManifest(manifest_bytes()))
        .await
        .unwrap();
    actions
        .send(CampaignAction::UpdateSchemeList(scheme_bytes(partitioned)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    Rig {
        agent,
        transport,
        clock,
    }
}

async fn push_sample(rig: &Rig, t: u64, value: f64) {
    rig.clock.set(t);
    rig.agent
        .sample_sender()
        .send(SignalSample {
            signal_id: SignalId(1),
            timestamp_ms: t,
            value: SampleValue::Number(value),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_trigger_flows_to_telemetry_upload() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_agent(&dir, false).await;

    push_sample(&rig, 10_100, 50.0).await;
    push_sample(&rig, 10_200, 150.0).await;
    // Let the flush interval fire.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let uploads = rig.transport.on_topic("dt/v1/telemetry");
    assert!(!uploads.is_empty(), "expected a telemetry upload");
    let parsed: serde_json::Value = serde_json::from_slice(&uploads[0]).unwrap();
    assert_eq!(parsed[0]["campaign_sync_id"], "cs-e2e");
    let signals = parsed[0]["signals"].as_array().unwrap();
    assert!(signals.iter().any(|s| s["number_value"] == 150.0));

    // The first checkin may predate the documents; after one more cadence
    // the active artifacts are reported.
    tokio::time::sleep(Duration::from_secs(301)).await;
    let checkins = rig.transport.on_topic("dt/v1/checkins");
    assert!(!checkins.is_empty(), "expected a checkin");
    let last: serde_json::Value = serde_json::from_slice(checkins.last().unwrap()).unwrap();
    assert_eq!(last["document_sync_ids"], json!(["cs-e2e", "dm-1"]));

    rig.agent.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_trigger_stores_then_forwards() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_agent(&dir, true).await;

    push_sample(&rig, 10_100, 150.0).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Nothing was uploaded directly: the data went into the stream.
    assert!(rig.transport.on_topic("dt/v1/telemetry").is_empty());
    assert!(rig.agent.stream_manager().has_campaign("cs-e2e"));
    assert!(rig
        .agent
        .stream_manager()
        .read_from_stream("cs-e2e", 0)
        .unwrap()
        .is_some());

    // Condition-driven forwarding drains it to the transport.
    rig.agent
        .forward_controller()
        .begin_condition_forward("cs-e2e", 0);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let uploads = rig.transport.on_topic("dt/v1/telemetry");
    assert!(!uploads.is_empty(), "expected the stored record to be forwarded");
    let parsed: serde_json::Value = serde_json::from_slice(&uploads[0]).unwrap();
    assert_eq!(parsed[0]["campaign_sync_id"], "cs-e2e");

    rig.agent.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_forward_job_document_drives_forwarder() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_agent(&dir, true).await;

    push_sample(&rig, 10_100, 150.0).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    rig.agent
        .job_handler()
        .handle_document(
            &serde_json::to_vec(&json!({
                "job_id": "job-1", "action": "start", "campaign_sync_id": "cs-e2e"
            }))
            .unwrap(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!rig.transport.on_topic("dt/v1/telemetry").is_empty());

    rig.agent.stop().await;
}
