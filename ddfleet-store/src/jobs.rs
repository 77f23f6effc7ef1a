// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote forward jobs: cloud-issued requests to drain stored streams,
//! independent of the campaign's own forward condition.

use crate::forwarder::ForwardController;
use crate::manager::StreamManager;
use ddfleet_common::time::Timestamp;
use ddfleet_common::EdgeError;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JobAction {
    Start,
    Cancel,
}

#[derive(Debug, Deserialize)]
struct JobDocument {
    job_id: String,
    action: JobAction,
    #[serde(default)]
    campaign_sync_id: Option<String>,
    /// Defaults to every partition of the campaign.
    #[serde(default)]
    partitions: Option<Vec<u32>>,
    #[serde(default)]
    end_time_ms: Option<Timestamp>,
}

/// Translates job documents from the transport into forwarder commands.
#[derive(Debug, Clone)]
pub struct ForwardJobHandler {
    manager: Arc<StreamManager>,
    controller: ForwardController,
}

impl ForwardJobHandler {
    pub fn new(manager: Arc<StreamManager>, controller: ForwardController) -> Self {
        ForwardJobHandler {
            manager,
            controller,
        }
    }

    pub fn handle_document(&self, bytes: &[u8]) -> Result<(), EdgeError> {
        let doc: JobDocument = serde_json::from_slice(bytes)
            .map_err(|e| EdgeError::invalid_format(format!("forward job: {e}")))?;
        match doc.action {
            JobAction::Start => {
                let campaign = doc.campaign_sync_id.ok_or_else(|| {
                    EdgeError::invalid_format("start job is missing campaign_sync_id")
                })?;
                if !self.manager.has_campaign(&campaign) {
                    return Err(EdgeError::not_found(campaign));
                }
                let partitions = match doc.partitions {
                    Some(partitions) => partitions,
                    None => self.manager.partitions_of(&campaign),
                };
                info!(component = "forwarder", job = %doc.job_id, campaign = %campaign,
                    partitions = partitions.len(), "starting forward job");
                for partition in partitions {
                    self.controller
                        .begin_job_forward(&campaign, partition, &doc.job_id, doc.end_time_ms);
                }
            }
            JobAction::Cancel => {
                info!(component = "forwarder", job = %doc.job_id, "cancelling forward job");
                self.controller.cancel_job(&doc.job_id);
            }
        }
        Ok(())
    }
}
