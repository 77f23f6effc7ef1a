// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Campaign lifecycle core: ingestion of cloud-delivered decoder manifests
//! and collection schemes, wall-clock scheduling of campaign windows, and
//! compilation of the runtime artifacts (decoder dictionaries, inspection
//! matrix, fetch matrix) consumed by the rest of the pipeline.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod checkin;
pub mod collection_scheme;
pub mod condition;
pub mod decoder_dictionary;
pub mod decoder_manifest;
pub mod fetch_matrix;
pub mod inspection_matrix;
pub mod manager;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use collection_scheme::{CollectionScheme, CollectionSchemeList, CollectionSchemeListIngestion};
pub use condition::{BinaryOp, ConditionArena, ExpressionNode, NodeIndex, UnaryOp, WindowFunction};
pub use decoder_dictionary::DecoderDictionarySet;
pub use decoder_manifest::{DecoderManifest, DecoderManifestIngestion};
pub use fetch_matrix::FetchMatrix;
pub use inspection_matrix::{ConditionWithMetadata, InspectionMatrix};
pub use manager::{CampaignAction, CampaignManager, CampaignSnapshots};
