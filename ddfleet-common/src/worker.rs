// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

/// Trait representing a generic worker.
///
/// The worker runs an async looping function running periodic tasks until
/// its cancellation token fires or its mailbox closes.
///
/// This trait is dyn-compatible thanks to the `async_trait` macro,
/// which allows it to be used as `Box<dyn Worker>`.
#[async_trait]
pub trait Worker {
    /// Main worker function
    async fn run(&mut self);

    /// Hook called when the agent is shutting down. Used to flush all data.
    fn shutdown(&mut self) {}
}

// Blanket implementation for boxed trait objects
#[async_trait]
impl Worker for Box<dyn Worker + Send + Sync> {
    async fn run(&mut self) {
        (**self).run().await
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}
