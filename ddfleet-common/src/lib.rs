// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::{Mutex, MutexGuard};

pub mod error;
pub mod ids;
pub mod metrics;
pub mod persistency;
pub mod signal;
pub mod time;
pub mod transport;
pub mod value;
pub mod worker;

pub use error::EdgeError;

/// Extension trait for `Mutex` to provide a method that acquires a lock,
/// panicking if the lock is poisoned.
///
/// Intended to avoid sprinkling `#[allow(clippy::unwrap_used)]` on every
/// mutex acquisition.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
