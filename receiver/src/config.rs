// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Receiver configuration.
//!

use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Tunables of a receiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Longest time `deactivate()` waits for in-flight messages before cancelling them.
    pub drain_timeout: Duration,
    /// Maximum number of admitted identities remembered for duplicate detection.
    pub admission_capacity: usize,
    /// How long an admitted identity is remembered.
    pub admission_ttl: Duration,
    /// Retries when the broker consumer can not be opened.
    pub open_retries: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            admission_capacity: 10_000,
            admission_ttl: Duration::from_secs(3600),
            open_retries: 3,
        }
    }
}

impl ReceiverConfig {
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_admission_bounds(mut self, capacity: usize, ttl: Duration) -> Self {
        self.admission_capacity = capacity;
        self.admission_ttl = ttl;
        self
    }

    pub fn with_open_retries(mut self, retries: usize) -> Self {
        self.open_retries = retries;
        self
    }
}
