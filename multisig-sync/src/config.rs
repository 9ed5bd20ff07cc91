// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{SyncError, SyncResult};
use multisig_sync_config::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the pending operation sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// How long an operation without an on-chain definition survives,
    /// measured from when its definition disappeared
    #[serde(default = "default_expiration_timeout_secs")]
    pub expiration_timeout_secs: u64,

    /// TTL of rows in the shared call data cache
    #[serde(default = "default_call_data_cache_ttl_secs")]
    pub call_data_cache_ttl_secs: u64,

    /// Used for timestamp estimation when the chain does not report one
    #[serde(default = "default_block_time_ms")]
    pub default_block_time_ms: u64,

    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            expiration_timeout_secs: default_expiration_timeout_secs(),
            call_data_cache_ttl_secs: default_call_data_cache_ttl_secs(),
            default_block_time_ms: default_block_time_ms(),
            event_channel_size: default_event_channel_size(),
        }
    }
}

fn default_expiration_timeout_secs() -> u64 {
    60
}

fn default_call_data_cache_ttl_secs() -> u64 {
    3600
}

fn default_block_time_ms() -> u64 {
    6000
}

fn default_event_channel_size() -> usize {
    256
}

impl Config for SyncConfig {}

impl SyncConfig {
    pub fn expiration_timeout(&self) -> Duration {
        Duration::from_secs(self.expiration_timeout_secs)
    }

    pub fn call_data_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.call_data_cache_ttl_secs)
    }

    pub fn validate(&self) -> SyncResult<()> {
        let invalid = |msg: &str| Err(SyncError::InvalidConfig(msg.to_string()));
        if self.expiration_timeout_secs == 0 {
            return invalid("expiration-timeout-secs must be positive");
        }
        if self.default_block_time_ms == 0 {
            return invalid("default-block-time-ms must be positive");
        }
        if self.event_channel_size == 0 {
            return invalid("event-channel-size must be positive");
        }
        Ok(())
    }
}
