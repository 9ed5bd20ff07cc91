// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::client::ChainConnection;
use crate::error::SyncResult;
use crate::types::{BlockNumber, ChainId, Timestamp};
use std::sync::Arc;
use tracing::debug;

/// Linear extrapolation of the wall-clock time of `block_height` from the
/// current block. Clamped to the representable range.
pub fn estimate_timestamp(
    block_height: BlockNumber,
    current_block: BlockNumber,
    block_time_ms: u64,
    now_ms: Timestamp,
) -> Timestamp {
    let blocks = block_height as i128 - current_block as i128;
    let estimated = now_ms as i128 + blocks * block_time_ms as i128;
    estimated.clamp(0, Timestamp::MAX as i128) as Timestamp
}

/// Inputs of `estimate_timestamp` captured once per pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTimeSnapshot {
    pub current_block: BlockNumber,
    pub block_time_ms: u64,
    pub now_ms: Timestamp,
}

impl BlockTimeSnapshot {
    pub fn estimate(&self, block_height: BlockNumber) -> Timestamp {
        estimate_timestamp(block_height, self.current_block, self.block_time_ms, self.now_ms)
    }
}

pub struct BlockTimeEstimator {
    chain_id: ChainId,
    connection: Arc<dyn ChainConnection>,
    /// Block time from the chain model, preferred over the runtime value
    configured_block_time_ms: Option<u64>,
    default_block_time_ms: u64,
}

impl BlockTimeEstimator {
    pub fn new(
        chain_id: ChainId,
        connection: Arc<dyn ChainConnection>,
        configured_block_time_ms: Option<u64>,
        default_block_time_ms: u64,
    ) -> Self {
        Self {
            chain_id,
            connection,
            configured_block_time_ms,
            default_block_time_ms,
        }
    }

    /// Fetch the current block number and resolve the block time
    pub async fn snapshot(&self, now_ms: Timestamp) -> SyncResult<BlockTimeSnapshot> {
        let current_block = self.connection.current_block_number().await?;
        let block_time_ms = self.block_time_ms().await;
        Ok(BlockTimeSnapshot {
            current_block,
            block_time_ms,
            now_ms,
        })
    }

    async fn block_time_ms(&self) -> u64 {
        if let Some(ms) = self.configured_block_time_ms.filter(|ms| *ms > 0) {
            return ms;
        }
        match self.connection.expected_block_time_ms().await {
            Ok(Some(ms)) if ms > 0 => ms,
            Ok(_) => self.default_block_time_ms,
            Err(e) => {
                debug!(
                    "[{}] Runtime block time unavailable, using default {}ms: {}",
                    self.chain_id, self.default_block_time_ms, e
                );
                self.default_block_time_ms
            }
        }
    }
}
