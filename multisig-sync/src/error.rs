// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::ChainId;

/// Error type for every multisig sync operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("No connection for chain {0}")]
    NoConnection(ChainId),

    #[error("No runtime for chain {0}")]
    NoRuntime(ChainId),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Indexer error: {0}")]
    Indexer(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Whether the failed pass may simply be retried on the next trigger
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::NoConnection(_)
                | SyncError::NoRuntime(_)
                | SyncError::Rpc(_)
                | SyncError::Indexer(_)
                | SyncError::Cancelled
                | SyncError::ChannelClosed
        )
    }

    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            SyncError::NoConnection(_) => "no_connection",
            SyncError::NoRuntime(_) => "no_runtime",
            SyncError::Rpc(_) => "rpc",
            SyncError::Decode(_) => "decode",
            SyncError::Indexer(_) => "indexer",
            SyncError::Storage(_) => "storage",
            SyncError::InvalidConfig(_) => "config",
            SyncError::Cancelled => "cancelled",
            SyncError::ChannelClosed => "channel_closed",
            SyncError::Other(_) => "other",
        }
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        SyncError::Other(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(format!("serialization: {}", e))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
