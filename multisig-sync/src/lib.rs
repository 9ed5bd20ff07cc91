// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Keeps a local view of the pending multisig operations of the selected
//! wallet in sync with the chains it lives on.

pub mod call_data_cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event_watcher;
pub mod fetcher;
pub mod metrics;
pub mod orchestrator;
pub mod reconciliation;
pub mod service;
pub mod store;
pub mod subscription;
pub mod types;
pub mod utils;


#[cfg(test)]
pub mod test_utils;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use orchestrator::{ChainSyncOrchestrator, OrchestratorState, SyncDependencies};
pub use service::MultisigSyncService;
pub use store::PendingOperationStore;
pub use types::{
    AccountId, CallHash, Chain, ChainId, MultisigAccount, PendingOperation, PendingOperationDelta,
    ScopeKey, Wallet,
};
