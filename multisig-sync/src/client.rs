// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Collaborators the sync engine consumes but does not implement: chain
//! connectivity, runtime decoding, the off-chain indexer, and the wallet and
//! chain list models.

use crate::error::SyncResult;
use crate::types::{
    AccountId, BlockNumber, CallHash, CallRecord, ChainChange, ChainId, MultisigEvent,
    OnchainMultisig, PendingOperation, ScopeKey, Wallet,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Raw multisig storage entry under a multisig account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub call_hash: CallHash,
    pub value: Vec<u8>,
}

/// One storage notification. `None` means the entry was removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageChangeSet {
    pub changes: Vec<(CallHash, Option<Vec<u8>>)>,
}

/// Encoded events of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub block_number: BlockNumber,
    pub events: Vec<Vec<u8>>,
}

/// Live connection to one chain.
///
/// Subscriptions are torn down by dropping the returned receiver.
#[async_trait]
pub trait ChainConnection: Send + Sync {
    async fn fetch_multisig_entries(&self, multisig: &AccountId) -> SyncResult<Vec<StorageEntry>>;

    async fn subscribe_multisig_entries(
        &self,
        multisig: &AccountId,
        call_hashes: &[CallHash],
    ) -> SyncResult<mpsc::Receiver<StorageChangeSet>>;

    async fn subscribe_events(&self) -> SyncResult<mpsc::Receiver<EventBatch>>;

    async fn current_block_number(&self) -> SyncResult<BlockNumber>;

    /// Block time advertised by the runtime, if it exposes one
    async fn expected_block_time_ms(&self) -> SyncResult<Option<u64>>;
}

/// Runtime-metadata aware decoder for one chain
pub trait RuntimeDecoder: Send + Sync {
    fn decode_definition(&self, value: &[u8]) -> SyncResult<OnchainMultisig>;

    /// `Ok(None)` for events that do not belong to the multisig pallet
    fn decode_event(&self, event: &[u8]) -> SyncResult<Option<MultisigEvent>>;
}

/// "Get connection / get decoder for chain X"
pub trait ChainRegistry: Send + Sync {
    fn connection(&self, chain_id: &ChainId) -> SyncResult<Arc<dyn ChainConnection>>;

    fn decoder(&self, chain_id: &ChainId) -> SyncResult<Arc<dyn RuntimeDecoder>>;
}

#[async_trait]
pub trait IndexerClient: Send + Sync {
    async fn fetch_call_data(
        &self,
        chain_id: &ChainId,
        endpoint: &str,
        call_hashes: &HashSet<CallHash>,
    ) -> anyhow::Result<HashMap<CallHash, CallRecord>>;
}

pub trait WalletStore: Send + Sync {
    /// Current selection first, then every change
    fn observe_selected_wallet(&self) -> watch::Receiver<Option<Wallet>>;
}

pub trait ChainListStore: Send + Sync {
    /// The first batch carries every known chain as `Insert`
    fn observe_chains(&self) -> mpsc::Receiver<Vec<ChainChange>>;
}

/// Receives the full operation list of a scope after each committed change
pub trait PendingOperationObserver: Send + Sync {
    fn on_update(&self, scope: &ScopeKey, operations: &[PendingOperation]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);
