// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watches the chain event stream for multisig proposals and approvals of the
//! tracked account. Matching events are forwarded as signals; state is only
//! changed by the orchestrator reacting to them.

use crate::client::{ChainConnection, EventBatch, RuntimeDecoder};
use crate::error::SyncResult;
use crate::metrics::SyncMetrics;
use crate::types::{AccountId, BlockNumber, CallHash, ChainId, MultisigEventKind};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalSignal {
    pub call_hash: CallHash,
    pub kind: MultisigEventKind,
    pub block_number: BlockNumber,
}

#[derive(Clone)]
pub struct ProposalEventWatcher {
    chain_id: ChainId,
    multisig_account_id: AccountId,
    connection: Arc<dyn ChainConnection>,
    decoder: Arc<dyn RuntimeDecoder>,
    channel_size: usize,
    metrics: Option<Arc<SyncMetrics>>,
}

impl ProposalEventWatcher {
    pub fn new(
        chain_id: ChainId,
        multisig_account_id: AccountId,
        connection: Arc<dyn ChainConnection>,
        decoder: Arc<dyn RuntimeDecoder>,
        channel_size: usize,
    ) -> Self {
        Self {
            chain_id,
            multisig_account_id,
            connection,
            decoder,
            channel_size,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscribe to the event stream and forward matching proposals until
    /// `cancel` fires, the stream ends, or the receiver is dropped.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> SyncResult<mpsc::Receiver<ProposalSignal>> {
        let mut events = self.connection.subscribe_events().await?;
        let (tx, rx) = mpsc::channel(self.channel_size);
        let watcher = self.clone();

        info!(
            "[{}] Watching multisig events for {}",
            self.chain_id, self.multisig_account_id
        );
        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = events.recv() => match batch {
                        Some(batch) => batch,
                        None => {
                            warn!("[{}] Event stream closed", watcher.chain_id);
                            break;
                        }
                    },
                };

                for signal in watcher.filter_proposals(&batch) {
                    if tx.send(signal).await.is_err() {
                        debug!("[{}] Proposal receiver dropped", watcher.chain_id);
                        return;
                    }
                }
            }
            debug!("[{}] Proposal event watcher exited", watcher.chain_id);
        });

        Ok(rx)
    }

    /// Decode a batch and keep proposal/approval events of the tracked
    /// account, one signal per call hash. Undecodable events are skipped.
    pub fn filter_proposals(&self, batch: &EventBatch) -> Vec<ProposalSignal> {
        let chain = self.chain_id.as_str();
        let mut seen = HashSet::new();
        let mut signals = Vec::new();

        for (index, raw) in batch.events.iter().enumerate() {
            let event = match self.decoder.decode_event(raw) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "[{}] Skipping undecodable event {} of block {}: {}",
                        chain, index, batch.block_number, e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .decode_errors
                            .with_label_values(&[chain, "event"])
                            .inc();
                    }
                    continue;
                }
            };

            if !event.is_proposal() || event.multisig != self.multisig_account_id {
                continue;
            }
            if !seen.insert(event.call_hash) {
                continue;
            }

            debug!(
                "[{}] {:?} for {} at block {}",
                chain, event.kind, event.call_hash, batch.block_number
            );
            if let Some(metrics) = &self.metrics {
                metrics.proposal_events.with_label_values(&[chain]).inc();
            }
            signals.push(ProposalSignal {
                call_hash: event.call_hash,
                kind: event.kind,
                block_number: batch.block_number,
            });
        }

        signals
    }
}
