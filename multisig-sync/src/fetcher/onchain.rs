// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::client::{ChainConnection, RuntimeDecoder};
use crate::error::SyncResult;
use crate::metrics::SyncMetrics;
use crate::types::{CallHash, ChainId, MultisigAccount, MultisigDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads the multisig pallet storage of one account
pub struct OnchainDefinitionFetcher {
    chain_id: ChainId,
    connection: Arc<dyn ChainConnection>,
    decoder: Arc<dyn RuntimeDecoder>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl OnchainDefinitionFetcher {
    pub fn new(
        chain_id: ChainId,
        connection: Arc<dyn ChainConnection>,
        decoder: Arc<dyn RuntimeDecoder>,
    ) -> Self {
        Self {
            chain_id,
            connection,
            decoder,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Point-in-time snapshot of every pending call of `multisig`.
    ///
    /// Transport failures fail the whole fetch. Entries that cannot be
    /// decoded are skipped.
    pub async fn fetch(
        &self,
        multisig: &MultisigAccount,
    ) -> SyncResult<BTreeMap<CallHash, MultisigDefinition>> {
        let entries = self
            .connection
            .fetch_multisig_entries(&multisig.account_id)
            .await?;
        let total = entries.len();

        let mut definitions = BTreeMap::new();
        for entry in entries {
            match decode_definition(self.decoder.as_ref(), &entry.value, multisig.threshold) {
                Ok(definition) => {
                    definitions.insert(entry.call_hash, definition);
                }
                Err(e) => {
                    warn!(
                        "[{}] Skipping undecodable multisig entry {} of {}: {}",
                        self.chain_id, entry.call_hash, multisig.account_id, e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .decode_errors
                            .with_label_values(&[self.chain_id.as_str(), "storage"])
                            .inc();
                    }
                }
            }
        }

        debug!(
            "[{}] Fetched {}/{} on-chain definitions for {}",
            self.chain_id,
            definitions.len(),
            total,
            multisig.account_id
        );
        Ok(definitions)
    }
}

pub(crate) fn decode_definition(
    decoder: &dyn RuntimeDecoder,
    value: &[u8],
    threshold: u16,
) -> SyncResult<MultisigDefinition> {
    Ok(decoder.decode_definition(value)?.into_definition(threshold))
}
