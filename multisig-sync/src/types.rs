// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Type definitions for multisig pending operation tracking

use crate::error::SyncError;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub type BlockNumber = u64;

/// Unix timestamp in milliseconds
pub type Timestamp = u64;

type Blake2b256 = Blake2b<U32>;

macro_rules! fixed_bytes_type {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LENGTH: usize = $len;

            pub fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    SyncError::Decode(format!(
                        "{} must be {} bytes, got {}",
                        stringify!($name),
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s.trim_start_matches("0x"))
                    .map_err(|e| SyncError::Decode(format!("invalid hex {}: {}", s, e)))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes_type!(
    /// Blake2-256 digest of a SCALE-encoded call
    CallHash,
    32
);

fixed_bytes_type!(
    /// 32-byte account identifier
    AccountId,
    32
);

impl CallHash {
    /// Hash a raw call payload the way the multisig pallet does
    pub fn of_call(call: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(call);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Whether `call` is the preimage of this hash
    pub fn matches_call(&self, call: &[u8]) -> bool {
        Self::of_call(call) == *self
    }
}

/// Chain identifier (genesis hash in practice)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Block height and extrinsic index at which a proposal was first recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timepoint {
    pub height: BlockNumber,
    pub index: u32,
}

impl Timepoint {
    pub fn new(height: BlockNumber, index: u32) -> Self {
        Self { height, index }
    }
}

/// Multisig pallet storage record as decoded from the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainMultisig {
    pub timepoint: Timepoint,
    pub deposit: u128,
    pub depositor: AccountId,
    pub approvals: Vec<AccountId>,
}

impl OnchainMultisig {
    pub fn into_definition(self, threshold: u16) -> MultisigDefinition {
        MultisigDefinition {
            threshold,
            approvals: self.approvals.into_iter().collect(),
            depositor: self.depositor,
            deposit: self.deposit,
            timepoint: self.timepoint,
        }
    }
}

/// On-chain approval state of a pending multisig call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigDefinition {
    pub threshold: u16,
    pub approvals: BTreeSet<AccountId>,
    pub depositor: AccountId,
    pub deposit: u128,
    pub timepoint: Timepoint,
}

impl MultisigDefinition {
    pub fn is_approved_by(&self, account: &AccountId) -> bool {
        self.approvals.contains(account)
    }
}

/// Scope of one sync: a multisig account on a chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub chain_id: ChainId,
    pub multisig_account_id: AccountId,
}

impl ScopeKey {
    pub fn new(chain_id: ChainId, multisig_account_id: AccountId) -> Self {
        Self {
            chain_id,
            multisig_account_id,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.multisig_account_id)
    }
}

/// Unique identity of a pending operation record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingOperationKey {
    pub chain_id: ChainId,
    pub multisig_account_id: AccountId,
    pub signatory_account_id: AccountId,
    pub call_hash: CallHash,
}

impl PendingOperationKey {
    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::new(self.chain_id.clone(), self.multisig_account_id)
    }
}

impl fmt::Display for PendingOperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.chain_id, self.multisig_account_id, self.signatory_account_id, self.call_hash
        )
    }
}

/// A multisig call awaiting approvals, as shown to the wallet owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub call_hash: CallHash,
    pub chain_id: ChainId,
    pub multisig_account_id: AccountId,
    pub signatory_account_id: AccountId,
    #[serde(default, with = "hex_bytes_opt")]
    pub call: Option<Vec<u8>>,
    #[serde(default)]
    pub definition: Option<MultisigDefinition>,
    /// Best-known discovery time
    pub timestamp: Timestamp,
    /// When the on-chain definition was last seen to disappear
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared_at: Option<Timestamp>,
}

impl PendingOperation {
    pub fn key(&self) -> PendingOperationKey {
        PendingOperationKey {
            chain_id: self.chain_id.clone(),
            multisig_account_id: self.multisig_account_id,
            signatory_account_id: self.signatory_account_id,
            call_hash: self.call_hash,
        }
    }

    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::new(self.chain_id.clone(), self.multisig_account_id)
    }

    pub fn replacing_definition(mut self, definition: Option<MultisigDefinition>) -> Self {
        if definition.is_some() {
            self.cleared_at = None;
        }
        self.definition = definition;
        self
    }

    /// Drop the definition and start the grace window at `now`. The discovery
    /// timestamp is kept.
    pub fn clearing_definition(mut self, now: Timestamp) -> Self {
        self.definition = None;
        self.cleared_at = Some(now);
        self
    }

    pub fn replacing_call(mut self, call: Option<Vec<u8>>) -> Self {
        self.call = call;
        self
    }

    /// Known only from off-chain data (or just lost its definition) and still
    /// inside the grace window.
    pub fn is_discovered_but_pending_onchain(&self, now: Timestamp, timeout: Duration) -> bool {
        self.definition.is_none() && !self.is_expired(now, timeout)
    }

    /// Grace window runs from the clearing time, or from the discovery
    /// timestamp for records never confirmed on-chain
    pub fn is_expired(&self, now: Timestamp, timeout: Duration) -> bool {
        let since = self.cleared_at.unwrap_or(self.timestamp);
        now.saturating_sub(since) as u128 >= timeout.as_millis()
    }
}

/// Changes produced by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingOperationDelta {
    pub new: Vec<PendingOperation>,
    pub updated: Vec<PendingOperation>,
    pub removed: Vec<PendingOperationKey>,
}

impl PendingOperationDelta {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// `new ∪ updated`, i.e. everything that has to be upserted
    pub fn changed(&self) -> impl Iterator<Item = &PendingOperation> {
        self.new.iter().chain(self.updated.iter())
    }

    pub fn changed_call_hashes(&self) -> BTreeSet<CallHash> {
        self.changed().map(|op| op.call_hash).collect()
    }

    pub fn removed_call_hashes(&self) -> BTreeSet<CallHash> {
        self.removed.iter().map(|key| key.call_hash).collect()
    }
}

/// Indexer row for a call hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(default, with = "hex_bytes_opt")]
    pub call: Option<Vec<u8>>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// Multisig membership of a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigAccount {
    pub account_id: AccountId,
    pub signatory: AccountId,
    pub other_signatories: Vec<AccountId>,
    pub threshold: u16,
    /// `None` for a multisig that exists on every multisig-capable chain
    #[serde(default)]
    pub chain: Option<ChainId>,
}

impl MultisigAccount {
    pub fn applies_to(&self, chain_id: &ChainId) -> bool {
        self.chain.as_ref().map_or(true, |own| own == chain_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub multisig: Option<MultisigAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub chain_id: ChainId,
    pub name: String,
    #[serde(default)]
    pub multisig_supported: bool,
    #[serde(default)]
    pub multisig_indexer_url: Option<String>,
    #[serde(default)]
    pub block_time_ms: Option<u64>,
}

impl Chain {
    pub fn supports_multisig(&self) -> bool {
        self.multisig_supported
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainChange {
    Insert(Chain),
    Update(Chain),
    Delete(ChainId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MultisigEventKind {
    NewMultisig,
    MultisigApproval,
    MultisigExecuted,
    MultisigCancelled,
}

/// Decoded multisig pallet event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigEvent {
    pub kind: MultisigEventKind,
    pub multisig: AccountId,
    pub approving: AccountId,
    pub call_hash: CallHash,
    pub timepoint: Option<Timepoint>,
}

impl MultisigEvent {
    pub fn is_proposal(&self) -> bool {
        matches!(
            self.kind,
            MultisigEventKind::NewMultisig | MultisigEventKind::MultisigApproval
        )
    }
}

mod hex_bytes_opt {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&format!("0x{}", hex::encode(bytes))),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|s| hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom))
            .transpose()
    }
}
