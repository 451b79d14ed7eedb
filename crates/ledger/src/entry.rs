//! Ledger entries, keys and the total key ordering.
//!
//! A ledger entry is the unit of state tracked by the store: accounts,
//! trust lines, liquidity pools, contract data and code, and the TTL
//! records that govern contract-entry lifetimes. Every entry has a
//! [`LedgerKey`] identity, and keys carry a total ordering that the bucket
//! layer relies on for sorted runs and streaming merges.
//!
//! # Key Ordering
//!
//! Keys are sorted first by entry-type discriminant, then by type-specific
//! fields in declaration order. See [`compare_keys`]. The ordering is
//! deterministic: two implementations walking the same entries must produce
//! identical sorted sequences, or content hashes will diverge.
//!
//! # TTL Helpers
//!
//! Contract entries (contract data and contract code) are subject to
//! TTL-driven eviction:
//!
//! - [`is_contract_entry`] / [`is_contract_key`]: entry types with a TTL
//! - [`is_temporary_entry`]: contract data that is deleted on expiry
//! - [`is_persistent_entry`]: entries that survive expiry via archival
//! - [`ttl_key`]: derive the TTL key for a contract entry key

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::types::Hash256;

/// A 32-byte account identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AccountId(pub [u8; 32]);

/// A liquidity pool identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub Hash256);

/// A 32-byte contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractId(pub [u8; 32]);

/// An asset held on a trust line.
///
/// The variant order matters: pool-share trust lines sort after all credit
/// trust lines of the same account, keeping an account's pool-share trust
/// lines contiguous in a sorted bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// The native asset.
    Native,
    /// An issued credit asset.
    Credit {
        code: [u8; 12],
        issuer: AccountId,
    },
    /// A share in a liquidity pool.
    PoolShare(PoolId),
}

/// An account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub account_id: AccountId,
    pub balance: i64,
    pub seq_num: u64,
    pub num_sub_entries: u32,
}

/// A trust line from an account to an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustLineEntry {
    pub account_id: AccountId,
    pub asset: Asset,
    pub balance: i64,
    pub limit: i64,
    pub flags: u32,
}

/// A liquidity pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityPoolEntry {
    pub liquidity_pool_id: PoolId,
    pub asset_a: Asset,
    pub asset_b: Asset,
    pub reserve_a: i64,
    pub reserve_b: i64,
    pub total_pool_shares: i64,
}

/// Durability class of a contract data entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContractDataDurability {
    /// Deleted outright when its TTL expires.
    Temporary,
    /// Archived when its TTL expires; restorable later.
    Persistent,
}

/// A contract data entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDataEntry {
    pub contract: ContractId,
    pub key: Vec<u8>,
    pub durability: ContractDataDurability,
    pub val: Vec<u8>,
}

/// A contract code entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCodeEntry {
    pub hash: Hash256,
    pub code: Vec<u8>,
}

/// A TTL record for a contract entry.
///
/// The `key_hash` is the SHA-256 of the canonical bytes of the contract
/// entry's key; see [`ttl_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlEntry {
    pub key_hash: Hash256,
    pub live_until_ledger_seq: u32,
}

impl TtlEntry {
    /// A TTL is live at `ledger_seq` while its lifetime has not been
    /// strictly exceeded.
    pub fn is_live(&self, ledger_seq: u32) -> bool {
        self.live_until_ledger_seq >= ledger_seq
    }
}

/// The state payload of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryData {
    Account(AccountEntry),
    TrustLine(TrustLineEntry),
    LiquidityPool(LiquidityPoolEntry),
    ContractData(ContractDataEntry),
    ContractCode(ContractCodeEntry),
    Ttl(TtlEntry),
}

/// A ledger entry: a state payload plus the ledger it was last modified in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_modified_ledger_seq: u32,
    pub data: LedgerEntryData,
}

/// The identity of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerKey {
    Account {
        account_id: AccountId,
    },
    TrustLine {
        account_id: AccountId,
        asset: Asset,
    },
    LiquidityPool {
        liquidity_pool_id: PoolId,
    },
    ContractData {
        contract: ContractId,
        key: Vec<u8>,
        durability: ContractDataDurability,
    },
    ContractCode {
        hash: Hash256,
    },
    Ttl {
        key_hash: Hash256,
    },
}

/// Entry type discriminants, in key-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LedgerEntryType {
    Account,
    TrustLine,
    LiquidityPool,
    ContractData,
    ContractCode,
    Ttl,
}

/// Extract the [`LedgerKey`] identity of a ledger entry.
pub fn ledger_entry_key(entry: &LedgerEntry) -> LedgerKey {
    match &entry.data {
        LedgerEntryData::Account(account) => LedgerKey::Account {
            account_id: account.account_id,
        },
        LedgerEntryData::TrustLine(trust_line) => LedgerKey::TrustLine {
            account_id: trust_line.account_id,
            asset: trust_line.asset,
        },
        LedgerEntryData::LiquidityPool(pool) => LedgerKey::LiquidityPool {
            liquidity_pool_id: pool.liquidity_pool_id,
        },
        LedgerEntryData::ContractData(data) => LedgerKey::ContractData {
            contract: data.contract,
            key: data.key.clone(),
            durability: data.durability,
        },
        LedgerEntryData::ContractCode(code) => LedgerKey::ContractCode { hash: code.hash },
        LedgerEntryData::Ttl(ttl) => LedgerKey::Ttl {
            key_hash: ttl.key_hash,
        },
    }
}

/// The type discriminant of a key.
pub fn ledger_key_type(key: &LedgerKey) -> LedgerEntryType {
    match key {
        LedgerKey::Account { .. } => LedgerEntryType::Account,
        LedgerKey::TrustLine { .. } => LedgerEntryType::TrustLine,
        LedgerKey::LiquidityPool { .. } => LedgerEntryType::LiquidityPool,
        LedgerKey::ContractData { .. } => LedgerEntryType::ContractData,
        LedgerKey::ContractCode { .. } => LedgerEntryType::ContractCode,
        LedgerKey::Ttl { .. } => LedgerEntryType::Ttl,
    }
}

/// Compare two keys for ordering.
///
/// Keys are sorted first by type discriminant, then by type-specific fields.
/// This ordering is what makes bucket files sorted runs; it must be stable
/// across releases or content hashes of rebuilt buckets would change.
pub fn compare_keys(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match ledger_key_type(a).cmp(&ledger_key_type(b)) {
        Ordering::Equal => compare_keys_same_type(a, b),
        other => other,
    }
}

fn compare_keys_same_type(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match (a, b) {
        (
            LedgerKey::Account { account_id: a },
            LedgerKey::Account { account_id: b },
        ) => a.cmp(b),
        (
            LedgerKey::TrustLine {
                account_id: aid,
                asset: aa,
            },
            LedgerKey::TrustLine {
                account_id: bid,
                asset: ba,
            },
        ) => aid.cmp(bid).then_with(|| aa.cmp(ba)),
        (
            LedgerKey::LiquidityPool {
                liquidity_pool_id: a,
            },
            LedgerKey::LiquidityPool {
                liquidity_pool_id: b,
            },
        ) => a.cmp(b),
        (
            LedgerKey::ContractData {
                contract: ac,
                key: ak,
                durability: ad,
            },
            LedgerKey::ContractData {
                contract: bc,
                key: bk,
                durability: bd,
            },
        ) => ac.cmp(bc).then_with(|| ak.cmp(bk)).then_with(|| ad.cmp(bd)),
        (LedgerKey::ContractCode { hash: a }, LedgerKey::ContractCode { hash: b }) => a.cmp(b),
        (LedgerKey::Ttl { key_hash: a }, LedgerKey::Ttl { key_hash: b }) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

impl PartialOrd for LedgerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LedgerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(self, other)
    }
}

// ============================================================================
// TTL helpers
// ============================================================================

/// Check if a ledger entry is a contract entry (contract data or code).
///
/// Contract entries are the only entry types subject to TTL-driven eviction.
pub fn is_contract_entry(entry: &LedgerEntry) -> bool {
    matches!(
        entry.data,
        LedgerEntryData::ContractData(_) | LedgerEntryData::ContractCode(_)
    )
}

/// Check if a key identifies a contract entry.
pub fn is_contract_key(key: &LedgerKey) -> bool {
    matches!(
        key,
        LedgerKey::ContractData { .. } | LedgerKey::ContractCode { .. }
    )
}

/// Check if a ledger entry is a temporary contract data entry.
///
/// Temporary entries are deleted outright when their TTL expires; they are
/// never archived.
pub fn is_temporary_entry(entry: &LedgerEntry) -> bool {
    if let LedgerEntryData::ContractData(data) = &entry.data {
        data.durability == ContractDataDurability::Temporary
    } else {
        false
    }
}

/// Check if a ledger entry is a persistent contract entry.
///
/// Persistent entries (contract code, and contract data with `Persistent`
/// durability) are archived when their TTL expires and can be restored.
pub fn is_persistent_entry(entry: &LedgerEntry) -> bool {
    match &entry.data {
        LedgerEntryData::ContractCode(_) => true,
        LedgerEntryData::ContractData(data) => {
            data.durability == ContractDataDurability::Persistent
        }
        _ => false,
    }
}

/// Derive the TTL key for a contract entry key.
///
/// The TTL key is the SHA-256 of the contract key's canonical bytes.
/// Returns `None` for keys that do not carry a TTL.
pub fn ttl_key(key: &LedgerKey) -> Option<LedgerKey> {
    if !is_contract_key(key) {
        return None;
    }

    let key_bytes = codec::serialize(key).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let mut hash_bytes = [0u8; 32];
    hash_bytes.copy_from_slice(&hasher.finalize());

    Some(LedgerKey::Ttl {
        key_hash: Hash256(hash_bytes),
    })
}
