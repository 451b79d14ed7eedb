//! Common ledger types and utilities for tessera.
//!
//! This crate provides the data model shared across all tessera modules. It
//! is designed to be dependency-light and contains pure data types and
//! helpers with no I/O side effects beyond the frame streams, making it
//! suitable as a foundation for the storage crates.
//!
//! # Overview
//!
//! - [`entry`] - Ledger entries, keys and the total key ordering
//! - [`codec`] - The canonical binary codec for ledger records
//! - [`frame`] - Size-prefixed frame streams for record files
//! - [`protocol`] - Protocol version gating utilities
//! - [`types`] - Core types like [`Hash256`]

pub mod codec;
pub mod entry;
pub mod frame;
pub mod protocol;
pub mod types;

pub use codec::CodecError;
pub use entry::{
    compare_keys, is_contract_entry, is_contract_key, is_persistent_entry, is_temporary_entry,
    ledger_entry_key, ttl_key, AccountEntry, AccountId, Asset, ContractCodeEntry,
    ContractDataDurability, ContractDataEntry, ContractId, LedgerEntry, LedgerEntryData,
    LedgerEntryType, LedgerKey, LiquidityPoolEntry, PoolId, TrustLineEntry, TtlEntry,
};
pub use frame::{FrameInputStream, FrameOutputStream};
pub use protocol::{protocol_version_is_before, protocol_version_starts_from};
pub use types::Hash256;
