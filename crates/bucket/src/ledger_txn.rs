//! The transactional ledger store consulted during eviction.

use std::collections::HashMap;

use tessera_ledger::{ledger_entry_key, LedgerEntry, LedgerKey};

/// Point loads and erases against the ledger store, scoped to one
/// transaction.
///
/// The eviction scanner assumes only that a `load_without_record` followed
/// by an `erase` is atomic within the transaction; isolation beyond that is
/// the implementor's concern.
pub trait LedgerTxn {
    /// Load an entry without recording a read footprint.
    fn load_without_record(&mut self, key: &LedgerKey) -> Option<LedgerEntry>;

    /// Erase an entry.
    fn erase(&mut self, key: &LedgerKey);
}

/// In-memory [`LedgerTxn`] backing tests and tools.
#[derive(Debug, Default)]
pub struct MemLedgerTxn {
    entries: HashMap<LedgerKey, LedgerEntry>,
}

impl MemLedgerTxn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under its own key.
    pub fn insert(&mut self, entry: LedgerEntry) {
        self.entries.insert(ledger_entry_key(&entry), entry);
    }

    /// Number of entries currently present.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.entries.contains_key(key)
    }
}

impl LedgerTxn for MemLedgerTxn {
    fn load_without_record(&mut self, key: &LedgerKey) -> Option<LedgerEntry> {
        self.entries.get(key).cloned()
    }

    fn erase(&mut self, key: &LedgerKey) {
        self.entries.remove(key);
    }
}
