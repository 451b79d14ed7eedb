//! Merge statistics.
//!
//! Counters accumulate in a plain record local to each merge and are pushed
//! to the bucket manager once at the end, so no atomics are needed inside
//! the merge loop. The manager aggregates records from finished merges with
//! [`MergeCounters::add`].

/// Statistics accumulated by a single merge (or fresh-bucket build).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeCounters {
    /// Merges run under a protocol before init-entry support.
    pub pre_init_entry_protocol_merges: u64,
    /// Merges run under a protocol with init-entry support.
    pub post_init_entry_protocol_merges: u64,

    /// Merges run under a protocol that still uses shadows.
    pub pre_shadow_removal_protocol_merges: u64,
    /// Merges run under a protocol with shadows removed.
    pub post_shadow_removal_protocol_merges: u64,

    /// Input entries from the new bucket, by type.
    pub new_meta_entries: u64,
    pub new_init_entries: u64,
    pub new_live_entries: u64,
    pub new_dead_entries: u64,

    /// Input entries from the old bucket, by type.
    pub old_meta_entries: u64,
    pub old_init_entries: u64,
    pub old_live_entries: u64,
    pub old_dead_entries: u64,

    /// Entries taken without equal-key resolution.
    pub old_entries_default_accepted: u64,
    pub new_entries_default_accepted: u64,

    /// Equal-key resolutions, by case.
    pub new_init_entries_merged_with_old_dead: u64,
    pub old_init_entries_merged_with_new_live: u64,
    pub old_init_entries_merged_with_new_dead: u64,
    pub new_entries_merged_with_old_neither_init: u64,

    /// Steps taken advancing shadow cursors.
    pub shadow_scan_steps: u64,
    /// Entries elided because a shadow covered them, by type.
    pub meta_entry_shadow_elisions: u64,
    pub init_entry_shadow_elisions: u64,
    pub live_entry_shadow_elisions: u64,
    pub dead_entry_shadow_elisions: u64,

    /// Tombstones filtered at the output stage (oldest-level elision).
    pub output_iterator_tombstone_elisions: u64,
    /// Buffered records replaced by a same-key successor.
    pub output_iterator_buffer_updates: u64,
    /// Records actually written to the output file.
    pub output_iterator_actual_writes: u64,
}

impl MergeCounters {
    /// Fold another record into this one.
    pub fn add(&mut self, other: &MergeCounters) {
        self.pre_init_entry_protocol_merges += other.pre_init_entry_protocol_merges;
        self.post_init_entry_protocol_merges += other.post_init_entry_protocol_merges;
        self.pre_shadow_removal_protocol_merges += other.pre_shadow_removal_protocol_merges;
        self.post_shadow_removal_protocol_merges += other.post_shadow_removal_protocol_merges;
        self.new_meta_entries += other.new_meta_entries;
        self.new_init_entries += other.new_init_entries;
        self.new_live_entries += other.new_live_entries;
        self.new_dead_entries += other.new_dead_entries;
        self.old_meta_entries += other.old_meta_entries;
        self.old_init_entries += other.old_init_entries;
        self.old_live_entries += other.old_live_entries;
        self.old_dead_entries += other.old_dead_entries;
        self.old_entries_default_accepted += other.old_entries_default_accepted;
        self.new_entries_default_accepted += other.new_entries_default_accepted;
        self.new_init_entries_merged_with_old_dead += other.new_init_entries_merged_with_old_dead;
        self.old_init_entries_merged_with_new_live += other.old_init_entries_merged_with_new_live;
        self.old_init_entries_merged_with_new_dead += other.old_init_entries_merged_with_new_dead;
        self.new_entries_merged_with_old_neither_init +=
            other.new_entries_merged_with_old_neither_init;
        self.shadow_scan_steps += other.shadow_scan_steps;
        self.meta_entry_shadow_elisions += other.meta_entry_shadow_elisions;
        self.init_entry_shadow_elisions += other.init_entry_shadow_elisions;
        self.live_entry_shadow_elisions += other.live_entry_shadow_elisions;
        self.dead_entry_shadow_elisions += other.dead_entry_shadow_elisions;
        self.output_iterator_tombstone_elisions += other.output_iterator_tombstone_elisions;
        self.output_iterator_buffer_updates += other.output_iterator_buffer_updates;
        self.output_iterator_actual_writes += other.output_iterator_actual_writes;
    }

    /// Total shadow elisions across entry types.
    pub fn total_shadow_elisions(&self) -> u64 {
        self.meta_entry_shadow_elisions
            + self.init_entry_shadow_elisions
            + self.live_entry_shadow_elisions
            + self.dead_entry_shadow_elisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_folds_fields() {
        let mut a = MergeCounters {
            old_entries_default_accepted: 3,
            live_entry_shadow_elisions: 1,
            ..Default::default()
        };
        let b = MergeCounters {
            old_entries_default_accepted: 2,
            dead_entry_shadow_elisions: 4,
            output_iterator_actual_writes: 7,
            ..Default::default()
        };
        a.add(&b);

        assert_eq!(a.old_entries_default_accepted, 5);
        assert_eq!(a.total_shadow_elisions(), 5);
        assert_eq!(a.output_iterator_actual_writes, 7);
    }
}
