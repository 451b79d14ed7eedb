//! Protocol version gating utilities.
//!
//! Protocol versions are opaque `u32` values supplied by the caller. The
//! storage layer only relies on their total ordering: features are gated on
//! whether the effective version of an operation has reached a given cutoff.

/// Check if a protocol version is strictly before a cutoff.
#[inline]
pub fn protocol_version_is_before(version: u32, cutoff: u32) -> bool {
    version < cutoff
}

/// Check if a protocol version is at or after a cutoff (most commonly used).
#[inline]
pub fn protocol_version_starts_from(version: u32, cutoff: u32) -> bool {
    version >= cutoff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gating_is_total_and_monotonic() {
        assert!(protocol_version_is_before(10, 11));
        assert!(!protocol_version_is_before(11, 11));
        assert!(!protocol_version_is_before(12, 11));

        assert!(!protocol_version_starts_from(10, 11));
        assert!(protocol_version_starts_from(11, 11));
        assert!(protocol_version_starts_from(12, 11));
    }
}
