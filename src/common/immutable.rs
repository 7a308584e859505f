//! Helper functions for immutable items.

use sha1_smol::Sha1;

use super::ID_SIZE;
use crate::Id;

/// Maximum size of a stored value's `v` field.
pub const MAX_VALUE_SIZE: usize = 1000;

/// Returns `true` if `v` hashes to `target`.
pub fn validate_immutable(v: &[u8], target: &Id) -> bool {
    hash_immutable(v) == *target.as_bytes()
}

/// The target of an immutable item: SHA-1 over the bencoded `v` field.
pub fn hash_immutable(v: &[u8]) -> [u8; ID_SIZE] {
    let mut encoded = Vec::with_capacity(v.len() + 6);
    encoded.extend(format!("{}:", v.len()).bytes());
    encoded.extend_from_slice(v);

    let mut hasher = Sha1::new();
    hasher.update(&encoded);

    hasher.digest().bytes()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn hash_is_over_bencoded_value() {
        // sha1("4:spam")
        let target = Id::from_str("97276df3fe95d101e82c29335821265902a40f90").unwrap();

        assert_eq!(hash_immutable(b"spam"), *target.as_bytes());
    }

    #[test]
    fn validate_rejects_truncated_value() {
        let v = b"some stored value";
        let target = Id::from_bytes(hash_immutable(v)).unwrap();

        assert!(validate_immutable(v, &target));
        assert!(!validate_immutable(&v[1..], &target));
    }
}
