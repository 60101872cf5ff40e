use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Computes a stable content digest over a ConfigMap's `data` field only.
///
/// `BTreeMap` already iterates in lexicographic key order and `k8s_openapi`
/// types `data` as `BTreeMap<String, String>`, so there is no null-value or
/// non-string-key case to normalise here: the type system rules those out
/// before this function ever sees the map. `serde_json::to_vec` emits no
/// insignificant whitespace, so the same logical map always serialises to
/// the same bytes regardless of insertion order.
///
/// Hashing only `data` (never labels, annotations, or `resource_version`)
/// is what makes metadata-only edits invisible to the restart decision.
pub fn hash_data(data: Option<&BTreeMap<String, String>>) -> String {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    let data = data.unwrap_or(&EMPTY);
    let bytes = serde_json::to_vec(data).expect("BTreeMap<String, String> always serialises");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_and_none_hash_the_same() {
        assert_eq!(hash_data(None), hash_data(Some(&map(&[]))));
    }

    #[test]
    fn identical_content_hashes_identically_regardless_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("zeta".to_string(), "1".to_string());
        a.insert("alpha".to_string(), "2".to_string());

        let mut b = BTreeMap::new();
        b.insert("alpha".to_string(), "2".to_string());
        b.insert("zeta".to_string(), "1".to_string());

        assert_eq!(hash_data(Some(&a)), hash_data(Some(&b)));
    }

    #[test]
    fn different_content_hashes_differently() {
        let a = map(&[("key", "value-1")]);
        let b = map(&[("key", "value-2")]);
        assert_ne!(hash_data(Some(&a)), hash_data(Some(&b)));
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let digest = hash_data(Some(&map(&[("k", "v")])));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn adding_a_key_changes_the_hash() {
        let a = map(&[("k1", "v1")]);
        let b = map(&[("k1", "v1"), ("k2", "v2")]);
        assert_ne!(hash_data(Some(&a)), hash_data(Some(&b)));
    }
}
