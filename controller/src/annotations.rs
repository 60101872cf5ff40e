use sha2::{Digest, Sha256};

/// Splits `prefix/name` into `(Some(prefix), name)`, or `(None, key)` for a
/// bare key with no prefix.
fn split_prefix(key: &str) -> (Option<&str>, &str) {
    match key.rfind('/') {
        Some(idx) => (Some(&key[..idx]), &key[idx + 1..]),
        None => (None, key),
    }
}

fn slugify(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    replaced.trim_matches(|c: char| c == '-' || c == '.').to_string()
}

fn short_digest(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())[..10].to_string()
}

/// Derives the per-ConfigMap content-hash annotation key from the
/// configured rollout-timestamp annotation key and a ConfigMap name.
///
/// Shares the rollout key's prefix (if any) so both annotations live in the
/// same namespace on the Deployment's pod template. The local name is
/// `config-hash-<slug>`, truncated with a digest suffix if it would exceed
/// 63 characters, so two ConfigMaps whose names collide only after
/// truncation still end up with distinct annotation keys.
pub fn hash_annotation_key(rollout_annotation_key: &str, configmap_name: &str) -> String {
    const LOCAL_LIMIT: usize = 63;
    const STEM: &str = "config-hash-";

    let (prefix, _) = split_prefix(rollout_annotation_key);
    let slug = slugify(configmap_name);
    let mut local = format!("{STEM}{slug}");

    if local.len() > LOCAL_LIMIT {
        let suffix = format!("-{}", short_digest(configmap_name));
        let budget = LOCAL_LIMIT.saturating_sub(STEM.len() + suffix.len());
        let truncated: String = slug.chars().take(budget).collect();
        local = format!("{STEM}{truncated}{suffix}");
    }

    match prefix {
        Some(p) => format!("{p}/{local}"),
        None => local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_prefix_with_rollout_key() {
        let key = hash_annotation_key("shipshape.io/restartedAt", "app-config");
        assert_eq!(key, "shipshape.io/config-hash-app-config");
    }

    #[test]
    fn bare_rollout_key_produces_bare_hash_key() {
        let key = hash_annotation_key("restartedAt", "app-config");
        assert_eq!(key, "config-hash-app-config");
    }

    #[test]
    fn disallowed_characters_are_slugified() {
        let key = hash_annotation_key("p/restartedAt", "app_config.v1!!!");
        assert_eq!(key, "p/config-hash-app_config.v1");
    }

    #[test]
    fn long_names_truncate_within_limit_with_distinct_suffixes() {
        let long_a = "a".repeat(100);
        let long_b = format!("{}b", "a".repeat(99));

        let key_a = hash_annotation_key("p/restartedAt", &long_a);
        let key_b = hash_annotation_key("p/restartedAt", &long_b);

        let (_, local_a) = split_prefix(&key_a);
        assert!(local_a.len() <= 63);
        assert_ne!(key_a, key_b, "distinct names must not collide after truncation");
    }

    #[test]
    fn no_truncation_for_short_names() {
        let key = hash_annotation_key("p/restartedAt", "short");
        assert!(!key.contains("--"));
    }
}
