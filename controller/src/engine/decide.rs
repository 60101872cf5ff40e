use std::collections::BTreeMap;

/// Identifies a single engine-tracked ConfigMap: its `env` label and its
/// own name. All engine state is keyed on this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub env: String,
    pub configmap_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Other,
}

/// Whether a watch/list event is even worth looking at: only ADDED and
/// MODIFIED survive, and only for objects matching every clause of the
/// configured selector.
pub fn passes_filter(kind: EventKind, labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    matches!(kind, EventKind::Added | EventKind::Modified)
        && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Extracts the engine key from an object's labels and name, requiring a
/// non-empty `env` label and non-empty name.
pub fn extract_key(labels: &BTreeMap<String, String>, name: Option<&str>) -> Option<Key> {
    let env = labels.get("env")?.trim();
    if env.is_empty() {
        return None;
    }
    let name = name?.trim();
    if name.is_empty() {
        return None;
    }
    Some(Key {
        env: env.to_string(),
        configmap_name: name.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Initial watch replay seeding the baseline hash; never restarts.
    Baseline,
    /// Content hash unchanged; metadata-only churn.
    NoChange,
    /// Content hash differs from the last observation.
    Changed,
}

/// Classifies a content-hash observation against the previously cached
/// hash for this key. A first-ever `ADDED` with no prior baseline seeds the
/// cache without restarting; a first-ever `MODIFIED` with no prior baseline
/// is treated as a real change (the engine only has no baseline on MODIFIED
/// when it started watching mid-stream after missing the ADD).
pub fn classify_change(kind: EventKind, previous_hash: Option<&str>, current_hash: &str) -> ChangeDecision {
    if previous_hash.is_none() && kind == EventKind::Added {
        return ChangeDecision::Baseline;
    }
    if previous_hash == Some(current_hash) {
        return ChangeDecision::NoChange;
    }
    ChangeDecision::Changed
}

/// Seconds remaining before this key may restart again, given the debounce
/// window and the last successful restart. `0` if never restarted or if
/// debounce is disabled.
pub fn debounce_remaining(debounce_seconds: u64, now: u64, last_restart: Option<u64>) -> u64 {
    if debounce_seconds == 0 {
        return 0;
    }
    match last_restart {
        None => 0,
        Some(last) => debounce_seconds.saturating_sub(now.saturating_sub(last)),
    }
}

/// Coalesces a new deferred deadline into any existing one: the deadline
/// only ever moves later, never earlier.
pub fn coalesce_deadline(existing: Option<u64>, candidate: u64) -> u64 {
    existing.map(|e| e.max(candidate)).unwrap_or(candidate)
}

/// Bounded exponential backoff for a failing key: `min(30, 2^(attempt-1))`
/// seconds. `attempt` is 1-based.
pub fn retry_backoff_secs(attempt: u32) -> u64 {
    let attempt = attempt.max(1).min(31);
    (1u64 << (attempt - 1)).min(30)
}

/// The watch-stream timeout: 30s when nothing is pending, otherwise just
/// long enough to wake for the nearest due deadline (floor 1s, ceiling 30s).
pub fn watch_timeout_secs(now: u64, nearest_pending_deadline: Option<u64>) -> u32 {
    match nearest_pending_deadline {
        None => 30,
        Some(deadline) => deadline.saturating_sub(now).clamp(1, 30) as u32,
    }
}

/// Jittered retry delay: `backoff * (0.5 + uniform)`, `uniform` in `[0, 1)`.
pub fn jittered_delay_secs(backoff_secs: f64, uniform: f64) -> f64 {
    backoff_secs * (0.5 + uniform)
}

/// Doubles a backoff, capped at 30s.
pub fn next_backoff_secs(current_secs: f64) -> f64 {
    (current_secs * 2.0).min(30.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftStatus {
    InSync,
    Stale,
    Legacy,
    Unmanaged,
}

impl DriftStatus {
    pub fn needs_reconcile(self) -> bool {
        matches!(self, DriftStatus::Stale | DriftStatus::Legacy)
    }
}

/// Classifies a Deployment's drift against the current ConfigMap hash, per
/// its existing hash and rollout annotations.
pub fn classify_drift(hash_annotation: Option<&str>, rollout_annotation_present: bool, expected_hash: &str) -> DriftStatus {
    match hash_annotation {
        Some(h) if h == expected_hash => DriftStatus::InSync,
        Some(_) => DriftStatus::Stale,
        None if rollout_annotation_present => DriftStatus::Legacy,
        None => DriftStatus::Unmanaged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_drops_deleted_events() {
        let labels = BTreeMap::new();
        let selector = BTreeMap::new();
        assert!(!passes_filter(EventKind::Deleted, &labels, &selector));
    }

    #[test]
    fn filter_requires_every_selector_clause_to_match() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "helloworld".to_string());
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "helloworld".to_string());
        selector.insert("tier".to_string(), "web".to_string());
        assert!(!passes_filter(EventKind::Modified, &labels, &selector));

        labels.insert("tier".to_string(), "web".to_string());
        assert!(passes_filter(EventKind::Modified, &labels, &selector));
    }

    #[test]
    fn extract_key_requires_nonempty_env_and_name() {
        let mut labels = BTreeMap::new();
        assert!(extract_key(&labels, Some("cm")).is_none());
        labels.insert("env".to_string(), "".to_string());
        assert!(extract_key(&labels, Some("cm")).is_none());
        labels.insert("env".to_string(), "prod".to_string());
        assert!(extract_key(&labels, None).is_none());
        assert!(extract_key(&labels, Some("cm")).is_some());
    }

    #[test]
    fn added_without_baseline_seeds_only() {
        assert_eq!(
            classify_change(EventKind::Added, None, "h1"),
            ChangeDecision::Baseline
        );
    }

    #[test]
    fn modified_without_baseline_is_a_real_change() {
        assert_eq!(
            classify_change(EventKind::Modified, None, "h1"),
            ChangeDecision::Changed
        );
    }

    #[test]
    fn same_hash_is_no_change() {
        assert_eq!(
            classify_change(EventKind::Modified, Some("h1"), "h1"),
            ChangeDecision::NoChange
        );
    }

    #[test]
    fn different_hash_is_a_change() {
        assert_eq!(
            classify_change(EventKind::Modified, Some("h1"), "h2"),
            ChangeDecision::Changed
        );
    }

    #[test]
    fn debounce_zero_never_defers() {
        assert_eq!(debounce_remaining(0, 1000, Some(999)), 0);
    }

    #[test]
    fn debounce_remaining_counts_down() {
        assert_eq!(debounce_remaining(5, 100, Some(98)), 3);
        assert_eq!(debounce_remaining(5, 100, Some(95)), 0);
        assert_eq!(debounce_remaining(5, 100, Some(90)), 0);
    }

    #[test]
    fn debounce_with_no_prior_restart_is_zero() {
        assert_eq!(debounce_remaining(5, 100, None), 0);
    }

    #[test]
    fn coalesce_never_moves_deadline_earlier() {
        assert_eq!(coalesce_deadline(Some(100), 90), 100);
        assert_eq!(coalesce_deadline(Some(100), 110), 110);
        assert_eq!(coalesce_deadline(None, 50), 50);
    }

    #[test]
    fn retry_backoff_follows_the_capped_sequence() {
        let expected = [1, 2, 4, 8, 16, 30, 30];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(retry_backoff_secs((i + 1) as u32), *want);
        }
    }

    #[test]
    fn watch_timeout_is_30_when_nothing_pending() {
        assert_eq!(watch_timeout_secs(100, None), 30);
    }

    #[test]
    fn watch_timeout_floors_at_1_and_ceils_at_30() {
        assert_eq!(watch_timeout_secs(100, Some(100)), 1);
        assert_eq!(watch_timeout_secs(100, Some(99)), 1);
        assert_eq!(watch_timeout_secs(100, Some(1000)), 30);
        assert_eq!(watch_timeout_secs(100, Some(105)), 5);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(next_backoff_secs(1.0), 2.0);
        assert_eq!(next_backoff_secs(20.0), 30.0);
        assert_eq!(next_backoff_secs(30.0), 30.0);
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half_times_backoff() {
        assert_eq!(jittered_delay_secs(10.0, 0.0), 5.0);
        assert_eq!(jittered_delay_secs(10.0, 1.0), 15.0);
    }

    #[test]
    fn drift_classification_covers_all_four_cases() {
        assert_eq!(classify_drift(Some("h"), true, "h"), DriftStatus::InSync);
        assert_eq!(classify_drift(Some("old"), true, "h"), DriftStatus::Stale);
        assert_eq!(classify_drift(None, true, "h"), DriftStatus::Legacy);
        assert_eq!(classify_drift(None, false, "h"), DriftStatus::Unmanaged);
    }

    #[test]
    fn only_stale_and_legacy_need_reconcile() {
        assert!(!DriftStatus::InSync.needs_reconcile());
        assert!(DriftStatus::Stale.needs_reconcile());
        assert!(DriftStatus::Legacy.needs_reconcile());
        assert!(!DriftStatus::Unmanaged.needs_reconcile());
    }
}
