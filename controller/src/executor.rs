use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;

use crate::annotations::hash_annotation_key;
use crate::client::ClusterClient;
use crate::{log_warn, util::Error};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestartResult {
    pub matched: usize,
    pub restarted: usize,
    pub failed: usize,
}

impl RestartResult {
    /// A result that signals "retry this key" without having touched any
    /// Deployment (e.g. the Deployment list call itself failed).
    fn list_failed() -> RestartResult {
        RestartResult {
            matched: 0,
            restarted: 0,
            failed: 1,
        }
    }
}

/// Patches the pod-template annotations of every Deployment matching the
/// configured selector for an env, recording the rollout timestamp and the
/// ConfigMap's content hash. Idempotent: a Deployment already carrying the
/// current hash is left untouched.
pub struct RestartExecutor {
    client: ClusterClient,
    base_selector: BTreeMap<String, String>,
    rollout_annotation_key: String,
}

impl RestartExecutor {
    pub fn new(
        client: ClusterClient,
        base_selector: BTreeMap<String, String>,
        rollout_annotation_key: String,
    ) -> Self {
        RestartExecutor {
            client,
            base_selector,
            rollout_annotation_key,
        }
    }

    pub fn selector_for_env(&self, env: &str) -> String {
        build_selector_string(&self.base_selector, env)
    }

    pub async fn restart_matching(
        &self,
        env: &str,
        configmap_name: &str,
        content_hash: &str,
    ) -> RestartResult {
        let selector = self.selector_for_env(env);
        let hash_key = hash_annotation_key(&self.rollout_annotation_key, configmap_name);

        let deployments = match self.client.list_deployments(&selector).await {
            Ok(list) => list,
            Err(e) => {
                log_warn!("listing deployments for selector {selector:?} failed: {e}");
                return RestartResult::list_failed();
            }
        };

        let timestamp = rfc3339_now();
        let mut result = RestartResult {
            matched: deployments.items.len(),
            ..Default::default()
        };

        for dep in &deployments.items {
            let Some(name) = dep.metadata.name.clone() else {
                continue;
            };
            if !needs_patch(annotation_value(dep, &hash_key).as_deref(), content_hash) {
                continue;
            }
            let mut after = dep.clone();
            set_template_annotations(
                &mut after,
                &[
                    (self.rollout_annotation_key.clone(), timestamp.clone()),
                    (hash_key.clone(), content_hash.to_string()),
                ],
            );
            match self.client.patch_deployment(&name, dep, &after).await {
                Ok(_) => result.restarted += 1,
                Err(e) => {
                    log_warn!("patching deployment {name} failed: {e}");
                    result.failed += 1;
                }
            }
        }

        result
    }
}

/// Whether a Deployment needs patching given its current hash annotation
/// value (if any) and the content hash we want it to carry.
fn needs_patch(current: Option<&str>, content_hash: &str) -> bool {
    current != Some(content_hash)
}

pub(crate) fn annotation_value(dep: &Deployment, key: &str) -> Option<String> {
    dep.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(key)
        .cloned()
}

fn set_template_annotations(dep: &mut Deployment, kvs: &[(String, String)]) {
    let spec = dep.spec.get_or_insert_with(Default::default);
    let meta = spec.template.metadata.get_or_insert_with(Default::default);
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    for (k, v) in kvs {
        annotations.insert(k.clone(), v.clone());
    }
}

fn rfc3339_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Augments the configured app selector with `env=<env>` unless the
/// configured selector already pins its own `env` clause.
fn build_selector_string(base: &BTreeMap<String, String>, env: &str) -> String {
    let mut clauses = base.clone();
    clauses
        .entry("env".to_string())
        .or_insert_with(|| env.to_string());
    clauses
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn selector_gains_env_clause_when_absent() {
        let selector = build_selector_string(&base(&[("app", "helloworld")]), "prod");
        assert_eq!(selector, "app=helloworld,env=prod");
    }

    #[test]
    fn selector_keeps_explicit_env_clause() {
        let selector = build_selector_string(&base(&[("app", "helloworld"), ("env", "fixed")]), "prod");
        assert_eq!(selector, "app=helloworld,env=fixed");
    }

    #[test]
    fn needs_patch_when_hash_missing() {
        assert!(needs_patch(None, "abc"));
    }

    #[test]
    fn needs_patch_when_hash_differs() {
        assert!(needs_patch(Some("old"), "new"));
    }

    #[test]
    fn no_patch_when_hash_already_current() {
        assert!(!needs_patch(Some("same"), "same"));
    }

    #[test]
    fn annotation_roundtrips_through_set_and_read() {
        let mut dep = Deployment::default();
        set_template_annotations(&mut dep, &[("k".to_string(), "v".to_string())]);
        assert_eq!(annotation_value(&dep, "k").as_deref(), Some("v"));
    }

    #[test]
    fn existing_annotations_are_preserved_when_adding_new_ones() {
        let mut dep = Deployment::default();
        set_template_annotations(&mut dep, &[("existing".to_string(), "kept".to_string())]);
        set_template_annotations(&mut dep, &[("new".to_string(), "added".to_string())]);
        assert_eq!(annotation_value(&dep, "existing").as_deref(), Some("kept"));
        assert_eq!(annotation_value(&dep, "new").as_deref(), Some("added"));
    }
}
