use futures::Stream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ListParams, ObjectList, PostParams, WatchEvent, WatchParams};
use kube::{Api, Client};

use crate::util::Error;

/// Thin typed wrapper around the cluster API operations this controller
/// needs: ConfigMap list/watch, Deployment list/patch, Lease read/create/
/// replace. Individual calls are independent RPCs with the client's own
/// per-call timeout; this type does no caching or retrying of its own — that
/// lives in the engine and elector.
#[derive(Clone)]
pub struct ClusterClient {
    configmaps: Api<ConfigMap>,
    deployments: Api<Deployment>,
    leases: Api<Lease>,
}

impl ClusterClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        ClusterClient {
            configmaps: Api::namespaced(client.clone(), namespace),
            deployments: Api::namespaced(client.clone(), namespace),
            leases: Api::namespaced(client, namespace),
        }
    }

    pub async fn list_configmaps(&self, selector: &str) -> Result<ObjectList<ConfigMap>, Error> {
        let lp = ListParams::default().labels(selector);
        self.configmaps.list(&lp).await.map_err(Error::from_kube)
    }

    pub async fn watch_configmaps(
        &self,
        selector: &str,
        resource_version: &str,
        timeout_secs: u32,
    ) -> Result<impl Stream<Item = kube::Result<WatchEvent<ConfigMap>>> + use<>, Error> {
        let wp = WatchParams::default()
            .labels(selector)
            .timeout(timeout_secs);
        self.configmaps
            .watch(&wp, resource_version)
            .await
            .map_err(Error::from_kube)
    }

    pub async fn list_deployments(&self, selector: &str) -> Result<ObjectList<Deployment>, Error> {
        let lp = ListParams::default().labels(selector);
        self.deployments.list(&lp).await.map_err(Error::from_kube)
    }

    pub async fn patch_deployment(
        &self,
        name: &str,
        before: &Deployment,
        after: &Deployment,
    ) -> Result<Deployment, Error> {
        crate::util::patch::apply_diff(&self.deployments, name, before, after).await
    }

    pub async fn get_lease(&self, name: &str) -> Result<Option<Lease>, Error> {
        match self.leases.get(name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                let err = Error::from_kube(e);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub async fn create_lease(&self, lease: &Lease) -> Result<Lease, Error> {
        self.leases
            .create(&PostParams::default(), lease)
            .await
            .map_err(Error::from_kube)
    }

    pub async fn replace_lease(
        &self,
        name: &str,
        before: &Lease,
        after: &Lease,
    ) -> Result<Lease, Error> {
        crate::util::patch::apply_diff(&self.leases, name, before, after).await
    }
}
