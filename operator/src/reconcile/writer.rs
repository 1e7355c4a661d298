use std::{future::Future, time::Duration};

use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, Patch, PatchParams, PostParams},
};
use serde_json::{Value, json};

use super::resources::{MANAGER, OwnedKind};
use crate::{
    crd::{Environment, EnvironmentStatus},
    error::Error,
};

/// The write half of the cluster API, as far as a reconciliation pass needs it.
pub trait ClusterWriter: Send + Sync {
    fn create<K: OwnedKind>(&self, obj: &K) -> impl Future<Output = Result<(), Error>> + Send;

    /// Applies a JSON merge patch.
    fn patch<K: OwnedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn delete<K: OwnedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn patch_status(
        &self,
        env: &Environment,
        status: &EnvironmentStatus,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Writes through a kube [`Client`], bounding every request by `timeout`.
#[derive(Clone)]
pub struct KubeWriter {
    client: Client,
    timeout: Duration,
}

impl KubeWriter {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T>(
        &self,
        kind: &'static str,
        name: &str,
        request: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::RequestTimeout {
                kind,
                name: name.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(MANAGER.into()),
        ..Default::default()
    }
}

impl ClusterWriter for KubeWriter {
    async fn create<K: OwnedKind>(&self, obj: &K) -> Result<(), Error> {
        let name = obj.name_any();
        let api = K::api(self.client.clone(), obj.namespace().as_deref().unwrap_or_default());
        let params = PostParams {
            field_manager: Some(MANAGER.into()),
            ..Default::default()
        };
        self.bounded(K::KIND, &name, api.create(&params, obj)).await?;
        Ok(())
    }

    async fn patch<K: OwnedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        let api = K::api(self.client.clone(), namespace.unwrap_or_default());
        self.bounded(K::KIND, name, api.patch(name, &patch_params(), &Patch::Merge(patch)))
            .await?;
        Ok(())
    }

    async fn delete<K: OwnedKind>(&self, namespace: Option<&str>, name: &str) -> Result<(), Error> {
        let api = K::api(self.client.clone(), namespace.unwrap_or_default());
        self.bounded(K::KIND, name, api.delete(name, &DeleteParams::background()))
            .await?;
        Ok(())
    }

    async fn patch_status(&self, env: &Environment, status: &EnvironmentStatus) -> Result<(), Error> {
        let name = env.name_any();
        let api: Api<Environment> =
            Api::namespaced(self.client.clone(), env.namespace().as_deref().unwrap_or_default());
        let patch = json!({ "status": status });
        self.bounded(
            "Environment",
            &name,
            api.patch_status(&name, &patch_params(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}
