// Copyright 2025 HwameiStor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::types;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt, api::Api};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::Snafu;
use snafu::futures::TryFutureExt;
use std::fmt::Debug;

/// Bounded retries for compare-and-swap writes; conflicts past this count
/// surface to the caller's error policy.
pub const CAS_RETRIES: usize = 5;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Kubernetes API error: {}", source))]
    Kube { source: kube::Error },

    #[snafu(display("record event error: {}", source))]
    Record { source: kube::Error },

    #[snafu(transparent)]
    Types { source: types::error::Error },

    #[snafu(transparent)]
    Serde { source: serde_json::Error },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}

pub struct Context {
    pub(crate) client: kube::Client,
    pub(crate) recorder: Recorder,
}

impl Context {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "local-disk-manager".into(),
            instance: std::env::var("NODENAME").ok(),
        };

        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    /// send event attached to the given record
    #[inline]
    pub async fn record<T>(
        &self,
        resource: &T,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), Error>
    where
        T: Resource<DynamicType = ()>,
    {
        self.recorder
            .publish(
                &Event {
                    type_: event_type,
                    reason: reason.to_owned(),
                    note: Some(message.into()),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &resource.object_ref(&()),
            )
            .context(RecordSnafu)
            .await
    }

    pub async fn get<T>(&self, name: &str) -> Result<T, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        api.get(name).context(KubeSnafu).await
    }

    pub async fn get_opt<T>(&self, name: &str) -> Result<Option<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        api.get_opt(name).context(KubeSnafu).await
    }

    pub async fn list<T>(&self, params: &ListParams) -> Result<ObjectList<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        api.list(params).context(KubeSnafu).await
    }

    pub async fn create<T>(&self, resource: &T) -> Result<T, Error>
    where
        T: Clone + Serialize + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        api.create(&PostParams::default(), resource)
            .context(KubeSnafu)
            .await
    }

    /// Replace with the resourceVersion carried by `resource`; a stale
    /// version yields a conflict the caller retries from a fresh read.
    pub async fn update<T>(&self, resource: &T) -> Result<T, Error>
    where
        T: Clone + Serialize + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        api.replace(&resource.name_any(), &PostParams::default(), resource)
            .context(KubeSnafu)
            .await
    }

    pub async fn apply<T>(&self, resource: &T) -> Result<T, Error>
    where
        T: Clone + Serialize + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        api.patch(
            &resource.name_any(),
            &PatchParams::apply("local-disk-manager"),
            &Patch::Apply(resource),
        )
        .context(KubeSnafu)
        .await
    }

    /// Merge-patch the status subresource of a cluster-scoped record.
    pub async fn patch_status<T>(&self, name: &str, status: serde_json::Value) -> Result<T, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        let body = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .context(KubeSnafu)
            .await
    }

    /// Compare-and-swap variant: the patch carries the observed
    /// resourceVersion, so a concurrent writer turns this into a 409 the
    /// caller retries from a fresh read.
    pub async fn patch_status_cas<T>(
        &self,
        name: &str,
        resource_version: &str,
        status: serde_json::Value,
    ) -> Result<T, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        let body = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .context(KubeSnafu)
            .await
    }

    pub async fn delete<T>(&self, name: &str) -> Result<(), Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .context(KubeSnafu)
            .await?;
        Ok(())
    }

    pub async fn get_namespaced<T>(&self, name: &str, namespace: &str) -> Result<T, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).context(KubeSnafu).await
    }

    pub async fn get_namespaced_opt<T>(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).context(KubeSnafu).await
    }

    pub async fn list_namespaced<T>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<ObjectList<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.list(params).context(KubeSnafu).await
    }

    pub async fn create_namespaced<T>(&self, resource: &T, namespace: &str) -> Result<T, Error>
    where
        T: Clone + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), resource)
            .context(KubeSnafu)
            .await
    }

    pub async fn update_namespaced<T>(&self, resource: &T, namespace: &str) -> Result<T, Error>
    where
        T: Clone + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&resource.name_any(), &PostParams::default(), resource)
            .context(KubeSnafu)
            .await
    }
}
