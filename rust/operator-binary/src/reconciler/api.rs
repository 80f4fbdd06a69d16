//! Reads and writes against the API server, each bounded by a timeout.

use std::{fmt::Debug, future::Future, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::NamespaceResourceScope,
    kube::{
        self,
        api::{DynamicObject, Patch, PatchParams},
        discovery::ApiResource,
        runtime::reflector::ObjectRef,
        Api, Resource,
    },
};

use crate::{
    crd::{StrimziSchemaRegistry, StrimziSchemaRegistryStatus},
    reconciler::plan::Write,
    OPERATOR_NAME,
};

#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(display("timed out after {timeout:?} trying to {verb} {object}"))]
    Timeout {
        verb: &'static str,
        object: ObjectRef<DynamicObject>,
        timeout: Duration,
    },

    #[snafu(display("failed to {verb} {object}"))]
    Kube {
        source: kube::Error,
        verb: &'static str,
        object: ObjectRef<DynamicObject>,
    },
}

impl ApiError {
    pub fn object(&self) -> &ObjectRef<DynamicObject> {
        match self {
            ApiError::Timeout { object, .. } | ApiError::Kube { object, .. } => object,
        }
    }

    /// Whether the API server rejected the object itself, which retrying cannot fix.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            ApiError::Kube {
                source: kube::Error::Api(response),
                ..
            } if response.code == 400 || response.code == 422
        )
    }
}

/// Access to the objects in the namespace of one registry.
pub struct Cluster {
    client: kube::Client,
    namespace: String,
    timeout: Duration,
}

impl Cluster {
    pub fn new(client: kube::Client, namespace: &str, timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            timeout,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn call<T>(
        &self,
        verb: &'static str,
        object: ObjectRef<DynamicObject>,
        fut: impl Future<Output = kube::Result<T>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.context(KubeSnafu { verb, object }),
            Err(_) => TimeoutSnafu {
                verb,
                object,
                timeout: self.timeout,
            }
            .fail(),
        }
    }

    pub async fn get_opt<K>(&self, name: &str) -> Result<Option<K>, ApiError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let object = ObjectRef::<K>::new(name).within(&self.namespace).erase();
        self.call("get", object, self.api::<K>().get_opt(name))
            .await
    }

    /// Reads an object without a compiled-in schema, such as a `Kafka` whose API version
    /// depends on the installed Strimzi release.
    pub async fn get_dynamic(
        &self,
        resource: &ApiResource,
        name: &str,
    ) -> Result<Option<DynamicObject>, ApiError> {
        let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), &self.namespace, resource);
        let object = ObjectRef::new_with(name, resource.clone())
            .within(&self.namespace)
            .erase();
        self.call("get", object, api.get_opt(name)).await
    }

    async fn apply_object<K>(&self, obj: &K) -> Result<(), ApiError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        let object = ObjectRef::from_obj(obj).erase();
        let params = PatchParams::apply(OPERATOR_NAME).force();
        self.call(
            "apply",
            object,
            self.api::<K>().patch(&name, &params, &Patch::Apply(obj)),
        )
        .await
        .map(|_| ())
    }

    /// Server-side applies one planned write.
    pub async fn apply(&self, write: &Write) -> Result<(), ApiError> {
        match write {
            Write::Secret(secret) => self.apply_object(secret).await,
            Write::Deployment(deployment) => self.apply_object(deployment).await,
            Write::Service(service) => self.apply_object(service).await,
        }
    }

    /// Replaces the status of the registry `name`, conditioned on `resource_version`.
    ///
    /// Returns the resource version after the update, which the next status write of the same
    /// pass has to be conditioned on.
    pub async fn patch_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &StrimziSchemaRegistryStatus,
    ) -> Result<Option<String>, ApiError> {
        let object = ObjectRef::<StrimziSchemaRegistry>::new(name)
            .within(&self.namespace)
            .erase();
        let mut patch = serde_json::json!({ "status": status });
        if let Some(resource_version) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": resource_version });
        }
        let updated = self
            .call(
                "update status of",
                object,
                self.api::<StrimziSchemaRegistry>().patch_status(
                    name,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                ),
            )
            .await?;
        Ok(updated.metadata.resource_version)
    }
}
