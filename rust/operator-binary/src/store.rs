//! Access to the Kubernetes objects that the controllers read and write

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{NamespaceResourceScope, api::core::v1::Secret},
    kube::{
        Api, Resource, ResourceExt,
        api::{DynamicObject, Patch, PatchParams, PostParams},
        runtime::reflector::ObjectRef,
    },
};

use crate::{
    crd::{ClusterIssuer, Issuer},
    external_crd::cert_manager::CertificateRequest,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {object}"))]
    Get {
        source: stackable_operator::client::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{object} has no namespace"))]
    NoNamespace { object: ObjectRef<DynamicObject> },

    #[snafu(display("failed to serialize {object}"))]
    Serialize {
        source: serde_json::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: ObjectRef<DynamicObject> },

    #[snafu(display("failed to update {object}"))]
    Update {
        source: stackable_operator::kube::Error,
        object: ObjectRef<DynamicObject>,
    },
}

/// The object store operations used by the controllers.
///
/// All updates are guarded by the object's `resourceVersion`, a concurrent modification fails
/// with [`Error::Conflict`] instead of overwriting it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_certificate_request(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<CertificateRequest>, Error>;

    /// Writes the annotations of `request`, leaving spec and status untouched.
    async fn update_certificate_request_annotations(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, Error>;

    async fn update_certificate_request_status(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, Error>;

    async fn get_issuer(&self, name: &str, namespace: &str) -> Result<Option<Issuer>, Error>;

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<ClusterIssuer>, Error>;

    async fn update_issuer_status(&self, issuer: &Issuer) -> Result<Issuer, Error>;

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;
}

#[async_trait]
impl ObjectStore for stackable_operator::client::Client {
    async fn get_certificate_request(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<CertificateRequest>, Error> {
        self.get_opt::<CertificateRequest>(name, namespace)
            .await
            .with_context(|_| GetSnafu {
                object: ObjectRef::<CertificateRequest>::new(name)
                    .within(namespace)
                    .erase(),
            })
    }

    async fn update_certificate_request_annotations(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, Error> {
        let (api, object) = namespaced_api(self, request)?;
        // Merge patches only fail on resourceVersion mismatch if it is part of the patch
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": request.metadata.resource_version,
                "annotations": request.metadata.annotations,
            }
        });
        api.patch(&request.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|source| update_error(source, object))
    }

    async fn update_certificate_request_status(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, Error> {
        replace_status(self, request).await
    }

    async fn get_issuer(&self, name: &str, namespace: &str) -> Result<Option<Issuer>, Error> {
        self.get_opt::<Issuer>(name, namespace)
            .await
            .with_context(|_| GetSnafu {
                object: ObjectRef::<Issuer>::new(name).within(namespace).erase(),
            })
    }

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<ClusterIssuer>, Error> {
        self.get_opt::<ClusterIssuer>(name, &())
            .await
            .with_context(|_| GetSnafu {
                object: ObjectRef::<ClusterIssuer>::new(name).erase(),
            })
    }

    async fn update_issuer_status(&self, issuer: &Issuer) -> Result<Issuer, Error> {
        replace_status(self, issuer).await
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        self.get_opt::<Secret>(name, namespace)
            .await
            .with_context(|_| GetSnafu {
                object: ObjectRef::<Secret>::new(name).within(namespace).erase(),
            })
    }
}

fn namespaced_api<K>(
    client: &stackable_operator::client::Client,
    obj: &K,
) -> Result<(Api<K>, ObjectRef<DynamicObject>), Error>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    let object = ObjectRef::from_obj(obj).erase();
    let namespace = obj.namespace().with_context(|| NoNamespaceSnafu {
        object: object.clone(),
    })?;
    Ok((Api::namespaced(client.as_kube_client(), &namespace), object))
}

async fn replace_status<K>(
    client: &stackable_operator::client::Client,
    obj: &K,
) -> Result<K, Error>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
{
    let (api, object) = namespaced_api(client, obj)?;
    // The full object is sent, including metadata.resourceVersion
    let data = serde_json::to_vec(obj).with_context(|_| SerializeSnafu {
        object: object.clone(),
    })?;
    api.replace_status(&obj.name_any(), &PostParams::default(), data)
        .await
        .map_err(|source| update_error(source, object))
}

fn update_error(
    source: stackable_operator::kube::Error,
    object: ObjectRef<DynamicObject>,
) -> Error {
    match source {
        stackable_operator::kube::Error::Api(response) if response.code == 409 => {
            Error::Conflict { object }
        }
        source => Error::Update { source, object },
    }
}
