use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc},
    kube::{CustomResource, api::DynamicObject, runtime::reflector::ObjectRef},
    schemars::{self, JsonSchema},
};

use crate::external_crd::cert_manager::ConditionStatus;

/// API group of the issuer CRDs, `CertificateRequest`s referring to any other group belong to someone else.
pub const GROUP: &str = "pki.stackable.tech";

/// A namespaced issuer, usable by `CertificateRequest`s in the same namespace.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "pki.stackable.tech",
    version = "v1alpha1",
    kind = "Issuer",
    namespaced,
    status = "IssuerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    /// Base URL of the PKI, for example `https://pki.example.com`.
    pub url: String,
    /// The PKI profile that certificates are enrolled under.
    pub profile: String,
    /// Name of the Secret containing the `username` and `password` used to authenticate against the PKI.
    pub auth_secret_name: String,
}

/// A cluster-wide issuer.
///
/// Not supported yet, `CertificateRequest`s referring to it are failed.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "pki.stackable.tech",
    version = "v1alpha1",
    kind = "ClusterIssuer",
    status = "IssuerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIssuerSpec {
    #[serde(flatten)]
    pub issuer: IssuerSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStatus {
    #[serde(default)]
    pub conditions: Vec<IssuerCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerCondition {
    #[serde(rename = "type")]
    pub type_: IssuerConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum IssuerConditionType {
    Ready,
}

impl IssuerStatus {
    pub fn ready_condition(&self) -> Option<&IssuerCondition> {
        self.conditions
            .iter()
            .find(|cond| cond.type_ == IssuerConditionType::Ready)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|cond| cond.status == ConditionStatus::True)
    }

    pub fn set_ready_condition(
        &mut self,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        let mut condition = IssuerCondition {
            type_: IssuerConditionType::Ready,
            status,
            last_transition_time: Some(Time(Utc::now())),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        };
        match self
            .conditions
            .iter_mut()
            .find(|cond| cond.type_ == IssuerConditionType::Ready)
        {
            Some(existing) => {
                if existing.status == status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}

/// The issuer kinds that a `CertificateRequest`'s `issuerRef.kind` may name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum IssuerKind {
    Issuer,
    ClusterIssuer,
}

impl IssuerKind {
    /// Parses an `issuerRef.kind`, a missing or empty kind is not recognised.
    pub fn from_ref(kind: Option<&str>) -> Result<Self, strum::ParseError> {
        Self::from_str(kind.unwrap_or_default())
    }

    pub fn is_supported(self) -> bool {
        match self {
            IssuerKind::Issuer => true,
            IssuerKind::ClusterIssuer => false,
        }
    }
}

/// Any issuer variant, see [`IssuerKind`].
#[derive(Clone, Debug)]
pub enum AnyIssuer {
    Namespaced(Issuer),
    Cluster(ClusterIssuer),
}

impl AnyIssuer {
    pub fn kind(&self) -> IssuerKind {
        match self {
            AnyIssuer::Namespaced(_) => IssuerKind::Issuer,
            AnyIssuer::Cluster(_) => IssuerKind::ClusterIssuer,
        }
    }

    pub fn spec(&self) -> &IssuerSpec {
        match self {
            AnyIssuer::Namespaced(issuer) => &issuer.spec,
            AnyIssuer::Cluster(issuer) => &issuer.spec.issuer,
        }
    }

    pub fn status(&self) -> Option<&IssuerStatus> {
        match self {
            AnyIssuer::Namespaced(issuer) => issuer.status.as_ref(),
            AnyIssuer::Cluster(issuer) => issuer.status.as_ref(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status().is_some_and(IssuerStatus::is_ready)
    }

    /// The namespace that the issuer's credentials Secret lives in.
    ///
    /// Returns [`None`] for variants that don't have one (yet).
    pub fn secret_namespace(&self) -> Option<&str> {
        match self {
            AnyIssuer::Namespaced(issuer) => issuer.metadata.namespace.as_deref(),
            AnyIssuer::Cluster(_) => None,
        }
    }

    pub fn object_ref(&self) -> ObjectRef<DynamicObject> {
        match self {
            AnyIssuer::Namespaced(issuer) => ObjectRef::from_obj(issuer).erase(),
            AnyIssuer::Cluster(issuer) => ObjectRef::from_obj(issuer).erase(),
        }
    }
}
