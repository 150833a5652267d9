//! CRDs owned by [cert-manager](https://cert-manager.io/), see [their API docs](https://cert-manager.io/docs/reference/api-docs/).

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{ByteString, apimachinery::pkg::apis::meta::v1::Time, chrono::Utc},
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_APPROVED: &str = "Approved";
pub const CONDITION_DENIED: &str = "Denied";

pub const REASON_PENDING: &str = "Pending";
pub const REASON_ISSUED: &str = "Issued";
pub const REASON_DENIED: &str = "Denied";
pub const REASON_FAILED: &str = "Failed";

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequest>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    namespaced,
    status = "CertificateRequestStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    pub issuer_ref: ObjectReference,
    /// PEM-encoded x509 certificate signing request.
    pub request: ByteString,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.ObjectReference>.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    pub kind: Option<String>,
    pub group: Option<String>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequestStatus>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CertificateRequestCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<Time>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequestCondition>.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.ConditionStatus>.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, strum::Display,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl CertificateRequest {
    pub fn condition(&self, type_: &str) -> Option<&CertificateRequestCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|cond| cond.type_ == type_)
    }

    /// Whether the condition `type_` has `status`, and `reason` (if given).
    pub fn has_condition(
        &self,
        type_: &str,
        status: ConditionStatus,
        reason: Option<&str>,
    ) -> bool {
        self.condition(type_).is_some_and(|cond| {
            cond.status == status
                && reason.map_or(true, |reason| cond.reason.as_deref() == Some(reason))
        })
    }

    pub fn is_approved(&self) -> bool {
        self.has_condition(CONDITION_APPROVED, ConditionStatus::True, None)
    }

    pub fn is_denied(&self) -> bool {
        self.has_condition(CONDITION_DENIED, ConditionStatus::True, None)
    }

    /// Sets the condition `type_`, replacing any existing condition of the same type.
    ///
    /// The transition time is only bumped when `status` changes.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        let observed_generation = self.metadata.generation;
        let conditions = &mut self
            .status
            .get_or_insert_with(Default::default)
            .conditions;
        let mut condition = CertificateRequestCondition {
            type_: type_.to_string(),
            status,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Some(Time(Utc::now())),
            observed_generation,
        };
        match conditions.iter_mut().find(|cond| cond.type_ == type_) {
            Some(existing) => {
                if existing.status == status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = condition;
            }
            None => conditions.push(condition),
        }
    }
}
