//! In-memory stand-ins for the object store and the PKI, along with fixtures

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::{
        ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube::{Resource, ResourceExt, api::DynamicObject, runtime::reflector::ObjectRef},
};
use stackable_pki_client::{
    Credentials, Error as PkiError, ExternalRequest, Label, PkiConnector, PkiSession,
    RequestStatus,
};
use url::Url;

use crate::{
    crd::{ClusterIssuer, ClusterIssuerSpec, GROUP, Issuer, IssuerSpec, IssuerStatus},
    external_crd::cert_manager::{
        CertificateRequest, CertificateRequestSpec, ConditionStatus, ObjectReference,
    },
    status::ISSUER_READY_REASON,
    store::{self, ObjectStore},
};

type Key = (String, String);

fn key(name: &str, namespace: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct StoreState {
    requests: BTreeMap<Key, CertificateRequest>,
    issuers: BTreeMap<Key, Issuer>,
    cluster_issuers: BTreeMap<String, ClusterIssuer>,
    secrets: BTreeMap<Key, Secret>,
    annotation_writes: usize,
    status_writes: usize,
    reject_status_writes: bool,
    update_after_next_get: bool,
    next_resource_version: u64,
}

impl StoreState {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_resource_version += 1;
        meta.resource_version = Some(self.next_resource_version.to_string());
    }
}

/// An [`ObjectStore`] that checks `resourceVersion`s like the API server does.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn insert_request(&self, mut request: CertificateRequest) {
        let mut state = self.state();
        state.bump(&mut request.metadata);
        let key = key(&request.name_any(), &request.namespace().unwrap());
        state.requests.insert(key, request);
    }

    pub fn insert_issuer(&self, mut issuer: Issuer) {
        let mut state = self.state();
        state.bump(&mut issuer.metadata);
        let key = key(&issuer.name_any(), &issuer.namespace().unwrap());
        state.issuers.insert(key, issuer);
    }

    pub fn insert_cluster_issuer(&self, mut issuer: ClusterIssuer) {
        let mut state = self.state();
        state.bump(&mut issuer.metadata);
        state.cluster_issuers.insert(issuer.name_any(), issuer);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let key = key(&secret.name_any(), &secret.namespace().unwrap());
        self.state().secrets.insert(key, secret);
    }

    pub fn request(&self, name: &str, namespace: &str) -> CertificateRequest {
        self.state().requests[&key(name, namespace)].clone()
    }

    pub fn issuer(&self, name: &str, namespace: &str) -> Issuer {
        self.state().issuers[&key(name, namespace)].clone()
    }

    pub fn annotation_writes(&self) -> usize {
        self.state().annotation_writes
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    /// Makes all following status writes fail as if someone else modified the object first.
    pub fn reject_status_writes(&self) {
        self.state().reject_status_writes = true;
    }

    /// Bumps the stored `resourceVersion` of the next `CertificateRequest` that is read,
    /// leaving the reader with a stale copy.
    pub fn update_after_next_get(&self) {
        self.state().update_after_next_get = true;
    }
}

fn conflict<K: Resource<DynamicType = ()>>(obj: &K) -> store::Error {
    store::Error::Conflict {
        object: ObjectRef::from_obj(obj).erase(),
    }
}

fn check_version(
    stored: &ObjectMeta,
    written: &ObjectMeta,
    object: ObjectRef<DynamicObject>,
) -> Result<(), store::Error> {
    if stored.resource_version == written.resource_version {
        Ok(())
    } else {
        Err(store::Error::Conflict { object })
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_certificate_request(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<CertificateRequest>, store::Error> {
        let mut state = self.state();
        let key = key(name, namespace);
        let found = state.requests.get(&key).cloned();
        if found.is_some() && std::mem::take(&mut state.update_after_next_get) {
            let mut stored = state.requests.remove(&key).unwrap();
            state.bump(&mut stored.metadata);
            state.requests.insert(key, stored);
        }
        Ok(found)
    }

    async fn update_certificate_request_annotations(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, store::Error> {
        let mut state = self.state();
        let key = key(&request.name_any(), &request.namespace().unwrap());
        let mut stored = state
            .requests
            .get(&key)
            .cloned()
            .ok_or_else(|| conflict(request))?;
        check_version(
            &stored.metadata,
            &request.metadata,
            ObjectRef::from_obj(request).erase(),
        )?;
        stored
            .annotations_mut()
            .extend(request.annotations().clone());
        state.bump(&mut stored.metadata);
        state.annotation_writes += 1;
        state.requests.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_certificate_request_status(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, store::Error> {
        let mut state = self.state();
        if state.reject_status_writes {
            return Err(conflict(request));
        }
        let key = key(&request.name_any(), &request.namespace().unwrap());
        let mut stored = state
            .requests
            .get(&key)
            .cloned()
            .ok_or_else(|| conflict(request))?;
        check_version(
            &stored.metadata,
            &request.metadata,
            ObjectRef::from_obj(request).erase(),
        )?;
        stored.status = request.status.clone();
        state.bump(&mut stored.metadata);
        state.status_writes += 1;
        state.requests.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_issuer(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Issuer>, store::Error> {
        Ok(self.state().issuers.get(&key(name, namespace)).cloned())
    }

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<ClusterIssuer>, store::Error> {
        Ok(self.state().cluster_issuers.get(name).cloned())
    }

    async fn update_issuer_status(&self, issuer: &Issuer) -> Result<Issuer, store::Error> {
        let mut state = self.state();
        if state.reject_status_writes {
            return Err(conflict(issuer));
        }
        let key = key(&issuer.name_any(), &issuer.namespace().unwrap());
        let mut stored = state
            .issuers
            .get(&key)
            .cloned()
            .ok_or_else(|| conflict(issuer))?;
        check_version(
            &stored.metadata,
            &issuer.metadata,
            ObjectRef::from_obj(issuer).erase(),
        )?;
        stored.status = issuer.status.clone();
        state.bump(&mut stored.metadata);
        state.status_writes += 1;
        state.issuers.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Secret>, store::Error> {
        Ok(self.state().secrets.get(&key(name, namespace)).cloned())
    }
}

#[derive(Default)]
struct PkiState {
    endpoints: Vec<Url>,
    submissions: Vec<Submission>,
    lookups: Vec<String>,
    requests: BTreeMap<String, ExternalRequest>,
    next_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub profile: String,
    pub csr: Vec<u8>,
    pub labels: Vec<Label>,
}

/// A PKI that keeps every request pending until told otherwise.
#[derive(Clone, Default)]
pub struct FakePki {
    state: Arc<Mutex<PkiState>>,
}

impl FakePki {
    fn state(&self) -> MutexGuard<'_, PkiState> {
        self.state.lock().unwrap()
    }

    /// Sets the id assigned to the next submission.
    pub fn set_next_id(&self, id: &str) {
        self.state().next_id = Some(id.to_string());
    }

    pub fn complete(&self, id: &str, certificate: &str) {
        let mut state = self.state();
        let request = state.requests.get_mut(id).unwrap();
        request.status = RequestStatus::Completed;
        request.certificate = Some(certificate.to_string());
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.state().lookups.clone()
    }

    pub fn connected_endpoints(&self) -> Vec<Url> {
        self.state().endpoints.clone()
    }
}

impl PkiConnector for FakePki {
    fn connect(
        &self,
        endpoint: Url,
        _credentials: Credentials,
    ) -> Result<Arc<dyn PkiSession>, PkiError> {
        self.state().endpoints.push(endpoint);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl PkiSession for FakePki {
    async fn submit_enrollment(
        &self,
        profile: &str,
        csr: &[u8],
        labels: &[Label],
    ) -> Result<ExternalRequest, PkiError> {
        let mut state = self.state();
        state.submissions.push(Submission {
            profile: profile.to_string(),
            csr: csr.to_vec(),
            labels: labels.to_vec(),
        });
        let id = state
            .next_id
            .take()
            .unwrap_or_else(|| format!("req-{}", state.submissions.len()));
        let request = ExternalRequest {
            id: id.clone(),
            status: RequestStatus::Pending,
            certificate: None,
        };
        state.requests.insert(id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: &str) -> Result<ExternalRequest, PkiError> {
        let mut state = self.state();
        state.lookups.push(id.to_string());
        state
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| PkiError::Rejected {
                url: Url::parse("https://pki.example/api/v1/requests/")
                    .unwrap()
                    .join(id)
                    .unwrap(),
                status: 404,
                body: "request not found".to_string(),
            })
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        username: "enroller".to_string(),
        password: "hunter2".to_string(),
    }
}

fn issuer_spec() -> IssuerSpec {
    IssuerSpec {
        url: "https://pki.example".to_string(),
        profile: "webserver".to_string(),
        auth_secret_name: "cred".to_string(),
    }
}

fn ready_status() -> IssuerStatus {
    let mut status = IssuerStatus::default();
    status.set_ready_condition(ConditionStatus::True, ISSUER_READY_REASON, "Success");
    status
}

pub fn ready_issuer(name: &str, namespace: &str) -> Issuer {
    let mut issuer = Issuer::new(name, issuer_spec());
    issuer.metadata.namespace = Some(namespace.to_string());
    issuer.status = Some(ready_status());
    issuer
}

pub fn ready_cluster_issuer(name: &str) -> ClusterIssuer {
    let mut issuer = ClusterIssuer::new(
        name,
        ClusterIssuerSpec {
            issuer: issuer_spec(),
        },
    );
    issuer.status = Some(ready_status());
    issuer
}

pub fn credentials_secret(name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(
            [
                ("username".to_string(), ByteString(b"enroller".to_vec())),
                ("password".to_string(), ByteString(b"hunter2".to_vec())),
            ]
            .into(),
        ),
        ..Secret::default()
    }
}

/// A fresh `CertificateRequest` for the [`Issuer`] `iss1`.
pub fn certificate_request(name: &str, namespace: &str) -> CertificateRequest {
    let mut request = CertificateRequest::new(
        name,
        CertificateRequestSpec {
            issuer_ref: ObjectReference {
                name: "iss1".to_string(),
                kind: Some("Issuer".to_string()),
                group: Some(GROUP.to_string()),
            },
            request: ByteString(b"-----BEGIN CERTIFICATE REQUEST-----".to_vec()),
        },
    );
    request.metadata.namespace = Some(namespace.to_string());
    request
}
