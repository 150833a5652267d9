//! Drives cert-manager `CertificateRequest`s that refer to our issuers through the PKI
//!
//! A request is submitted to the PKI once, the returned request id is recorded in the
//! [`REQUEST_ID_ANNOTATION`], and the PKI is then polled until it has signed the certificate.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::{ByteString, apimachinery::pkg::apis::meta::v1::Time, chrono::Utc},
    kube::{
        ResourceExt,
        api::DynamicObject,
        core::{DeserializeGuard, error_boundary},
        runtime::{
            Controller,
            controller::{self, Action},
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher,
        },
    },
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
};
use stackable_pki_client::{PkiConnector, PkiSession};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    OPERATOR_NAME,
    crd::{GROUP, IssuerKind},
    external_crd::cert_manager::{
        CONDITION_APPROVED, CONDITION_READY, CertificateRequest, ConditionStatus, REASON_DENIED,
        REASON_FAILED, REASON_ISSUED, REASON_PENDING,
    },
    issuer,
    status::{self, PersistFailure},
    store::{self, ObjectStore},
    utils::error_full_message,
};

/// Id of the PKI request that a `CertificateRequest` was submitted as.
pub const REQUEST_ID_ANNOTATION: &str = concatcp!(GROUP, "/request-id");

/// How often pending PKI requests are polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

const CONTROLLER_NAME: &str = "certificaterequest";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    connector: Arc<dyn PkiConnector>,
    config: controller::Config,
) {
    let event_recorder = Arc::new(Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: FULL_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    Controller::new(
        watch_namespace.get_api::<DeserializeGuard<CertificateRequest>>(client),
        watcher::Config::default(),
    )
    .with_config(config)
    .run(
        reconcile,
        error_policy,
        Arc::new(Ctx {
            client: client.clone(),
            connector,
        }),
    )
    .for_each_concurrent(16, move |res| {
        let event_recorder = event_recorder.clone();
        async move {
            report_controller_reconciled(&event_recorder, FULL_CONTROLLER_NAME, &res).await
        }
    })
    .await;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("CertificateRequest object is invalid"))]
    InvalidCertificateRequest {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("{request} has no namespace"))]
    NoCertificateRequestNamespace {
        request: ObjectRef<CertificateRequest>,
    },

    #[snafu(display("failed to get {request}"))]
    GetCertificateRequest {
        source: store::Error,
        request: ObjectRef<CertificateRequest>,
    },

    #[snafu(display("failed to resolve issuer"))]
    ResolveIssuer { source: issuer::Error },

    #[snafu(display("failed to connect to the PKI"))]
    OpenSession { source: issuer::Error },

    #[snafu(display("failed to submit enrollment to the PKI"))]
    SubmitEnrollment {
        source: stackable_pki_client::Error,
    },

    #[snafu(display("failed to record PKI request id {request_id:?}"))]
    PersistRequestId {
        source: store::Error,
        request_id: String,
    },

    #[snafu(display("failed to get PKI request {request_id:?}"))]
    GetExternalRequest {
        source: stackable_pki_client::Error,
        request_id: String,
    },

    #[snafu(display("PKI request {request_id:?} completed without a certificate"))]
    MissingCertificate { request_id: String },

    #[snafu(display("failed to persist status{}", after_reconcile_error(reconcile_error)))]
    PersistStatus {
        source: store::Error,
        reconcile_error: Option<Box<Error>>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

fn after_reconcile_error(reconcile_error: &Option<Box<Error>>) -> String {
    reconcile_error.as_deref().map_or_else(String::new, |err| {
        format!(" (reconciling failed with: {})", error_full_message(err))
    })
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::InvalidCertificateRequest { .. } => None,
            Error::NoCertificateRequestNamespace { .. } => None,
            Error::GetCertificateRequest { .. } => None,
            Error::ResolveIssuer { source } => source.secondary_object(),
            Error::OpenSession { source } => source.secondary_object(),
            Error::SubmitEnrollment { .. } => None,
            Error::PersistRequestId { .. } => None,
            Error::GetExternalRequest { .. } => None,
            Error::MissingCertificate { .. } => None,
            Error::PersistStatus {
                reconcile_error, ..
            } => reconcile_error.as_ref()?.secondary_object(),
        }
    }
}

impl PersistFailure for Error {
    fn persist_failed(source: store::Error, reconcile_error: Option<Self>) -> Self {
        Error::PersistStatus {
            source,
            reconcile_error: reconcile_error.map(Box::new),
        }
    }
}

struct Ctx {
    client: stackable_operator::client::Client,
    connector: Arc<dyn PkiConnector>,
}

async fn reconcile(
    request: Arc<DeserializeGuard<CertificateRequest>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    let request = request
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidCertificateRequestSnafu)?;
    reconcile_request(
        &ctx.client,
        ctx.connector.as_ref(),
        &ObjectRef::from_obj(request),
    )
    .await
}

fn error_policy(
    _obj: Arc<DeserializeGuard<CertificateRequest>>,
    _error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Reconciles the current state of the `CertificateRequest` referred to by `request_ref`.
///
/// Requests that aren't ours or that have already reached a final state are left untouched.
/// Otherwise the status is always written back, even if driving the request failed.
pub async fn reconcile_request(
    store: &dyn ObjectStore,
    connector: &dyn PkiConnector,
    request_ref: &ObjectRef<CertificateRequest>,
) -> Result<Action> {
    let namespace =
        request_ref
            .namespace
            .as_deref()
            .with_context(|| NoCertificateRequestNamespaceSnafu {
                request: request_ref.clone(),
            })?;
    let Some(mut request) = store
        .get_certificate_request(&request_ref.name, namespace)
        .await
        .with_context(|_| GetCertificateRequestSnafu {
            request: request_ref.clone(),
        })?
    else {
        tracing::debug!(request = %request_ref, "CertificateRequest not found, ignoring");
        return Ok(Action::await_change());
    };
    if let Some(reason) = ignore_reason(&request) {
        tracing::debug!(request = %request_ref, reason, "ignoring CertificateRequest");
        return Ok(Action::await_change());
    }

    let outcome = drive(store, connector, request_ref, namespace, &mut request).await;
    status::commit(store, &mut request, outcome).await
}

/// Why `request` needs no further action from us, if it doesn't.
fn ignore_reason(request: &CertificateRequest) -> Option<&'static str> {
    if request.spec.issuer_ref.group.as_deref() != Some(GROUP) {
        Some("issuer belongs to a different group")
    } else if request.has_condition(CONDITION_READY, ConditionStatus::True, None) {
        Some("already ready")
    } else if request.has_condition(
        CONDITION_READY,
        ConditionStatus::False,
        Some(REASON_FAILED),
    ) {
        Some("already failed")
    } else if request.has_condition(
        CONDITION_READY,
        ConditionStatus::False,
        Some(REASON_DENIED),
    ) {
        Some("already denied")
    } else {
        None
    }
}

async fn drive(
    store: &dyn ObjectStore,
    connector: &dyn PkiConnector,
    request_ref: &ObjectRef<CertificateRequest>,
    namespace: &str,
    request: &mut CertificateRequest,
) -> Result<Action> {
    if request.is_denied() {
        tracing::info!(request = %request_ref, "CertificateRequest was denied, marking as failed");
        request
            .status
            .get_or_insert_with(Default::default)
            .failure_time
            .get_or_insert_with(|| Time(Utc::now()));
        request.set_condition(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_DENIED,
            "The CertificateRequest was denied by an approval controller",
        );
        return Ok(Action::await_change());
    }

    let issuer_ref = request.spec.issuer_ref.clone();
    let kind = match IssuerKind::from_ref(issuer_ref.kind.as_deref()) {
        Ok(kind) => kind,
        Err(_) => {
            let message = format!(
                "issuerRef refers to unrecognised kind {:?}",
                issuer_ref.kind.as_deref().unwrap_or_default()
            );
            tracing::error!(
                request = %request_ref,
                kind = ?issuer_ref.kind,
                "unrecognised issuer kind, ignoring"
            );
            request.set_condition(
                CONDITION_READY,
                ConditionStatus::False,
                REASON_FAILED,
                message,
            );
            return Ok(Action::await_change());
        }
    };
    if !kind.is_supported() {
        let message = format!("issuerRef refers to {kind}, which is not supported yet");
        tracing::error!(request = %request_ref, %kind, "unsupported issuer kind, ignoring");
        request.set_condition(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_FAILED,
            message,
        );
        return Ok(Action::await_change());
    }

    let resolved = issuer::resolve(store, kind, &issuer_ref.name, namespace)
        .await
        .context(ResolveIssuerSnafu)?;
    let issuer_spec = resolved.issuer.spec();
    let session = issuer::open_session(connector, &issuer_spec.url, resolved.credentials)
        .context(OpenSessionSnafu)?;

    if request.is_approved() {
        tracing::debug!(request = %request_ref, "CertificateRequest is already approved");
        return Ok(Action::await_change());
    }
    match request.annotations().get(REQUEST_ID_ANNOTATION).cloned() {
        Some(request_id) => poll(session.as_ref(), request_ref, request, request_id).await,
        None => {
            submit(
                store,
                session.as_ref(),
                request_ref,
                request,
                &issuer_spec.profile,
            )
            .await
        }
    }
}

/// Submits `request` to the PKI, and records the PKI's request id.
async fn submit(
    store: &dyn ObjectStore,
    session: &dyn PkiSession,
    request_ref: &ObjectRef<CertificateRequest>,
    request: &mut CertificateRequest,
    profile: &str,
) -> Result<Action> {
    let submitted = session
        .submit_enrollment(profile, &request.spec.request.0, &[])
        .await
        .context(SubmitEnrollmentSnafu)?;
    tracing::info!(
        request = %request_ref,
        request.id = %submitted.id,
        profile,
        "submitted CertificateRequest to the PKI"
    );

    // Recorded before anything else, this is the only link to the PKI request
    request
        .annotations_mut()
        .insert(REQUEST_ID_ANNOTATION.to_string(), submitted.id.clone());
    *request = store
        .update_certificate_request_annotations(request)
        .await
        .with_context(|_| PersistRequestIdSnafu {
            request_id: submitted.id.clone(),
        })?;
    request.set_condition(
        CONDITION_READY,
        ConditionStatus::False,
        REASON_PENDING,
        "Submitted request to the PKI",
    );
    Ok(Action::requeue(POLL_INTERVAL))
}

/// Checks on the PKI request `request_id`, copying the certificate into `request` once it is signed.
async fn poll(
    session: &dyn PkiSession,
    request_ref: &ObjectRef<CertificateRequest>,
    request: &mut CertificateRequest,
    request_id: String,
) -> Result<Action> {
    let external = session
        .get_request(&request_id)
        .await
        .with_context(|_| GetExternalRequestSnafu {
            request_id: request_id.clone(),
        })?;
    if !external.is_completed() {
        tracing::debug!(
            request = %request_ref,
            request.id = %request_id,
            status = ?external.status,
            "PKI request is still in progress"
        );
        return Ok(Action::requeue(POLL_INTERVAL));
    }

    let certificate = external
        .certificate
        .context(MissingCertificateSnafu { request_id: &request_id })?;
    tracing::info!(request = %request_ref, request.id = %request_id, "PKI request was signed");
    request.set_condition(
        CONDITION_APPROVED,
        ConditionStatus::True,
        GROUP,
        "Request approved on the PKI",
    );
    request.status.get_or_insert_with(Default::default).certificate =
        Some(ByteString(certificate.into_bytes()));
    request.set_condition(CONDITION_READY, ConditionStatus::True, REASON_ISSUED, "Signed");
    Ok(Action::await_change())
}
