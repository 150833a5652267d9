//! Periodically checks that [`Issuer`]s can reach their PKI, and reports it in their Ready condition

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    kube::{
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
use stackable_pki_client::PkiConnector;
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    OPERATOR_NAME,
    crd::{AnyIssuer, Issuer},
    external_crd::cert_manager::ConditionStatus,
    issuer,
    status::{self, ISSUER_READY_REASON, PersistFailure},
    store::{self, ObjectStore},
};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

const CONTROLLER_NAME: &str = "issuer";
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
        watch_namespace.get_api::<DeserializeGuard<Issuer>>(client),
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
    #[snafu(display("Issuer object is invalid"))]
    InvalidIssuer {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("{issuer} has no namespace"))]
    NoIssuerNamespace { issuer: ObjectRef<Issuer> },

    #[snafu(display("failed to get {issuer}"))]
    GetIssuer {
        source: store::Error,
        issuer: ObjectRef<Issuer>,
    },

    #[snafu(display("failed to read credentials"))]
    Credentials { source: issuer::Error },

    #[snafu(display("health check failed"))]
    HealthCheck { source: issuer::Error },

    #[snafu(display("failed to persist status"))]
    PersistStatus {
        source: store::Error,
        reconcile_error: Option<Box<Error>>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::InvalidIssuer { .. } => None,
            Error::NoIssuerNamespace { .. } => None,
            Error::GetIssuer { .. } => None,
            Error::Credentials { source } => source.secondary_object(),
            Error::HealthCheck { source } => source.secondary_object(),
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

async fn reconcile(issuer: Arc<DeserializeGuard<Issuer>>, ctx: Arc<Ctx>) -> Result<Action> {
    let issuer = issuer
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidIssuerSnafu)?;
    reconcile_issuer(
        &ctx.client,
        ctx.connector.as_ref(),
        &ObjectRef::from_obj(issuer),
    )
    .await
}

fn error_policy(_obj: Arc<DeserializeGuard<Issuer>>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

pub async fn reconcile_issuer(
    store: &dyn ObjectStore,
    connector: &dyn PkiConnector,
    issuer_ref: &ObjectRef<Issuer>,
) -> Result<Action> {
    let namespace = issuer_ref
        .namespace
        .as_deref()
        .with_context(|| NoIssuerNamespaceSnafu {
            issuer: issuer_ref.clone(),
        })?;
    let Some(mut issuer) = store
        .get_issuer(&issuer_ref.name, namespace)
        .await
        .with_context(|_| GetIssuerSnafu {
            issuer: issuer_ref.clone(),
        })?
    else {
        tracing::debug!(issuer = %issuer_ref, "Issuer not found, ignoring");
        return Ok(Action::await_change());
    };

    let outcome = check(store, connector, issuer_ref, &mut issuer).await;
    status::commit(store, &mut issuer, outcome).await
}

async fn check(
    store: &dyn ObjectStore,
    connector: &dyn PkiConnector,
    issuer_ref: &ObjectRef<Issuer>,
    issuer: &mut Issuer,
) -> Result<Action> {
    let status = issuer.status.get_or_insert_with(Default::default);
    if status.ready_condition().is_none() {
        tracing::info!(issuer = %issuer_ref, "new Issuer, marking as first seen");
        status.set_ready_condition(ConditionStatus::Unknown, ISSUER_READY_REASON, "First seen");
        return Ok(Action::await_change());
    }

    let any_issuer = AnyIssuer::Namespaced(issuer.clone());
    let credentials = issuer::credentials(store, &any_issuer)
        .await
        .context(CredentialsSnafu)?;
    issuer::open_session(connector, &issuer.spec.url, credentials).context(HealthCheckSnafu)?;

    tracing::debug!(issuer = %issuer_ref, "Issuer is healthy");
    issuer
        .status
        .get_or_insert_with(Default::default)
        .set_ready_condition(ConditionStatus::True, ISSUER_READY_REASON, "Success");
    Ok(Action::requeue(HEALTH_CHECK_INTERVAL))
}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::runtime::{controller::Action, reflector::ObjectRef};

    use super::{Error, HEALTH_CHECK_INTERVAL, reconcile_issuer};
    use crate::{
        crd::{Issuer, IssuerStatus},
        external_crd::cert_manager::ConditionStatus,
        fake::{self, FakePki, FakeStore},
        issuer,
    };

    fn iss1() -> ObjectRef<Issuer> {
        ObjectRef::new("iss1").within("default")
    }

    fn new_issuer() -> Issuer {
        let mut issuer = fake::ready_issuer("iss1", "default");
        issuer.status = None;
        issuer
    }

    fn ready(status: &IssuerStatus) -> (ConditionStatus, String) {
        let cond = status.ready_condition().unwrap();
        (cond.status, cond.message.clone().unwrap_or_default())
    }

    #[tokio::test]
    async fn first_seen_then_healthy() {
        let store = FakeStore::default();
        store.insert_issuer(new_issuer());
        store.insert_secret(fake::credentials_secret("cred", "default"));
        let pki = FakePki::default();

        let action = reconcile_issuer(&store, &pki, &iss1()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(
            ready(&store.issuer("iss1", "default").status.unwrap()),
            (ConditionStatus::Unknown, "First seen".to_string())
        );
        assert!(pki.connected_endpoints().is_empty());

        let action = reconcile_issuer(&store, &pki, &iss1()).await.unwrap();
        assert_eq!(action, Action::requeue(HEALTH_CHECK_INTERVAL));
        assert_eq!(
            ready(&store.issuer("iss1", "default").status.unwrap()),
            (ConditionStatus::True, "Success".to_string())
        );
        assert_eq!(pki.connected_endpoints().len(), 1);
        assert_eq!(store.status_writes(), 2);
    }

    #[tokio::test]
    async fn missing_secret_marks_not_ready() {
        let store = FakeStore::default();
        store.insert_issuer(fake::ready_issuer("iss1", "default"));

        let err = reconcile_issuer(&store, &FakePki::default(), &iss1())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Credentials {
                    source: issuer::Error::CredentialSecretNotFound { .. }
                }
            ),
            "{err:?}"
        );
        let status = store.issuer("iss1", "default").status.unwrap();
        assert!(!status.is_ready());
        let (cond_status, message) = ready(&status);
        assert_eq!(cond_status, ConditionStatus::False);
        assert!(message.starts_with("failed to read credentials"), "{message}");
    }

    #[tokio::test]
    async fn invalid_url_marks_not_ready() {
        let store = FakeStore::default();
        let mut issuer = fake::ready_issuer("iss1", "default");
        issuer.spec.url = "not a url".to_string();
        store.insert_issuer(issuer);
        store.insert_secret(fake::credentials_secret("cred", "default"));

        let err = reconcile_issuer(&store, &FakePki::default(), &iss1())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HealthCheck { .. }), "{err:?}");
        assert!(!store.issuer("iss1", "default").status.unwrap().is_ready());
    }

    #[tokio::test]
    async fn missing_issuer_is_ignored() {
        let store = FakeStore::default();
        let action = reconcile_issuer(&store, &FakePki::default(), &iss1())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(store.status_writes(), 0);
    }
}
