//! Resolves the issuer referenced by a `CertificateRequest`, its credentials, and a PKI session

use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{ByteString, api::core::v1::Secret},
    kube::{api::DynamicObject, runtime::reflector::ObjectRef},
};
use stackable_pki_client::{Credentials, PkiConnector, PkiSession};
use url::Url;

use crate::{
    crd::{AnyIssuer, ClusterIssuer, Issuer, IssuerKind},
    store::{self, ObjectStore},
};

const SECRET_KEY_USERNAME: &str = "username";
const SECRET_KEY_PASSWORD: &str = "password";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {issuer}"))]
    GetIssuer {
        source: store::Error,
        issuer: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{issuer} does not exist"))]
    IssuerNotFound { issuer: ObjectRef<DynamicObject> },

    #[snafu(display("{issuer} is not ready"))]
    IssuerNotReady { issuer: ObjectRef<DynamicObject> },

    #[snafu(display("{issuer} is a {kind}, which is not supported yet"))]
    UnsupportedVariant {
        issuer: ObjectRef<DynamicObject>,
        kind: IssuerKind,
    },

    #[snafu(display("failed to get credentials {secret}"))]
    GetCredentialSecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("credentials {secret} does not exist"))]
    CredentialSecretNotFound { secret: ObjectRef<Secret> },

    #[snafu(display("credentials {secret} has no valid UTF-8 {key:?} entry"))]
    MissingCredential {
        secret: ObjectRef<Secret>,
        key: &'static str,
    },

    #[snafu(display("invalid PKI endpoint URL {url:?}"))]
    InvalidEndpoint {
        source: url::ParseError,
        url: String,
    },

    #[snafu(display("failed to open PKI session for {endpoint}"))]
    Connect {
        source: stackable_pki_client::Error,
        endpoint: Url,
    },
}

impl Error {
    pub fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetIssuer { issuer, .. }
            | Error::IssuerNotFound { issuer }
            | Error::IssuerNotReady { issuer }
            | Error::UnsupportedVariant { issuer, .. } => Some(issuer.clone()),
            Error::GetCredentialSecret { secret, .. }
            | Error::CredentialSecretNotFound { secret }
            | Error::MissingCredential { secret, .. } => Some(secret.clone().erase()),
            Error::InvalidEndpoint { .. } | Error::Connect { .. } => None,
        }
    }
}

/// A ready issuer, along with the credentials for its PKI.
#[derive(Debug)]
pub struct ResolvedIssuer {
    pub issuer: AnyIssuer,
    pub credentials: Credentials,
}

/// Fetches the issuer of `kind` called `name`, as seen from a `CertificateRequest` in `namespace`.
pub async fn get(
    store: &dyn ObjectStore,
    kind: IssuerKind,
    name: &str,
    namespace: &str,
) -> Result<AnyIssuer, Error> {
    match kind {
        IssuerKind::Issuer => {
            let issuer_ref = ObjectRef::<Issuer>::new(name).within(namespace).erase();
            store
                .get_issuer(name, namespace)
                .await
                .with_context(|_| GetIssuerSnafu {
                    issuer: issuer_ref.clone(),
                })?
                .map(AnyIssuer::Namespaced)
                .context(IssuerNotFoundSnafu { issuer: issuer_ref })
        }
        IssuerKind::ClusterIssuer => {
            let issuer_ref = ObjectRef::<ClusterIssuer>::new(name).erase();
            store
                .get_cluster_issuer(name)
                .await
                .with_context(|_| GetIssuerSnafu {
                    issuer: issuer_ref.clone(),
                })?
                .map(AnyIssuer::Cluster)
                .context(IssuerNotFoundSnafu { issuer: issuer_ref })
        }
    }
}

/// Fetches the issuer and its credentials, failing unless the issuer is ready.
pub async fn resolve(
    store: &dyn ObjectStore,
    kind: IssuerKind,
    name: &str,
    namespace: &str,
) -> Result<ResolvedIssuer, Error> {
    let issuer = get(store, kind, name, namespace).await?;
    if !issuer.is_ready() {
        return IssuerNotReadySnafu {
            issuer: issuer.object_ref(),
        }
        .fail();
    }
    let credentials = credentials(store, &issuer).await?;
    Ok(ResolvedIssuer {
        issuer,
        credentials,
    })
}

/// Reads the PKI credentials from the issuer's auth Secret.
pub async fn credentials(
    store: &dyn ObjectStore,
    issuer: &AnyIssuer,
) -> Result<Credentials, Error> {
    let namespace = issuer
        .secret_namespace()
        .with_context(|| UnsupportedVariantSnafu {
            issuer: issuer.object_ref(),
            kind: issuer.kind(),
        })?;
    let secret_name = &issuer.spec().auth_secret_name;
    let secret_ref = ObjectRef::<Secret>::new(secret_name).within(namespace);
    let secret = store
        .get_secret(secret_name, namespace)
        .await
        .with_context(|_| GetCredentialSecretSnafu {
            secret: secret_ref.clone(),
        })?
        .with_context(|| CredentialSecretNotFoundSnafu {
            secret: secret_ref.clone(),
        })?;
    let mut data = secret.data.unwrap_or_default();
    let mut take = |key: &'static str| {
        data.remove(key)
            .and_then(|ByteString(value)| String::from_utf8(value).ok())
            .with_context(|| MissingCredentialSnafu {
                secret: secret_ref.clone(),
                key,
            })
    };
    Ok(Credentials {
        username: take(SECRET_KEY_USERNAME)?,
        password: take(SECRET_KEY_PASSWORD)?,
    })
}

/// Opens a session to the PKI at `url`.
pub fn open_session(
    connector: &dyn PkiConnector,
    url: &str,
    credentials: Credentials,
) -> Result<Arc<dyn PkiSession>, Error> {
    let endpoint = Url::parse(url).context(InvalidEndpointSnafu { url })?;
    connector
        .connect(endpoint.clone(), credentials)
        .context(ConnectSnafu { endpoint })
}
