//! Session capability for remote PKIs that enroll certificates asynchronously.
//!
//! A PKI accepts an enrollment (a CSR submitted under a profile), answers with a request id,
//! and eventually completes the request with a signed certificate. Consumers only ever
//! submit enrollments and look requests up by id, see [`PkiSession`].

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use url::Url;

pub mod rest;

pub use rest::{RestConnector, RestSession};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to build HTTP client"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("failed to build PKI URL for {path:?}"))]
    JoinUrl {
        source: url::ParseError,
        path: String,
    },

    #[snafu(display("PKI URL {url} cannot have path segments"))]
    CannotBeABase { url: Url },

    #[snafu(display("request to {url} failed"))]
    Transport { source: reqwest::Error, url: Url },

    /// `body` is truncated.
    #[snafu(display("PKI rejected request to {url} with status {status}: {body}"))]
    Rejected { url: Url, status: u16, body: String },

    #[snafu(display("failed to decode PKI response from {url}"))]
    Decode { source: reqwest::Error, url: Url },
}

/// Credentials used to authenticate against the PKI.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A label attached to an enrollment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Label {
    pub label: String,
    pub value: String,
}

/// Progress of a request, as reported by the PKI.
///
/// Only [`RequestStatus::Completed`] is terminal, everything else is polled again later.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum RequestStatus {
    Pending,
    Completed,
    Other(String),
}

impl From<String> for RequestStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            _ => Self::Other(value),
        }
    }
}

impl From<RequestStatus> for String {
    fn from(value: RequestStatus) -> Self {
        match value {
            RequestStatus::Pending => "pending".to_string(),
            RequestStatus::Completed => "completed".to_string(),
            RequestStatus::Other(other) => other,
        }
    }
}

/// A request owned by the PKI, mirrored locally only by its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalRequest {
    pub id: String,
    pub status: RequestStatus,
    /// PEM-encoded certificate, set once the request has completed.
    pub certificate: Option<String>,
}

impl ExternalRequest {
    pub fn is_completed(&self) -> bool {
        self.status == RequestStatus::Completed
    }
}

/// An authenticated handle to a PKI.
#[async_trait]
pub trait PkiSession: Send + Sync {
    /// Submits `csr` for enrollment under `profile`.
    async fn submit_enrollment(
        &self,
        profile: &str,
        csr: &[u8],
        labels: &[Label],
    ) -> Result<ExternalRequest, Error>;

    /// Looks up a previously submitted request.
    async fn get_request(&self, id: &str) -> Result<ExternalRequest, Error>;
}

/// Produces [`PkiSession`]s bound to a PKI endpoint.
pub trait PkiConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: Url,
        credentials: Credentials,
    ) -> Result<Arc<dyn PkiSession>, Error>;
}
