//! [`PkiSession`] over the PKI's JSON REST API

use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use url::Url;

use crate::{
    BuildClientSnafu, CannotBeABaseSnafu, Credentials, DecodeSnafu, Error, ExternalRequest,
    JoinUrlSnafu, Label, PkiConnector, PkiSession, RejectedSnafu, RequestStatus, TransportSnafu,
};

const SUBMIT_PATH: &str = "api/v1/requests/submit";
const REQUESTS_PATH: &str = "api/v1/requests";

/// Longest response body that is kept in [`Error::Rejected`].
const MAX_REJECTED_BODY_CHARS: usize = 256;

const HEADER_API_ID: &str = "x-api-id";
const HEADER_API_KEY: &str = "x-api-key";

/// Connects to PKIs over HTTP(S).
///
/// All sessions share the connector's connection pool.
#[derive(Debug, Clone)]
pub struct RestConnector {
    http: reqwest::Client,
}

impl RestConnector {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            http: reqwest::Client::builder()
                .build()
                .context(BuildClientSnafu)?,
        })
    }
}

impl PkiConnector for RestConnector {
    fn connect(
        &self,
        endpoint: Url,
        credentials: Credentials,
    ) -> Result<Arc<dyn PkiSession>, Error> {
        Ok(Arc::new(RestSession::new(
            self.http.clone(),
            endpoint,
            credentials,
        )))
    }
}

#[derive(Debug)]
pub struct RestSession {
    http: reqwest::Client,
    base: Url,
    credentials: Credentials,
}

impl RestSession {
    pub fn new(http: reqwest::Client, endpoint: Url, credentials: Credentials) -> Self {
        Self {
            http,
            base: with_trailing_slash(endpoint),
            credentials,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: Url,
    ) -> Result<ExternalRequest, Error> {
        let response = request
            .header(HEADER_API_ID, &self.credentials.username)
            .header(HEADER_API_KEY, &self.credentials.password)
            .send()
            .await
            .with_context(|_| TransportSnafu { url: url.clone() })?;
        let status = response.status();
        if !status.is_success() {
            // Only used for diagnostics
            let body = response.text().await.unwrap_or_default();
            return RejectedSnafu {
                url,
                status: status.as_u16(),
                body: truncate_body(body),
            }
            .fail();
        }
        let body = response
            .json::<RequestBody>()
            .await
            .context(DecodeSnafu { url })?;
        Ok(body.into())
    }
}

#[async_trait]
impl PkiSession for RestSession {
    async fn submit_enrollment(
        &self,
        profile: &str,
        csr: &[u8],
        labels: &[Label],
    ) -> Result<ExternalRequest, Error> {
        let url = join(&self.base, SUBMIT_PATH)?;
        tracing::debug!(%url, profile, "submitting enrollment");
        let body = SubmitBody::enroll(profile, csr, labels);
        self.send(self.http.post(url.clone()).json(&body), url).await
    }

    async fn get_request(&self, id: &str) -> Result<ExternalRequest, Error> {
        let url = request_url(&self.base, id)?;
        tracing::debug!(%url, request.id = id, "fetching request");
        self.send(self.http.get(url.clone()), url).await
    }
}

/// [`Url::join`] replaces the last path segment unless the base ends with a slash
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn join(base: &Url, path: &str) -> Result<Url, Error> {
    base.join(path).context(JoinUrlSnafu { path })
}

/// The URL of the request `id`, which is escaped as a single path segment.
fn request_url(base: &Url, id: &str) -> Result<Url, Error> {
    let mut url = join(base, REQUESTS_PATH)?;
    url.path_segments_mut()
        .map_err(|()| CannotBeABaseSnafu { url: base.clone() }.build())?
        .pop_if_empty()
        .push(id);
    Ok(url)
}

fn truncate_body(mut body: String) -> String {
    if let Some((cut, _)) = body.char_indices().nth(MAX_REJECTED_BODY_CHARS) {
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    workflow: &'static str,
    module: &'static str,
    profile: &'a str,
    template: SubmitTemplate<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SubmitTemplate<'a> {
    csr: Cow<'a, str>,
    labels: &'a [Label],
}

impl<'a> SubmitBody<'a> {
    fn enroll(profile: &'a str, csr: &'a [u8], labels: &'a [Label]) -> Self {
        Self {
            workflow: "enroll",
            module: "webra",
            profile,
            template: SubmitTemplate {
                // CSRs are PEM, which is always ASCII
                csr: String::from_utf8_lossy(csr),
                labels,
            },
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RequestBody {
    #[serde(rename = "_id")]
    id: String,
    status: RequestStatus,
    #[serde(default)]
    certificate: Option<CertificateBody>,
}

#[derive(Deserialize, Debug)]
struct CertificateBody {
    certificate: String,
}

impl From<RequestBody> for ExternalRequest {
    fn from(body: RequestBody) -> Self {
        Self {
            id: body.id,
            status: body.status,
            certificate: body.certificate.map(|cert| cert.certificate),
        }
    }
}
