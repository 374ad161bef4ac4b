#![deny(clippy::all)]

//! HTTP client for the remote cache service.
//!
//! The wire surface is small: artifact fetch/upload/existence probes plus a
//! fire-and-forget analytics batch endpoint. Transport failures here are
//! never fatal to a run; callers degrade to the local cache tier.

pub mod analytics;

use std::time::Duration;

use reqwest::{header::HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

pub use crate::analytics::{AnalyticsClient, AnalyticsEvent};

pub type Response = reqwest::Response;

const ARTIFACTS_ENDPOINT: &str = "/v8/artifacts";
const ANALYTICS_ENDPOINT: &str = "/v8/artifacts/events";

/// Header carrying the original execution duration of a cached task.
pub const DURATION_HEADER: &str = "x-artifact-duration";
/// Header carrying the HMAC tag of a signed artifact.
pub const TAG_HEADER: &str = "x-artifact-tag";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error making HTTP request: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Unable to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Unable to set up TLS: {0}")]
    TlsError(#[source] reqwest::Error),
    #[error("The remote cache is disabled for this account")]
    CacheDisabled,
    #[error("Unknown status {code} from cache server")]
    UnknownStatus { code: StatusCode },
    #[error("Artifact response carried a malformed {header} header")]
    MalformedHeader { header: &'static str },
}

/// Credentials and team scoping for remote cache calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct APIAuth {
    pub token: String,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
}

#[derive(Debug, Clone)]
pub struct APIClient {
    client: reqwest::Client,
    base_url: Url,
}

impl APIClient {
    pub fn new(
        base_url: impl AsRef<str>,
        timeout: Option<Duration>,
        version: &str,
    ) -> Result<Self, Error> {
        let mut builder =
            reqwest::Client::builder().user_agent(format!("convoy/{version}"));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(Error::TlsError)?;
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self { client, base_url })
    }

    fn artifact_url(&self, hash: &str, auth: &APIAuth) -> Result<Url, Error> {
        let mut url = self
            .base_url
            .join(&format!("{ARTIFACTS_ENDPOINT}/{hash}"))?;
        if let Some(team_id) = &auth.team_id {
            url.query_pairs_mut().append_pair("teamId", team_id);
        }
        if let Some(team_slug) = &auth.team_slug {
            url.query_pairs_mut().append_pair("slug", team_slug);
        }
        Ok(url)
    }

    /// Cheap existence probe. `Ok(None)` is a miss.
    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn artifact_exists(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        self.request_artifact(Method::HEAD, hash, auth).await
    }

    /// Fetches an artifact's bytes. `Ok(None)` is a miss.
    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn fetch_artifact(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        self.request_artifact(Method::GET, hash, auth).await
    }

    async fn request_artifact(
        &self,
        method: Method,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        let url = self.artifact_url(hash, auth)?;
        let response = self
            .client
            .request(method, url)
            .bearer_auth(&auth.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN | StatusCode::PAYMENT_REQUIRED => Err(Error::CacheDisabled),
            status if status.is_success() => Ok(Some(response)),
            code => Err(Error::UnknownStatus { code }),
        }
    }

    /// Uploads an artifact. The duration header lets later fetches report
    /// time saved; the tag header carries the integrity signature.
    #[tracing::instrument(skip_all, fields(hash = hash, bytes = artifact_body.len()))]
    pub async fn put_artifact(
        &self,
        hash: &str,
        artifact_body: Vec<u8>,
        duration: u64,
        tag: Option<&str>,
        auth: &APIAuth,
    ) -> Result<(), Error> {
        let url = self.artifact_url(hash, auth)?;
        let mut request = self
            .client
            .put(url)
            .bearer_auth(&auth.token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(DURATION_HEADER, duration.to_string());

        if let Some(tag) = tag {
            let value = HeaderValue::from_str(tag)
                .map_err(|_| Error::MalformedHeader { header: TAG_HEADER })?;
            request = request.header(TAG_HEADER, value);
        }

        let response = request.body(artifact_body).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::FORBIDDEN | StatusCode::PAYMENT_REQUIRED => Err(Error::CacheDisabled),
            code => Err(Error::UnknownStatus { code }),
        }
    }

    pub(crate) async fn record_analytics_inner(
        &self,
        auth: &APIAuth,
        events: Vec<AnalyticsEvent>,
    ) -> Result<(), Error> {
        let url = self.base_url.join(ANALYTICS_ENDPOINT)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&auth.token)
            .json(&events)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            code => Err(Error::UnknownStatus { code }),
        }
    }
}

/// Extracts the recorded execution duration from an artifact response.
/// Absent header means the server predates duration tracking; report zero.
pub fn duration_from_response(response: &Response) -> Result<u64, Error> {
    match response.headers().get(DURATION_HEADER) {
        None => Ok(0),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|duration| duration.parse::<u64>().ok())
            .ok_or(Error::MalformedHeader {
                header: DURATION_HEADER,
            }),
    }
}
