//! The HTTP surface of the service under test.
//!
//! Everything above this module speaks in terms of [`Endpoint`] and [`Reply`]
//! and never sees a URL or a connection. Interpreting a reply is the caller's
//! business: this module only reports whether an exchange happened and what
//! came back.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{StatusCode, Uri};
use serde_json::Value;

#[cfg(test)]
pub(crate) mod test;

/// The service endpoints reviewload drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Open a new pull request, the service assigns reviewers
    CreatePullRequest,
    /// Replace one reviewer of an existing pull request
    ReassignReviewer,
    /// Provision a team and its members
    AddTeam,
}

impl Endpoint {
    /// Request path relative to the target URI.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::CreatePullRequest => "/pullRequest/create",
            Self::ReassignReviewer => "/pullRequest/reassign",
            Self::AddTeam => "/team/add",
        }
    }

    /// Stable name used as the `endpoint` metric label. Never contains a
    /// per-call identifier.
    #[must_use]
    pub const fn metric_name(self) -> &'static str {
        self.path()
    }
}

/// A completed exchange with the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Response status
    pub status: StatusCode,
    /// Raw response body
    pub body: Bytes,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Transport`] implementations.
pub enum Error {
    /// Wrapper around [`reqwest::Error`] raised while building the client.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    /// The target URI has no scheme or authority.
    #[error("Target URI must be absolute, got {0}")]
    RelativeUri(Uri),
    /// The exchange did not finish within the configured timeout.
    #[error("Request to {} timed out", .endpoint.path())]
    Timeout {
        /// Endpoint of the request
        endpoint: Endpoint,
    },
    /// The exchange failed before a full response arrived.
    #[error("Failed to send request to {}: {source}", .endpoint.path())]
    Request {
        /// Endpoint of the request
        endpoint: Endpoint,
        /// Underlying reqwest error
        #[source]
        source: Box<reqwest::Error>,
    },
}

impl Error {
    /// Short, label-friendly description of the failure.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Client(_) => "client",
            Self::RelativeUri(_) => "relative_uri",
            Self::Timeout { .. } => "timeout",
            Self::Request { .. } => "request",
        }
    }
}

#[async_trait]
/// A way to POST a JSON document to the service.
pub trait Transport: Send + Sync {
    /// POST `body` to `endpoint` and return the full reply, whatever its
    /// status.
    ///
    /// # Errors
    ///
    /// Returns an error only when no complete reply was received.
    async fn post(&self, endpoint: Endpoint, body: Value) -> Result<Reply, Error>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
}

impl HttpTransport {
    /// Create a new [`HttpTransport`] rooted at `target_uri`.
    ///
    /// # Errors
    ///
    /// Returns an error if `target_uri` is not absolute or if the underlying
    /// client cannot be built.
    pub fn new(target_uri: &Uri, timeout: Duration) -> Result<Self, Error> {
        if target_uri.scheme().is_none() || target_uri.authority().is_none() {
            return Err(Error::RelativeUri(target_uri.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Client)?;
        let base = target_uri.to_string().trim_end_matches('/').to_string();
        Ok(Self { client, base })
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base, endpoint.path())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, endpoint: Endpoint, body: Value) -> Result<Reply, Error> {
        let classify = |source: reqwest::Error| {
            if source.is_timeout() {
                Error::Timeout { endpoint }
            } else {
                Error::Request {
                    endpoint,
                    source: Box::new(source),
                }
            }
        };

        let response = self
            .client
            .post(self.url(endpoint))
            .json(&body)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify)?;
        Ok(Reply { status, body })
    }
}
