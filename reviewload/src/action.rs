//! The action executor.
//!
//! Each action is a single request/response exchange with the service. The
//! executor builds nothing itself: the session hands it a request, the
//! executor sends it, turns the reply into an [`Outcome`] and returns the
//! session folded with that outcome. A failed action is never an error here,
//! it is an outcome that leaves the session as it was.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of requests sent
//! `request_ok`: Requests answered with the expected status
//! `request_failure`: Requests answered with another status, labelled
//! `status_code`, or not answered at all, labelled `error`
//! `request_latency_seconds`: Time from send to full reply
//! `response_malformed`: Expected status but undecodable body
//!
//! Every metric carries `component=session` and the stable `endpoint` name.
//!

use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use http::StatusCode;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    common::{self, MetricsBuilder},
    session::{Outcome, ReassignReviewer, Session},
    transport::{Endpoint, Transport},
};

/// Display name of the pull request a session opens when it starts.
pub const INITIAL_PULL_REQUEST_NAME: &str = "Initial LoadTest PR";
/// Display name of every scheduled pull request.
pub const PULL_REQUEST_NAME: &str = "LoadTest PR";

/// The kinds of action a session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Open a new pull request
    Create,
    /// Replace the pending reviewer of the current pull request
    Reassign,
}

impl Action {
    /// Label-friendly name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Reassign => "reassign",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PullRequestReply {
    #[serde(default)]
    pr: Option<PullRequestBody>,
}

#[derive(Debug, Default, Deserialize)]
struct PullRequestBody {
    // The service encodes an empty reviewer list as `null`.
    #[serde(default)]
    assigned_reviewers: Option<Vec<String>>,
}

/// Assigned reviewers of a pull request reply. Missing `pr` or missing
/// `assigned_reviewers` decode as no reviewers.
fn decode_reviewers(body: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let reply: PullRequestReply = serde_json::from_slice(body)?;
    Ok(reply
        .pr
        .and_then(|pr| pr.assigned_reviewers)
        .unwrap_or_default())
}

fn encode<S: Serialize>(request: &S) -> Option<Value> {
    match serde_json::to_value(request) {
        Ok(body) => Some(body),
        Err(err) => {
            error!("Failed to encode request body: {err}");
            None
        }
    }
}

/// Performs actions on behalf of sessions.
///
/// One executor is shared by every session of a run.
#[derive(Debug)]
pub struct Executor<T> {
    transport: Arc<T>,
    create_labels: Vec<(String, String)>,
    reassign_labels: Vec<(String, String)>,
}

impl<T> Executor<T>
where
    T: Transport,
{
    /// Create a new [`Executor`] sending through `transport`.
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            create_labels: MetricsBuilder::new("session")
                .with_endpoint(Endpoint::CreatePullRequest)
                .build(),
            reassign_labels: MetricsBuilder::new("session")
                .with_endpoint(Endpoint::ReassignReviewer)
                .build(),
        }
    }

    /// Open a new pull request named `pull_request_name` as the session's
    /// author.
    pub async fn create(&self, session: Session, pull_request_name: &str) -> Session {
        let request = session.create_request(pull_request_name);
        let Some(body) = encode(&request) else {
            return session;
        };

        let outcome = match self
            .exchange(
                Endpoint::CreatePullRequest,
                &self.create_labels,
                body,
                StatusCode::CREATED,
            )
            .await
        {
            Some(reply) => match decode_reviewers(&reply) {
                Ok(reviewers) => {
                    debug!(
                        pull_request_id = %request.pull_request_id,
                        reviewers = reviewers.len(),
                        "pull request created"
                    );
                    Outcome::Created {
                        pull_request_id: request.pull_request_id,
                        reviewers,
                    }
                }
                Err(err) => {
                    warn!("Discarding malformed create reply: {err}");
                    counter!("response_malformed", &self.create_labels).increment(1);
                    Outcome::Failed
                }
            },
            None => Outcome::Failed,
        };
        session.apply(outcome)
    }

    /// Ask the service to replace `request.old_user_id` on
    /// `request.pull_request_id`.
    ///
    /// `request` comes from [`Session::reassign_request`], the executor never
    /// builds one itself.
    pub async fn reassign(&self, session: Session, request: ReassignReviewer) -> Session {
        let Some(body) = encode(&request) else {
            return session;
        };

        let outcome = match self
            .exchange(
                Endpoint::ReassignReviewer,
                &self.reassign_labels,
                body,
                StatusCode::OK,
            )
            .await
        {
            Some(reply) => match decode_reviewers(&reply) {
                Ok(reviewers) => {
                    debug!(
                        pull_request_id = %request.pull_request_id,
                        old_user_id = %request.old_user_id,
                        "reviewer reassigned"
                    );
                    Outcome::Reassigned {
                        pull_request_id: request.pull_request_id,
                        reviewers,
                    }
                }
                Err(err) => {
                    warn!("Discarding malformed reassign reply: {err}");
                    counter!("response_malformed", &self.reassign_labels).increment(1);
                    Outcome::Failed
                }
            },
            None => Outcome::Failed,
        };
        session.apply(outcome)
    }

    /// Send `body` and return the reply body if the status is `expected`.
    #[allow(clippy::ptr_arg)]
    async fn exchange(
        &self,
        endpoint: Endpoint,
        labels: &Vec<(String, String)>,
        body: Value,
        expected: StatusCode,
    ) -> Option<Bytes> {
        counter!("requests_sent", labels).increment(1);
        let start = Instant::now();
        let result = self.transport.post(endpoint, body).await;
        histogram!("request_latency_seconds", labels).record(start.elapsed().as_secs_f64());

        match result {
            Ok(reply) if reply.status == expected => {
                counter!("request_ok", labels).increment(1);
                Some(reply.body)
            }
            Ok(reply) => {
                debug!(
                    "{path} answered {status}",
                    path = endpoint.path(),
                    status = reply.status
                );
                let labels =
                    common::extend(labels, "status_code", reply.status.as_u16().to_string());
                counter!("request_failure", &labels).increment(1);
                None
            }
            Err(err) => {
                debug!("{err}");
                let labels = common::extend(labels, "error", err.kind().to_string());
                counter!("request_failure", &labels).increment(1);
                None
            }
        }
    }
}
