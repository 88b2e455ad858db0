//! A scripted in-memory [`Transport`] for tests.

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use serde_json::Value;

use super::{Endpoint, Error, Reply, Transport};

/// Replies from a queue, in order, and records every request it receives.
/// Once the queue is drained every request gets a bare 500.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<Reply, Endpoint>>>,
    requests: Mutex<Vec<(Endpoint, Value)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a reply with `status` and a JSON `body`.
    pub(crate) fn reply(self, status: u16, body: &Value) -> Self {
        let reply = Reply {
            status: StatusCode::from_u16(status).expect("invalid status code"),
            body: Bytes::from(body.to_string()),
        };
        self.replies.lock().unwrap().push_back(Ok(reply));
        self
    }

    /// Queue a reply with `status` and a raw, possibly malformed, body.
    pub(crate) fn reply_raw(self, status: u16, body: &'static str) -> Self {
        let reply = Reply {
            status: StatusCode::from_u16(status).expect("invalid status code"),
            body: Bytes::from_static(body.as_bytes()),
        };
        self.replies.lock().unwrap().push_back(Ok(reply));
        self
    }

    /// Queue a timeout.
    pub(crate) fn timeout(self, endpoint: Endpoint) -> Self {
        self.replies.lock().unwrap().push_back(Err(endpoint));
        self
    }

    /// Every request received so far, in order.
    pub(crate) fn requests(&self) -> Vec<(Endpoint, Value)> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests received so far for `endpoint`.
    pub(crate) fn requests_to(&self, endpoint: Endpoint) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, body)| body)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, endpoint: Endpoint, body: Value) -> Result<Reply, Error> {
        self.requests.lock().unwrap().push((endpoint, body));
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(endpoint)) => Err(Error::Timeout { endpoint }),
            None => Ok(Reply {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: Bytes::new(),
            }),
        }
    }
}

/// A pull request reply body in the shape the service produces.
pub(crate) fn pull_request_body(pull_request_id: &str, reviewers: &[&str]) -> Value {
    serde_json::json!({
        "pr": {
            "pull_request_id": pull_request_id,
            "pull_request_name": "LoadTest PR",
            "author_id": "user-loadtest-01-01",
            "status": "OPEN",
            "assigned_reviewers": reviewers,
        }
    })
}
