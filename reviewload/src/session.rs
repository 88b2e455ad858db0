//! Per-simulated-user state and its transition function.
//!
//! A [`Session`] is owned by exactly one task. Each action takes the session
//! by value, talks to the service and hands back the session produced by
//! [`Session::apply`]. Nothing here performs IO: the executor deals with the
//! network, this module only decides what a response means for the state.
//!
//! The pull request and the reviewer to replace are stored as a single
//! optional [`Assignment`]. A reviewer is only meaningful next to the pull
//! request it was assigned to, so the two are always replaced together and
//! never exist one without the other.

use serde::Serialize;
use uuid::Uuid;

/// A pull request owned by the session and one of its reviewers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// The most recently created pull request of the session
    pub pull_request_id: String,
    /// A reviewer currently assigned to `pull_request_id`, replaced next
    pub reviewer_id: String,
}

/// What an action produced, as far as the session is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The service created `pull_request_id` and assigned `reviewers`.
    Created {
        /// Id of the new pull request
        pull_request_id: String,
        /// Assigned reviewers, in service order
        reviewers: Vec<String>,
    },
    /// The service replaced a reviewer of `pull_request_id`.
    Reassigned {
        /// Id of the pull request the reassignment applied to
        pull_request_id: String,
        /// Reviewers after the replacement, in service order
        reviewers: Vec<String>,
    },
    /// Non-success status, transport error or undecodable body.
    Failed,
}

/// Body of a create pull request call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatePullRequest {
    /// Fresh, globally unique id
    pub pull_request_id: String,
    /// Display name
    pub pull_request_name: String,
    /// The session's author
    pub author_id: String,
}

/// Body of a reassign reviewer call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReassignReviewer {
    /// Pull request whose reviewer is replaced
    pub pull_request_id: String,
    /// Reviewer to replace
    pub old_user_id: String,
}

/// State of one simulated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    author_id: String,
    assignment: Option<Assignment>,
}

impl Session {
    /// A fresh session for `author_id` with no pull request.
    #[must_use]
    pub fn new(author_id: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            assignment: None,
        }
    }

    /// The author this session creates pull requests as.
    #[must_use]
    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// The tracked pull request and reviewer, if any.
    #[must_use]
    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    /// The most recently created pull request, if any.
    #[must_use]
    pub fn current_pull_request_id(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.pull_request_id.as_str())
    }

    /// The reviewer to replace next, if any.
    #[must_use]
    pub fn pending_reviewer_id(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.reviewer_id.as_str())
    }

    /// Build a create request with a fresh pull request id.
    #[must_use]
    pub fn create_request(&self, pull_request_name: &str) -> CreatePullRequest {
        CreatePullRequest {
            pull_request_id: format!("pr-{}", Uuid::new_v4().simple()),
            pull_request_name: pull_request_name.to_string(),
            author_id: self.author_id.clone(),
        }
    }

    /// Build a reassign request, or `None` when the session does not know a
    /// pull request and reviewer yet. This is the only place deciding whether
    /// a reassignment may be sent.
    #[must_use]
    pub fn reassign_request(&self) -> Option<ReassignReviewer> {
        self.assignment.as_ref().map(|a| ReassignReviewer {
            pull_request_id: a.pull_request_id.clone(),
            old_user_id: a.reviewer_id.clone(),
        })
    }

    /// Fold `outcome` into the session.
    ///
    /// ```text
    /// Created { id, [r, ..] }            => Some((id, r))
    /// Reassigned { id, [r, ..] }         => Some((id, r))  if id is current
    /// Created/Reassigned with no reviewer => unchanged
    /// Reassigned for another id          => unchanged
    /// Failed                             => unchanged
    /// ```
    #[must_use]
    pub fn apply(mut self, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Created {
                pull_request_id,
                reviewers,
            } => {
                if let Some(reviewer_id) = reviewers.into_iter().next() {
                    self.assignment = Some(Assignment {
                        pull_request_id,
                        reviewer_id,
                    });
                }
            }
            Outcome::Reassigned {
                pull_request_id,
                reviewers,
            } => {
                if self.current_pull_request_id() != Some(pull_request_id.as_str()) {
                    return self;
                }
                if let Some(reviewer_id) = reviewers.into_iter().next() {
                    self.assignment = Some(Assignment {
                        pull_request_id,
                        reviewer_id,
                    });
                }
            }
            Outcome::Failed => {}
        }
        self
    }
}
