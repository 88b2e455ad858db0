//! The data seeder.
//!
//! Provisions every team of the author pool, one team at a time, before any
//! session starts. A team that already exists is as good as a team created
//! now: the seeder trusts the status code and never compares membership. A
//! team that fails does not stop the others, failures are collected and
//! reported once every team was attempted.
//!
//! ## Metrics
//!
//! `seed_team_created`: Team provisioned by this run
//! `seed_team_exists`: Team already present in the service
//! `seed_team_failed`: Team rejected or not answered
//!

use std::sync::Arc;

use http::StatusCode;
use metrics::counter;
use tracing::{error, info};

use crate::{
    author::TeamSeedSpec,
    common::MetricsBuilder,
    transport::{Endpoint, Reply, Transport},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Seeder`].
pub enum Error {
    /// Some teams could not be provisioned.
    #[error("Failed to seed {} of {total} teams: {}", .failed.len(), .failed.join(", "))]
    Partial {
        /// Names of the teams that failed, in team order
        failed: Vec<String>,
        /// Number of teams attempted
        total: usize,
    },
}

/// What happened to one team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamOutcome {
    /// The service created the team, 200 or 201
    Created,
    /// The service already knew the team, 409
    AlreadyExists,
    /// Any other status, or no reply
    Failed,
}

impl TeamOutcome {
    fn classify(status: StatusCode) -> Self {
        match status {
            StatusCode::OK | StatusCode::CREATED => Self::Created,
            StatusCode::CONFLICT => Self::AlreadyExists,
            _ => Self::Failed,
        }
    }
}

/// Summary of a seeding run where every team succeeded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Teams created by this run
    pub created: usize,
    /// Teams that already existed
    pub existing: usize,
}

/// Provisions the teams of the author pool.
#[derive(Debug)]
pub struct Seeder<T> {
    transport: Arc<T>,
    team_count: u32,
    members_per_team: u32,
    labels: Vec<(String, String)>,
}

impl<T> Seeder<T>
where
    T: Transport,
{
    /// Create a new [`Seeder`] for `team_count` teams of `members_per_team`
    /// members each.
    #[must_use]
    pub fn new(transport: Arc<T>, team_count: u32, members_per_team: u32) -> Self {
        Self {
            transport,
            team_count,
            members_per_team,
            labels: MetricsBuilder::new("seeder")
                .with_endpoint(Endpoint::AddTeam)
                .build(),
        }
    }

    /// Submit one team and classify the answer.
    pub async fn seed_team(&self, spec: &TeamSeedSpec) -> TeamOutcome {
        let body = match serde_json::to_value(spec) {
            Ok(body) => body,
            Err(err) => {
                error!("Failed to encode team {}: {err}", spec.team_name);
                return TeamOutcome::Failed;
            }
        };

        match self.transport.post(Endpoint::AddTeam, body).await {
            Ok(Reply { status, body }) => {
                let outcome = TeamOutcome::classify(status);
                match outcome {
                    TeamOutcome::Created => info!("Created team {}", spec.team_name),
                    TeamOutcome::AlreadyExists => {
                        info!("Team {} already exists", spec.team_name);
                    }
                    TeamOutcome::Failed => error!(
                        "Failed to create team {}: {status} {}",
                        spec.team_name,
                        String::from_utf8_lossy(&body)
                    ),
                }
                outcome
            }
            Err(err) => {
                error!("Failed to create team {}: {err}", spec.team_name);
                TeamOutcome::Failed
            }
        }
    }

    /// Seed every team, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Partial`] naming every team that failed. The other
    /// teams were still attempted.
    pub async fn run(&self) -> Result<Report, Error> {
        info!(
            "Seeding {} teams of {} members",
            self.team_count, self.members_per_team
        );
        let mut report = Report::default();
        let mut failed = Vec::new();
        let mut total = 0;

        for spec in TeamSeedSpec::all(self.team_count, self.members_per_team) {
            total += 1;
            match self.seed_team(&spec).await {
                TeamOutcome::Created => {
                    counter!("seed_team_created", &self.labels).increment(1);
                    report.created += 1;
                }
                TeamOutcome::AlreadyExists => {
                    counter!("seed_team_exists", &self.labels).increment(1);
                    report.existing += 1;
                }
                TeamOutcome::Failed => {
                    counter!("seed_team_failed", &self.labels).increment(1);
                    failed.push(spec.team_name);
                }
            }
        }

        if failed.is_empty() {
            info!(
                "Seeding complete: {} created, {} already present",
                report.created, report.existing
            );
            Ok(report)
        } else {
            Err(Error::Partial { failed, total })
        }
    }
}
