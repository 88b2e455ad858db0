//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Every field has a
//! default so an empty document is a valid configuration.
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use http::Uri;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{
    author::AuthorPool,
    scheduler::{self, ActionTable, ThinkTime, Weights},
};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// The author pool would be empty.
    #[error("Author pool is empty: team_count {team_count} x members_per_team {members_per_team}")]
    EmptyAuthorPool {
        /// Configured team count
        team_count: u32,
        /// Configured members per team
        members_per_team: u32,
    },
    /// No session would run.
    #[error("sessions must be at least 1")]
    NoSessions,
    /// Every request would time out before it is sent.
    #[error("request_timeout_millis must be at least 1")]
    ZeroRequestTimeout,
    /// Invalid weights or think time.
    #[error(transparent)]
    Scheduler(#[from] scheduler::Error),
}

fn default_target_uri() -> Uri {
    Uri::from_static("http://localhost:8080")
}

fn default_team_count() -> u32 {
    20
}

fn default_members_per_team() -> u32 {
    10
}

fn default_sessions() -> u32 {
    10
}

fn default_request_timeout_millis() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Shape of the identity space, shared by the seeder and the author pool.
pub struct Teams {
    /// Number of teams
    #[serde(default = "default_team_count")]
    pub team_count: u32,
    /// Members in each team
    #[serde(default = "default_members_per_team")]
    pub members_per_team: u32,
}

impl Default for Teams {
    fn default() -> Self {
        Self {
            team_count: default_team_count(),
            members_per_team: default_members_per_team(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Defines the manner of reviewload's telemetry.
pub enum Telemetry {
    /// Expose internal telemetry for scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
    /// Expose internal telemetry for scraping on a unix socket.
    PrometheusSocket {
        /// Path of the socket for the prometheus exporter
        path: PathBuf,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Telemetry {
    /// Labels applied to every metric.
    pub fn global_labels_mut(&mut self) -> &mut FxHashMap<String, String> {
        match self {
            Self::Prometheus { global_labels, .. }
            | Self::PrometheusSocket { global_labels, .. } => global_labels,
        }
    }
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URI of the service under test
    #[serde(with = "http_serde::uri", default = "default_target_uri")]
    pub target_uri: Uri,
    /// Seed for the run's random number generator. A fixed seed makes author
    /// choice, think times and action draws reproducible.
    #[serde(default)]
    pub seed: Option<[u8; 32]>,
    /// Shape of the identity space
    #[serde(default)]
    pub teams: Teams,
    /// Relative weight of each action
    #[serde(default)]
    pub weights: Weights,
    /// Pause between two actions of a session
    #[serde(default)]
    pub think_time: ThinkTime,
    /// Number of concurrent sessions
    #[serde(default = "default_sessions")]
    pub sessions: u32,
    /// Upper bound on every request, seeding included
    #[serde(default = "default_request_timeout_millis")]
    pub request_timeout_millis: u64,
    /// The method by which to express telemetry, none if absent
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_uri: default_target_uri(),
            seed: None,
            teams: Teams::default(),
            weights: Weights::default(),
            think_time: ThinkTime::default(),
            sessions: default_sessions(),
            request_timeout_millis: default_request_timeout_millis(),
            telemetry: None,
        }
    }
}

impl Config {
    /// Parse a YAML document. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML or does not match
    /// [`Config`].
    pub fn parse(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse the YAML document at `path`. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::parse(&contents)
    }

    /// Check the configuration describes a runnable load.
    ///
    /// # Errors
    ///
    /// Returns an error if the author pool is empty, every weight is zero, the
    /// think time range is inverted, no session would run or the request
    /// timeout is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.author_pool().is_empty() {
            return Err(Error::EmptyAuthorPool {
                team_count: self.teams.team_count,
                members_per_team: self.teams.members_per_team,
            });
        }
        ActionTable::new(self.weights)?;
        self.think_time.validate()?;
        if self.sessions == 0 {
            return Err(Error::NoSessions);
        }
        if self.request_timeout_millis == 0 {
            return Err(Error::ZeroRequestTimeout);
        }
        Ok(())
    }

    /// The author pool described by `teams`.
    #[must_use]
    pub fn author_pool(&self) -> AuthorPool {
        AuthorPool::generate(self.teams.team_count, self.teams.members_per_team)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }
}
