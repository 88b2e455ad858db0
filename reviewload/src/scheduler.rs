//! The weighted action scheduler.
//!
//! Every simulated user is one [`Scheduler`] running in its own task. It
//! opens an initial pull request, then loops: pause for a think time, draw an
//! action from the [`ActionTable`], perform it, fold the result into the
//! session. The loop runs until the shutdown signal arrives. The signal is
//! only observed during the think time, so an action that has started always
//! runs to completion before the session exits.
//!
//! ## Metrics
//!
//! `action_skipped`: Reassign drawn while the session has no pull request
//! `sessions_active`: Number of sessions currently looping
//!

use std::{sync::Arc, time::Duration};

use metrics::{Gauge, counter, gauge};
use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
    rngs::SmallRng,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    action::{Action, Executor, INITIAL_PULL_REQUEST_NAME, PULL_REQUEST_NAME},
    author::AuthorPool,
    common::MetricsBuilder,
    session::Session,
    transport::Transport,
};

fn default_create_weight() -> u32 {
    2
}

fn default_reassign_weight() -> u32 {
    1
}

fn default_minimum_millis() -> u64 {
    1_000
}

fn default_maximum_millis() -> u64 {
    3_000
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Scheduler`] construction.
pub enum Error {
    /// The weights do not form a distribution, all zero for instance.
    #[error("Invalid action weights: {0}")]
    Weights(#[from] rand::distr::weighted::Error),
    /// The think time range is inverted.
    #[error("Think time minimum {minimum_millis}ms exceeds maximum {maximum_millis}ms")]
    ThinkTime {
        /// Configured lower bound
        minimum_millis: u64,
        /// Configured upper bound
        maximum_millis: u64,
    },
    /// There is no author to give the session.
    #[error("Author pool is empty")]
    EmptyAuthorPool,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Relative weight of each action.
pub struct Weights {
    /// Weight of [`Action::Create`]
    #[serde(default = "default_create_weight")]
    pub create: u32,
    /// Weight of [`Action::Reassign`]
    #[serde(default = "default_reassign_weight")]
    pub reassign: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            create: default_create_weight(),
            reassign: default_reassign_weight(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Bounds of the pause between two actions of a session, inclusive.
pub struct ThinkTime {
    /// Shortest pause
    #[serde(default = "default_minimum_millis")]
    pub minimum_millis: u64,
    /// Longest pause
    #[serde(default = "default_maximum_millis")]
    pub maximum_millis: u64,
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self {
            minimum_millis: default_minimum_millis(),
            maximum_millis: default_maximum_millis(),
        }
    }
}

impl ThinkTime {
    /// Check that the range is not inverted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThinkTime`] if `minimum_millis > maximum_millis`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.minimum_millis > self.maximum_millis {
            return Err(Error::ThinkTime {
                minimum_millis: self.minimum_millis,
                maximum_millis: self.maximum_millis,
            });
        }
        Ok(())
    }

    /// Draw a pause uniformly from the range.
    pub fn sample<R>(&self, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        let upper = self.maximum_millis.max(self.minimum_millis);
        Duration::from_millis(rng.random_range(self.minimum_millis..=upper))
    }
}

/// A discrete weighted distribution over [`Action`].
#[derive(Debug, Clone)]
pub struct ActionTable {
    actions: [Action; 2],
    distribution: WeightedIndex<u32>,
}

impl ActionTable {
    /// Build the table from `weights`.
    ///
    /// # Errors
    ///
    /// Returns an error if every weight is zero or the weights overflow.
    pub fn new(weights: Weights) -> Result<Self, Error> {
        let actions = [Action::Create, Action::Reassign];
        let distribution = WeightedIndex::new([weights.create, weights.reassign])?;
        Ok(Self {
            actions,
            distribution,
        })
    }

    /// Draw one action.
    pub fn sample<R>(&self, rng: &mut R) -> Action
    where
        R: Rng + ?Sized,
    {
        self.actions[self.distribution.sample(rng)]
    }
}

/// Count of what a session did over its lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Create actions performed, the initial one included
    pub creates: u64,
    /// Reassign actions performed
    pub reassigns: u64,
    /// Reassign actions drawn but skipped for lack of a pull request
    pub skipped: u64,
}

impl std::ops::AddAssign for Tally {
    fn add_assign(&mut self, rhs: Self) {
        self.creates += rhs.creates;
        self.reassigns += rhs.reassigns;
        self.skipped += rhs.skipped;
    }
}

/// The final state of a session after shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// The session as it was when the loop exited
    pub session: Session,
    /// What the session did
    pub tally: Tally,
}

/// Keeps `sessions_active` raised while a session runs. Decrements on drop,
/// so an aborted session task is accounted for too.
struct ActiveSession(Gauge);

impl ActiveSession {
    fn enter() -> Self {
        let active = gauge!("sessions_active");
        active.increment(1.0);
        Self(active)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.decrement(1.0);
    }
}

/// Drives one simulated user.
#[derive(Debug)]
pub struct Scheduler<T> {
    author_id: String,
    executor: Arc<Executor<T>>,
    actions: Arc<ActionTable>,
    think_time: ThinkTime,
    rng: SmallRng,
    skipped_labels: Vec<(String, String)>,
}

impl<T> Scheduler<T>
where
    T: Transport,
{
    /// Create a new [`Scheduler`], drawing the session's author from
    /// `authors` with `rng`.
    ///
    /// # Errors
    ///
    /// Returns an error if `authors` is empty or `think_time` is inverted.
    pub fn new(
        authors: &AuthorPool,
        executor: Arc<Executor<T>>,
        actions: Arc<ActionTable>,
        think_time: ThinkTime,
        mut rng: SmallRng,
    ) -> Result<Self, Error> {
        think_time.validate()?;
        let author_id = authors
            .choose(&mut rng)
            .ok_or(Error::EmptyAuthorPool)?
            .to_string();

        Ok(Self {
            author_id,
            executor,
            actions,
            think_time,
            rng,
            skipped_labels: MetricsBuilder::new("session")
                .with_label("action", Action::Reassign.name())
                .build(),
        })
    }

    /// The author every pull request of this session is opened as.
    #[must_use]
    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// Perform `action` for `session`, or nothing if the session cannot
    /// perform it yet.
    async fn step(&self, session: Session, action: Action, tally: &mut Tally) -> Session {
        match action {
            Action::Create => {
                tally.creates += 1;
                self.executor.create(session, PULL_REQUEST_NAME).await
            }
            Action::Reassign => match session.reassign_request() {
                Some(request) => {
                    tally.reassigns += 1;
                    self.executor.reassign(session, request).await
                }
                None => {
                    tally.skipped += 1;
                    counter!("action_skipped", &self.skipped_labels).increment(1);
                    session
                }
            },
        }
    }

    /// Run the session until `shutdown` is signalled.
    pub async fn spin(mut self, shutdown: reviewload_signal::Watcher) -> Report {
        let _active = ActiveSession::enter();
        let mut tally = Tally::default();

        let session = Session::new(self.author_id.clone());
        tally.creates += 1;
        let mut session = self
            .executor
            .create(session, INITIAL_PULL_REQUEST_NAME)
            .await;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            let pause = self.think_time.sample(&mut self.rng);
            tokio::select! {
                biased;

                () = &mut shutdown_wait => {
                    debug!("shutdown signal received");
                    break;
                }
                () = tokio::time::sleep(pause) => {}
            }

            let action = self.actions.sample(&mut self.rng);
            session = self.step(session, action, &mut tally).await;
        }

        Report { session, tally }
    }
}
