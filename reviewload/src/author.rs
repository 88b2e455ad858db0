//! Synthetic identities shared by the seeder and the sessions.
//!
//! Every identity is derived from a 1-based `(team, member)` index pair. The
//! seeder provisions exactly these identities and sessions pick their author
//! from exactly these identities, so a run against a seeded service never
//! authors a pull request as an unknown user.

use rand::{Rng, seq::IndexedRandom};
use serde::Serialize;

/// Author identity for `member` of `team`, both 1-based.
#[must_use]
pub fn author_id(team: u32, member: u32) -> String {
    format!("user-loadtest-{team:02}-{member:02}")
}

/// Display name for `member` of `team`, both 1-based.
#[must_use]
pub fn username(team: u32, member: u32) -> String {
    format!("loadtest-user-{team:02}-{member:02}")
}

/// Name of `team`, 1-based.
#[must_use]
pub fn team_name(team: u32) -> String {
    format!("loadtest-team-{team:02}")
}

/// The fixed, ordered set of pull-request authors for a run.
///
/// Generation is a pure function of its inputs: the same counts always yield
/// the same identities in the same order, so repeated runs reuse the identity
/// space of a previously seeded service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorPool {
    authors: Vec<String>,
}

impl AuthorPool {
    /// Generate `team_count * members_per_team` identities, team-major.
    #[must_use]
    pub fn generate(team_count: u32, members_per_team: u32) -> Self {
        let authors = (1..=team_count)
            .flat_map(|team| (1..=members_per_team).map(move |member| author_id(team, member)))
            .collect();
        Self { authors }
    }

    /// Draw one identity uniformly at random. Returns `None` only when the
    /// pool is empty.
    pub fn choose<R>(&self, rng: &mut R) -> Option<&str>
    where
        R: Rng + ?Sized,
    {
        self.authors.choose(rng).map(String::as_str)
    }

    /// Number of identities in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.authors.len()
    }

    /// Whether the pool holds no identities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authors.is_empty()
    }

    /// The identities, in generation order.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.authors
    }
}

/// A single member submitted to the team-provisioning endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamMember {
    /// Identity, identical to the matching [`AuthorPool`] entry
    pub user_id: String,
    /// Display name
    pub username: String,
    /// Seeded members are always active
    pub is_active: bool,
}

/// The team-provisioning request body for one team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamSeedSpec {
    /// Name of the team
    pub team_name: String,
    /// Members of the team, in member index order
    pub members: Vec<TeamMember>,
}

impl TeamSeedSpec {
    /// Build the spec for `team` (1-based) with `members_per_team` active
    /// members.
    #[must_use]
    pub fn new(team: u32, members_per_team: u32) -> Self {
        let members = (1..=members_per_team)
            .map(|member| TeamMember {
                user_id: author_id(team, member),
                username: username(team, member),
                is_active: true,
            })
            .collect();
        Self {
            team_name: team_name(team),
            members,
        }
    }

    /// Build the specs of every team in a run, in team order.
    pub fn all(team_count: u32, members_per_team: u32) -> impl Iterator<Item = Self> {
        (1..=team_count).map(move |team| Self::new(team, members_per_team))
    }
}
