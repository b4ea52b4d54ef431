//! Quorum tracking and the voting decision rule.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MagiError, MagiResult};
use crate::persona::PersonaName;
use crate::schema::Vote;

/// Decision rule applied to the voting tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VotingThreshold {
    #[default]
    Majority,
    Unanimous,
}

/// Point-in-time quorum view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumState {
    pub alive: usize,
    pub quorum_threshold: usize,
    pub retries_left: BTreeMap<PersonaName, u32>,
    pub partial_results: bool,
    pub excluded_personas: Vec<PersonaName>,
}

#[derive(Debug, Clone)]
struct AgentStanding {
    retries_left: u32,
    excluded: bool,
}

/// Tracks per-persona standing across phases and enforces the quorum floor.
#[derive(Debug, Clone)]
pub struct QuorumManager {
    threshold: usize,
    standings: BTreeMap<PersonaName, AgentStanding>,
}

impl QuorumManager {
    pub fn new(quorum_threshold: usize, retries_per_agent: u32) -> Self {
        let standings = PersonaName::ALL
            .iter()
            .map(|&name| {
                (
                    name,
                    AgentStanding {
                        retries_left: retries_per_agent,
                        excluded: false,
                    },
                )
            })
            .collect();
        Self {
            threshold: quorum_threshold,
            standings,
        }
    }

    /// Record a phase success; refreshes nothing, exclusion is sticky.
    pub fn note_success(&mut self, _persona: PersonaName) {}

    /// Record a persona failure after its local retries were spent.
    pub fn note_failure(&mut self, persona: PersonaName, reason: &str) {
        if let Some(standing) = self.standings.get_mut(&persona) {
            standing.excluded = true;
            tracing::warn!(persona = %persona, reason, "persona excluded from deliberation");
        }
    }

    /// Consume one retry; false when the budget is spent.
    pub fn consume_retry(&mut self, persona: PersonaName) -> bool {
        match self.standings.get_mut(&persona) {
            Some(standing) if standing.retries_left > 0 => {
                standing.retries_left -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_alive(&self, persona: PersonaName) -> bool {
        self.standings
            .get(&persona)
            .map(|s| !s.excluded)
            .unwrap_or(false)
    }

    pub fn alive(&self) -> usize {
        self.standings.values().filter(|s| !s.excluded).count()
    }

    /// Personas alive, in canonical order.
    pub fn alive_personas(&self) -> Vec<PersonaName> {
        PersonaName::ALL
            .iter()
            .copied()
            .filter(|&p| self.is_alive(p))
            .collect()
    }

    pub fn excluded_personas(&self) -> Vec<PersonaName> {
        PersonaName::ALL
            .iter()
            .copied()
            .filter(|&p| !self.is_alive(p))
            .collect()
    }

    /// True when any persona was excluded but quorum still holds.
    pub fn partial_results(&self) -> bool {
        !self.excluded_personas().is_empty()
    }

    /// Phase-boundary check: quorum loss is the fail-safe trigger.
    pub fn check(&self) -> MagiResult<QuorumState> {
        let alive = self.alive();
        if alive < self.threshold {
            return Err(MagiError::QuorumLoss {
                excluded: self.excluded_personas(),
            });
        }
        Ok(QuorumState {
            alive,
            quorum_threshold: self.threshold,
            retries_left: self
                .standings
                .iter()
                .map(|(&name, s)| (name, s.retries_left))
                .collect(),
            partial_results: self.partial_results(),
            excluded_personas: self.excluded_personas(),
        })
    }
}

/// Counts per ballot outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingTally {
    pub approve: usize,
    pub deny: usize,
    pub conditional: usize,
}

impl VotingTally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        votes.into_iter().fold(Self::default(), |mut tally, vote| {
            match vote {
                Vote::Approve => tally.approve += 1,
                Vote::Deny => tally.deny += 1,
                Vote::Conditional => tally.conditional += 1,
            }
            tally
        })
    }

    pub fn total(&self) -> usize {
        self.approve + self.deny + self.conditional
    }

    /// Apply the decision rule.
    ///
    /// Unanimous: APPROVE only when every alive persona approved; any DENY
    /// is a DENY. Majority: two like ballots decide; anything else is
    /// CONDITIONAL.
    pub fn decide(&self, threshold: VotingThreshold) -> Vote {
        match threshold {
            VotingThreshold::Unanimous => {
                if self.deny >= 1 {
                    Vote::Deny
                } else if self.approve == self.total() && self.total() > 0 {
                    Vote::Approve
                } else {
                    Vote::Conditional
                }
            }
            VotingThreshold::Majority => {
                if self.approve >= 2 {
                    Vote::Approve
                } else if self.deny >= 2 {
                    Vote::Deny
                } else {
                    Vote::Conditional
                }
            }
        }
    }
}
