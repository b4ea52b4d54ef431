//! Typed event model for the observer stream.
//!
//! Every message sent to an observer is an [`Envelope`]: a versioned,
//! session-stamped wrapper around the [`Event`] union. Consumers match
//! exhaustively on the discriminant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persona::PersonaName;
use crate::schema::Vote;

/// Wire schema version stamped on every envelope.
pub const SCHEMA_VERSION: &str = "1.0";

/// Deliberation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Queued,
    Thinking,
    Debate,
    Voting,
    Resolved,
    Cancelled,
    Error,
}

impl Phase {
    /// Terminal phases accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Resolved | Phase::Cancelled | Phase::Error)
    }

    /// Position along the canonical QUEUED→RESOLVED order.
    ///
    /// CANCELLED/ERROR sit outside the order; they may replace any
    /// non-terminal phase.
    pub fn rank(self) -> Option<u8> {
        match self {
            Phase::Queued => Some(0),
            Phase::Thinking => Some(1),
            Phase::Debate => Some(2),
            Phase::Voting => Some(3),
            Phase::Resolved => Some(4),
            Phase::Cancelled | Phase::Error => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Queued => "QUEUED",
            Phase::Thinking => "THINKING",
            Phase::Debate => "DEBATE",
            Phase::Voting => "VOTING",
            Phase::Resolved => "RESOLVED",
            Phase::Cancelled => "CANCELLED",
            Phase::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Per-persona processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Idle,
    Thinking,
    Debating,
    Voting,
    Voted,
}

impl UnitState {
    /// Monotonic position; a unit never regresses and VOTED is final.
    pub fn rank(self) -> u8 {
        match self {
            UnitState::Idle => 0,
            UnitState::Thinking => 1,
            UnitState::Debating => 2,
            UnitState::Voting => 3,
            UnitState::Voted => 4,
        }
    }
}

/// Severity of a `log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Reserved for fail-open guardrail audit trails.
    Critical,
}

/// Closed set of wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "MAGI_CORE_ERROR")]
    MagiCoreError,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "INTERNAL")]
    Internal,
}

/// One persona's recorded vote inside a `final` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaVote {
    pub vote: Vote,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
}

/// A typed event from the deliberation runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Phase transition.
    Phase { phase: Phase },

    /// Overall progress in percent.
    Progress { pct: u8 },

    /// Per-persona state change.
    Unit {
        unit: PersonaName,
        state: UnitState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },

    /// Free-form log lines for the observer console.
    Log {
        level: LogLevel,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<PersonaName>,
        lines: Vec<String>,
    },

    /// The deliberation result. Emitted exactly once, only when quorum held.
    Final {
        decision: Vote,
        votes: BTreeMap<PersonaName, PersonaVote>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Terminal failure report.
    Error { code: ErrorCode, message: String },
}

/// Delivery priority classes for the streaming emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Normal,
    Critical,
}

impl Event {
    /// Events whose loss is impermissible: terminal phases, the final
    /// result, and terminal errors.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Final { .. } | Event::Error { .. } => EventPriority::Critical,
            Event::Phase { phase } if phase.is_terminal() => EventPriority::Critical,
            _ => EventPriority::Normal,
        }
    }

    /// Create a log event from a single line.
    pub fn log_line(level: LogLevel, line: impl Into<String>) -> Self {
        Event::Log {
            level,
            unit: None,
            lines: vec![line.into()],
        }
    }
}

/// Versioned wrapper placed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire schema version.
    pub schema_version: String,
    /// Session this event belongs to.
    pub session_id: Uuid,
    /// ISO-8601 emission timestamp.
    pub ts: chrono::DateTime<chrono::Utc>,
    /// The typed event.
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    /// Stamp an event for a session.
    pub fn new(session_id: Uuid, event: Event) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            session_id,
            ts: chrono::Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serialization_is_screaming_snake() {
        let json = serde_json::to_string(&Phase::Thinking).unwrap();
        assert_eq!(json, "\"THINKING\"");
    }

    #[test]
    fn test_event_discriminant_tag() {
        let event = Event::Progress { pct: 42 };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["pct"], 42);
    }

    #[test]
    fn test_envelope_carries_version_and_session() {
        let id = Uuid::new_v4();
        let env = Envelope::new(id, Event::Phase { phase: Phase::Queued });
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        assert_eq!(value["session_id"], id.to_string());
        assert_eq!(value["type"], "phase");
        assert_eq!(value["phase"], "QUEUED");
        assert!(value["ts"].is_string());
    }

    #[test]
    fn test_priority_classes() {
        assert_eq!(
            Event::Phase { phase: Phase::Thinking }.priority(),
            EventPriority::Normal
        );
        assert_eq!(
            Event::Phase { phase: Phase::Resolved }.priority(),
            EventPriority::Critical
        );
        assert_eq!(
            Event::Error {
                code: ErrorCode::Internal,
                message: "boom".into()
            }
            .priority(),
            EventPriority::Critical
        );
    }

    #[test]
    fn test_unit_state_rank_is_monotonic() {
        assert!(UnitState::Voted.rank() > UnitState::Voting.rank());
        assert!(UnitState::Voting.rank() > UnitState::Debating.rank());
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::MagiCoreError).unwrap(),
            "\"MAGI_CORE_ERROR\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::Timeout).unwrap(),
            "\"TIMEOUT\""
        );
    }
}
