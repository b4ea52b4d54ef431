//! Structured vote payloads and their schema validation.
//!
//! The validator is pure: it judges one payload and reports every failure
//! reason. The retry loop lives with the caller (the agent), which
//! re-prompts and calls back in until its attempt budget is spent.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A ballot outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Vote {
    Approve,
    Deny,
    Conditional,
}

impl Vote {
    /// Process exit code encoding of a decision.
    pub fn exit_code(self) -> i32 {
        match self {
            Vote::Approve => 0,
            Vote::Deny => 1,
            Vote::Conditional => 2,
        }
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Vote::Approve => "APPROVE",
            Vote::Deny => "DENY",
            Vote::Conditional => "CONDITIONAL",
        };
        f.write_str(s)
    }
}

/// A persona's structured ballot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotePayload {
    pub vote: Vote,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
}

static VOTE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "object",
        "required": ["vote", "reason"],
        "additionalProperties": false,
        "properties": {
            "vote": { "type": "string", "enum": ["APPROVE", "DENY", "CONDITIONAL"] },
            "reason": { "type": "string", "minLength": 1 },
            "conditions": {
                "type": "array",
                "items": { "type": "string" }
            }
        }
    })
});

static COMPILED_VOTE_SCHEMA: Lazy<JSONSchema> =
    Lazy::new(|| JSONSchema::compile(&VOTE_SCHEMA).expect("invalid vote schema"));

/// Validates vote payloads against the ballot JSON schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a raw model reply. Accepts surrounding prose or code fences;
    /// the first JSON object found is judged.
    ///
    /// `Err` carries the joined failure reasons for the corrective
    /// re-prompt and the attempt record.
    pub fn validate_vote(&self, raw: &str) -> Result<VotePayload, String> {
        let json = extract_json_object(raw)
            .ok_or_else(|| "no JSON object found in reply".to_string())?;
        let value: Value = serde_json::from_str(json)
            .map_err(|e| format!("malformed JSON: {e}"))?;

        if let Err(errors) = COMPILED_VOTE_SCHEMA.validate(&value) {
            let reasons: Vec<String> = errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect();
            return Err(reasons.join("; "));
        }

        serde_json::from_value(value).map_err(|e| format!("payload mismatch: {e}"))
    }
}

/// Find the outermost JSON object in a reply that may carry prose or fences.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_payload_round_trips() {
        let payload = VotePayload {
            vote: Vote::Conditional,
            reason: "needs a rollout plan".to_string(),
            conditions: Some(vec!["staged rollout".to_string()]),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: VotePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_conditions_omitted_when_absent() {
        let payload = VotePayload {
            vote: Vote::Approve,
            reason: "ship it".to_string(),
            conditions: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("conditions").is_none());
    }

    #[test]
    fn test_validator_accepts_fenced_reply() {
        let validator = SchemaValidator::new();
        let raw = "Here is my ballot:\n```json\n{\"vote\": \"APPROVE\", \"reason\": \"sound\"}\n```";
        let payload = validator.validate_vote(raw).unwrap();
        assert_eq!(payload.vote, Vote::Approve);
    }

    #[test]
    fn test_validator_rejects_unknown_vote() {
        let validator = SchemaValidator::new();
        let err = validator
            .validate_vote(r#"{"vote": "MAYBE", "reason": "unsure"}"#)
            .unwrap_err();
        assert!(err.contains("/vote"));
    }

    #[test]
    fn test_validator_rejects_missing_reason() {
        let validator = SchemaValidator::new();
        assert!(validator.validate_vote(r#"{"vote": "DENY"}"#).is_err());
    }

    #[test]
    fn test_validator_rejects_prose_only() {
        let validator = SchemaValidator::new();
        let err = validator.validate_vote("I approve of this plan.").unwrap_err();
        assert!(err.contains("no JSON object"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Vote::Approve.exit_code(), 0);
        assert_eq!(Vote::Deny.exit_code(), 1);
        assert_eq!(Vote::Conditional.exit_code(), 2);
    }
}
