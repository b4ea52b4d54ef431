//! The three fixed reasoning personas.

use serde::{Deserialize, Serialize};

use crate::error::{MagiError, MagiResult};

/// Canonical persona identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PersonaName {
    #[serde(rename = "MELCHIOR-1")]
    Melchior,
    #[serde(rename = "BALTHASAR-2")]
    Balthasar,
    #[serde(rename = "CASPER-3")]
    Casper,
}

impl PersonaName {
    /// All personas in canonical order.
    pub const ALL: [PersonaName; 3] = [
        PersonaName::Melchior,
        PersonaName::Balthasar,
        PersonaName::Casper,
    ];

    /// Lowercase short key used in configuration (`personas.melchior.llm...`).
    pub fn key(self) -> &'static str {
        match self {
            PersonaName::Melchior => "melchior",
            PersonaName::Balthasar => "balthasar",
            PersonaName::Casper => "casper",
        }
    }
}

impl std::fmt::Display for PersonaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PersonaName::Melchior => "MELCHIOR-1",
            PersonaName::Balthasar => "BALTHASAR-2",
            PersonaName::Casper => "CASPER-3",
        };
        f.write_str(s)
    }
}

/// One reasoning role. Immutable after construction; the manager hands out
/// clones with any override applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Canonical identity.
    pub name: PersonaName,
    /// Fixed base instruction.
    pub base_instruction: String,
    /// Optional appended override.
    pub override_instruction: Option<String>,
}

impl Persona {
    /// Full system prompt: base instruction plus any override appendix.
    pub fn system_prompt(&self) -> String {
        match &self.override_instruction {
            Some(extra) => format!("{}\n\n{}", self.base_instruction, extra),
            None => self.base_instruction.clone(),
        }
    }
}

const MELCHIOR_INSTRUCTION: &str = "You are MELCHIOR-1, the scientist of a three-member \
deliberation council. Reason from first principles and verifiable evidence. Weigh the \
technical soundness of the proposal, name the assumptions it rests on, and call out \
anything that cannot be tested or measured.";

const BALTHASAR_INSTRUCTION: &str = "You are BALTHASAR-2, the guardian of a three-member \
deliberation council. Reason about operational risk and second-order consequences. Weigh \
failure modes, rollback paths, cost, and the worst realistic outcome before endorsing a \
course of action.";

const CASPER_INSTRUCTION: &str = "You are CASPER-3, the humanist of a three-member \
deliberation council. Reason from the perspective of the people affected. Weigh user \
impact, fairness, and intent, and challenge proposals that optimize a metric at a \
person's expense.";

/// Owns the three personas and applies permission-checked overrides.
#[derive(Debug, Clone)]
pub struct PersonaManager {
    personas: [Persona; 3],
}

impl Default for PersonaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PersonaManager {
    /// Construct the fixed council.
    pub fn new() -> Self {
        Self {
            personas: [
                Persona {
                    name: PersonaName::Melchior,
                    base_instruction: MELCHIOR_INSTRUCTION.to_string(),
                    override_instruction: None,
                },
                Persona {
                    name: PersonaName::Balthasar,
                    base_instruction: BALTHASAR_INSTRUCTION.to_string(),
                    override_instruction: None,
                },
                Persona {
                    name: PersonaName::Casper,
                    base_instruction: CASPER_INSTRUCTION.to_string(),
                    override_instruction: None,
                },
            ],
        }
    }

    /// Get a persona by name.
    pub fn get(&self, name: PersonaName) -> &Persona {
        self.personas
            .iter()
            .find(|p| p.name == name)
            .unwrap_or(&self.personas[0])
    }

    /// Iterate the council in canonical order.
    pub fn all(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }

    /// Apply an instruction override to one persona.
    ///
    /// Overrides append to the base instruction. Replacing the base outright
    /// requires the `FULL_OVERRIDE` grant.
    pub fn apply_override(
        &mut self,
        name: PersonaName,
        instruction: impl Into<String>,
        full_override_granted: bool,
        replace: bool,
    ) -> MagiResult<()> {
        if replace && !full_override_granted {
            return Err(MagiError::Configuration(format!(
                "replacing {name} base instruction requires FULL_OVERRIDE"
            )));
        }
        let persona = self
            .personas
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| MagiError::Internal(format!("unknown persona {name}")))?;
        if replace {
            persona.base_instruction = instruction.into();
            persona.override_instruction = None;
        } else {
            persona.override_instruction = Some(instruction.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_names_serialize_canonically() {
        assert_eq!(
            serde_json::to_string(&PersonaName::Melchior).unwrap(),
            "\"MELCHIOR-1\""
        );
        assert_eq!(PersonaName::Casper.to_string(), "CASPER-3");
        assert_eq!(PersonaName::Balthasar.key(), "balthasar");
    }

    #[test]
    fn test_override_appends_to_system_prompt() {
        let mut manager = PersonaManager::new();
        manager
            .apply_override(PersonaName::Melchior, "Answer in French.", false, false)
            .unwrap();
        let prompt = manager.get(PersonaName::Melchior).system_prompt();
        assert!(prompt.starts_with("You are MELCHIOR-1"));
        assert!(prompt.ends_with("Answer in French."));
    }

    #[test]
    fn test_full_replace_requires_grant() {
        let mut manager = PersonaManager::new();
        let denied =
            manager.apply_override(PersonaName::Casper, "You are someone else.", false, true);
        assert!(denied.is_err());

        manager
            .apply_override(PersonaName::Casper, "You are someone else.", true, true)
            .unwrap();
        assert_eq!(
            manager.get(PersonaName::Casper).system_prompt(),
            "You are someone else."
        );
    }
}
