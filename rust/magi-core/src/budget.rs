//! Token budget enforcement for the debate context.
//!
//! The estimate is a deterministic language-aware heuristic: identical
//! input always yields the identical count, so budget decisions are
//! reproducible across runs. Reduction preserves the most recent round
//! fully; older rounds are folded into a summarizer digest, with head/tail
//! truncation as the fallback when the summarizer fails.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MagiResult;
use crate::events::Phase;
use crate::persona::PersonaName;

/// One transcript fragment subject to budgeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Author; `None` for synthetic entries such as digests.
    pub persona: Option<PersonaName>,
    /// Round the fragment belongs to (0 = thinking outputs).
    pub round: u32,
    pub content: String,
}

impl ContextEntry {
    pub fn new(persona: PersonaName, round: u32, content: impl Into<String>) -> Self {
        Self {
            persona: Some(persona),
            round,
            content: content.into(),
        }
    }
}

/// How a reduction was achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionStrategy {
    PrioritySelectionOnly,
    WithSummary,
}

/// Audit record of one budget enforcement that changed the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionLogEntry {
    pub phase: Phase,
    pub size_before: usize,
    pub size_after: usize,
    pub retain_ratio: f64,
    pub summary_applied: bool,
    pub strategy: ReductionStrategy,
}

/// Result of one enforcement pass.
#[derive(Debug, Clone)]
pub struct BudgetResult {
    pub entries: Vec<ContextEntry>,
    /// Present only when the context was reduced.
    pub reduction: Option<ReductionLogEntry>,
}

/// Compresses text into at most `target_tokens` estimated tokens.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, target_tokens: usize) -> MagiResult<String>;
}

/// Deterministic fallback summarizer: head/tail extraction, no LLM call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncatingSummarizer;

#[async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn summarize(&self, text: &str, target_tokens: usize) -> MagiResult<String> {
        Ok(truncate_to_tokens(text, target_tokens))
    }
}

/// Deterministic token estimate: ~4 ASCII characters or ~2 wide code
/// points per token, each rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let (ascii, wide) = text
        .chars()
        .fold((0usize, 0usize), |(a, w), c| {
            if c.is_ascii() {
                (a + 1, w)
            } else {
                (a, w + 1)
            }
        });
    ascii.div_ceil(4) + wide.div_ceil(2)
}

/// Total estimate across entries.
pub fn estimate_entries(entries: &[ContextEntry]) -> usize {
    entries.iter().map(|e| estimate_tokens(&e.content)).sum()
}

/// Head/tail truncation with a guaranteed estimate ≤ `target_tokens`.
fn truncate_to_tokens(text: &str, target_tokens: usize) -> String {
    const ELLIPSIS: &str = "\n[...]\n";
    if estimate_tokens(text) <= target_tokens {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    // Start from the ASCII-optimistic fit and shrink until the estimate holds.
    let mut keep = (target_tokens.saturating_mul(4)).min(chars.len());
    loop {
        if keep < 8 {
            return String::new();
        }
        let head: String = chars[..keep / 2].iter().collect();
        let tail: String = chars[chars.len() - keep / 2..].iter().collect();
        let candidate = format!("{head}{ELLIPSIS}{tail}");
        if estimate_tokens(&candidate) <= target_tokens {
            return candidate;
        }
        keep = keep * 9 / 10;
    }
}

/// Budget manager: enforcement plus the reduction audit log.
pub struct TokenBudgetManager {
    summarizer: Arc<dyn Summarizer>,
    reductions: Vec<ReductionLogEntry>,
}

impl std::fmt::Debug for TokenBudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgetManager")
            .field("reductions", &self.reductions.len())
            .finish()
    }
}

impl TokenBudgetManager {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            summarizer,
            reductions: Vec::new(),
        }
    }

    /// All reductions recorded so far, oldest first.
    pub fn reductions(&self) -> &[ReductionLogEntry] {
        &self.reductions
    }

    /// Enforce `budget` over `entries`.
    ///
    /// Guarantee: the returned entries always estimate to ≤ `budget`.
    pub async fn enforce_budget(
        &mut self,
        entries: Vec<ContextEntry>,
        budget: usize,
        phase: Phase,
    ) -> BudgetResult {
        let size_before = estimate_entries(&entries);
        if size_before <= budget {
            return BudgetResult {
                entries,
                reduction: None,
            };
        }

        let latest_round = entries.iter().map(|e| e.round).max().unwrap_or(0);
        let (latest, older): (Vec<ContextEntry>, Vec<ContextEntry>) =
            entries.into_iter().partition(|e| e.round == latest_round);

        let latest_size = estimate_entries(&latest);
        let slack = budget.saturating_sub(latest_size);

        let mut summary_applied = false;
        let mut strategy = ReductionStrategy::PrioritySelectionOnly;
        let mut kept: Vec<ContextEntry> = Vec::new();

        if !older.is_empty() && slack > 0 {
            let dropped_text = older
                .iter()
                .map(|e| e.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            match self.summarizer.summarize(&dropped_text, slack).await {
                Ok(digest) if !digest.is_empty() => {
                    let digest = truncate_to_tokens(&digest, slack);
                    kept.push(ContextEntry {
                        persona: None,
                        round: latest_round.saturating_sub(1),
                        content: digest,
                    });
                    summary_applied = true;
                    strategy = ReductionStrategy::WithSummary;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "summarizer failed; falling back to head/tail truncation"
                    );
                    let truncated = truncate_to_tokens(&dropped_text, slack);
                    if !truncated.is_empty() {
                        kept.push(ContextEntry {
                            persona: None,
                            round: latest_round.saturating_sub(1),
                            content: truncated,
                        });
                    }
                }
            }
        }

        kept.extend(latest);

        // Hard floor: a single oversized round is still cut to fit.
        let mut remaining = budget.saturating_sub(
            kept.first()
                .filter(|e| e.persona.is_none())
                .map(|e| estimate_tokens(&e.content))
                .unwrap_or(0),
        );
        for entry in kept.iter_mut().filter(|e| e.persona.is_some()) {
            let size = estimate_tokens(&entry.content);
            if size > remaining {
                entry.content = truncate_to_tokens(&entry.content, remaining);
                remaining = 0;
            } else {
                remaining -= size;
            }
        }
        kept.retain(|e| !e.content.is_empty());

        let size_after = estimate_entries(&kept);
        let entry = ReductionLogEntry {
            phase,
            size_before,
            size_after,
            retain_ratio: if size_before == 0 {
                1.0
            } else {
                size_after as f64 / size_before as f64
            },
            summary_applied,
            strategy,
        };
        tracing::info!(
            phase = %phase,
            size_before,
            size_after,
            summary_applied,
            "token budget reduced context"
        );
        self.reductions.push(entry.clone());

        BudgetResult {
            entries: kept,
            reduction: Some(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MagiError;

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _text: &str, _target: usize) -> MagiResult<String> {
            Err(MagiError::Transport("summarizer offline".into()))
        }
    }

    fn manager() -> TokenBudgetManager {
        TokenBudgetManager::new(Arc::new(TruncatingSummarizer))
    }

    fn entry(round: u32, len: usize) -> ContextEntry {
        ContextEntry::new(PersonaName::Melchior, round, "x".repeat(len))
    }

    #[test]
    fn test_estimate_is_deterministic_and_language_aware() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // Two wide code points per token.
        assert_eq!(estimate_tokens("日本語"), 2);
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), estimate_tokens("abcd"));
    }

    #[tokio::test]
    async fn test_under_budget_passes_through() {
        let mut manager = manager();
        let entries = vec![entry(0, 40), entry(1, 40)];
        let result = manager.enforce_budget(entries.clone(), 8192, Phase::Debate).await;
        assert_eq!(result.entries, entries);
        assert!(result.reduction.is_none());
        assert!(manager.reductions().is_empty());
    }

    #[tokio::test]
    async fn test_over_budget_keeps_latest_round_and_fits() {
        let mut manager = manager();
        // Round 1 alone fits; rounds 0+1 exceed a 150-token budget.
        let entries = vec![entry(0, 2000), entry(1, 400)];
        let result = manager.enforce_budget(entries, 150, Phase::Debate).await;

        assert!(estimate_entries(&result.entries) <= 150);
        // Latest round survives with its author attached.
        assert!(result
            .entries
            .iter()
            .any(|e| e.persona == Some(PersonaName::Melchior) && e.round == 1));

        let log = result.reduction.unwrap();
        assert_eq!(log.phase, Phase::Debate);
        assert!(log.summary_applied);
        assert_eq!(log.strategy, ReductionStrategy::WithSummary);
        assert!(log.retain_ratio < 1.0);
        assert_eq!(manager.reductions().len(), 1);
    }

    #[tokio::test]
    async fn test_summarizer_failure_flagged_and_still_within_budget() {
        let mut manager = TokenBudgetManager::new(Arc::new(FailingSummarizer));
        let entries = vec![entry(0, 2000), entry(1, 400)];
        let result = manager.enforce_budget(entries, 150, Phase::Debate).await;

        assert!(estimate_entries(&result.entries) <= 150);
        let log = result.reduction.unwrap();
        assert!(!log.summary_applied);
        assert_eq!(log.strategy, ReductionStrategy::PrioritySelectionOnly);
    }

    #[tokio::test]
    async fn test_single_oversized_round_is_cut_to_fit() {
        let mut manager = manager();
        let entries = vec![entry(3, 10_000)];
        let result = manager.enforce_budget(entries, 100, Phase::Debate).await;
        assert!(estimate_entries(&result.entries) <= 100);
        assert!(!result.entries.is_empty());
    }

    #[tokio::test]
    async fn test_scenario_twelve_k_under_eight_k() {
        let mut manager = manager();
        // ~12k estimated tokens of debate across two rounds.
        let entries = vec![
            entry(0, 24_000),
            ContextEntry::new(PersonaName::Balthasar, 0, "y".repeat(12_000)),
            ContextEntry::new(PersonaName::Casper, 1, "z".repeat(12_000)),
        ];
        assert!(estimate_entries(&entries) > 8192);
        let result = manager.enforce_budget(entries, 8192, Phase::Debate).await;
        assert!(estimate_entries(&result.entries) <= 8192);
        assert!(result.reduction.unwrap().summary_applied);
    }
}
