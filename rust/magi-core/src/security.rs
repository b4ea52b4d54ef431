//! Prompt sanitization.
//!
//! Runs after the guardrail chain. Normalizes control sequences, then masks
//! fragments matching the forbidden pattern set. Detection is always
//! recorded: an empty scan still yields the `none` sentinel so downstream
//! audit rows never have to special-case absence.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Replacement written into the sanitized text. Fixed 8 characters.
const MASK_TOKEN: &str = "********";

/// Width of recorded snippets in code points.
const SNIPPET_WIDTH: usize = 32;

/// A forbidden pattern: stable id plus compiled regex.
#[derive(Debug, Clone)]
pub struct ForbiddenPattern {
    pub id: &'static str,
    pub regex: Regex,
}

static DEFAULT_PATTERNS: Lazy<Vec<ForbiddenPattern>> = Lazy::new(|| {
    let compile = |id: &'static str, pattern: &str| ForbiddenPattern {
        id,
        regex: Regex::new(pattern).expect("invalid forbidden pattern"),
    };
    vec![
        compile("api_key", r"\bsk-[A-Za-z0-9_-]{16,}\b"),
        compile("aws_access_key", r"\bAKIA[0-9A-Z]{16}\b"),
        compile("bearer_token", r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]{16,}"),
        compile(
            "password_assignment",
            r#"(?i)\b(password|passwd|secret)\s*[:=]\s*\S+"#,
        ),
        compile(
            "private_key_block",
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
        ),
    ]
});

/// One detection record. `count == 0` only for the `none` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternHit {
    pub pattern_id: String,
    pub count: usize,
}

/// One redaction: the recorded snippet and the token written in its place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redaction {
    /// Snippet of the removed fragment, padded/truncated to 32 code points.
    pub snippet: String,
    /// Replacement token placed in the sanitized text.
    pub replacement: String,
}

/// Result of one sanitization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedResult {
    pub sanitized_text: String,
    pub redaction_map: Vec<Redaction>,
    /// Never empty: the `{none, 0}` sentinel stands in for "no detections".
    pub removed_patterns: Vec<PatternHit>,
    pub original_length: usize,
}

/// Prompt sanitizer over a fixed forbidden-pattern set.
#[derive(Debug, Clone)]
pub struct SecurityFilter {
    patterns: Vec<ForbiddenPattern>,
    hash_replacements: bool,
}

impl Default for SecurityFilter {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SecurityFilter {
    /// Build with the default pattern set. `hash_replacements` switches the
    /// mask token to a `masked:sha256:<first-8-hex>` form.
    pub fn new(hash_replacements: bool) -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.clone(),
            hash_replacements,
        }
    }

    /// Build with a custom pattern set.
    pub fn with_patterns(patterns: Vec<ForbiddenPattern>, hash_replacements: bool) -> Self {
        Self {
            patterns,
            hash_replacements,
        }
    }

    /// Sanitize a prompt: normalize, neutralize control sequences, mask
    /// forbidden fragments.
    pub fn sanitize(&self, text: &str) -> SanitizedResult {
        let original_length = text.chars().count();

        let mut sanitized = normalize(text);
        let mut redaction_map = Vec::new();
        let mut removed_patterns = Vec::new();

        for pattern in &self.patterns {
            let mut count = 0usize;
            let hash_mode = self.hash_replacements;
            let replaced = pattern
                .regex
                .replace_all(&sanitized, |caps: &regex::Captures<'_>| {
                    let fragment = &caps[0];
                    let replacement = if hash_mode {
                        hashed_token(fragment)
                    } else {
                        MASK_TOKEN.to_string()
                    };
                    redaction_map.push(Redaction {
                        snippet: snippet_of(fragment),
                        replacement: replacement.clone(),
                    });
                    count += 1;
                    replacement
                })
                .into_owned();
            if count > 0 {
                sanitized = replaced;
                removed_patterns.push(PatternHit {
                    pattern_id: pattern.id.to_string(),
                    count,
                });
                tracing::debug!(
                    pattern_id = pattern.id,
                    count,
                    "security filter masked fragments"
                );
            }
        }

        if removed_patterns.is_empty() {
            removed_patterns.push(PatternHit {
                pattern_id: "none".to_string(),
                count: 0,
            });
        }

        SanitizedResult {
            sanitized_text: sanitized,
            redaction_map,
            removed_patterns,
            original_length,
        }
    }
}

/// NFC-normalize, collapse `\r\n` to `\n`, strip NUL and zero-width
/// characters.
fn normalize(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let unified = nfc.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{0000}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}'
            )
        })
        .collect()
}

/// Record a fragment at a fixed 32-code-point width.
fn snippet_of(fragment: &str) -> String {
    let mut chars: Vec<char> = fragment.chars().take(SNIPPET_WIDTH).collect();
    while chars.len() < SNIPPET_WIDTH {
        chars.push(' ');
    }
    chars.into_iter().collect()
}

/// `masked:sha256:<first-8-hex>` replacement token.
fn hashed_token(fragment: &str) -> String {
    let digest = Sha256::digest(fragment.as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("masked:sha256:{hex}")
}
