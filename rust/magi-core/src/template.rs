//! Prompt template loading with TTL cache and atomic swap.
//!
//! Templates live as `<name>.tmpl` files under the configured directory; an
//! optional sibling `<name>.schema.json` becomes the revision's schema
//! reference. A reload stages the new revision and swaps it in only on
//! success, so a broken file never evicts a serving revision.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{MagiError, MagiResult};

/// Staging deadline for one file read.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// One cached template revision.
#[derive(Debug, Clone)]
pub struct TemplateRevision {
    pub name: String,
    /// Monotonic per-name revision counter.
    pub version: u64,
    /// Path of the sibling schema file, when present.
    pub schema_ref: Option<String>,
    pub body: String,
    pub loaded_at: Instant,
    pub ttl: Duration,
}

impl TemplateRevision {
    fn is_fresh(&self) -> bool {
        self.loaded_at.elapsed() < self.ttl
    }
}

/// Reload trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    /// Reload only when the cached revision's TTL expired.
    Auto,
    /// Operator-initiated unconditional reload.
    Force,
}

/// Template loader over a directory of `.tmpl` files.
#[derive(Debug)]
pub struct TemplateLoader {
    dir: PathBuf,
    ttl: Duration,
    cache: RwLock<HashMap<String, Arc<TemplateRevision>>>,
}

impl TemplateLoader {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load a template, serving from cache while its TTL holds.
    pub async fn load(&self, name: &str) -> MagiResult<Arc<TemplateRevision>> {
        self.load_with_mode(name, ReloadMode::Auto).await
    }

    /// Load with an explicit reload mode.
    pub async fn load_with_mode(
        &self,
        name: &str,
        mode: ReloadMode,
    ) -> MagiResult<Arc<TemplateRevision>> {
        if mode == ReloadMode::Auto {
            let cache = self.cache.read();
            if let Some(revision) = cache.get(name) {
                if revision.is_fresh() {
                    return Ok(Arc::clone(revision));
                }
            }
        }

        match self.stage(name).await {
            Ok(staged) => {
                let mut cache = self.cache.write();
                let version = cache.get(name).map(|r| r.version + 1).unwrap_or(1);
                let revision = Arc::new(TemplateRevision { version, ..staged });
                cache.insert(name.to_string(), Arc::clone(&revision));
                Ok(revision)
            }
            Err(err) => {
                // A failed reload never evicts a serving revision.
                let cache = self.cache.read();
                if let Some(previous) = cache.get(name) {
                    tracing::warn!(
                        template = name,
                        error = %err,
                        "template reload failed; serving previous revision"
                    );
                    Ok(Arc::clone(previous))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Resolve the engine prompt set from the `thinking` / `debate` /
    /// `vote` templates, keeping the built-in body for any template that
    /// is missing.
    pub async fn load_prompt_set(&self) -> crate::agent::PromptSet {
        let mut prompts = crate::agent::PromptSet::default();
        for (name, slot) in [
            ("thinking", &mut prompts.thinking),
            ("debate", &mut prompts.debate),
            ("vote", &mut prompts.vote),
        ] {
            match self.load(name).await {
                Ok(revision) => *slot = revision.body.clone(),
                Err(err) => {
                    tracing::warn!(
                        template = name,
                        error = %err,
                        "prompt template unavailable; using built-in body"
                    );
                }
            }
        }
        prompts
    }

    /// Stage a revision from disk without touching the cache.
    async fn stage(&self, name: &str) -> MagiResult<TemplateRevision> {
        let path = self.dir.join(format!("{name}.tmpl"));
        let read = tokio::time::timeout(LOAD_TIMEOUT, tokio::fs::read_to_string(&path));
        let body = match read.await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => {
                return Err(MagiError::TemplateLoad {
                    name: name.to_string(),
                    reason: err.to_string(),
                })
            }
            Err(_elapsed) => {
                return Err(MagiError::TemplateLoad {
                    name: name.to_string(),
                    reason: format!("read exceeded {}s", LOAD_TIMEOUT.as_secs()),
                })
            }
        };

        let schema_path = self.dir.join(format!("{name}.schema.json"));
        let schema_ref = tokio::fs::try_exists(&schema_path)
            .await
            .unwrap_or(false)
            .then(|| schema_path.to_string_lossy().into_owned());

        Ok(TemplateRevision {
            name: name.to_string(),
            version: 0,
            schema_ref,
            body,
            loaded_at: Instant::now(),
            ttl: self.ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_template(dir: &std::path::Path, name: &str, body: &str) {
        tokio::fs::write(dir.join(format!("{name}.tmpl")), body)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_and_cache() {
        let tmp = tempfile::tempdir().unwrap();
        write_template(tmp.path(), "thinking", "Consider: {prompt}").await;

        let loader = TemplateLoader::new(tmp.path(), Duration::from_secs(300));
        let first = loader.load("thinking").await.unwrap();
        assert_eq!(first.body, "Consider: {prompt}");
        assert_eq!(first.version, 1);

        // A rewrite inside the TTL is not observed.
        write_template(tmp.path(), "thinking", "changed").await;
        let second = loader.load("thinking").await.unwrap();
        assert_eq!(second.body, "Consider: {prompt}");
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn test_force_reload_bumps_version() {
        let tmp = tempfile::tempdir().unwrap();
        write_template(tmp.path(), "vote", "v1").await;

        let loader = TemplateLoader::new(tmp.path(), Duration::from_secs(300));
        loader.load("vote").await.unwrap();

        write_template(tmp.path(), "vote", "v2").await;
        let reloaded = loader.load_with_mode("vote", ReloadMode::Force).await.unwrap();
        assert_eq!(reloaded.body, "v2");
        assert_eq!(reloaded.version, 2);
    }

    #[tokio::test]
    async fn test_failed_reload_preserves_previous_revision() {
        let tmp = tempfile::tempdir().unwrap();
        write_template(tmp.path(), "debate", "round prompt").await;

        let loader = TemplateLoader::new(tmp.path(), Duration::from_secs(300));
        loader.load("debate").await.unwrap();

        tokio::fs::remove_file(tmp.path().join("debate.tmpl"))
            .await
            .unwrap();
        let served = loader.load_with_mode("debate", ReloadMode::Force).await.unwrap();
        assert_eq!(served.body, "round prompt");
        assert_eq!(served.version, 1);
    }

    #[tokio::test]
    async fn test_missing_template_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = TemplateLoader::new(tmp.path(), Duration::from_secs(300));
        let err = loader.load("absent").await.unwrap_err();
        assert!(matches!(err, MagiError::TemplateLoad { .. }));
    }

    #[tokio::test]
    async fn test_prompt_set_mixes_loaded_and_builtin() {
        let tmp = tempfile::tempdir().unwrap();
        write_template(tmp.path(), "vote", "Custom ballot prompt: {context}").await;

        let loader = TemplateLoader::new(tmp.path(), Duration::from_secs(300));
        let prompts = loader.load_prompt_set().await;
        assert_eq!(prompts.vote, "Custom ballot prompt: {context}");
        // Missing templates fall back to the built-in bodies.
        assert!(prompts.thinking.contains("{prompt}"));
    }

    #[tokio::test]
    async fn test_schema_ref_detected() {
        let tmp = tempfile::tempdir().unwrap();
        write_template(tmp.path(), "vote", "ballot").await;
        tokio::fs::write(tmp.path().join("vote.schema.json"), "{}")
            .await
            .unwrap();

        let loader = TemplateLoader::new(tmp.path(), Duration::from_secs(300));
        let revision = loader.load("vote").await.unwrap();
        assert!(revision.schema_ref.as_ref().unwrap().ends_with("vote.schema.json"));
    }
}
