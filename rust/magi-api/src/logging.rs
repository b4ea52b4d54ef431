//! Logging helpers for server startup and session lifecycle.

use std::time::Instant;

use uuid::Uuid;

use magi_core::events::Phase;

/// One numbered step of the startup sequence.
///
/// Logs a debug line when the step begins and the `[n/total]` summary line
/// with its duration when it completes.
#[derive(Debug)]
pub struct InitStep {
    index: usize,
    total: usize,
    name: &'static str,
    start: Instant,
}

impl InitStep {
    #[must_use]
    pub fn begin(index: usize, total: usize, name: &'static str) -> Self {
        tracing::debug!(step = index, total, name, "init step started");
        Self {
            index,
            total,
            name,
            start: Instant::now(),
        }
    }

    /// Complete the step with its one-line summary.
    pub fn done(self, detail: impl std::fmt::Display) {
        tracing::info!(
            step = self.index,
            total = self.total,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "[{}/{}] {} - {}",
            self.index,
            self.total,
            self.name,
            detail
        );
    }
}

/// Wall-clock timer for one deliberation.
///
/// Started when the session task begins driving its engine and finished
/// with the terminal phase, so every session leaves one summary line
/// keyed by its id.
#[derive(Debug)]
pub struct DeliberationTimer {
    session_id: Uuid,
    start: Instant,
}

impl DeliberationTimer {
    #[must_use]
    pub fn start(session_id: Uuid) -> Self {
        Self {
            session_id,
            start: Instant::now(),
        }
    }

    /// Record the terminal phase and total duration.
    pub fn finish(self, phase: Phase) {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        match phase {
            Phase::Resolved => tracing::info!(
                session_id = %self.session_id,
                duration_ms,
                "deliberation resolved"
            ),
            Phase::Cancelled => tracing::info!(
                session_id = %self.session_id,
                duration_ms,
                "deliberation cancelled"
            ),
            _ => tracing::warn!(
                session_id = %self.session_id,
                duration_ms,
                phase = %phase,
                "deliberation ended abnormally"
            ),
        }
    }
}
