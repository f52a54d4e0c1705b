//! Diagnostic stream: errors, warnings and info text tagged with the stage and
//! phase they came from.
//!
//! The stream is passed by reference into every lifecycle call. The chain
//! never decides on its own whether diagnostics stop the pipeline; each phase
//! boundary checks [`DiagnosticSink::has_errors`] explicitly.

use crate::pipeline::phase::Phase;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Name of the originating stage; empty for engine-level messages.
    pub stage: String,
    pub phase: Option<Phase>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        stage: impl Into<String>,
        phase: Option<Phase>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            stage: stage.into(),
            phase,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(stage: impl Into<String>, phase: Phase, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, stage, Some(phase), message)
    }

    pub fn warning(stage: impl Into<String>, phase: Phase, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, stage, Some(phase), message)
    }

    pub fn info(stage: impl Into<String>, phase: Phase, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, stage, Some(phase), message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.stage.is_empty(), self.phase) {
            (false, Some(phase)) => write!(f, "{}::{}: {}", self.stage, phase, self.message),
            (false, None) => write!(f, "{}: {}", self.stage, self.message),
            (true, Some(phase)) => write!(f, "{}: {}", phase, self.message),
            (true, None) => f.write_str(&self.message),
        }
    }
}

/// Receiver of diagnostics.
#[cfg_attr(test, mockall::automock)]
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);

    /// Number of error-severity entries since the last [`clear`](Self::clear).
    fn error_count(&self) -> usize;

    fn clear(&mut self);

    fn has_errors(&self) -> bool {
        self.error_count() > 0
    }
}

/// In-memory diagnostic stream that also mirrors every entry to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticLog {
    entries: Vec<Diagnostic>,
    errors: usize,
    /// Running count of errors ever reported, not reset by `clear`.
    total_errors: u64,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.with_severity(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.with_severity(Severity::Warning)
    }

    pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.severity == severity)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    /// Take all entries, leaving the log empty.
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        self.errors = 0;
        std::mem::take(&mut self.entries)
    }
}

impl DiagnosticSink for DiagnosticLog {
    fn report(&mut self, diagnostic: Diagnostic) {
        let phase = diagnostic.phase.map(|p| p.as_str()).unwrap_or("");
        match diagnostic.severity {
            Severity::Error => {
                self.errors += 1;
                self.total_errors += 1;
                tracing::error!(stage = %diagnostic.stage, phase, "{}", diagnostic.message);
            }
            Severity::Warning => {
                tracing::warn!(stage = %diagnostic.stage, phase, "{}", diagnostic.message);
            }
            Severity::Info => {
                tracing::info!(stage = %diagnostic.stage, phase, "{}", diagnostic.message);
            }
        }
        self.entries.push(diagnostic);
    }

    fn error_count(&self) -> usize {
        self.errors
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.errors = 0;
    }
}
