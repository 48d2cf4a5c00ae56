//! Failure diagnosis for scheduled tasks.
//!
//! Classifies the current error together with the recent run history into
//! one of six patterns that drive the auto-recovery policy. Error
//! comparison is prefix-normalized: first line, capped at 80 characters,
//! so stack traces with identical heads compare equal.

use super::{RunStatus, TaskRunLog};
use crate::util::error_prefix;

const PREFIX_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePattern {
    /// The task's chat no longer exists.
    Orphaned,
    /// Upstream throttling; always backs off at the top rung.
    RateLimited,
    Timeout,
    /// The same error keeps recurring.
    Persistent,
    /// Repeated but varying failures.
    Transient,
    Unknown,
}

impl FailurePattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orphaned => "orphaned",
            Self::RateLimited => "rate-limited",
            Self::Timeout => "timeout",
            Self::Persistent => "persistent",
            Self::Transient => "transient",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub pattern: FailurePattern,
    /// One-line human-readable diagnosis.
    pub summary: String,
    /// What the engine (or the user) should do about it.
    pub recommendation: String,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify the current failure given the last few run logs.
pub fn classify(error: &str, recent: &[TaskRunLog]) -> Diagnosis {
    let lowered = error.to_lowercase();

    if contains_any(&lowered, &["group not found", "chat not found"]) {
        return Diagnosis {
            pattern: FailurePattern::Orphaned,
            summary: "The task's chat no longer exists.".into(),
            recommendation: "Deactivating the task; re-register the chat and create it again."
                .into(),
        };
    }

    if contains_any(
        &lowered,
        &["rate limit", "429", "too many requests", "api error"],
    ) {
        return Diagnosis {
            pattern: FailurePattern::RateLimited,
            summary: "The task is being rate-limited upstream.".into(),
            recommendation: "Retrying with maximum backoff.".into(),
        };
    }

    if contains_any(&lowered, &["timeout", "timed out", "idle timeout"]) {
        return Diagnosis {
            pattern: FailurePattern::Timeout,
            summary: "The task run timed out.".into(),
            recommendation: "Retrying; consider increasing the task idle timeout.".into(),
        };
    }

    let current_prefix = error_prefix(&lowered, PREFIX_LEN);
    let recent_error_prefixes: Vec<String> = recent
        .iter()
        .filter(|run| run.status == RunStatus::Error)
        .filter_map(|run| run.error.as_deref())
        .map(|e| error_prefix(&e.to_lowercase(), PREFIX_LEN))
        .collect();

    let identical = recent_error_prefixes
        .iter()
        .filter(|p| **p == current_prefix)
        .count();
    if identical >= 2 {
        return Diagnosis {
            pattern: FailurePattern::Persistent,
            summary: "The task keeps failing with the same error.".into(),
            recommendation: "Pausing the task; fix the underlying problem, then resume it.".into(),
        };
    }

    if recent_error_prefixes.len() >= 2 {
        return Diagnosis {
            pattern: FailurePattern::Transient,
            summary: "The task has failed repeatedly with varying errors.".into(),
            recommendation: "Retrying with backoff.".into(),
        };
    }

    Diagnosis {
        pattern: FailurePattern::Unknown,
        summary: "The task failed.".into(),
        recommendation: "Retrying with backoff.".into(),
    }
}
