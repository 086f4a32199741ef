//! Write policies, execution status, and per-run outcome counters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coercion::{ErrorKind, ValidationError};
use crate::error::CoreError;

/// Default cap on sampled row errors kept in counters and summaries.
pub const DEFAULT_MAX_ERROR_SAMPLES: usize = 100;

// ── Write policy ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    #[default]
    CreateOnly,
    UpdateOnly,
    Upsert,
}

impl WritePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateOnly => "create_only",
            Self::UpdateOnly => "update_only",
            Self::Upsert => "upsert",
        }
    }

    /// Policies that match rows against existing records by business key.
    pub fn requires_business_key(&self) -> bool {
        !matches!(self, Self::CreateOnly)
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `create_only`, `createOnly`, and `create-only` spellings.
impl FromStr for WritePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match folded.as_str() {
            "createonly" => Ok(Self::CreateOnly),
            "updateonly" => Ok(Self::UpdateOnly),
            "upsert" => Ok(Self::Upsert),
            _ => Err(CoreError::Validation(format!(
                "Unknown write policy '{s}'. Must be one of: create_only, update_only, upsert"
            ))),
        }
    }
}

// ── Status / state ───────────────────────────────────────────────────

/// Caller-visible result of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    CompletedWithErrors,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call executor state: `Validating -> Writing -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    Validating,
    Writing,
    Committed,
    PartiallyFailed,
    Failed,
}

impl WriteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Writing => "writing",
            Self::Committed => "committed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::PartiallyFailed | Self::Failed)
    }

    /// Terminal state for a finished call.
    pub fn terminal_for(counters: &WriteOutcomeCounters) -> Self {
        if counters.aborted || (counters.succeeded() == 0 && counters.rejected() > 0) {
            Self::Failed
        } else if counters.rejected() > 0 {
            Self::PartiallyFailed
        } else {
            Self::Committed
        }
    }
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Counters ─────────────────────────────────────────────────────────

/// One sampled row failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    /// 1-based data row number within the file.
    pub row_number: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl RowError {
    pub fn from_validation(row_number: usize, error: &ValidationError) -> Self {
        Self {
            row_number,
            field: Some(error.field.clone()),
            kind: error.kind,
            message: error.message.clone(),
            value: error.value.clone(),
        }
    }

    /// A row-level error not tied to a single field.
    pub fn row(row_number: usize, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            row_number,
            field: None,
            kind,
            message: message.into(),
            value: None,
        }
    }
}

/// Aggregated outcome of one or more executor calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcomeCounters {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Rows never attempted because an earlier chunk aborted the run.
    pub unprocessed: usize,
    pub error_counts: BTreeMap<ErrorKind, usize>,
    /// Bounded sample of row errors, in file order.
    pub errors: Vec<RowError>,
    pub aborted: bool,
    pub elapsed_secs: f64,
    pub rows_per_second: f64,
    #[serde(skip)]
    max_errors: usize,
}

impl Default for WriteOutcomeCounters {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERROR_SAMPLES)
    }
}

impl WriteOutcomeCounters {
    pub fn new(max_errors: usize) -> Self {
        Self {
            created: 0,
            updated: 0,
            failed: 0,
            skipped: 0,
            unprocessed: 0,
            error_counts: BTreeMap::new(),
            errors: Vec::new(),
            aborted: false,
            elapsed_secs: 0.0,
            rows_per_second: 0.0,
            max_errors,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated
    }

    pub fn rejected(&self) -> usize {
        self.failed + self.skipped + self.unprocessed
    }

    /// Rows that reached a final outcome.
    pub fn processed(&self) -> usize {
        self.created + self.updated + self.failed + self.skipped
    }

    /// Record one rejected row. `skip` selects `skipped` over `failed`.
    /// Each error counts in the histogram; the row counts once.
    pub fn reject_row(&mut self, errors: Vec<RowError>, skip: bool) {
        if skip {
            self.skipped += 1;
        } else {
            self.failed += 1;
        }
        for error in errors {
            *self.error_counts.entry(error.kind).or_insert(0) += 1;
            if self.errors.len() < self.max_errors {
                self.errors.push(error);
            }
        }
    }

    pub fn mark_unprocessed(&mut self, rows: usize) {
        self.unprocessed += rows;
        if rows > 0 {
            self.aborted = true;
        }
    }

    /// Fold another call's counters into this one.
    pub fn merge(&mut self, other: WriteOutcomeCounters) {
        self.created += other.created;
        self.updated += other.updated;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.unprocessed += other.unprocessed;
        for (kind, count) in other.error_counts {
            *self.error_counts.entry(kind).or_insert(0) += count;
        }
        let room = self.max_errors.saturating_sub(self.errors.len());
        self.errors.extend(other.errors.into_iter().take(room));
        self.aborted |= other.aborted;
        self.elapsed_secs += other.elapsed_secs;
        self.rows_per_second = throughput(self.processed(), self.elapsed_secs);
    }

    /// Stamp timing and derived throughput.
    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
        self.rows_per_second = throughput(self.processed(), self.elapsed_secs);
    }

    pub fn status(&self) -> ExecutionStatus {
        if self.aborted {
            ExecutionStatus::Failed
        } else if self.rejected() == 0 {
            ExecutionStatus::Completed
        } else if self.succeeded() == 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::CompletedWithErrors
        }
    }
}

fn throughput(rows: usize, secs: f64) -> f64 {
    if secs > 0.0 {
        rows as f64 / secs
    } else {
        0.0
    }
}

/// Caller-facing result of `execute` across all batches of a session.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    pub entity: String,
    pub write_policy: WritePolicy,
    pub skip_errors: bool,
    pub total_rows: usize,
    pub batch_size: usize,
    pub total_batches: usize,
    pub batches_processed: usize,
    pub aborted: bool,
    pub counters: WriteOutcomeCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_error(row: usize, kind: ErrorKind) -> RowError {
        RowError::row(row, kind, "boom")
    }

    // -- policy parsing --

    #[test]
    fn policy_accepts_all_spellings() {
        for s in ["create_only", "createOnly", "create-only", "CREATE_ONLY"] {
            assert_eq!(s.parse::<WritePolicy>().unwrap(), WritePolicy::CreateOnly);
        }
        assert_eq!("updateOnly".parse::<WritePolicy>().unwrap(), WritePolicy::UpdateOnly);
        assert_eq!("upsert".parse::<WritePolicy>().unwrap(), WritePolicy::Upsert);
        assert!("merge".parse::<WritePolicy>().is_err());
    }

    #[test]
    fn default_policy_is_create_only() {
        assert_eq!(WritePolicy::default(), WritePolicy::CreateOnly);
        assert!(!WritePolicy::CreateOnly.requires_business_key());
        assert!(WritePolicy::Upsert.requires_business_key());
    }

    // -- counters --

    #[test]
    fn reject_row_counts_row_once() {
        let mut c = WriteOutcomeCounters::default();
        c.reject_row(
            vec![
                make_error(1, ErrorKind::InvalidChoice),
                make_error(1, ErrorKind::StringTooLong),
            ],
            true,
        );
        assert_eq!(c.skipped, 1);
        assert_eq!(c.failed, 0);
        assert_eq!(c.error_counts[&ErrorKind::InvalidChoice], 1);
        assert_eq!(c.error_counts[&ErrorKind::StringTooLong], 1);
        assert_eq!(c.errors.len(), 2);
    }

    #[test]
    fn error_sample_is_bounded() {
        let mut c = WriteOutcomeCounters::new(2);
        for row in 1..=5 {
            c.reject_row(vec![make_error(row, ErrorKind::DuplicateKey)], false);
        }
        assert_eq!(c.failed, 5);
        assert_eq!(c.errors.len(), 2);
        assert_eq!(c.error_counts[&ErrorKind::DuplicateKey], 5);
    }

    #[test]
    fn merge_adds_up() {
        let mut a = WriteOutcomeCounters::default();
        a.created = 3;
        a.reject_row(vec![make_error(4, ErrorKind::DuplicateKey)], true);
        let mut b = WriteOutcomeCounters::default();
        b.updated = 2;
        b.reject_row(vec![make_error(9, ErrorKind::DuplicateKey)], true);
        a.merge(b);
        assert_eq!(a.created, 3);
        assert_eq!(a.updated, 2);
        assert_eq!(a.skipped, 2);
        assert_eq!(a.error_counts[&ErrorKind::DuplicateKey], 2);
    }

    #[test]
    fn throughput_from_elapsed() {
        let mut c = WriteOutcomeCounters::default();
        c.created = 50;
        c.finish(Duration::from_secs(2));
        assert_eq!(c.rows_per_second, 25.0);
    }

    // -- status --

    #[test]
    fn status_distinguishes_outcomes() {
        let mut c = WriteOutcomeCounters::default();
        c.created = 2;
        assert_eq!(c.status(), ExecutionStatus::Completed);

        c.reject_row(vec![make_error(3, ErrorKind::DuplicateKey)], true);
        assert_eq!(c.status(), ExecutionStatus::CompletedWithErrors);

        c.mark_unprocessed(10);
        assert_eq!(c.status(), ExecutionStatus::Failed);
        assert!(c.aborted);
    }

    #[test]
    fn nothing_succeeded_is_failed() {
        let mut c = WriteOutcomeCounters::default();
        c.reject_row(vec![make_error(1, ErrorKind::InvalidBoolean)], true);
        assert_eq!(c.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn empty_run_is_completed() {
        assert_eq!(WriteOutcomeCounters::default().status(), ExecutionStatus::Completed);
    }

    #[test]
    fn terminal_write_state() {
        let mut c = WriteOutcomeCounters::default();
        c.created = 1;
        assert_eq!(WriteState::terminal_for(&c), WriteState::Committed);
        c.reject_row(vec![make_error(2, ErrorKind::DuplicateKey)], true);
        assert_eq!(WriteState::terminal_for(&c), WriteState::PartiallyFailed);
        c.aborted = true;
        assert_eq!(WriteState::terminal_for(&c), WriteState::Failed);
    }
}
