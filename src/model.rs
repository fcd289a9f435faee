use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Untyped record as produced by a source connector or file parser,
/// before the row processor normalizes it.
pub type RawRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    Import,
    Export,
    Promote,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Export => "export",
            JobKind::Promote => "promote",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "import" => Some(JobKind::Import),
            "export" => Some(JobKind::Export),
            "promote" => Some(JobKind::Promote),
            _ => None,
        }
    }

    /// Imports pause at VALIDATED for a human review of row-level errors.
    /// Exports and promotions have nothing to review; they run straight
    /// from the planning pass into commit.
    pub fn requires_approval(&self) -> bool {
        matches!(self, JobKind::Import)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Validating,
    Validated,
    Committing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Validating => "VALIDATING",
            JobStatus::Validated => "VALIDATED",
            JobStatus::Committing => "COMMITTING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "VALIDATING" => Some(JobStatus::Validating),
            "VALIDATED" => Some(JobStatus::Validated),
            "COMMITTING" => Some(JobStatus::Committing),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Status transitions are monotonic; cancellation is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobStatus::Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Validating)
                | (JobStatus::Validating, JobStatus::Validated)
                | (JobStatus::Validating, JobStatus::Failed)
                | (JobStatus::Validated, JobStatus::Committing)
                | (JobStatus::Committing, JobStatus::Completed)
                | (JobStatus::Committing, JobStatus::Failed)
        )
    }
}

/// Identity of a data source writing catalog fields: manual entry in the
/// dashboard, or one of the connected integrations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceId {
    Manual,
    Integration(String),
}

impl SourceId {
    pub fn encode(&self) -> String {
        match self {
            SourceId::Manual => "manual".to_string(),
            SourceId::Integration(id) => format!("integration:{}", id),
        }
    }

    pub fn parse_source(s: &str) -> Option<Self> {
        if s == "manual" {
            return Some(SourceId::Manual);
        }
        s.strip_prefix("integration:")
            .filter(|id| !id.is_empty())
            .map(|id| SourceId::Integration(id.to_string()))
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, SourceId::Manual)
    }
}

impl Serialize for SourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for SourceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SourceId::parse_source(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid source id: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Structural,
    MissingField,
    InvalidValue,
    UnknownReference,
    Duplicate,
    OwnershipConflict,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Structural => "structural",
            FailureKind::MissingField => "missing_field",
            FailureKind::InvalidValue => "invalid_value",
            FailureKind::UnknownReference => "unknown_reference",
            FailureKind::Duplicate => "duplicate",
            FailureKind::OwnershipConflict => "ownership_conflict",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "structural" => Some(FailureKind::Structural),
            "missing_field" => Some(FailureKind::MissingField),
            "invalid_value" => Some(FailureKind::InvalidValue),
            "unknown_reference" => Some(FailureKind::UnknownReference),
            "duplicate" => Some(FailureKind::Duplicate),
            "ownership_conflict" => Some(FailureKind::OwnershipConflict),
            _ => None,
        }
    }

    /// Duplicates supersede an earlier row but do not fail it; a skipped
    /// conflicting field leaves the rest of the row committed.
    pub fn default_severity(&self) -> FailureSeverity {
        match self {
            FailureKind::Duplicate => FailureSeverity::Warning,
            FailureKind::OwnershipConflict => FailureSeverity::Note,
            _ => FailureSeverity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    Error,
    Warning,
    Note,
}

impl FailureSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureSeverity::Error => "error",
            FailureSeverity::Warning => "warning",
            FailureSeverity::Note => "note",
        }
    }

    pub fn parse_severity(s: &str) -> Option<Self> {
        match s {
            "error" => Some(FailureSeverity::Error),
            "warning" => Some(FailureSeverity::Warning),
            "note" => Some(FailureSeverity::Note),
            _ => None,
        }
    }
}

/// Row-level failure entry attributed to a 1-based source row index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFailure {
    pub row_index: i64,
    pub column: String,
    pub kind: FailureKind,
    pub severity: FailureSeverity,
    pub message: String,
}

impl RowFailure {
    pub fn new(row_index: i64, column: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            row_index,
            column: column.to_string(),
            kind,
            severity: kind.default_severity(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub brand_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub processed: i64,
    pub total: i64,
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
    pub message: String,
    pub source_id: SourceId,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            kind: self.kind,
            status: self.status,
            processed: self.processed,
            total: self.total,
            created: self.created,
            updated: self.updated,
            failed: self.failed,
            message: self.message.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Status snapshot delivered to observers. Identical in shape to the
/// status-query response, so a missed event is always recoverable by
/// re-fetching the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub processed: i64,
    pub total: i64,
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Permitted value kinds for opaque per-entity attributes. Anything else
/// is rejected at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttrValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Created,
    Updated,
    Skipped,
    Failed,
}

/// Result of processing one input row; consumed within a single chunk.
#[derive(Debug, Clone)]
pub struct RowReport {
    pub row_index: i64,
    pub outcome: RowOutcome,
    pub failures: Vec<RowFailure>,
}

impl RowReport {
    pub fn has_errors(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.severity == FailureSeverity::Error)
    }
}
