//! Audit execution records: audits, per-chunk results, flags, citations,
//! reviewer questions, and compliance score snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Audit state machine.
///
/// The only legal transitions are `queued → running`,
/// `running → completed | failed`, and `failed → running` on an explicit
/// resume. `completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Created, waiting for the runner.
    Queued,
    /// Being processed chunk-by-chunk.
    Running,
    /// All chunks analyzed; score snapshot attempted.
    Completed,
    /// Terminal error; completed chunks remain durable.
    Failed,
}

impl AuditStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the runner may pick this audit up.
    #[must_use]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// One audit execution against one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    /// Surrogate id (assigned by the storage layer).
    pub id: Option<i64>,
    /// Opaque stable identifier.
    pub external_id: String,
    /// Audited document surrogate id.
    pub document_id: i64,
    /// Current state.
    pub status: AuditStatus,
    /// Reduced-cost execution mode: at most 5 chunks, no sequential
    /// neighbors, halved budgets, no refinement.
    pub is_draft: bool,
    /// Total chunks of the audited document.
    pub chunk_total: i64,
    /// Chunks with a durable result. Invariant: `0 <= completed <= total`.
    pub chunk_completed: i64,
    /// External id of the most recently completed chunk.
    pub last_chunk_id: Option<String>,
    /// Set on the first transition to running.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the transition to completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set on the transition to failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Human-readable failure reason, at most 500 characters.
    pub failure_reason: Option<String>,
}

impl Audit {
    /// Creates a queued audit for a document.
    #[must_use]
    pub fn new(document_id: i64, is_draft: bool) -> Self {
        Self {
            id: None,
            external_id: Uuid::new_v4().simple().to_string(),
            document_id,
            status: AuditStatus::Queued,
            is_draft,
            chunk_total: 0,
            chunk_completed: 0,
            last_chunk_id: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            failure_reason: None,
        }
    }

    /// Pending chunk count from the progress counters.
    #[must_use]
    pub const fn remaining(&self) -> i64 {
        self.chunk_total - self.chunk_completed
    }

    /// Sets a failure reason truncated to 500 characters.
    pub fn set_failure_reason(&mut self, reason: &str) {
        let truncated = if reason.len() > 500 {
            let cut = crate::core::chunk::preview(reason, 497);
            format!("{cut}...")
        } else {
            reason.to_string()
        };
        self.failure_reason = Some(truncated);
    }
}

/// Per-(audit, chunk) analysis record. Unique on `(audit_id, chunk_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditChunkResult {
    /// Surrogate id.
    pub id: Option<i64>,
    /// Owning audit.
    pub audit_id: i64,
    /// External chunk id.
    pub chunk_id: String,
    /// Chunk position within the document.
    pub chunk_index: i64,
    /// Result status; always `completed` for persisted rows.
    pub status: String,
    /// Normalized analysis JSON, augmented with a `context_summary`.
    pub analysis: Value,
    /// Total tokens of the context bundle used.
    pub context_token_count: Option<i64>,
}

/// Compliance classification of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlagClass {
    /// Serious compliance violation or confirmed missing mandatory content.
    Red,
    /// Minor issue or ambiguity needing clarification.
    Yellow,
    /// Compliant.
    Green,
}

impl FlagClass {
    /// Database and wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Red => "RED",
            Self::Yellow => "YELLOW",
            Self::Green => "GREEN",
        }
    }

    /// Parses a case-insensitive representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "RED" => Some(Self::Red),
            "YELLOW" => Some(Self::Yellow),
            "GREEN" => Some(Self::Green),
            _ => None,
        }
    }

    /// Derives a class from a severity score when the analysis supplied
    /// no usable flag: >= 80 RED, >= 50 YELLOW, else GREEN.
    #[must_use]
    pub const fn from_severity(severity: i64) -> Self {
        if severity >= 80 {
            Self::Red
        } else if severity >= 50 {
            Self::Yellow
        } else {
            Self::Green
        }
    }
}

/// One flag per (audit, chunk). Unique on `(audit_id, chunk_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    /// Surrogate id.
    pub id: Option<i64>,
    /// Owning audit.
    pub audit_id: i64,
    /// External chunk id.
    pub chunk_id: String,
    /// Classification.
    pub class: FlagClass,
    /// Severity 0-100.
    pub severity_score: i64,
    /// Findings text; never empty.
    pub findings: String,
    /// Identified gaps.
    pub gaps: Vec<String>,
    /// Remediation recommendations.
    pub recommendations: Vec<String>,
    /// Free-form analysis metadata (refinement markers and the like).
    pub analysis_metadata: Value,
    /// Creation time, used by the score walk ordering.
    pub created_at: DateTime<Utc>,
}

/// Citation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationKind {
    /// A manual section reference.
    Manual,
    /// A regulation section reference.
    Regulation,
}

impl CitationKind {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Regulation => "regulation",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "regulation" => Some(Self::Regulation),
            _ => None,
        }
    }
}

/// A citation owned by a flag. Citations are rewritten wholesale on each
/// flag upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// Surrogate id.
    pub id: Option<i64>,
    /// Owning flag.
    pub flag_id: i64,
    /// Manual or regulation.
    pub kind: CitationKind,
    /// The cited reference string.
    pub reference: String,
}

/// A prioritized reviewer question for one regulation reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorQuestion {
    /// Surrogate id.
    pub id: Option<i64>,
    /// Owning audit.
    pub audit_id: i64,
    /// Regulation reference this question belongs to.
    pub regulation_reference: String,
    /// Question text.
    pub question_text: String,
    /// 1 = highest priority, 10 = lowest.
    pub priority: i64,
    /// Why the question matters.
    pub rationale: Option<String>,
    /// Flags that motivated the question.
    pub related_flag_ids: Vec<i64>,
}

/// Per-audit compliance score snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceScore {
    /// Surrogate id.
    pub id: Option<i64>,
    /// Owning audit.
    pub audit_id: i64,
    /// Overall score 0-100.
    pub overall_score: f64,
    /// RED flag count.
    pub red_count: i64,
    /// YELLOW flag count.
    pub yellow_count: i64,
    /// GREEN flag count.
    pub green_count: i64,
    /// Total flags considered.
    pub total_flags: i64,
    /// Snapshot time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_status_round_trip() {
        for status in [
            AuditStatus::Queued,
            AuditStatus::Running,
            AuditStatus::Completed,
            AuditStatus::Failed,
        ] {
            assert_eq!(AuditStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AuditStatus::parse("paused"), None);
    }

    #[test]
    fn test_audit_status_runnable() {
        assert!(AuditStatus::Queued.is_runnable());
        assert!(AuditStatus::Running.is_runnable());
        assert!(!AuditStatus::Completed.is_runnable());
        assert!(!AuditStatus::Failed.is_runnable());
    }

    #[test]
    fn test_audit_new() {
        let audit = Audit::new(7, true);
        assert_eq!(audit.document_id, 7);
        assert!(audit.is_draft);
        assert_eq!(audit.status, AuditStatus::Queued);
        assert_eq!(audit.remaining(), 0);
    }

    #[test]
    fn test_failure_reason_truncated_to_500() {
        let mut audit = Audit::new(1, false);
        let long = "x".repeat(600);
        audit.set_failure_reason(&long);
        let reason = audit.failure_reason.unwrap();
        assert_eq!(reason.len(), 500);
        assert!(reason.ends_with("..."));
    }

    #[test]
    fn test_failure_reason_short_untouched() {
        let mut audit = Audit::new(1, false);
        audit.set_failure_reason("boom");
        assert_eq!(audit.failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_flag_class_parse() {
        assert_eq!(FlagClass::parse("red"), Some(FlagClass::Red));
        assert_eq!(FlagClass::parse(" Yellow "), Some(FlagClass::Yellow));
        assert_eq!(FlagClass::parse("GREEN"), Some(FlagClass::Green));
        assert_eq!(FlagClass::parse("ORANGE"), None);
    }

    #[test]
    fn test_flag_class_from_severity() {
        assert_eq!(FlagClass::from_severity(80), FlagClass::Red);
        assert_eq!(FlagClass::from_severity(95), FlagClass::Red);
        assert_eq!(FlagClass::from_severity(79), FlagClass::Yellow);
        assert_eq!(FlagClass::from_severity(50), FlagClass::Yellow);
        assert_eq!(FlagClass::from_severity(49), FlagClass::Green);
        assert_eq!(FlagClass::from_severity(0), FlagClass::Green);
    }

    #[test]
    fn test_citation_kind_round_trip() {
        assert_eq!(
            CitationKind::parse(CitationKind::Manual.as_str()),
            Some(CitationKind::Manual)
        );
        assert_eq!(
            CitationKind::parse(CitationKind::Regulation.as_str()),
            Some(CitationKind::Regulation)
        );
        assert_eq!(CitationKind::parse("evidence"), None);
    }
}
