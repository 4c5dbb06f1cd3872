//! Output formatting for CLI commands.
//!
//! Supports text and JSON output formats.

use crate::core::{Audit, AuditorQuestion, ComplianceScore, Flag};
use serde::Serialize;
use std::fmt::Write;

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output.
    Json,
}

impl OutputFormat {
    /// Parses format from string.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Formats an audit list.
#[must_use]
pub fn format_audit_list(audits: &[Audit], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => format_audit_list_text(audits),
        OutputFormat::Json => format_json(&audits),
    }
}

fn format_audit_list_text(audits: &[Audit]) -> String {
    if audits.is_empty() {
        return "No audits found.\n".to_string();
    }

    let mut output = String::new();
    output.push_str("Audits:\n");
    let _ = writeln!(
        output,
        "{:<6} {:<34} {:<10} {:<7} Progress",
        "ID", "External ID", "Status", "Draft"
    );
    output.push_str(&"-".repeat(70));
    output.push('\n');
    for audit in audits {
        let id = audit.id.map_or_else(|| "-".to_string(), |i| i.to_string());
        let _ = writeln!(
            output,
            "{:<6} {:<34} {:<10} {:<7} {}/{}",
            id,
            audit.external_id,
            audit.status.as_str(),
            if audit.is_draft { "yes" } else { "no" },
            audit.chunk_completed,
            audit.chunk_total
        );
    }
    output
}

/// Formats one audit's status, with percent, current activity, and ETA.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_audit_status(audit: &Audit, format: OutputFormat) -> String {
    let percent = if audit.chunk_total > 0 {
        (audit.chunk_completed as f64 / audit.chunk_total as f64) * 100.0
    } else {
        0.0
    };
    let activity = current_activity(audit);
    let eta = estimate_eta(audit);

    match format {
        OutputFormat::Json => format_json(&serde_json::json!({
            "id": audit.id,
            "external_id": audit.external_id,
            "status": audit.status.as_str(),
            "is_draft": audit.is_draft,
            "chunk_total": audit.chunk_total,
            "chunk_completed": audit.chunk_completed,
            "percent": percent,
            "current_activity": activity,
            "eta": eta,
            "last_chunk_id": audit.last_chunk_id,
            "started_at": audit.started_at,
            "completed_at": audit.completed_at,
            "failed_at": audit.failed_at,
            "failure_reason": audit.failure_reason,
        })),
        OutputFormat::Text => {
            let mut output = String::new();
            let _ = writeln!(output, "Audit {}", audit.external_id);
            let _ = writeln!(output, "  Status:    {}", audit.status.as_str());
            let _ = writeln!(
                output,
                "  Progress:  {}/{} ({percent:.1}%)",
                audit.chunk_completed, audit.chunk_total
            );
            let _ = writeln!(output, "  Activity:  {activity}");
            if let Some(eta) = eta {
                let _ = writeln!(output, "  ETA:       {eta}");
            }
            if let Some(reason) = &audit.failure_reason {
                let _ = writeln!(output, "  Failure:   {reason}");
            }
            output
        }
    }
}

/// Human-readable current-activity string for the poll surface.
#[must_use]
pub fn current_activity(audit: &Audit) -> String {
    match audit.status {
        crate::core::AuditStatus::Queued => "Waiting to start".to_string(),
        crate::core::AuditStatus::Running => format!(
            "Analyzing chunk {} of {}",
            (audit.chunk_completed + 1).min(audit.chunk_total.max(1)),
            audit.chunk_total
        ),
        crate::core::AuditStatus::Completed => "Audit complete".to_string(),
        crate::core::AuditStatus::Failed => {
            let reason = audit.failure_reason.as_deref().unwrap_or("unknown error");
            format!(
                "Audit failed: {}",
                crate::core::chunk::preview(reason, 200)
            )
        }
    }
}

/// ETA from observed throughput, formatted as `Ns`, `Nm Ms`, or `Nh Mm`.
#[must_use]
pub fn estimate_eta(audit: &Audit) -> Option<String> {
    if audit.status != crate::core::AuditStatus::Running || audit.chunk_completed == 0 {
        return None;
    }
    let started = audit.started_at?;
    let elapsed = (chrono::Utc::now() - started).num_seconds().max(1);
    #[allow(clippy::cast_precision_loss)]
    let per_chunk = elapsed as f64 / audit.chunk_completed as f64;
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let remaining_secs = (per_chunk * audit.remaining() as f64) as u64;
    Some(format_duration_secs(remaining_secs))
}

fn format_duration_secs(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Formats an audit's flags, optionally with reviewer questions.
#[must_use]
pub fn format_flags(
    flags: &[Flag],
    questions: Option<&[AuditorQuestion]>,
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Json => format_json(&serde_json::json!({
            "flags": flags,
            "questions": questions,
        })),
        OutputFormat::Text => {
            if flags.is_empty() {
                return "No flags found.\n".to_string();
            }
            let mut output = String::new();
            for flag in flags {
                let _ = writeln!(
                    output,
                    "[{:<6}] {} (severity {})",
                    flag.class.as_str(),
                    flag.chunk_id,
                    flag.severity_score
                );
                let _ = writeln!(output, "  {}", flag.findings);
                for gap in &flag.gaps {
                    let _ = writeln!(output, "  gap: {gap}");
                }
                for rec in &flag.recommendations {
                    let _ = writeln!(output, "  recommendation: {rec}");
                }
            }
            if let Some(questions) = questions {
                if !questions.is_empty() {
                    output.push_str("\nReviewer questions:\n");
                    for question in questions {
                        let _ = writeln!(
                            output,
                            "  [P{}] ({}) {}",
                            question.priority,
                            question.regulation_reference,
                            question.question_text
                        );
                    }
                }
            }
            output
        }
    }
}

/// Formats score history.
#[must_use]
pub fn format_scores(scores: &[ComplianceScore], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format_json(&scores),
        OutputFormat::Text => {
            if scores.is_empty() {
                return "No scores recorded.\n".to_string();
            }
            let mut output = String::new();
            let _ = writeln!(
                output,
                "{:<8} {:<8} {:<5} {:<7} {:<6} Recorded",
                "Audit", "Score", "Red", "Yellow", "Green"
            );
            output.push_str(&"-".repeat(60));
            output.push('\n');
            for score in scores {
                let _ = writeln!(
                    output,
                    "{:<8} {:<8.1} {:<5} {:<7} {:<6} {}",
                    score.audit_id,
                    score.overall_score,
                    score.red_count,
                    score.yellow_count,
                    score.green_count,
                    score.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            output
        }
    }
}

/// Formats an error for display.
#[must_use]
pub fn format_error(error: &crate::error::Error, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format_json(&serde_json::json!({"error": error.to_string()})),
        OutputFormat::Text => error.to_string(),
    }
}

/// Serializes any value to pretty JSON.
fn format_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}
