//! Flag synthesis from normalized analyses.
//!
//! Maps one normalized analysis into the persisted flag for its
//! `(audit, chunk)` pair, deriving the class from the severity score when
//! the analysis supplied none, and rewriting citations wholesale.

use chrono::Utc;
use serde_json::json;

use crate::core::{CitationKind, Flag, FlagClass, NormalizedAnalysis};
use crate::error::Result;
use crate::storage::Storage;

/// Maps normalized analysis payloads into persisted flags and citations.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagSynthesizer;

impl FlagSynthesizer {
    /// Creates a synthesizer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Upserts the flag for `(audit_id, chunk_id)` from an analysis.
    ///
    /// Citations are replaced atomically: one `manual` citation when the
    /// analysis cited a manual section, plus one `regulation` citation per
    /// cited regulation section.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn upsert_flag(
        &self,
        storage: &mut dyn Storage,
        audit_id: i64,
        chunk_id: &str,
        analysis: &NormalizedAnalysis,
    ) -> Result<Flag> {
        let severity_score = analysis.severity_score.max(0);
        let findings = if analysis.findings.is_empty() {
            "No findings provided.".to_string()
        } else {
            analysis.findings.clone()
        };

        let flag = Flag {
            id: None,
            audit_id,
            chunk_id: chunk_id.to_string(),
            class: resolve_flag_class(Some(analysis.flag), severity_score),
            severity_score,
            findings,
            gaps: analysis.gaps.clone(),
            recommendations: analysis.recommendations.clone(),
            analysis_metadata: json!({
                "flag": analysis.flag.as_str(),
                "needs_additional_context": analysis.needs_additional_context,
                "refined": analysis.refined,
                "refinement_attempts": analysis.refinement_attempts,
                "regulation_references": analysis.regulation_references,
            }),
            created_at: Utc::now(),
        };

        let mut citations: Vec<(CitationKind, String)> = Vec::new();
        if let Some(manual) = &analysis.citations.manual_section {
            if !manual.is_empty() {
                citations.push((CitationKind::Manual, manual.clone()));
            }
        }
        for reference in &analysis.citations.regulation_sections {
            if !reference.is_empty() {
                citations.push((CitationKind::Regulation, reference.clone()));
            }
        }

        storage.upsert_flag(&flag, &citations)
    }
}

/// Resolves the flag class: a usable analysis flag wins; otherwise derive
/// from the severity score.
#[must_use]
pub fn resolve_flag_class(flag: Option<FlagClass>, severity_score: i64) -> FlagClass {
    flag.unwrap_or_else(|| FlagClass::from_severity(severity_score))
}
