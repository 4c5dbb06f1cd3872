//! Normalized LLM analysis payload and its ingress validation.
//!
//! The LLM responds with a fixed JSON schema. Everything past this boundary
//! is typed: unknown top-level fields are rejected, enums are normalized,
//! list entries are stripped, and object-form gaps are flattened to text.
//! Untyped maps do not leak past this module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::audit::FlagClass;
use crate::error::AnalysisError;

/// Citations block: exactly one optional manual section plus zero or more
/// regulation sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CitationBlock {
    /// Manual section reference, if the analysis cited one.
    pub manual_section: Option<String>,
    /// Regulation section references.
    #[serde(default)]
    pub regulation_sections: Vec<String>,
}

/// A gap entry as the LLM may emit it: ideally a string, sometimes an
/// object with one of several description keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum GapEntry {
    Text(String),
    Object(serde_json::Map<String, Value>),
}

impl GapEntry {
    /// Flattens the entry to text. Object entries yield the first
    /// non-empty of the known description keys, else the stringified map.
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Object(map) => {
                for key in ["gap_name", "gap_item", "gap_description", "description"] {
                    if let Some(Value::String(text)) = map.get(key) {
                        if !text.trim().is_empty() {
                            return text.clone();
                        }
                    }
                }
                Value::Object(map).to_string()
            }
        }
    }
}

/// The analysis schema as received from the LLM, before normalization.
/// Unknown top-level fields are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnalysis {
    flag: String,
    #[serde(default)]
    severity_score: i64,
    #[serde(default)]
    regulation_references: Vec<String>,
    findings: String,
    #[serde(default)]
    gaps: Vec<GapEntry>,
    citations: CitationBlock,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    needs_additional_context: bool,
    #[serde(default)]
    context_query: Option<String>,
}

/// A validated, normalized chunk analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAnalysis {
    /// Compliance classification.
    pub flag: FlagClass,
    /// Severity 0-100.
    pub severity_score: i64,
    /// Regulation references mentioned in the findings.
    pub regulation_references: Vec<String>,
    /// Findings text; never empty.
    pub findings: String,
    /// Identified gaps, flattened to text.
    pub gaps: Vec<String>,
    /// Citations for the flag.
    pub citations: CitationBlock,
    /// Remediation recommendations.
    pub recommendations: Vec<String>,
    /// The analysis wants another retrieval pass.
    pub needs_additional_context: bool,
    /// Agent-supplied search query for the next pass.
    pub context_query: Option<String>,
    /// Set by the runner when at least one refinement pass ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined: Option<bool>,
    /// Number of refinement passes that ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement_attempts: Option<u32>,
}

impl NormalizedAnalysis {
    /// Parses and normalizes an LLM response body.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidResponse`] when the body is not
    /// valid JSON for the schema, the flag is not RED/YELLOW/GREEN, the
    /// severity is out of range, or the findings are empty.
    pub fn parse(content: &str) -> Result<Self, AnalysisError> {
        let raw: RawAnalysis = serde_json::from_str(content)
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;
        raw.normalize()
    }

    /// Serializes to the JSON persisted on the chunk result.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl RawAnalysis {
    fn normalize(self) -> Result<NormalizedAnalysis, AnalysisError> {
        let flag = FlagClass::parse(&self.flag).ok_or_else(|| {
            AnalysisError::InvalidResponse(format!(
                "flag must be RED, YELLOW, or GREEN, got '{}'",
                self.flag
            ))
        })?;

        if !(0..=100).contains(&self.severity_score) {
            return Err(AnalysisError::InvalidResponse(format!(
                "severity_score must be in 0..=100, got {}",
                self.severity_score
            )));
        }

        let findings = self.findings.trim().to_string();
        if findings.is_empty() {
            return Err(AnalysisError::InvalidResponse(
                "findings must be a non-empty string".to_string(),
            ));
        }

        let context_query = self
            .context_query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());

        Ok(NormalizedAnalysis {
            flag,
            severity_score: self.severity_score,
            regulation_references: strip_entries(self.regulation_references),
            findings,
            gaps: strip_entries(self.gaps.into_iter().map(GapEntry::into_text).collect()),
            citations: CitationBlock {
                manual_section: self
                    .citations
                    .manual_section
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                regulation_sections: dedup_stripped(self.citations.regulation_sections),
            },
            recommendations: strip_entries(self.recommendations),
            needs_additional_context: self.needs_additional_context,
            context_query,
            refined: None,
            refinement_attempts: None,
        })
    }
}

/// Strips whitespace and drops empty entries.
fn strip_entries(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Strips whitespace, drops empties, and de-duplicates while preserving
/// first occurrence order.
fn dedup_stripped(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    strip_entries(values)
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "flag": "green",
        "severity_score": 5,
        "regulation_references": [" ML.A.501(a) ", ""],
        "findings": "Compliant.",
        "gaps": [],
        "citations": {"manual_section": "Section 4.2", "regulation_sections": ["145.A.30", " 145.A.30", "145.A.35"]},
        "recommendations": ["  keep records  ", ""],
        "needs_additional_context": false,
        "context_query": null
    }"#;

    #[test]
    fn test_parse_valid_normalizes() {
        let analysis = NormalizedAnalysis::parse(VALID).unwrap();
        assert_eq!(analysis.flag, FlagClass::Green);
        assert_eq!(analysis.severity_score, 5);
        assert_eq!(analysis.regulation_references, vec!["ML.A.501(a)"]);
        assert_eq!(analysis.recommendations, vec!["keep records"]);
        // stripped then de-duplicated
        assert_eq!(
            analysis.citations.regulation_sections,
            vec!["145.A.30", "145.A.35"]
        );
        assert!(!analysis.needs_additional_context);
        assert!(analysis.context_query.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_top_level_field() {
        let body = r#"{
            "flag": "GREEN", "severity_score": 0, "findings": "ok",
            "citations": {"manual_section": null, "regulation_sections": []},
            "confidence": 0.9
        }"#;
        assert!(NormalizedAnalysis::parse(body).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_citation_field() {
        let body = r#"{
            "flag": "GREEN", "severity_score": 0, "findings": "ok",
            "citations": {"manual_section": null, "regulation_sections": [], "amc_sections": []}
        }"#;
        assert!(NormalizedAnalysis::parse(body).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_flag() {
        let body = r#"{
            "flag": "ORANGE", "severity_score": 0, "findings": "ok",
            "citations": {"manual_section": null, "regulation_sections": []}
        }"#;
        assert!(NormalizedAnalysis::parse(body).is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_severity() {
        for severity in ["-1", "101"] {
            let body = format!(
                r#"{{"flag": "RED", "severity_score": {severity}, "findings": "x",
                     "citations": {{"manual_section": null, "regulation_sections": []}}}}"#
            );
            assert!(NormalizedAnalysis::parse(&body).is_err(), "severity {severity}");
        }
    }

    #[test]
    fn test_parse_rejects_empty_findings() {
        let body = r#"{
            "flag": "GREEN", "severity_score": 0, "findings": "   ",
            "citations": {"manual_section": null, "regulation_sections": []}
        }"#;
        assert!(NormalizedAnalysis::parse(body).is_err());
    }

    #[test]
    fn test_gaps_accept_strings_and_objects() {
        let body = r#"{
            "flag": "YELLOW", "severity_score": 55, "findings": "Partial.",
            "gaps": [
                "Missing retention period",
                {"gap_name": "No audit trail"},
                {"gap_description": "Records unsigned"},
                {"description": "   "},
                {"other": 1}
            ],
            "citations": {"manual_section": null, "regulation_sections": []}
        }"#;
        let analysis = NormalizedAnalysis::parse(body).unwrap();
        assert_eq!(analysis.gaps.len(), 5);
        assert_eq!(analysis.gaps[0], "Missing retention period");
        assert_eq!(analysis.gaps[1], "No audit trail");
        assert_eq!(analysis.gaps[2], "Records unsigned");
        // unusable objects fall back to their JSON text
        assert!(analysis.gaps[3].contains("description"));
        assert!(analysis.gaps[4].contains("other"));
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let body = r#"{
            "flag": "GREEN", "findings": "ok",
            "citations": {"manual_section": null, "regulation_sections": []}
        }"#;
        let analysis = NormalizedAnalysis::parse(body).unwrap();
        assert_eq!(analysis.severity_score, 0);
        assert!(analysis.gaps.is_empty());
        assert!(!analysis.needs_additional_context);
        assert!(analysis.context_query.is_none());
    }

    #[test]
    fn test_blank_context_query_becomes_none() {
        let body = r#"{
            "flag": "GREEN", "findings": "ok", "context_query": "  ",
            "citations": {"manual_section": null, "regulation_sections": []}
        }"#;
        let analysis = NormalizedAnalysis::parse(body).unwrap();
        assert!(analysis.context_query.is_none());
    }

    #[test]
    fn test_blank_manual_section_becomes_none() {
        let body = r#"{
            "flag": "GREEN", "findings": "ok",
            "citations": {"manual_section": " ", "regulation_sections": []}
        }"#;
        let analysis = NormalizedAnalysis::parse(body).unwrap();
        assert!(analysis.citations.manual_section.is_none());
    }

    #[test]
    fn test_to_value_omits_unset_refinement_markers() {
        let analysis = NormalizedAnalysis::parse(VALID).unwrap();
        let value = analysis.to_value();
        assert!(value.get("refined").is_none());
        assert!(value.get("refinement_attempts").is_none());

        let mut refined = analysis;
        refined.refined = Some(true);
        refined.refinement_attempts = Some(2);
        let value = refined.to_value();
        assert_eq!(value["refined"], Value::Bool(true));
        assert_eq!(value["refinement_attempts"], Value::from(2));
    }

    #[test]
    fn test_serde_round_trip() {
        let analysis = NormalizedAnalysis::parse(VALID).unwrap();
        let json = serde_json::to_string(&analysis).unwrap();
        let back: NormalizedAnalysis = serde_json::from_str(&json).unwrap();
        assert_eq!(back, analysis);
    }
}
