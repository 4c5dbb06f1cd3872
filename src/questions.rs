//! Prioritized reviewer question generation.
//!
//! For each regulation reference cited by the audit's flags, generates 3-5
//! prioritized questions (1 = highest, 10 = lowest) with rationales.
//! LLM-backed with a heuristic fallback seeded by flag findings when the
//! endpoint is unreachable or unconfigured. Idempotent per
//! `(audit, regulation_reference)`.

// Heuristic priority arithmetic stays within 1..=10.
#![allow(clippy::cast_possible_wrap)]

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::chunk::preview;
use crate::core::{AuditorQuestion, Citation, CitationKind, Flag, FlagClass};
use crate::error::Result;
use crate::storage::Storage;

/// Lower bound on questions per regulation reference.
pub const MIN_QUESTIONS_PER_REFERENCE: usize = 3;

/// Schema upper bound on questions per regulation reference.
pub const MAX_QUESTIONS_PER_REFERENCE: usize = 10;

/// Group used for flags with no regulation citation at all.
const UNKNOWN_REFERENCE: &str = "UNKNOWN";

/// System prompt for question generation.
const QUESTIONS_SYSTEM_PROMPT: &str = "You are an expert aviation compliance auditor \
specializing in EASA Part-145 maintenance organizations. Your task is to generate \
prioritized review questions for manual auditors based on compliance findings. \
Questions should be specific, actionable, and ranked by risk (1=highest priority, \
10=lowest priority). Always respond in valid JSON according to the schema.";

/// One generated question before persistence.
#[derive(Debug, Clone, Deserialize)]
struct QuestionItem {
    question_text: String,
    #[serde(default = "default_priority")]
    priority: i64,
    rationale: String,
}

const fn default_priority() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
struct QuestionPlan {
    questions: Vec<QuestionItem>,
}

/// Generates prioritized auditor questions from compliance flags.
pub struct QuestionGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base_url: String,
}

impl QuestionGenerator {
    /// Creates a generator from deployment configuration.
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(config.llm_timeout)
                .build()
                .unwrap_or_default(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model_compliance.clone(),
            api_base_url: config.llm_api_base_url.clone(),
        }
    }

    /// Generates questions for every regulation reference cited by the
    /// audit's flags. Returns the number of questions created.
    ///
    /// References that already have questions are skipped, so re-running
    /// for an audit is a no-op for those references.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::NotFound`] for a missing audit;
    /// propagates storage failures. LLM failures fall back to heuristic
    /// questions rather than erroring.
    pub async fn generate_for_audit(
        &self,
        storage: &mut dyn Storage,
        audit_id: i64,
    ) -> Result<usize> {
        let audit = storage.get_audit(audit_id)?.ok_or(crate::error::Error::NotFound {
            entity: "audit",
            identifier: audit_id.to_string(),
        })?;
        let flags = storage.flags_for_audit(audit_id)?;
        if flags.is_empty() {
            info!(audit_id, "no flags; skipping question generation");
            return Ok(0);
        }

        let mut flag_citations: Vec<(Flag, Vec<Citation>)> = Vec::new();
        for flag in flags {
            let citations = flag
                .id
                .map_or_else(|| Ok(Vec::new()), |id| storage.citations_for_flag(id))?;
            flag_citations.push((flag, citations));
        }
        let groups = group_flags_by_regulation(&flag_citations);

        let mut total = 0;
        for (reference, group_flags) in groups {
            if storage.questions_exist(audit_id, &reference)? {
                continue;
            }
            let questions = self
                .questions_for_reference(audit_id, &reference, &group_flags)
                .await;
            total += storage.insert_questions(&questions)?;
        }

        info!(
            audit_id,
            audit_external_id = %audit.external_id,
            questions = total,
            "question generation finished"
        );
        Ok(total)
    }

    async fn questions_for_reference(
        &self,
        audit_id: i64,
        reference: &str,
        flags: &[&Flag],
    ) -> Vec<AuditorQuestion> {
        let mut items = match self.call_llm(reference, flags).await {
            Ok(items) => items,
            Err(reason) => {
                warn!(
                    reference,
                    error = %reason,
                    "question LLM unavailable; using heuristic questions"
                );
                Vec::new()
            }
        };

        if items.len() < MIN_QUESTIONS_PER_REFERENCE {
            let missing = MIN_QUESTIONS_PER_REFERENCE - items.len();
            items.extend(heuristic_questions(flags, missing));
        }
        // Truncate to the schema maximum in priority order.
        items.sort_by_key(|item| item.priority);
        items.truncate(MAX_QUESTIONS_PER_REFERENCE);

        let related_flag_ids: Vec<i64> = flags.iter().filter_map(|flag| flag.id).collect();
        items
            .into_iter()
            .map(|item| AuditorQuestion {
                id: None,
                audit_id,
                regulation_reference: reference.to_string(),
                question_text: item.question_text,
                priority: item.priority.clamp(1, 10),
                rationale: Some(item.rationale),
                related_flag_ids: related_flag_ids.clone(),
            })
            .collect()
    }

    async fn call_llm(
        &self,
        reference: &str,
        flags: &[&Flag],
    ) -> std::result::Result<Vec<QuestionItem>, String> {
        if self.api_key.is_empty() {
            return Err("no LLM API key configured".to_string());
        }

        let base = self.api_base_url.trim_end_matches('/');
        let url = format!("{base}/chat/completions");
        let payload = json!({
            "model": self.model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": QUESTIONS_SYSTEM_PROMPT},
                {"role": "user", "content": build_question_prompt(reference, flags)},
            ],
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("question endpoint returned {}", response.status()));
        }
        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| "missing content".to_string())?;

        let plan: QuestionPlan = serde_json::from_str(content).map_err(|e| e.to_string())?;
        Ok(plan
            .questions
            .into_iter()
            .filter(|item| item.question_text.trim().len() >= 10)
            .collect())
    }
}

/// Groups flags by their primary regulation citation. Flags with no
/// regulation citation fall back to the references captured in their
/// analysis metadata, then to the `UNKNOWN` group.
fn group_flags_by_regulation<'a>(
    flag_citations: &'a [(Flag, Vec<Citation>)],
) -> BTreeMap<String, Vec<&'a Flag>> {
    let mut groups: BTreeMap<String, Vec<&Flag>> = BTreeMap::new();
    for (flag, citations) in flag_citations {
        let primary = citations
            .iter()
            .find(|citation| citation.kind == CitationKind::Regulation)
            .map(|citation| citation.reference.clone())
            .or_else(|| {
                flag.analysis_metadata
                    .get("regulation_references")
                    .and_then(Value::as_array)
                    .and_then(|refs| refs.first())
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| UNKNOWN_REFERENCE.to_string());
        groups.entry(primary).or_default().push(flag);
    }
    groups
}

/// Builds the question-generation prompt for one regulation reference.
fn build_question_prompt(reference: &str, flags: &[&Flag]) -> String {
    let red = flags.iter().filter(|f| f.class == FlagClass::Red).count();
    let yellow = flags.iter().filter(|f| f.class == FlagClass::Yellow).count();
    let green = flags.iter().filter(|f| f.class == FlagClass::Green).count();

    let mut summary = format!(
        "Found {} flags: {red} RED, {yellow} YELLOW, {green} GREEN",
        flags.len()
    );
    if red > 0 {
        summary.push_str("\n\nCritical issues (RED flags):");
        for flag in flags.iter().filter(|f| f.class == FlagClass::Red) {
            summary.push_str(&format!("\n- {}", preview(&flag.findings, 200)));
        }
    }

    let gaps: Vec<&str> = flags
        .iter()
        .flat_map(|flag| flag.gaps.iter().map(String::as_str))
        .collect();
    let gaps_text = if gaps.is_empty() {
        "None identified".to_string()
    } else {
        gaps.iter()
            .map(|gap| format!("- {gap}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let findings_text = flags
        .iter()
        .map(|flag| format!("- {}", flag.findings))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Regulation Section: {reference}

Compliance Findings Summary:
{summary}

Identified Gaps:
{gaps_text}

Key Findings:
{findings_text}

Requirements:
1. Generate 3-5 prioritized review questions for manual auditors.
2. Questions should help clarify compliance issues, verify evidence, or identify missing elements.
3. Priority: 1 = critical/high-risk, 5 = medium, 10 = low/informational.
4. Provide a brief rationale for each question explaining why it's important.
5. Focus on actionable questions that can be answered through document review or clarification.
6. Respond as JSON: {{"questions": [{{"question_text": "...", "priority": 1, "rationale": "..."}}]}}"#
    )
}

/// Heuristic questions when the LLM is unavailable or under-delivers:
/// RED findings first, then YELLOW, then generic verification questions.
fn heuristic_questions(flags: &[&Flag], count: usize) -> Vec<QuestionItem> {
    let mut questions = Vec::new();

    for (i, flag) in flags
        .iter()
        .filter(|f| f.class == FlagClass::Red)
        .take(count)
        .enumerate()
    {
        questions.push(QuestionItem {
            question_text: format!(
                "Can you provide evidence or clarification for: {}?",
                preview(&flag.findings, 150)
            ),
            priority: (i as i64 + 1).min(3),
            rationale: format!(
                "Critical compliance issue identified: {}",
                preview(&flag.findings, 100)
            ),
        });
    }

    let remaining = count.saturating_sub(questions.len());
    for (i, flag) in flags
        .iter()
        .filter(|f| f.class == FlagClass::Yellow)
        .take(remaining)
        .enumerate()
    {
        questions.push(QuestionItem {
            question_text: format!(
                "Please clarify or provide additional documentation for: {}?",
                preview(&flag.findings, 150)
            ),
            priority: (4 + i as i64).min(6),
            rationale: format!(
                "Potential compliance concern: {}",
                preview(&flag.findings, 100)
            ),
        });
    }

    let generic = [
        "Are all required procedures documented and accessible to personnel?",
        "Is there evidence of regular review and updates to the manual?",
        "Are personnel qualifications and training records maintained?",
    ];
    let remaining = count.saturating_sub(questions.len());
    for (i, text) in generic.iter().take(remaining).enumerate() {
        questions.push(QuestionItem {
            question_text: (*text).to_string(),
            priority: (7 + i as i64).min(10),
            rationale: "General compliance verification question".to_string(),
        });
    }

    questions.truncate(count);
    questions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::core::{Document, SourceClass};
    use crate::storage::SqliteStorage;

    fn flag(id: i64, class: FlagClass, findings: &str) -> Flag {
        Flag {
            id: Some(id),
            audit_id: 1,
            chunk_id: format!("d_{id}_0"),
            class,
            severity_score: 50,
            findings: findings.to_string(),
            gaps: vec!["gap".to_string()],
            recommendations: Vec::new(),
            analysis_metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    fn citation(flag_id: i64, reference: &str) -> Citation {
        Citation {
            id: None,
            flag_id,
            kind: CitationKind::Regulation,
            reference: reference.to_string(),
        }
    }

    #[test]
    fn test_grouping_by_primary_citation() {
        let pairs = vec![
            (flag(1, FlagClass::Red, "a"), vec![citation(1, "145.A.30")]),
            (flag(2, FlagClass::Yellow, "b"), vec![citation(2, "145.A.30")]),
            (flag(3, FlagClass::Green, "c"), vec![citation(3, "145.A.55")]),
        ];
        let groups = group_flags_by_regulation(&pairs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["145.A.30"].len(), 2);
        assert_eq!(groups["145.A.55"].len(), 1);
    }

    #[test]
    fn test_grouping_falls_back_to_metadata_then_unknown() {
        let mut with_metadata = flag(1, FlagClass::Red, "a");
        with_metadata.analysis_metadata = json!({"regulation_references": ["ML.A.501"]});
        let without = flag(2, FlagClass::Green, "b");

        let pairs = vec![(with_metadata, Vec::new()), (without, Vec::new())];
        let groups = group_flags_by_regulation(&pairs);
        assert!(groups.contains_key("ML.A.501"));
        assert!(groups.contains_key(UNKNOWN_REFERENCE));
    }

    #[test]
    fn test_heuristic_red_first() {
        let red = flag(1, FlagClass::Red, "Missing mandatory records procedure");
        let yellow = flag(2, FlagClass::Yellow, "Ambiguous wording");
        let flags: Vec<&Flag> = vec![&red, &yellow];

        let questions = heuristic_questions(&flags, 3);
        assert_eq!(questions.len(), 3);
        assert!(questions[0].question_text.contains("Missing mandatory"));
        assert_eq!(questions[0].priority, 1);
        assert!(questions[1].question_text.contains("Ambiguous"));
        assert!(questions[1].priority >= 4);
        // Third backfilled from generic pool.
        assert!(questions[2].priority >= 7);
    }

    #[test]
    fn test_heuristic_respects_count() {
        let green = flag(1, FlagClass::Green, "ok");
        let flags: Vec<&Flag> = vec![&green];
        assert_eq!(heuristic_questions(&flags, 2).len(), 2);
        assert!(heuristic_questions(&flags, 0).is_empty());
    }

    #[test]
    fn test_prompt_contains_summary_and_gaps() {
        let red = flag(1, FlagClass::Red, "No accountable manager designated");
        let flags: Vec<&Flag> = vec![&red];
        let prompt = build_question_prompt("145.A.30", &flags);
        assert!(prompt.contains("Regulation Section: 145.A.30"));
        assert!(prompt.contains("1 RED"));
        assert!(prompt.contains("No accountable manager"));
        assert!(prompt.contains("- gap"));
    }

    #[tokio::test]
    async fn test_generate_for_audit_heuristic_and_idempotent() {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.init().unwrap();
        let document = Document::new("m.pdf", "p", 1, "h", SourceClass::Manual);
        let doc_id = storage.insert_document(&document).unwrap();
        let audit = storage.create_audit(doc_id, false).unwrap();
        let audit_id = audit.id.unwrap();

        let stored = storage
            .upsert_flag(
                &flag(0, FlagClass::Red, "Missing retention procedure"),
                &[(CitationKind::Regulation, "145.A.55".to_string())],
            )
            .unwrap();
        // Second flag without citations lands in the UNKNOWN group.
        let mut other = flag(0, FlagClass::Yellow, "Unclear responsibility");
        other.chunk_id = "d_9_0".to_string();
        other.audit_id = stored.audit_id;
        storage.upsert_flag(&other, &[]).unwrap();

        // No API key: heuristic path.
        let generator = QuestionGenerator::new(&AppConfig::default());
        let created = generator
            .generate_for_audit(&mut storage, audit_id)
            .await
            .unwrap();
        assert!(created >= 2 * MIN_QUESTIONS_PER_REFERENCE);

        let questions = storage.questions_for_audit(audit_id).unwrap();
        assert_eq!(questions.len(), created);
        for question in &questions {
            assert!((1..=10).contains(&question.priority));
        }

        // Re-running is a no-op for existing references.
        let again = generator
            .generate_for_audit(&mut storage, audit_id)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_generate_for_missing_audit_errors() {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.init().unwrap();
        let generator = QuestionGenerator::new(&AppConfig::default());
        assert!(generator.generate_for_audit(&mut storage, 99).await.is_err());
    }

    #[tokio::test]
    async fn test_no_flags_no_questions() {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.init().unwrap();
        let document = Document::new("m.pdf", "p", 1, "h", SourceClass::Manual);
        let doc_id = storage.insert_document(&document).unwrap();
        let audit = storage.create_audit(doc_id, false).unwrap();

        let generator = QuestionGenerator::new(&AppConfig::default());
        let created = generator
            .generate_for_audit(&mut storage, audit.id.unwrap())
            .await
            .unwrap();
        assert_eq!(created, 0);
    }
}
