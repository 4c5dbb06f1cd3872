//! Prompt templates for compliance analysis.
//!
//! The system prompt pins the auditor persona and the strict JSON schema;
//! the user prompt renders the focus chunk, per-category retrieval counts,
//! and the bundled context text.

use crate::context::ContextBundle;

/// System prompt: compliance-auditor persona plus the response schema.
pub const SYSTEM_PROMPT: &str = r#"You are an expert aviation compliance auditor specializing in EASA Part-145 maintenance organizations.
Analyse the provided manual content against applicable regulations, AMC, and GM material.
Always reason carefully, cite relevant sections, and respond strictly in JSON according to the schema.

CRITICAL: You are analyzing a SINGLE CHUNK of a larger document. The content you see may be:
- A partial section (cut off at the beginning or end)
- Part of a larger list or table that continues in other chunks
- A middle portion of a longer explanation
- Content that references other sections you cannot see in this chunk

IMPORTANT GUIDELINES:
- SEARCH BEFORE FLAGGING: if you suspect information might be missing, you MUST search for it first using "needs_additional_context": true with a specific "context_query" before flagging it as a gap. The system will perform retrieval searches to find the information. Only flag a gap if the search confirms it is actually missing.
- Only flag ACTUAL compliance violations or significant gaps in required content AFTER searching for the information.
- Do NOT flag incomplete lists, tables, or cut-off content as errors - these are chunk boundaries, not document errors.
- Do NOT flag document structure elements (cover pages, table of contents, headers, footers) as compliance issues.
- Use GREEN for sections that are compliant, even if they are just document structure or appear incomplete due to chunking.
- Use YELLOW only for minor issues or ambiguities that need clarification (after searching for clarification).
- Use RED only for serious compliance violations or missing mandatory content that has been CONFIRMED missing after searching.
- Be conservative: when in doubt, search first, then use GREEN rather than flagging non-issues.
- If information is found via search, do NOT flag it as a gap - it exists elsewhere in the document.

You MUST respond with a JSON object matching this EXACT structure (no other fields):
{
    "flag": "RED" | "YELLOW" | "GREEN",
    "severity_score": 0,
    "regulation_references": [],
    "findings": "Detailed findings text (REQUIRED - cannot be empty).",
    "gaps": [],
    "citations": {
        "manual_section": "section reference or null",
        "regulation_sections": []
    },
    "recommendations": [],
    "needs_additional_context": false,
    "context_query": null
}

CRITICAL REQUIREMENTS:
- "flag" is REQUIRED and must be exactly one of "RED", "YELLOW", or "GREEN".
- "findings" is REQUIRED and must be a non-empty string.
- "gaps", "recommendations", and "regulation_references" MUST be arrays of strings, NOT arrays of objects.
- "citations" is REQUIRED and must be an object with exactly "manual_section" (string or null) and "regulation_sections" (array of strings).
- Do NOT include any fields not listed above.
- Return ONLY valid JSON, no markdown, no code blocks, no explanations outside the JSON."#;

/// Renders the user prompt for one focus chunk.
#[must_use]
pub fn build_user_prompt(bundle: &ContextBundle) -> String {
    let manual_section = bundle
        .focus
        .as_ref()
        .map(|focus| focus.content.trim().to_string())
        .unwrap_or_default();
    let manual_heading = bundle
        .focus
        .as_ref()
        .and_then(|focus| focus.metadata.get("section_path"))
        .and_then(serde_json::Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(serde_json::Value::as_str)
                .collect::<Vec<_>>()
                .join(" > ")
        })
        .unwrap_or_default();
    let context_text = bundle.render_text();
    let context_text = if context_text.is_empty() {
        "None supplied".to_string()
    } else {
        context_text
    };

    format!(
        r"You are analyzing a SINGLE CHUNK from a larger document. This chunk may be
a partial section, part of a larger list or table, or a middle portion of a
longer explanation.

Focus Chunk to Analyze:
Heading: {heading}
Content:
{content}

NOTE: This is ONE CHUNK. If content appears incomplete (e.g. a list cut off
mid-way), this is likely a chunk boundary, NOT a document error. Do NOT flag
incomplete content as a compliance violation unless mandatory information is
clearly missing from this specific section.

Available Context (via retrieval):
- {manual_count} similar/related chunks from the same manual
- {regulation_count} relevant regulation chunks
- {guidance_count} relevant AMC/GM guidance chunks
- {evidence_count} evidence chunks

Additional Context Details:
{context}

Analysis Requirements:
1. USE THE PROVIDED CONTEXT: the regulation chunks, AMC/GM guidance, manual
   neighbors, referenced sections, and case material were retrieved
   specifically to support this analysis. Reference them.
2. IDENTIFY REFERENCES: references to other sections in the focus chunk
   (e.g. 'Section 4.2', 'OSA 5', 'kohdassa 3.4', 'Part-145.A.30') are
   fetched automatically; consider how they relate to the focus chunk.
3. Identify applicable regulation / AMC / GM references from the provided
   context and cite them in 'regulation_sections' and
   'regulation_references'.
4. Compare the focus chunk against those requirements, understanding it may
   be partial.
5. Only flag ACTUAL compliance violations - not chunk boundaries, document
   structure, formatting, or information that may live in other sections.
6. SEARCH BEFORE FLAGGING GAPS: if something seems missing, set
   'needs_additional_context': true with a specific 'context_query' first;
   flag the gap only once the search confirms it is missing.
7. Recommend remediation actions only for real compliance issues.
8. Output valid JSON matching the documented schema.",
        heading = if manual_heading.is_empty() {
            "N/A"
        } else {
            &manual_heading
        },
        content = manual_section,
        manual_count = bundle.manual_neighbors.len(),
        regulation_count = bundle.regulation_slices.len(),
        guidance_count = bundle.guidance_slices.len(),
        evidence_count = bundle.evidence_slices.len(),
        context = context_text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSlice;

    fn focus(content: &str) -> ContextSlice {
        ContextSlice {
            label: "Focus Chunk".to_string(),
            source: "manual".to_string(),
            content: content.to_string(),
            token_count: 4,
            metadata: serde_json::json!({"section_path": ["Manual", "§2 Records"]}),
            score: None,
        }
    }

    #[test]
    fn test_system_prompt_pins_schema() {
        assert!(SYSTEM_PROMPT.contains("\"flag\""));
        assert!(SYSTEM_PROMPT.contains("needs_additional_context"));
        assert!(SYSTEM_PROMPT.contains("regulation_sections"));
    }

    #[test]
    fn test_user_prompt_renders_focus_and_counts() {
        let mut bundle = ContextBundle::new(focus("Records shall be retained."));
        bundle.regulation_slices.push(ContextSlice {
            label: "Regulation ref #1".to_string(),
            source: "regulation".to_string(),
            content: "145.A.55 Records.".to_string(),
            token_count: 4,
            metadata: serde_json::json!({"heading": null}),
            score: Some(0.8),
        });

        let prompt = build_user_prompt(&bundle);
        assert!(prompt.contains("Records shall be retained."));
        assert!(prompt.contains("Manual > §2 Records"));
        assert!(prompt.contains("- 1 relevant regulation chunks"));
        assert!(prompt.contains("145.A.55 Records."));
    }

    #[test]
    fn test_user_prompt_empty_context() {
        let bundle = ContextBundle::new(focus("Text."));
        let prompt = build_user_prompt(&bundle);
        assert!(prompt.contains("None supplied"));
        assert!(prompt.contains("- 0 relevant regulation chunks"));
    }
}
