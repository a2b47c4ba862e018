// qci-trainer-rs/src/prompts.rs
// Request templates for every completion-service exchange. Each template
// names the exact JSON shape the response must take; the parsing side lives
// next to the stage that owns it.

use llm_service::CompletionRequest;
use serde_json::json;

use crate::model::NormalizedConversation;

const ANALYST_SYSTEM: &str = "You are a strict sales call quality analyst. \
Respond with a single JSON object and nothing else.";

pub fn structure_request(transcript: &str) -> CompletionRequest {
    let user = format!(
        r#"Convert this sales call transcript into structured JSON.

Rules:
- Split the transcript into turns in their original order.
- Copy every turn's text verbatim from the transcript. Do not paraphrase,
  translate or fix grammar.
- speaker is "agent" for the sales agent and "customer" for the person called.

TRANSCRIPT:
{transcript}

Respond with:
{{
  "participants": {{"agent": "name or role", "customer": "name or role"}},
  "conversation_flow": [
    {{"speaker": "agent|customer", "message": "verbatim text", "timestamp": "optional"}}
  ],
  "call_metadata": {{
    "total_exchanges": 0,
    "agent_talk_ratio": 0.0,
    "call_outcome": "meeting|interested|callback|info_only|no_outcome",
    "objections_raised": ["objection"],
    "call_length_estimate": "short|medium|long"
  }},
  "key_moments": {{
    "opening_line": "agent's first line",
    "value_proposition": "main value statement",
    "closing_attempt": "closing attempt",
    "objection_handling": ["agent response to an objection"]
  }}
}}"#
    );

    CompletionRequest::json("structure", ANALYST_SYSTEM, user)
        .with_temperature(0.1)
        .with_max_tokens(3000)
}

/// `duration_secs` is 0 when the export has no usable timestamps.
pub fn score_request(conversation: &NormalizedConversation, transcript: &str, duration_secs: f64) -> CompletionRequest {
    let structured = serde_json::to_string_pretty(conversation).unwrap_or_default();
    let duration = if duration_secs > 0.0 {
        format!("{:.0}s", duration_secs)
    } else {
        "unknown (estimate timings from the transcript)".to_string()
    };
    let user = format!(
        r#"Score this sales call with the QCI rubric. Report points per component;
the final totals are computed from your components.

A. DYNAMICS: time to first value statement (<=20s: 8 pts), time to first
   call to action (<=120s: 8 pts), number of dead-air gaps longer than 3s.
B. OBJECTIONS & COMPLIANCE: recognizing stop/do-not-call signals (0-6),
   reaction time after such a signal <=10s (0-8), offering an alternative
   before ending (0-6). Give full points when no such signal occurred.
C. BRAND & LANGUAGE: first brand mention <=10s (0-8), consistent brand
   naming (0-8), matching the customer's language within 15s (0-4).
D. OUTCOME & HYGIENE: outcome label, proper wrap-up (0-5), tool/process
   hygiene (0-10).

CALL DURATION: {duration}

STRUCTURED CALL:
{structured}

ORIGINAL TRANSCRIPT:
{transcript}

Respond with:
{{
  "qci_score": 0,
  "breakdown": {{
    "dynamics": {{"time_to_value_score": 0, "first_cta_score": 0, "dead_air_gaps": 0}},
    "objections_compliance": {{"recognition_score": 0, "compliance_time_score": 0, "alternative_offered_score": 0}},
    "brand_language": {{"brand_mention_score": 0, "brand_consistency_score": 0, "language_match_score": 0}},
    "outcome_hygiene": {{"outcome": "meeting|interested|callback|info_only|no_outcome", "wrap_up_score": 0, "tool_hygiene_score": 0}}
  }},
  "coaching_tips": ["specific tip"],
  "evidence": {{
    "successful_moments": [{{"quote": "verbatim quote", "reason": "why it worked"}}],
    "improvement_areas": [{{"quote": "verbatim quote", "issue": "what to improve"}}]
  }},
  "call_classification": "excellent|good|average|poor|failed"
}}"#
    );

    CompletionRequest::json("score", ANALYST_SYSTEM, user)
        .with_temperature(0.1)
        .with_max_tokens(2000)
}

pub fn success_mining_request(evidence: &serde_json::Value) -> CompletionRequest {
    let evidence = serde_json::to_string_pretty(evidence).unwrap_or_default();
    let user = format!(
        r#"These excerpts come from the highest scoring calls of one sales agent.
Counts show how often each excerpt occurred. Find the recurring patterns
that made these calls work.

EVIDENCE:
{evidence}

Respond with:
{{
  "opening_patterns": [{{"pattern": "", "frequency": "", "effectiveness": "", "example": ""}}],
  "value_proposition_patterns": [{{"pattern": "", "frequency": "", "key_words": [""], "example": ""}}],
  "objection_handling_patterns": [{{"pattern": "", "situation": "", "response": "", "example": ""}}],
  "closing_patterns": [{{"pattern": "", "timing": "", "example": ""}}],
  "key_success_factors": [""],
  "recommended_phrases": [{{"phrase": "", "context": "", "impact": ""}}]
}}"#
    );

    CompletionRequest::json("mine_success", ANALYST_SYSTEM, user).with_temperature(0.3)
}

pub fn failure_mining_request(evidence: &serde_json::Value) -> CompletionRequest {
    let evidence = serde_json::to_string_pretty(evidence).unwrap_or_default();
    let user = format!(
        r#"These excerpts come from the lowest scoring calls of one sales agent.
Counts show how often each excerpt occurred. Find the recurring problems
and a concrete fix for each.

EVIDENCE:
{evidence}

Respond with:
{{
  "opening_problems": [{{"problem": "", "frequency": "", "impact": "", "solution": ""}}],
  "objection_handling_problems": [{{"problem": "", "consequence": "", "solution": ""}}],
  "general_issues": [{{"issue": "", "examples": [""], "fix": ""}}],
  "avoid_phrases": [{{"phrase": "", "reason": "", "alternative": ""}}],
  "improvement_priorities": [{{"priority": 1, "area": "", "action": ""}}]
}}"#
    );

    CompletionRequest::json("mine_failures", ANALYST_SYSTEM, user).with_temperature(0.3)
}

pub fn rewrite_request(current_script: &str, plan: &serde_json::Value, sections: &[String]) -> CompletionRequest {
    let plan = serde_json::to_string_pretty(plan).unwrap_or_default();
    let sections = if sections.is_empty() {
        "(none detected)".to_string()
    } else {
        sections.join(", ")
    };
    let user = format!(
        r#"Improve this sales agent's instruction script using the improvement plan.

CURRENT SCRIPT:
{current_script}

IMPROVEMENT PLAN:
{plan}

Requirements:
- Keep every existing section, in the same order, with the same heading:
  {sections}
- Add a section headed "SUCCESSFUL PATTERNS" with the best phrases.
- Add a section headed "AVOID THESE MISTAKES" with the mistakes to avoid.
- Strengthen objection handling and make instructions concrete.

Respond with:
{{
  "optimized_prompt": "full text of the improved script",
  "key_changes": ["change"],
  "added_sections": [{{"section": "name", "purpose": "why"}}],
  "expected_improvements": ["improvement"]
}}"#
    );

    CompletionRequest::json(
        "rewrite",
        "You write high-performing instruction scripts for AI sales agents. \
Respond with a single JSON object and nothing else.",
        user,
    )
    .with_temperature(0.4)
    .with_max_tokens(4000)
}

pub fn ab_variants_request(base_script: &str) -> CompletionRequest {
    let user = format!(
        r#"Create two variants of this script for an A/B test.

BASE SCRIPT:
{base_script}

Variant A pushes for a fast close (outcome-aggressive).
Variant B builds trust first (consultative).

Respond with:
{{
  "variant_a": {{"prompt": "full text", "focus": "outcome-aggressive", "key_differences": [""]}},
  "variant_b": {{"prompt": "full text", "focus": "consultative", "key_differences": [""]}}
}}"#
    );

    CompletionRequest::json(
        "ab_variants",
        "Create clearly distinct variants suitable for a valid A/B test. \
Respond with a single JSON object and nothing else.",
        user,
    )
    .with_temperature(0.6)
    .with_max_tokens(4000)
}

/// Compact JSON view used when a stage needs to hand structured data to
/// another prompt.
pub fn evidence_value<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|_| json!({}))
}
