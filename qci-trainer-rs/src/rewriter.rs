// qci-trainer-rs/src/rewriter.rs
// Prompt rewriter: produces the optimization package for one agent from its
// current script and stored improvement plan.
//
// The base rewrite and the A/B variants are separate requests. A failed A/B
// step is recorded on the package and never invalidates the rewrite.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use llm_service::{extract_json, CompletionRequest, CompletionService};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{FailureRecord, PipelineError, Stage};
use crate::model::AgentId;
use crate::prompts;
use crate::recommendation::ImprovementPlan;
use crate::rollout::RolloutPlan;
use crate::source::PromptSource;
use crate::store::{ArtifactKind, ArtifactStore, ArtifactStoreExt};
use crate::wire::{lenient_string, lenient_strings, null_as_default};

pub const SUCCESSFUL_PATTERNS_HEADING: &str = "SUCCESSFUL PATTERNS";
pub const AVOID_MISTAKES_HEADING: &str = "AVOID THESE MISTAKES";

/// Section headings of a script, normalized, in order of appearance.
///
/// A heading is a Markdown heading line (`#`..`######`), or a short line whose
/// letters are all upper case (optionally wrapped in `[...]` or ending in `:`).
pub fn section_headings(script: &str) -> Vec<String> {
    script.lines().filter_map(heading_of).collect()
}

fn heading_of(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.len() > 80 {
        return None;
    }

    let text = if line.starts_with('#') {
        line.trim_start_matches('#').trim()
    } else {
        let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
        if letters.len() < 3 || letters.iter().any(|c| c.is_lowercase()) {
            return None;
        }
        line
    };

    let normalized = text
        .trim_start_matches('[')
        .trim_end_matches(':')
        .trim_end_matches(']')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    (!normalized.is_empty()).then_some(normalized)
}

fn has_heading(headings: &[String], wanted: &str) -> bool {
    headings.iter().any(|h| h.contains(wanted))
}

/// Original headings missing from the rewrite, or present out of order.
pub fn missing_sections(original: &[String], rewritten: &[String]) -> Vec<String> {
    let mut cursor = 0;
    let mut missing = Vec::new();
    for heading in original {
        match rewritten[cursor..].iter().position(|h| h == heading) {
            Some(offset) => cursor += offset + 1,
            None => missing.push(heading.clone()),
        }
    }
    missing
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddedSection {
    #[serde(deserialize_with = "lenient_string")]
    pub section: String,
    #[serde(deserialize_with = "lenient_string")]
    pub purpose: String,
}

#[derive(Debug, Deserialize)]
struct RewriteWire {
    #[serde(default, deserialize_with = "lenient_string")]
    optimized_prompt: String,
    #[serde(default, deserialize_with = "lenient_strings")]
    key_changes: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    added_sections: Vec<AddedSection>,
    #[serde(default, deserialize_with = "lenient_strings")]
    expected_improvements: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VariantWire {
    #[serde(default, deserialize_with = "lenient_string")]
    prompt: String,
    #[serde(default, deserialize_with = "lenient_string")]
    focus: String,
    #[serde(default, deserialize_with = "lenient_strings")]
    key_differences: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AbWire {
    variant_a: Option<VariantWire>,
    variant_b: Option<VariantWire>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptVariant {
    pub script: String,
    pub focus: String,
    pub key_differences: Vec<String>,
}

/// Exactly two variants of the rewritten script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbVariants {
    pub outcome_aggressive: ScriptVariant,
    pub consultative: ScriptVariant,
}

/// Persisted document `optimization_package[agent_id]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPackage {
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
    pub original_script: String,
    pub rewritten_script: String,
    pub key_changes: Vec<String>,
    pub added_sections: Vec<AddedSection>,
    pub expected_improvements: Vec<String>,
    pub ab_variants: Option<AbVariants>,
    /// Why the A/B step produced nothing, when it ran and failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_error: Option<FailureRecord>,
    pub rollout: RolloutPlan,
}

#[derive(Debug, Clone)]
pub struct RewriteSettings {
    pub stage_pacing: Duration,
    pub ab_variants: bool,
}

pub struct PromptRewriter {
    llm: Arc<dyn CompletionService>,
    prompts: Arc<dyn PromptSource>,
    store: Arc<dyn ArtifactStore>,
    settings: RewriteSettings,
}

impl PromptRewriter {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        prompts: Arc<dyn PromptSource>,
        store: Arc<dyn ArtifactStore>,
        settings: RewriteSettings,
    ) -> Self {
        Self {
            llm,
            prompts,
            store,
            settings,
        }
    }

    /// Build and persist the package and rollout instructions for `agent`.
    ///
    /// The plan is read back from the store; a missing plan or script is a
    /// hard precondition failure for this agent.
    #[instrument(name = "optimize_prompt", skip(self), fields(agent_id = %agent))]
    pub async fn optimize(&self, agent: &AgentId) -> Result<OptimizationPackage, PipelineError> {
        let key = agent.storage_key();
        let plan: ImprovementPlan = self
            .store
            .get_json(ArtifactKind::ImprovementPlan, &key)
            .await?
            .ok_or_else(|| PipelineError::NoImprovementPlan(agent.clone()))?;
        let original = self
            .prompts
            .current_prompt(agent)
            .await?
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PipelineError::NoCurrentPrompt(agent.clone()))?;

        let rewrite = self.rewrite(&original, &plan).await?;

        let (ab_variants, ab_error) = if self.settings.ab_variants {
            tokio::time::sleep(self.settings.stage_pacing).await;
            match self.variants(&rewrite.optimized_prompt).await {
                Ok(variants) => (Some(variants), None),
                Err(err) => {
                    tracing::warn!(error = %err, "A/B variant generation failed, keeping base rewrite");
                    (None, Some(err.to_record()))
                }
            }
        } else {
            (None, None)
        };

        let rollout = RolloutPlan::for_plan(&plan, ab_variants.is_some());
        let package = OptimizationPackage {
            agent_id: agent.clone(),
            created_at: Utc::now(),
            original_script: original,
            rewritten_script: rewrite.optimized_prompt,
            key_changes: rewrite.key_changes,
            added_sections: rewrite.added_sections,
            expected_improvements: rewrite.expected_improvements,
            ab_variants,
            ab_error,
            rollout,
        };

        self.store
            .put_json(ArtifactKind::OptimizationPackage, &key, &package)
            .await?;
        self.store
            .put_text(
                ArtifactKind::RolloutInstructions,
                &key,
                &package.rollout.render_markdown(agent),
            )
            .await?;

        tracing::info!(
            key_changes = package.key_changes.len(),
            ab_variants = package.ab_variants.is_some(),
            "optimization package written"
        );
        Ok(package)
    }

    async fn rewrite(&self, original: &str, plan: &ImprovementPlan) -> Result<RewriteWire, PipelineError> {
        let original_sections = section_headings(original);
        let request = prompts::rewrite_request(original, &prompts::evidence_value(plan), &original_sections);
        let raw = self.complete(Stage::Rewrite, &request).await?;
        let mut rewrite: RewriteWire = extract_json(&raw).map_err(|e| PipelineError::malformed(Stage::Rewrite, e, &raw))?;

        if rewrite.optimized_prompt.trim().is_empty() {
            return Err(PipelineError::malformed(Stage::Rewrite, "empty optimized_prompt", &raw));
        }

        let rewritten_sections = section_headings(&rewrite.optimized_prompt);
        let missing = missing_sections(&original_sections, &rewritten_sections);
        if !missing.is_empty() {
            return Err(PipelineError::malformed(
                Stage::Rewrite,
                format!("rewrite dropped or reordered sections: {}", missing.join(", ")),
                &raw,
            ));
        }

        if !has_heading(&rewritten_sections, SUCCESSFUL_PATTERNS_HEADING) {
            append_section(&mut rewrite, SUCCESSFUL_PATTERNS_HEADING, successful_patterns_body(plan));
        }
        if !has_heading(&rewritten_sections, AVOID_MISTAKES_HEADING) {
            append_section(&mut rewrite, AVOID_MISTAKES_HEADING, avoid_mistakes_body(plan));
        }
        Ok(rewrite)
    }

    async fn variants(&self, base: &str) -> Result<AbVariants, PipelineError> {
        let request = prompts::ab_variants_request(base);
        let raw = self.complete(Stage::AbVariants, &request).await?;
        let wire: AbWire = extract_json(&raw).map_err(|e| PipelineError::malformed(Stage::AbVariants, e, &raw))?;

        let variant = |v: Option<VariantWire>, name: &str| -> Result<ScriptVariant, PipelineError> {
            match v {
                Some(v) if !v.prompt.trim().is_empty() => Ok(ScriptVariant {
                    script: v.prompt,
                    focus: v.focus,
                    key_differences: v.key_differences,
                }),
                _ => Err(PipelineError::malformed(
                    Stage::AbVariants,
                    format!("{} missing or empty", name),
                    &raw,
                )),
            }
        };

        Ok(AbVariants {
            outcome_aggressive: variant(wire.variant_a, "variant_a")?,
            consultative: variant(wire.variant_b, "variant_b")?,
        })
    }

    async fn complete(&self, stage: Stage, request: &CompletionRequest) -> Result<String, PipelineError> {
        self.llm
            .complete(request)
            .await
            .map_err(|e| PipelineError::from_llm(stage, e))
    }
}

fn append_section(rewrite: &mut RewriteWire, heading: &str, lines: Vec<String>) {
    let mut section = format!("\n\n## {}\n", heading);
    for line in &lines {
        section.push_str("- ");
        section.push_str(line);
        section.push('\n');
    }
    rewrite.optimized_prompt = format!("{}{}", rewrite.optimized_prompt.trim_end(), section);
    rewrite
        .key_changes
        .push(format!("Appended missing \"{}\" section from the improvement plan", heading));
    rewrite.added_sections.push(AddedSection {
        section: heading.to_string(),
        purpose: "Added from the improvement plan".to_string(),
    });
}

fn successful_patterns_body(plan: &ImprovementPlan) -> Vec<String> {
    let script = &plan.recommendations.script_improvements;
    let mut lines: Vec<String> = script
        .opening_examples
        .iter()
        .map(|o| format!("Opening that works: \"{}\"", o))
        .chain(script.recommended_phrases.iter().map(|p| format!("Use: \"{}\"", p)))
        .collect();
    if lines.is_empty() {
        lines.extend(plan.success_patterns.patterns.key_success_factors.iter().cloned());
    }
    if lines.is_empty() {
        lines.push("Keep the structure of the best scoring calls".to_string());
    }
    lines
}

fn avoid_mistakes_body(plan: &ImprovementPlan) -> Vec<String> {
    let failures = &plan.failure_patterns.patterns;
    let mut lines: Vec<String> = failures
        .avoid_phrases
        .iter()
        .filter(|p| !p.phrase.trim().is_empty())
        .map(|p| match p.alternative.trim() {
            "" => format!("Do not say \"{}\"", p.phrase),
            alt => format!("Instead of \"{}\" say \"{}\"", p.phrase, alt),
        })
        .chain(
            failures
                .general_issues
                .iter()
                .filter(|i| !i.issue.trim().is_empty())
                .map(|i| match i.fix.trim() {
                    "" => i.issue.clone(),
                    fix => format!("{}: {}", i.issue, fix),
                }),
        )
        .collect();
    if lines.is_empty() {
        lines.extend(plan.recommendations.training_focus.iter().cloned());
    }
    if lines.is_empty() {
        lines.push("Do not talk over the customer".to_string());
    }
    lines
}
