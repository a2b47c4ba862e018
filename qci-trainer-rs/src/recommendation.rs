// qci-trainer-rs/src/recommendation.rs
// Recommendation synthesizer: turns an agent's score summary and mined
// patterns into an improvement plan. Pure; no completion-service calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{AgentQciSummary, ScoreRange};
use crate::categorizer::TierDistribution;
use crate::error::PipelineError;
use crate::model::AgentId;
use crate::patterns::{FailurePatterns, MinedPatterns, SuccessPatterns};

/// Opening examples carried verbatim into the plan.
pub const MAX_SCRIPT_OPENINGS: usize = 3;
/// Recommended phrases carried verbatim into the plan.
pub const MAX_SCRIPT_PHRASES: usize = 5;
/// Mined improvement priorities appended to the band's actions.
pub const MAX_MINED_PRIORITIES: usize = 3;
/// General issues turned into training areas.
pub const MAX_TRAINING_ISSUES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeline {
    #[serde(rename = "2 weeks")]
    TwoWeeks,
    #[serde(rename = "3 weeks")]
    ThreeWeeks,
    #[serde(rename = "1 month")]
    OneMonth,
}

impl Timeline {
    pub fn label(&self) -> &'static str {
        match self {
            Timeline::TwoWeeks => "2 weeks",
            Timeline::ThreeWeeks => "3 weeks",
            Timeline::OneMonth => "1 month",
        }
    }
}

/// Performance band selected by the current mean score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Critical,
    Developing,
    Established,
}

impl Band {
    fn for_mean(mean: f64) -> Band {
        if mean < 40.0 {
            Band::Critical
        } else if mean < 60.0 {
            Band::Developing
        } else {
            Band::Established
        }
    }

    fn table_target(self) -> u8 {
        match self {
            Band::Critical => 55,
            Band::Developing => 70,
            Band::Established => 80,
        }
    }

    fn timeline(self) -> Timeline {
        match self {
            Band::Critical => Timeline::TwoWeeks,
            Band::Developing => Timeline::ThreeWeeks,
            Band::Established => Timeline::OneMonth,
        }
    }

    fn key_metric(self) -> &'static str {
        match self {
            Band::Critical => "Keep customers on the line past the opening",
            Band::Developing => "Raise conversion to booked meetings",
            Band::Established => "Hold quality steady at the higher level",
        }
    }

    fn actions(self) -> [&'static str; 3] {
        match self {
            Band::Critical => [
                "Rewrite the call opening urgently",
                "Run intensive objection-handling training",
                "Review every call daily for one week",
            ],
            Band::Developing => [
                "Sharpen the value proposition",
                "Practice closing technique",
                "Personalize the approach to each customer",
            ],
            Band::Established => [
                "Scale the successful patterns",
                "Fine-tune objection handling",
                "Tighten call time",
            ],
        }
    }
}

/// Target score and timeline for a mean score.
///
/// Uses the fixed table (<40: 55, <60: 70, otherwise 80). A table target at
/// or below the mean is raised to `floor(mean) + 5`, capped at 100. A perfect
/// mean has no headroom.
pub fn target_for(mean: f64) -> Result<(u8, Timeline), PipelineError> {
    if mean >= 100.0 {
        return Err(PipelineError::NoHeadroom { mean });
    }
    let band = Band::for_mean(mean);
    let mut target = band.table_target();
    if f64::from(target) <= mean {
        target = (mean.floor() as u8).saturating_add(5).min(100);
    }
    Ok((target, band.timeline()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub mean_score: f64,
    pub calls_analyzed: usize,
    pub calls_scored: usize,
    pub range: Option<ScoreRange>,
    pub distribution: TierDistribution,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptImprovements {
    pub opening_examples: Vec<String>,
    pub recommended_phrases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub priority_actions: Vec<String>,
    pub target_score: u8,
    pub timeline: Timeline,
    pub key_metric: String,
    pub script_improvements: ScriptImprovements,
    pub training_focus: Vec<String>,
}

/// Persisted document `improvement_plan[agent_id]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementPlan {
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
    pub current: PerformanceSnapshot,
    pub success_patterns: MinedPatterns<SuccessPatterns>,
    pub failure_patterns: MinedPatterns<FailurePatterns>,
    pub recommendations: Recommendations,
}

/// Build the plan. Fails when there is no mean to plan from or no headroom
/// above it.
pub fn synthesize(
    agent: &AgentId,
    summary: &AgentQciSummary,
    distribution: TierDistribution,
    success: MinedPatterns<SuccessPatterns>,
    failures: MinedPatterns<FailurePatterns>,
) -> Result<ImprovementPlan, PipelineError> {
    let mean = summary
        .mean_score
        .ok_or_else(|| PipelineError::ScoringUnavailable(format!("agent {} has no scored calls", agent)))?;
    let (target_score, timeline) = target_for(mean)?;
    let band = Band::for_mean(mean);

    let mut priority_actions: Vec<String> = band.actions().iter().map(|a| a.to_string()).collect();
    priority_actions.extend(mined_actions(&failures.patterns));

    let recommendations = Recommendations {
        priority_actions,
        target_score,
        timeline,
        key_metric: band.key_metric().to_string(),
        script_improvements: script_improvements(&success.patterns),
        training_focus: training_focus(&failures.patterns),
    };

    Ok(ImprovementPlan {
        agent_id: agent.clone(),
        created_at: Utc::now(),
        current: PerformanceSnapshot {
            mean_score: mean,
            calls_analyzed: summary.total_analyzed,
            calls_scored: summary.successful,
            range: summary.range,
            distribution,
        },
        success_patterns: success,
        failure_patterns: failures,
        recommendations,
    })
}

/// Top mined priorities, lowest priority number first; unnumbered last.
fn mined_actions(failures: &FailurePatterns) -> Vec<String> {
    let mut priorities: Vec<_> = failures
        .improvement_priorities
        .iter()
        .filter(|p| !p.action.trim().is_empty() || !p.area.trim().is_empty())
        .collect();
    priorities.sort_by(|a, b| {
        let a = a.priority.unwrap_or(f64::MAX);
        let b = b.priority.unwrap_or(f64::MAX);
        a.total_cmp(&b)
    });

    priorities
        .into_iter()
        .take(MAX_MINED_PRIORITIES)
        .map(|p| match (p.area.trim(), p.action.trim()) {
            ("", action) => action.to_string(),
            (area, "") => area.to_string(),
            (area, action) => format!("{}: {}", area, action),
        })
        .collect()
}

fn script_improvements(success: &SuccessPatterns) -> ScriptImprovements {
    let non_empty = |s: &String| !s.trim().is_empty();
    ScriptImprovements {
        opening_examples: success
            .opening_patterns
            .iter()
            .map(|p| p.example.clone())
            .filter(non_empty)
            .take(MAX_SCRIPT_OPENINGS)
            .collect(),
        recommended_phrases: success
            .recommended_phrases
            .iter()
            .map(|p| p.phrase.clone())
            .filter(non_empty)
            .take(MAX_SCRIPT_PHRASES)
            .collect(),
    }
}

fn training_focus(failures: &FailurePatterns) -> Vec<String> {
    let mut focus = Vec::new();
    if !failures.opening_problems.is_empty() {
        focus.push("Call opening technique".to_string());
    }
    if !failures.objection_handling_problems.is_empty() {
        focus.push("Objection handling".to_string());
    }
    focus.extend(
        failures
            .general_issues
            .iter()
            .map(|i| i.issue.trim())
            .filter(|i| !i.is_empty())
            .take(MAX_TRAINING_ISSUES)
            .map(str::to_string),
    );
    focus
}
