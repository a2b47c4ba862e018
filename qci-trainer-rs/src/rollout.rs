// qci-trainer-rs/src/rollout.rs
// Rollout guidance attached to every optimization package, and its Markdown
// rendering for the operator.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::model::AgentId;
use crate::recommendation::ImprovementPlan;

/// Alerts fire when the mean falls this fraction below the current mean.
pub const ALERT_DROP_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPhase {
    pub name: String,
    pub duration: String,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitoring {
    pub track_daily: Vec<String>,
    pub track_weekly: Vec<String>,
    pub alert_triggers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub current_mean: f64,
    pub target_score: u8,
    pub phases: Vec<RolloutPhase>,
    pub success_metrics: Vec<String>,
    pub monitoring: Monitoring,
    pub rollback: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl RolloutPlan {
    pub fn for_plan(plan: &ImprovementPlan, has_ab_variants: bool) -> Self {
        let current_mean = plan.current.mean_score;
        let alert_floor = current_mean * (1.0 - ALERT_DROP_FRACTION);

        let mut ab_actions = strings(&[
            "Clone the agent for variant B",
            "Split traffic 50/50 between the variants",
            "Score every call of both variants",
        ]);
        if !has_ab_variants {
            ab_actions.insert(0, "Generate A/B variants first; none were produced in this run".to_string());
        }

        Self {
            current_mean,
            target_score: plan.recommendations.target_score,
            phases: vec![
                RolloutPhase {
                    name: "Optimized script trial".to_string(),
                    duration: "1 week".to_string(),
                    actions: strings(&[
                        "Back up the current script",
                        "Deploy the optimized script",
                        "Score new calls daily and compare with the previous mean",
                    ]),
                },
                RolloutPhase {
                    name: "A/B test".to_string(),
                    duration: "2 weeks".to_string(),
                    actions: ab_actions,
                },
                RolloutPhase {
                    name: "Adopt the winner".to_string(),
                    duration: "ongoing".to_string(),
                    actions: strings(&[
                        "Keep the variant with the higher mean score",
                        "Start the next training cycle",
                    ]),
                },
            ],
            success_metrics: vec![
                "Mean score up 15-20%".to_string(),
                format!("Mean score reaches {}", plan.recommendations.target_score),
                "More calls converted to booked meetings".to_string(),
                "Fewer refusals in the first 30 seconds".to_string(),
            ],
            monitoring: Monitoring {
                track_daily: strings(&["QCI scores", "Call success rate", "Average call duration"]),
                track_weekly: strings(&["Pattern consistency", "Coaching adherence", "Performance trends"]),
                alert_triggers: vec![
                    format!(
                        "Mean QCI falls 10% below the current mean (below {:.1})",
                        alert_floor
                    ),
                    "Sharp rise in refusals".to_string(),
                    "Drop in meeting conversion".to_string(),
                ],
            },
            rollback: "Restore the backed-up script if any alert persists for two consecutive days \
                       or the mean score is below the starting mean after the trial week."
                .to_string(),
        }
    }

    /// Operator-facing instructions. Content only; nothing parses it back.
    pub fn render_markdown(&self, agent: &AgentId) -> String {
        let mut out = String::new();
        // writing to a String cannot fail
        let _ = writeln!(out, "# Rollout instructions: agent {}", agent);
        let _ = writeln!(out);
        let _ = writeln!(out, "**Current mean QCI:** {:.1}  ", self.current_mean);
        let _ = writeln!(out, "**Target QCI:** {}", self.target_score);

        for (i, phase) in self.phases.iter().enumerate() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Phase {}: {} ({})", i + 1, phase.name, phase.duration);
            let _ = writeln!(out);
            for (n, action) in phase.actions.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", n + 1, action);
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "## Success metrics");
        let _ = writeln!(out);
        for metric in &self.success_metrics {
            let _ = writeln!(out, "- {}", metric);
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "## Monitoring");
        for (title, items) in [
            ("Daily", &self.monitoring.track_daily),
            ("Weekly", &self.monitoring.track_weekly),
            ("Alert triggers", &self.monitoring.alert_triggers),
        ] {
            let _ = writeln!(out);
            let _ = writeln!(out, "### {}", title);
            let _ = writeln!(out);
            for item in items {
                let _ = writeln!(out, "- [ ] {}", item);
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "## Expected results");
        let _ = writeln!(out);
        let _ = writeln!(out, "- After 1 week: first movement in scores, some fluctuation");
        let _ = writeln!(out, "- After 2 weeks: new patterns stable, clear picture of the gain");
        let _ = writeln!(out, "- After 1 month: target reached, ready for the next cycle");

        let _ = writeln!(out);
        let _ = writeln!(out, "## Rollback");
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", self.rollback);
        out
    }
}
