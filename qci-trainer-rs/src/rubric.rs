// qci-trainer-rs/src/rubric.rs
// The fixed QCI rubric: category maxima, component caps, derived points and
// tier boundaries. Everything here is pure.

use serde::{Deserialize, Serialize};

use crate::model::Outcome;

pub const DYNAMICS_MAX: u8 = 30;
pub const OBJECTIONS_MAX: u8 = 20;
pub const BRAND_MAX: u8 = 20;
pub const OUTCOME_MAX: u8 = 30;

pub const TALK_RATIO_MAX: u8 = 8;
pub const TIME_TO_VALUE_MAX: u8 = 8;
pub const FIRST_CTA_MAX: u8 = 8;
pub const DEAD_AIR_PENALTY_PER_GAP: u8 = 2;
pub const DEAD_AIR_PENALTY_CAP: u8 = 6;

pub const STOP_RECOGNITION_MAX: u8 = 6;
pub const REACTION_TIME_MAX: u8 = 8;
pub const ALTERNATIVE_OFFERED_MAX: u8 = 6;

pub const FIRST_BRAND_MENTION_MAX: u8 = 8;
pub const BRAND_CONSISTENCY_MAX: u8 = 8;
pub const LANGUAGE_MATCH_MAX: u8 = 4;

pub const WRAP_UP_MAX: u8 = 5;
pub const TOOL_HYGIENE_MAX: u8 = 10;

const TALK_RATIO_TARGET: (f64, f64) = (0.35, 0.55);
const TALK_RATIO_FALLOFF: (f64, f64) = (0.25, 0.65);

/// Full points inside the target band, linear falloff to zero at the
/// falloff bounds.
pub fn talk_ratio_points(ratio: f64) -> u8 {
    let (lo, hi) = TALK_RATIO_TARGET;
    let (floor, ceil) = TALK_RATIO_FALLOFF;
    let max = f64::from(TALK_RATIO_MAX);

    let points = if (lo..=hi).contains(&ratio) {
        max
    } else if ratio >= floor && ratio < lo {
        max * (ratio - floor) / (lo - floor)
    } else if ratio > hi && ratio <= ceil {
        max * (ceil - ratio) / (ceil - hi)
    } else {
        0.0
    };
    points.round() as u8
}

pub fn dead_air_penalty(gaps: u32) -> u8 {
    let penalty = gaps.saturating_mul(u32::from(DEAD_AIR_PENALTY_PER_GAP));
    penalty.min(u32::from(DEAD_AIR_PENALTY_CAP)) as u8
}

pub fn outcome_points(outcome: Outcome) -> u8 {
    match outcome {
        Outcome::Meeting => 15,
        Outcome::Interested => 10,
        Outcome::Callback => 6,
        Outcome::InfoOnly => 4,
        Outcome::NoOutcome => 0,
    }
}

/// Round a reported component to whole points inside `[0, max]`.
pub fn clamp_points(value: f64, max: u8) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, f64::from(max)) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicsScore {
    pub talk_ratio: u8,
    pub time_to_value: u8,
    pub first_cta: u8,
    pub dead_air_gaps: u32,
    pub dead_air_penalty: u8,
    pub total: u8,
}

impl DynamicsScore {
    pub fn new(talk_ratio: u8, time_to_value: u8, first_cta: u8, dead_air_gaps: u32) -> Self {
        let talk_ratio = talk_ratio.min(TALK_RATIO_MAX);
        let time_to_value = time_to_value.min(TIME_TO_VALUE_MAX);
        let first_cta = first_cta.min(FIRST_CTA_MAX);
        let dead_air_penalty = dead_air_penalty(dead_air_gaps);
        let earned = i32::from(talk_ratio) + i32::from(time_to_value) + i32::from(first_cta);
        let total = (earned - i32::from(dead_air_penalty)).clamp(0, i32::from(DYNAMICS_MAX)) as u8;
        Self {
            talk_ratio,
            time_to_value,
            first_cta,
            dead_air_gaps,
            dead_air_penalty,
            total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectionsScore {
    pub stop_recognition: u8,
    pub reaction_time: u8,
    pub alternative_offered: u8,
    pub total: u8,
}

impl ObjectionsScore {
    pub fn new(stop_recognition: u8, reaction_time: u8, alternative_offered: u8) -> Self {
        let stop_recognition = stop_recognition.min(STOP_RECOGNITION_MAX);
        let reaction_time = reaction_time.min(REACTION_TIME_MAX);
        let alternative_offered = alternative_offered.min(ALTERNATIVE_OFFERED_MAX);
        Self {
            stop_recognition,
            reaction_time,
            alternative_offered,
            total: (stop_recognition + reaction_time + alternative_offered).min(OBJECTIONS_MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandScore {
    pub first_mention: u8,
    pub consistency: u8,
    pub language_match: u8,
    pub total: u8,
}

impl BrandScore {
    pub fn new(first_mention: u8, consistency: u8, language_match: u8) -> Self {
        let first_mention = first_mention.min(FIRST_BRAND_MENTION_MAX);
        let consistency = consistency.min(BRAND_CONSISTENCY_MAX);
        let language_match = language_match.min(LANGUAGE_MATCH_MAX);
        Self {
            first_mention,
            consistency,
            language_match,
            total: (first_mention + consistency + language_match).min(BRAND_MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeScore {
    pub outcome: Outcome,
    pub outcome_points: u8,
    pub wrap_up: u8,
    pub tool_hygiene: u8,
    pub total: u8,
}

impl OutcomeScore {
    pub fn new(outcome: Outcome, wrap_up: u8, tool_hygiene: u8) -> Self {
        let outcome_points = outcome_points(outcome);
        let wrap_up = wrap_up.min(WRAP_UP_MAX);
        let tool_hygiene = tool_hygiene.min(TOOL_HYGIENE_MAX);
        Self {
            outcome,
            outcome_points,
            wrap_up,
            tool_hygiene,
            total: (outcome_points + wrap_up + tool_hygiene).min(OUTCOME_MAX),
        }
    }
}

/// Classification band of a QCI score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Excellent,
    Good,
    Average,
    Poor,
    Failed,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Excellent, Tier::Good, Tier::Average, Tier::Poor, Tier::Failed];

    /// excellent [80,100], good [60,80), average [40,60), poor [20,40),
    /// failed [0,20). Lower bounds are inclusive.
    pub fn for_score(score: f64) -> Tier {
        if score >= 80.0 {
            Tier::Excellent
        } else if score >= 60.0 {
            Tier::Good
        } else if score >= 40.0 {
            Tier::Average
        } else if score >= 20.0 {
            Tier::Poor
        } else {
            Tier::Failed
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Tier::Excellent => "excellent",
            Tier::Good => "good",
            Tier::Average => "average",
            Tier::Poor => "poor",
            Tier::Failed => "failed",
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, Tier::Excellent | Tier::Good)
    }

    pub fn is_failing(&self) -> bool {
        matches!(self, Tier::Poor | Tier::Failed)
    }
}
