// qci-trainer-rs/src/test_support.rs
// Scripted completion service and fixture builders shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use llm_service::{CompletionRequest, CompletionService, LlmError};
use serde_json::{json, Value};

use crate::model::{AgentId, Call, CallId, KeyMoments, NormalizedConversation, Outcome, Speaker, Turn};

type Reply = Result<String, LlmError>;

/// Completion service that replays canned replies. Replies queued for a
/// request purpose win over the shared queue.
#[derive(Default)]
pub struct ScriptedLlm {
    shared: Mutex<VecDeque<Reply>>,
    by_purpose: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    pub fn routed(routes: Vec<(&str, Vec<Reply>)>) -> Arc<Self> {
        let by_purpose = routes
            .into_iter()
            .map(|(purpose, replies)| (purpose.to_string(), VecDeque::from(replies)))
            .collect();
        Arc::new(Self {
            by_purpose: Mutex::new(by_purpose),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn purposes(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.purpose.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());

        let routed = self
            .by_purpose
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(|q| q.pop_front());
        if let Some(reply) = routed {
            return reply;
        }

        self.shared
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::UnknownError(format!("no scripted reply for {}", request.purpose))))
    }
}

pub fn call(id: &str, agent: &str, transcript: Option<&str>) -> Call {
    let mut raw = json!({ "id": id, "assistantId": agent });
    if let Some(t) = transcript {
        raw["transcript"] = Value::String(t.to_string());
    }
    serde_json::from_value(raw).unwrap()
}

pub fn call_with_prompt(id: &str, agent: &str, transcript: &str, prompt: &str) -> Call {
    serde_json::from_value(json!({
        "id": id,
        "assistantId": agent,
        "transcript": transcript,
        "messages": [{ "role": "system", "message": prompt }]
    }))
    .unwrap()
}

/// Structurer reply whose single agent turn is `line` and whose talk ratio
/// is `ratio`.
pub fn structure_reply(line: &str, ratio: f64, outcome: &str) -> Reply {
    Ok(json!({
        "conversation_flow": [
            {"speaker": "agent", "message": line},
            {"speaker": "customer", "message": "ok"}
        ],
        "call_metadata": {"agent_talk_ratio": ratio, "call_outcome": outcome},
        "key_moments": {"opening_line": line, "value_proposition": line, "closing_attempt": line}
    })
    .to_string())
}

/// Scoring reply that totals 85 with a talk ratio inside [0.35, 0.55].
pub fn score_reply_85() -> Reply {
    Ok(json!({
        "qci_score": 85,
        "breakdown": {
            "dynamics": {"time_to_value_score": 8, "first_cta_score": 8, "dead_air_gaps": 1},
            "objections_compliance": {"recognition_score": 6, "compliance_time_score": 8, "alternative_offered_score": 6},
            "brand_language": {"brand_mention_score": 8, "brand_consistency_score": 8, "language_match_score": 4},
            "outcome_hygiene": {"outcome": "meeting", "wrap_up_score": 5, "tool_hygiene_score": 3}
        },
        "coaching_tips": ["Keep the crisp opening"],
        "evidence": {
            "successful_moments": [{"quote": "Hi, this is Anna from Acme.", "reason": "clear intro"}],
            "improvement_areas": []
        },
        "call_classification": "excellent"
    })
    .to_string())
}

/// Scoring reply that totals 45 with a talk ratio above 0.65.
pub fn score_reply_45() -> Reply {
    Ok(json!({
        "qci_score": 45,
        "breakdown": {
            "dynamics": {"time_to_value_score": 4, "first_cta_score": 2, "dead_air_gaps": 0},
            "objections_compliance": {"recognition_score": 3, "compliance_time_score": 4, "alternative_offered_score": 0},
            "brand_language": {"brand_mention_score": 4, "brand_consistency_score": 4, "language_match_score": 3},
            "outcome_hygiene": {"outcome": "callback", "wrap_up_score": 5, "tool_hygiene_score": 10}
        },
        "coaching_tips": ["Let the customer talk more"],
        "evidence": {
            "successful_moments": [],
            "improvement_areas": [{"quote": "Let me tell you everything", "issue": "monologue"}]
        },
        "call_classification": "average"
    })
    .to_string())
}

pub fn conversation(opening: &str, ratio: f64) -> NormalizedConversation {
    NormalizedConversation {
        turns: vec![
            Turn {
                index: 0,
                speaker: Speaker::Agent,
                text: opening.to_string(),
            },
            Turn {
                index: 1,
                speaker: Speaker::Customer,
                text: "ok".to_string(),
            },
        ],
        talk_ratio: ratio,
        outcome: Outcome::Meeting,
        objections: Vec::new(),
        key_moments: KeyMoments {
            opening_line: Some(opening.to_string()),
            ..KeyMoments::default()
        },
    }
}

pub fn agent(id: &str) -> AgentId {
    AgentId::new(id)
}

pub fn call_id(id: &str) -> CallId {
    CallId::new(id)
}
