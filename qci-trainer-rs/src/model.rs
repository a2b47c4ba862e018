// qci-trainer-rs/src/model.rs
// Core data model: identifiers, inbound call records and the normalized
// conversation produced by the structurer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Filesystem-safe key for this identifier. Injective and
            /// reversible through [`decode_storage_key`]; never truncated.
            pub fn storage_key(&self) -> String {
                encode_storage_key(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Full identifier of a conversational agent (assistant) on the call
    /// platform.
    AgentId
);
string_id!(CallId);

/// Percent-encode every byte outside `[A-Za-z0-9_-]`.
pub fn encode_storage_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Inverse of [`encode_storage_key`]. Returns `None` for keys it could not
/// have produced.
pub fn decode_storage_key(key: &str) -> Option<String> {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = key.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// One message of the platform's message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    pub role: String,
    #[serde(default, alias = "content")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Raw call record as exported by the call platform.
///
/// Only the fields the pipeline reads are typed; everything else is carried
/// through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: CallId,
    #[serde(alias = "agentId")]
    pub assistant_id: AgentId,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ended_reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<CallMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Call {
    pub fn transcript_text(&self) -> &str {
        self.transcript.as_deref().unwrap_or("")
    }

    /// Call length from the start/end timestamps; 0 when either is missing or
    /// unparseable.
    pub fn duration_secs(&self) -> f64 {
        let parse = |ts: &Option<String>| {
            ts.as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };
        match (parse(&self.started_at), parse(&self.ended_at)) {
            (Some(start), Some(end)) if end > start => {
                (end - start).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        }
    }

    /// The instruction script the agent ran with, if the platform logged it.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role.eq_ignore_ascii_case("system"))
            .and_then(|m| m.message.as_deref())
            .filter(|m| !m.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Customer,
}

impl Speaker {
    /// Map the speaker labels models and transcripts use onto the two roles.
    pub fn parse(label: &str) -> Option<Speaker> {
        match label.trim().to_ascii_lowercase().as_str() {
            "agent" | "assistant" | "ai" | "bot" | "operator" => Some(Speaker::Agent),
            "customer" | "user" | "client" | "lead" | "prospect" => Some(Speaker::Customer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub speaker: Speaker,
    pub text: String,
}

/// How the call ended, from the agent's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Meeting,
    Interested,
    Callback,
    InfoOnly,
    NoOutcome,
}

impl Outcome {
    pub fn parse(label: &str) -> Option<Outcome> {
        let normalized: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();

        match normalized.as_str() {
            "meeting" | "meeting_booked" | "meeting_scheduled" | "appointment" => Some(Outcome::Meeting),
            "interested" | "warm" | "warm_lead" => Some(Outcome::Interested),
            "callback" | "call_back" | "callback_set" | "callback_scheduled" => Some(Outcome::Callback),
            "info" | "info_only" | "info_sent" | "information" => Some(Outcome::InfoOnly),
            "none" | "no_outcome" | "not_interested" | "rejected" | "failed" => Some(Outcome::NoOutcome),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Meeting => "meeting",
            Outcome::Interested => "interested",
            Outcome::Callback => "callback",
            Outcome::InfoOnly => "info_only",
            Outcome::NoOutcome => "no_outcome",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMoments {
    pub opening_line: Option<String>,
    pub value_proposition: Option<String>,
    pub closing_attempt: Option<String>,
    #[serde(default)]
    pub objection_handling: Vec<String>,
}

/// Turn-by-turn view of one call plus the analytical metadata attached by
/// the structurer. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedConversation {
    pub turns: Vec<Turn>,
    /// Agent share of spoken characters, in [0, 1]
    pub talk_ratio: f64,
    pub outcome: Outcome,
    #[serde(default)]
    pub objections: Vec<String>,
    pub key_moments: KeyMoments,
}
