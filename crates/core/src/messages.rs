//! JSON messages exchanged with the client over the session socket.

use crate::generic_types::Role;
use crate::persistence::TurnRecord;
use crate::scoring::Evaluation;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters of a `start_session` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSession {
    pub user_id: String,
    #[serde(default = "default_mother_language")]
    pub mother_language: String,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default = "default_user_level")]
    pub user_level: String,
    #[serde(default = "default_teaching_mode")]
    pub teaching_mode: String,
    #[serde(default)]
    pub scenario: Option<String>,
}

fn default_mother_language() -> String {
    "english".to_string()
}

fn default_target_language() -> String {
    "spanish".to_string()
}

fn default_user_level() -> String {
    "beginner".to_string()
}

fn default_teaching_mode() -> String {
    "conversation".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession(StartSession),
    /// Base64-encoded 16-bit PCM.
    Audio { data: String },
    EndSession,
}

impl ClientMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        session_id: String,
    },
    Audio {
        data: String,
        sample_rate: u32,
    },
    Transcription {
        source: Role,
        text: String,
    },
    TurnComplete,
    Feedback {
        turn_index: u64,
        total_score: f64,
        metrics: BTreeMap<String, f64>,
        feedback: String,
        teaching_mode: String,
    },
    Error {
        message: String,
        /// True when the session cannot continue.
        fatal: bool,
    },
    SessionEnded {
        session_id: String,
    },
}

impl ServerMessage {
    pub fn audio(pcm: &[u8], sample_rate: u32) -> Self {
        ServerMessage::Audio {
            data: STANDARD.encode(pcm),
            sample_rate,
        }
    }

    pub fn feedback(record: &TurnRecord, evaluation: &Evaluation, teaching_mode: &str) -> Self {
        ServerMessage::Feedback {
            turn_index: record.turn_index,
            total_score: evaluation.total_score,
            metrics: evaluation.metrics.clone(),
            feedback: evaluation.feedback.clone(),
            teaching_mode: teaching_mode.to_string(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn decode_audio(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}
