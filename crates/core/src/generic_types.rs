use serde::{Deserialize, Serialize};

/// Generic configuration for opening a live connection with any provider.
#[derive(Debug, Clone, Default)]
pub struct GenericSessionConfig {
    /// Natural-language teaching instructions sent at connection time.
    pub instructions: String,
    pub voice: Option<String>,
}

/// Speaker of a transcription fragment or a persisted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Events any real-time provider emits back to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum GenericServerEvent {
    /// Raw PCM audio produced by the model.
    Audio(Vec<u8>),
    Transcription { role: Role, text: String },
    TurnComplete,
    Error(String),
    Closed,
}
