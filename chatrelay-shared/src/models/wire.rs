//! Application messages exchanged over a relay connection.
//!
//! Inbound frames are parsed once at the boundary into [`ClientFrame`]; every
//! outbound event is an [`OutboundEvent`] tagged by `role`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{
    chat::{ConversationId, StoredMessage},
    user::AuthUser,
};

/// Profile fields merged into the system context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
}

impl ProfileData {
    /// Renders the profile block appended to the system instruction.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "User Profile:\nName: {}\nOccupation: {}",
            self.name.as_deref().unwrap_or_default(),
            self.occupation.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Auth {
        #[serde(default)]
        credential: Option<String>,
        #[serde(default)]
        email: Option<String>,
        #[serde(default, rename = "isGuest")]
        is_guest: bool,
    },
    ProfileUpdate {
        data: ProfileData,
    },
    ChatInit {
        #[serde(default, rename = "chatId")]
        chat_id: Option<String>,
        #[serde(default, rename = "firstMessage")]
        first_message: Option<String>,
    },
    Message {
        content: String,
        #[serde(default, rename = "chatId")]
        chat_id: Option<String>,
    },
}

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Structured(InboundMessage),
    /// A payload that is not a JSON object, taken as chat content verbatim.
    PlainText(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("message is missing a 'type' field")]
    MissingType,
    #[error("invalid message: {0}")]
    Invalid(String),
}

impl ClientFrame {
    /// Parses a text frame.
    ///
    /// # Errors
    /// Returns [`FrameError`] for JSON objects that lack a known `type` or
    /// required fields. Anything that is not a JSON object is plain text.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => value,
            _ => return Ok(Self::PlainText(raw.to_string())),
        };

        if value.get("type").is_none() {
            return Err(FrameError::MissingType);
        }

        serde_json::from_value::<InboundMessage>(value)
            .map(Self::Structured)
            .map_err(|err| FrameError::Invalid(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum OutboundEvent {
    AuthSuccess {
        user: AuthUser,
    },
    Error {
        content: String,
    },
    ChatLoaded {
        #[serde(rename = "chatId")]
        chat_id: ConversationId,
        title: String,
        messages: Vec<StoredMessage>,
    },
    ChatCreated {
        #[serde(rename = "chatId")]
        chat_id: ConversationId,
        title: String,
    },
    AiStart,
    /// Carries the full accumulated response so far.
    Ai {
        content: String,
    },
    AiComplete {
        success: bool,
    },
}

impl OutboundEvent {
    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AuthSuccess { .. } => "auth_success",
            Self::Error { .. } => "error",
            Self::ChatLoaded { .. } => "chat_loaded",
            Self::ChatCreated { .. } => "chat_created",
            Self::AiStart => "ai_start",
            Self::Ai { .. } => "ai",
            Self::AiComplete { .. } => "ai_complete",
        }
    }
}
