use thiserror::Error;

use shared::llms::CompletionError;

use crate::services::history_store::HistoryError;
use crate::services::identity::IdentityError;

/// The store operation that failed, which decides the user-facing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStep {
    CreateConversation,
    LoadConversation,
    SaveMessage,
    LoadHistory,
}

impl PersistStep {
    const fn user_message(self) -> &'static str {
        match self {
            Self::CreateConversation => "Failed to create conversation",
            Self::LoadConversation => "Failed to load conversation",
            Self::SaveMessage => "Failed to save message",
            Self::LoadHistory => "Failed to load conversation history",
        }
    }
}

impl std::fmt::Display for PersistStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::CreateConversation => "create conversation",
            Self::LoadConversation => "load conversation",
            Self::SaveMessage => "save message",
            Self::LoadHistory => "load history",
        };
        f.write_str(label)
    }
}

/// Every way handling one inbound frame can fail.
///
/// The `Display` text is for logs. Clients only ever see
/// [`SessionError::user_message`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(#[from] IdentityError),
    #[error("guest sessions are disabled")]
    GuestsDisabled,
    #[error("frame received before authentication")]
    NotAuthenticated,
    #[error("session is already authenticated")]
    AlreadyAuthenticated,
    #[error("upstream completion failed: {0}")]
    UpstreamCompletionFailure(#[from] CompletionError),
    #[error("failed to {step}: {source}")]
    PersistenceFailure {
        step: PersistStep,
        #[source]
        source: HistoryError,
    },
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("a turn is already streaming")]
    TurnInProgress,
    #[error("conversation {0} is missing or not owned by this principal")]
    ConversationNotFound(String),
    #[error("message content is empty")]
    EmptyMessage,
    #[error("guest session asked for stored conversation {0}")]
    GuestConversation(String),
}

impl SessionError {
    /// Short fixed text sent to the client.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::AuthenticationFailure(_) => "Authentication failed",
            Self::GuestsDisabled => "Guest access is disabled",
            Self::NotAuthenticated => "User not authenticated",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::UpstreamCompletionFailure(_) => {
                "Sorry, I encountered an error. Please try again."
            }
            Self::PersistenceFailure { step, .. } => step.user_message(),
            Self::MalformedInput(_) => "Malformed message",
            Self::TurnInProgress => "A response is already in progress",
            Self::ConversationNotFound(_) => "Conversation not found",
            Self::EmptyMessage => "Message cannot be empty",
            Self::GuestConversation(_) => "Guest sessions cannot load saved conversations",
        }
    }

    /// Maps a store failure, keeping ownership and existence problems apart
    /// from genuine storage faults.
    pub fn from_history(step: PersistStep, error: HistoryError) -> Self {
        match error {
            HistoryError::NotFound(id) | HistoryError::Forbidden(id) => {
                Self::ConversationNotFound(id.to_string())
            }
            source => Self::PersistenceFailure { step, source },
        }
    }

    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::PersistenceFailure { .. })
    }
}
