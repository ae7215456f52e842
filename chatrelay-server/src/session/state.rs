use shared::models::{ConversationId, Principal, ProfileData};

use super::error::SessionError;
use super::log::MessageLog;

/// Where a session stands, derived from its bound state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Authenticated,
    ConversationBound,
    Streaming,
}

/// Per-connection state. Owned by exactly one connection.
#[derive(Debug, Default)]
pub struct Session {
    principal: Option<Principal>,
    conversation_id: Option<ConversationId>,
    profile_context: Option<String>,
    scratch: MessageLog,
    streaming: bool,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        match (&self.principal, self.conversation_id, self.streaming) {
            (None, _, _) => Phase::Unauthenticated,
            (Some(_), _, true) => Phase::Streaming,
            (Some(_), Some(_), false) => Phase::ConversationBound,
            (Some(_), None, false) => Phase::Authenticated,
        }
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Returns the bound principal or the not-authenticated rejection.
    ///
    /// # Errors
    /// [`SessionError::NotAuthenticated`] before a successful `auth`.
    pub fn require_principal(&self) -> Result<&Principal, SessionError> {
        self.principal.as_ref().ok_or(SessionError::NotAuthenticated)
    }

    /// Binds the principal. The binding is permanent for the session.
    ///
    /// # Errors
    /// [`SessionError::AlreadyAuthenticated`] if a principal is bound.
    pub fn bind_principal(&mut self, principal: Principal) -> Result<(), SessionError> {
        if self.principal.is_some() {
            return Err(SessionError::AlreadyAuthenticated);
        }
        self.principal = Some(principal);
        Ok(())
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    /// Binds a conversation. Switching conversations drops guest scratch
    /// history, which belongs to the previous one.
    pub fn bind_conversation(&mut self, id: ConversationId) {
        if self.conversation_id != Some(id) {
            self.scratch.clear();
        }
        self.conversation_id = Some(id);
    }

    /// Appends a profile block to the running system context.
    pub fn merge_profile(&mut self, profile: &ProfileData) {
        let block = profile.render();
        self.profile_context = Some(match self.profile_context.take() {
            Some(existing) => format!("{existing}\n\n{block}"),
            None => block,
        });
    }

    /// System instruction for the next completion request.
    #[must_use]
    pub fn system_content(&self, base: &str) -> String {
        match &self.profile_context {
            Some(profile) => format!("{base}\n\n{profile}"),
            None => base.to_string(),
        }
    }

    /// Marks a turn as started.
    ///
    /// # Errors
    /// [`SessionError::TurnInProgress`] while another turn is streaming.
    pub fn begin_turn(&mut self) -> Result<(), SessionError> {
        if self.streaming {
            return Err(SessionError::TurnInProgress);
        }
        self.streaming = true;
        Ok(())
    }

    pub fn end_turn(&mut self) {
        self.streaming = false;
    }

    #[must_use]
    pub fn scratch(&self) -> &MessageLog {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut MessageLog {
        &mut self.scratch
    }
}
