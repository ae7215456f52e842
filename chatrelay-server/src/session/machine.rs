//! Per-connection protocol logic.
//!
//! [`SessionMachine::handle`] processes one inbound frame to completion,
//! except for chat turns: those mark the session as streaming and run on
//! their own task so the connection can keep reading (and rejecting a second
//! turn, or noticing a disconnect) while the response streams.
//!
//! Ordering within a turn is fixed: resolve the conversation, persist the
//! user message, reload history, invoke the completion source, relay
//! fragments, then persist the assistant reply only if the stream finished
//! cleanly.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use shared::config::Config;
use shared::llms::{CompletionError, CompletionRequest, CompletionSource};
use shared::models::{
    ChatMessage, ClientFrame, ConversationId, Credential, InboundMessage, MessageRole,
    OutboundEvent, Principal, ProfileData,
};

use super::error::{PersistStep, SessionError};
use super::registry::SessionHandle;
use super::relay::DeltaRelay;
use super::state::Phase;
use super::title::{UNTITLED, derive_title};
use crate::services::history_store::HistoryStore;
use crate::services::identity::IdentityVerifier;

/// Relay settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub system_prompt: String,
    pub title_max_chars: usize,
    pub max_history_messages: usize,
    pub allow_guests: bool,
    pub max_completion_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl MachineSettings {
    #[must_use]
    pub fn from_config(config: &Config, system_prompt: String) -> Self {
        Self {
            system_prompt,
            title_max_chars: config.relay.title_max_chars,
            max_history_messages: config.relay.max_history_messages.max(1),
            allow_guests: config.auth.allow_guests,
            max_completion_tokens: config.completion.max_completion_tokens,
            temperature: config.completion.temperature,
            top_p: config.completion.top_p,
        }
    }
}

/// What handling a frame left running.
#[derive(Debug)]
pub enum HandleOutcome {
    Done,
    /// A chat turn is streaming on the returned task.
    TurnStarted(JoinHandle<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl TurnOutcome {
    const fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
struct Turn {
    principal: Principal,
    content: String,
    requested: Option<ConversationId>,
    /// System instruction as it stood when the message was handled.
    system: String,
}

#[derive(Clone)]
pub struct SessionMachine {
    history: Arc<dyn HistoryStore>,
    verifier: Arc<dyn IdentityVerifier>,
    completion: Arc<dyn CompletionSource>,
    settings: Arc<MachineSettings>,
}

impl fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMachine")
            .field("model", &self.completion.model_name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionMachine {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        verifier: Arc<dyn IdentityVerifier>,
        completion: Arc<dyn CompletionSource>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            history,
            verifier,
            completion,
            settings: Arc::new(settings),
        }
    }

    /// Parses and handles one text frame.
    pub async fn handle_text(&self, session: &Arc<SessionHandle>, raw: &str) -> HandleOutcome {
        match ClientFrame::parse(raw) {
            Ok(frame) => self.handle(session, frame).await,
            Err(err) => {
                self.report(session, &SessionError::MalformedInput(err.to_string()))
                    .await;
                HandleOutcome::Done
            }
        }
    }

    /// Handles one parsed frame. Failures become `error` events; nothing
    /// here terminates the connection.
    pub async fn handle(&self, session: &Arc<SessionHandle>, frame: ClientFrame) -> HandleOutcome {
        let result = match frame {
            ClientFrame::Structured(InboundMessage::Auth {
                credential,
                email,
                is_guest,
            }) => self
                .authenticate(session, credential, email, is_guest)
                .await
                .map(|()| HandleOutcome::Done),
            ClientFrame::Structured(InboundMessage::ProfileUpdate { data }) => self
                .update_profile(session, &data)
                .await
                .map(|()| HandleOutcome::Done),
            ClientFrame::Structured(InboundMessage::ChatInit {
                chat_id,
                first_message,
            }) => self
                .init_chat(session, chat_id, first_message)
                .await
                .map(|()| HandleOutcome::Done),
            ClientFrame::Structured(InboundMessage::Message { content, chat_id }) => {
                self.start_turn(session, content, chat_id).await
            }
            ClientFrame::PlainText(content) => self.start_turn(session, content, None).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.report(session, &err).await;
                HandleOutcome::Done
            }
        }
    }

    async fn authenticate(
        &self,
        session: &Arc<SessionHandle>,
        credential: Option<String>,
        email: Option<String>,
        is_guest: bool,
    ) -> Result<(), SessionError> {
        if session.state().await.principal().is_some() {
            return Err(SessionError::AlreadyAuthenticated);
        }

        let principal = if is_guest {
            if !self.settings.allow_guests {
                metrics::counter!("chatrelay_auth_total", "outcome" => "rejected").increment(1);
                return Err(SessionError::GuestsDisabled);
            }
            let id = email
                .map(|email| email.trim().to_string())
                .filter(|email| !email.is_empty())
                .unwrap_or_else(|| format!("guest-{}", Uuid::new_v4()));
            Principal::guest(id)
        } else {
            let credential = match (credential, email) {
                (Some(raw), _) => self.verifier.credential_from_raw(raw),
                (None, Some(email)) => Credential::Email(email),
                (None, None) => {
                    return Err(SessionError::MalformedInput(
                        "auth carries neither credential nor email".into(),
                    ));
                }
            };

            match self.verifier.verify(&credential).await {
                Ok(principal) => principal,
                Err(err) => {
                    metrics::counter!("chatrelay_auth_total", "outcome" => "rejected")
                        .increment(1);
                    return Err(err.into());
                }
            }
        };

        session.state().await.bind_principal(principal.clone())?;

        let outcome = if principal.guest { "guest" } else { "verified" };
        metrics::counter!("chatrelay_auth_total", "outcome" => outcome).increment(1);
        info!(principal = %principal, "session authenticated");

        session
            .send(OutboundEvent::AuthSuccess {
                user: principal.to_auth_user(),
            })
            .await;
        Ok(())
    }

    async fn update_profile(
        &self,
        session: &Arc<SessionHandle>,
        data: &ProfileData,
    ) -> Result<(), SessionError> {
        let mut state = session.state().await;
        state.require_principal()?;
        state.merge_profile(data);
        debug!("profile context updated");
        Ok(())
    }

    async fn init_chat(
        &self,
        session: &Arc<SessionHandle>,
        chat_id: Option<String>,
        first_message: Option<String>,
    ) -> Result<(), SessionError> {
        let (principal, bound) = {
            let state = session.state().await;
            let principal = state.require_principal()?.clone();
            if state.phase() == Phase::Streaming {
                return Err(SessionError::TurnInProgress);
            }
            (principal, state.conversation_id())
        };

        let requested = chat_id
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(parse_conversation_id)
            .transpose()?;

        let event = match (requested, principal.guest) {
            (Some(id), true) => {
                if bound != Some(id) {
                    return Err(SessionError::GuestConversation(id.to_string()));
                }
                let state = session.state().await;
                OutboundEvent::ChatLoaded {
                    chat_id: id,
                    title: state.scratch().first_user_message().map_or_else(
                        || UNTITLED.to_string(),
                        |text| derive_title(text, self.settings.title_max_chars),
                    ),
                    messages: state.scratch().snapshot(),
                }
            }
            (Some(id), false) => {
                let summary = self
                    .history
                    .get_conversation(&principal.id, id)
                    .await
                    .map_err(|err| SessionError::from_history(PersistStep::LoadConversation, err))?;
                let messages = self
                    .history
                    .list_messages(&principal.id, id)
                    .await
                    .map_err(|err| SessionError::from_history(PersistStep::LoadHistory, err))?;
                session.state().await.bind_conversation(id);
                OutboundEvent::ChatLoaded {
                    chat_id: id,
                    title: summary.title,
                    messages,
                }
            }
            (None, guest) => {
                let title = derive_title(
                    first_message.as_deref().unwrap_or_default(),
                    self.settings.title_max_chars,
                );
                let id = if guest {
                    Uuid::new_v4()
                } else {
                    self.history
                        .create_conversation(&principal.id, &title)
                        .await
                        .map_err(|err| {
                            SessionError::from_history(PersistStep::CreateConversation, err)
                        })?
                        .id
                };
                session.state().await.bind_conversation(id);
                OutboundEvent::ChatCreated { chat_id: id, title }
            }
        };

        session.send(event).await;
        Ok(())
    }

    async fn start_turn(
        &self,
        session: &Arc<SessionHandle>,
        content: String,
        chat_id: Option<String>,
    ) -> Result<HandleOutcome, SessionError> {
        let principal = session.state().await.require_principal()?.clone();
        if content.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let requested = chat_id
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(parse_conversation_id)
            .transpose()?;

        // Later frames (profile updates included) must not reach this turn.
        let system = {
            let mut state = session.state().await;
            if principal.guest
                && let Some(id) = requested
                && state.conversation_id() != Some(id)
            {
                return Err(SessionError::GuestConversation(id.to_string()));
            }
            state.begin_turn()?;
            state.system_content(&self.settings.system_prompt)
        };

        let turn = Turn {
            principal,
            content,
            requested,
            system,
        };
        let machine = self.clone();
        let session = Arc::clone(session);
        let span = info_span!("turn", connection = %session.id());
        let task = tokio::spawn(async move { machine.run_turn(session, turn).await }.instrument(span));

        Ok(HandleOutcome::TurnStarted(task))
    }

    async fn run_turn(self, session: Arc<SessionHandle>, turn: Turn) {
        let started = Instant::now();
        let outcome = self.drive_turn(&session, &turn).await;
        session.state().await.end_turn();

        metrics::counter!("chatrelay_turns_total", "outcome" => outcome.label()).increment(1);
        metrics::histogram!("chatrelay_turn_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        debug!(outcome = outcome.label(), "turn finished");
    }

    async fn drive_turn(&self, session: &Arc<SessionHandle>, turn: &Turn) -> TurnOutcome {
        let cancel = session.cancellation().clone();

        let (conversation_id, messages) = match self.prepare_turn(session, turn).await {
            Ok(prepared) => prepared,
            Err(err) => {
                self.report(session, &err).await;
                session
                    .send(OutboundEvent::AiComplete { success: false })
                    .await;
                return TurnOutcome::Failed;
            }
        };

        let request = CompletionRequest::new(messages)
            .with_max_completion_tokens(self.settings.max_completion_tokens)
            .with_temperature(self.settings.temperature)
            .with_top_p(self.settings.top_p);

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return TurnOutcome::Cancelled,
            opened = self.completion.stream_completion(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return self.fail_upstream(session, err).await,
        };

        let mut relay = DeltaRelay::new();
        loop {
            // Dropping the stream on cancellation aborts the upstream call.
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return TurnOutcome::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(fragment)) => {
                    for event in relay.push(&fragment) {
                        if !session.send(event).await {
                            return TurnOutcome::Cancelled;
                        }
                    }
                }
                Some(Err(err)) => return self.fail_upstream(session, err).await,
                None => break,
            }
        }
        drop(stream);

        let reply = relay.finish();
        if !reply.is_empty() {
            self.persist_reply(session, turn, conversation_id, reply).await;
        }

        session
            .send(OutboundEvent::AiComplete { success: true })
            .await;
        TurnOutcome::Completed
    }

    /// Resolves the conversation, records the user message and returns the
    /// prompt history to send upstream.
    async fn prepare_turn(
        &self,
        session: &Arc<SessionHandle>,
        turn: &Turn,
    ) -> Result<(ConversationId, Vec<ChatMessage>), SessionError> {
        let conversation_id = self.resolve_conversation(session, turn).await?;

        if turn.principal.guest {
            let mut state = session.state().await;
            state
                .scratch_mut()
                .append(MessageRole::User, turn.content.as_str());
            let history = state.scratch().chat_messages();
            return Ok((conversation_id, self.assemble(&turn.system, history)));
        }

        let owner = turn.principal.id.as_str();
        self.history
            .append_message(owner, conversation_id, MessageRole::User, &turn.content)
            .await
            .map_err(|err| SessionError::from_history(PersistStep::SaveMessage, err))?;

        let stored = self
            .history
            .list_messages(owner, conversation_id)
            .await
            .map_err(|err| SessionError::from_history(PersistStep::LoadHistory, err))?;

        let history = stored.iter().map(|message| message.to_chat_message()).collect();
        Ok((conversation_id, self.assemble(&turn.system, history)))
    }

    async fn resolve_conversation(
        &self,
        session: &Arc<SessionHandle>,
        turn: &Turn,
    ) -> Result<ConversationId, SessionError> {
        let bound = session.state().await.conversation_id();

        // An explicit chatId wins over the bound conversation.
        if let Some(id) = turn.requested.or(bound) {
            if !turn.principal.guest {
                self.history
                    .touch_conversation(&turn.principal.id, id)
                    .await
                    .map_err(|err| SessionError::from_history(PersistStep::LoadConversation, err))?;
            }
            session.state().await.bind_conversation(id);
            return Ok(id);
        }

        let title = derive_title(&turn.content, self.settings.title_max_chars);
        let id = if turn.principal.guest {
            Uuid::new_v4()
        } else {
            self.history
                .create_conversation(&turn.principal.id, &title)
                .await
                .map_err(|err| SessionError::from_history(PersistStep::CreateConversation, err))?
                .id
        };

        session.state().await.bind_conversation(id);
        session
            .send(OutboundEvent::ChatCreated { chat_id: id, title })
            .await;
        Ok(id)
    }

    fn assemble(&self, system: &str, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let skip = history
            .len()
            .saturating_sub(self.settings.max_history_messages);
        std::iter::once(ChatMessage::system(system))
            .chain(history.into_iter().skip(skip))
            .collect()
    }

    async fn persist_reply(
        &self,
        session: &Arc<SessionHandle>,
        turn: &Turn,
        conversation_id: ConversationId,
        reply: String,
    ) {
        if turn.principal.guest {
            session
                .state()
                .await
                .scratch_mut()
                .append(MessageRole::Assistant, reply);
            return;
        }

        if let Err(err) = self
            .history
            .append_message(
                &turn.principal.id,
                conversation_id,
                MessageRole::Assistant,
                &reply,
            )
            .await
        {
            metrics::counter!("chatrelay_persistence_failures_total").increment(1);
            error!(
                conversation = %conversation_id,
                error = %err,
                "failed to persist assistant reply"
            );
        }
    }

    async fn fail_upstream(&self, session: &Arc<SessionHandle>, err: CompletionError) -> TurnOutcome {
        metrics::counter!("chatrelay_upstream_failures_total").increment(1);
        let err = SessionError::from(err);
        warn!(error = %err, "completion stream failed");

        session
            .send(OutboundEvent::Ai {
                content: err.user_message().to_string(),
            })
            .await;
        session
            .send(OutboundEvent::AiComplete { success: false })
            .await;
        TurnOutcome::Failed
    }

    async fn report(&self, session: &Arc<SessionHandle>, err: &SessionError) {
        if err.is_persistence() {
            metrics::counter!("chatrelay_persistence_failures_total").increment(1);
            error!(error = %err, "history store failure");
        } else {
            debug!(error = %err, "frame rejected");
        }
        session.send(OutboundEvent::error(err.user_message())).await;
    }
}

fn parse_conversation_id(raw: &str) -> Result<ConversationId, SessionError> {
    Uuid::parse_str(raw.trim()).map_err(|_| SessionError::ConversationNotFound(raw.to_string()))
}
