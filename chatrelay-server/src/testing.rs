//! Scripted collaborators and a session harness for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::sync::mpsc;

use shared::llms::{
    CompletionError, CompletionRequest, CompletionResult, CompletionSource, FragmentStream,
};
use shared::models::{ConversationId, ConversationSummary, MessageRole, OutboundEvent, StoredMessage};

use crate::app_state::AppState;
use crate::services::history_store::{HistoryError, HistoryResult, HistoryStore, MemoryHistoryStore};
use crate::services::identity::EmailIdentityVerifier;
use crate::session::machine::{HandleOutcome, MachineSettings, SessionMachine};
use crate::session::registry::{SessionHandle, SessionRegistry};

#[derive(Debug, Clone)]
enum Ending {
    Finish,
    Fail(String),
    Stall,
}

/// Completion source replaying a fixed fragment script.
#[derive(Debug)]
pub struct ScriptedCompletion {
    fragments: Vec<String>,
    ending: Ending,
    refuse: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    fn build(fragments: &[&str], ending: Ending, refuse: Option<String>) -> Self {
        Self {
            fragments: fragments.iter().map(ToString::to_string).collect(),
            ending,
            refuse,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(fragments: &[&str]) -> Self {
        Self::build(fragments, Ending::Finish, None)
    }

    pub fn failing_after(fragments: &[&str], message: &str) -> Self {
        Self::build(fragments, Ending::Fail(message.to_string()), None)
    }

    /// Emits the fragments, then never finishes.
    pub fn stalling(fragments: &[&str]) -> Self {
        Self::build(fragments, Ending::Stall, None)
    }

    pub fn refusing(message: &str) -> Self {
        Self::build(&[], Ending::Finish, Some(message.to_string()))
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CompletionSource for ScriptedCompletion {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> CompletionResult<FragmentStream> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        if let Some(message) = &self.refuse {
            return Err(CompletionError::transport(message.clone()));
        }

        let fragments = stream::iter(self.fragments.clone().into_iter().map(Ok));
        let scripted: FragmentStream = match self.ending.clone() {
            Ending::Finish => Box::pin(fragments),
            Ending::Fail(message) => Box::pin(
                fragments.chain(stream::once(async move { Err(CompletionError::transport(message)) })),
            ),
            Ending::Stall => Box::pin(fragments.chain(stream::pending())),
        };
        Ok(scripted)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Memory store whose writes or reads can be made to fail on demand.
#[derive(Debug, Default)]
pub struct FlakyHistory {
    inner: MemoryHistoryStore,
    fail_user_appends: AtomicBool,
    fail_assistant_appends: AtomicBool,
    fail_listing: AtomicBool,
    fail_ready: AtomicBool,
}

impl FlakyHistory {
    pub fn fail_appends(&self, role: MessageRole) {
        match role {
            MessageRole::User => self.fail_user_appends.store(true, Ordering::SeqCst),
            MessageRole::Assistant => self.fail_assistant_appends.store(true, Ordering::SeqCst),
            MessageRole::System => {}
        }
    }

    pub fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }

    pub fn fail_readiness(&self) {
        self.fail_ready.store(true, Ordering::SeqCst);
    }

    fn injected() -> HistoryError {
        HistoryError::Corrupt("injected failure".into())
    }
}

#[async_trait]
impl HistoryStore for FlakyHistory {
    async fn create_conversation(
        &self,
        owner: &str,
        title: &str,
    ) -> HistoryResult<ConversationSummary> {
        self.inner.create_conversation(owner, title).await
    }

    async fn touch_conversation(&self, owner: &str, id: ConversationId) -> HistoryResult<()> {
        self.inner.touch_conversation(owner, id).await
    }

    async fn append_message(
        &self,
        owner: &str,
        id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> HistoryResult<StoredMessage> {
        let fail = match role {
            MessageRole::User => self.fail_user_appends.load(Ordering::SeqCst),
            MessageRole::Assistant => self.fail_assistant_appends.load(Ordering::SeqCst),
            MessageRole::System => false,
        };
        if fail {
            return Err(Self::injected());
        }
        self.inner.append_message(owner, id, role, content).await
    }

    async fn list_messages(
        &self,
        owner: &str,
        id: ConversationId,
    ) -> HistoryResult<Vec<StoredMessage>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.list_messages(owner, id).await
    }

    async fn list_conversations(&self, owner: &str) -> HistoryResult<Vec<ConversationSummary>> {
        self.inner.list_conversations(owner).await
    }

    async fn get_conversation(
        &self,
        owner: &str,
        id: ConversationId,
    ) -> HistoryResult<ConversationSummary> {
        self.inner.get_conversation(owner, id).await
    }

    async fn ready(&self) -> HistoryResult<()> {
        if self.fail_ready.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        Ok(())
    }
}

/// A machine wired to scripted collaborators plus a registry.
#[derive(Debug)]
pub struct Harness {
    pub machine: SessionMachine,
    pub registry: SessionRegistry,
    pub history: Arc<FlakyHistory>,
    pub completion: Arc<ScriptedCompletion>,
    pub settings: MachineSettings,
}

impl Harness {
    pub fn new(completion: ScriptedCompletion) -> Self {
        Self::with_history_limit(completion, 100)
    }

    pub fn with_history_limit(completion: ScriptedCompletion, max_history_messages: usize) -> Self {
        let settings = MachineSettings {
            system_prompt: "You are a test assistant.".into(),
            title_max_chars: 30,
            max_history_messages,
            allow_guests: true,
            max_completion_tokens: 64,
            temperature: 0.7,
            top_p: 1.0,
        };
        let history = Arc::new(FlakyHistory::default());
        let completion = Arc::new(completion);
        let machine = SessionMachine::new(
            history.clone(),
            Arc::new(EmailIdentityVerifier::new().unwrap()),
            completion.clone(),
            settings.clone(),
        );

        Self {
            machine,
            registry: SessionRegistry::new(),
            history,
            completion,
            settings,
        }
    }

    /// Application state sharing this harness's collaborators.
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.history.clone(),
            Arc::new(EmailIdentityVerifier::new().unwrap()),
            self.completion.clone(),
            self.settings.clone(),
            16,
        ))
    }

    pub fn connect(&self) -> (Arc<SessionHandle>, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (self.registry.create(tx), rx)
    }

    /// Handles one frame, waits for any turn it started, and returns every
    /// event the client received.
    pub async fn send(
        &self,
        session: &Arc<SessionHandle>,
        rx: &mut mpsc::Receiver<OutboundEvent>,
        raw: &str,
    ) -> Vec<OutboundEvent> {
        if let HandleOutcome::TurnStarted(task) = self.machine.handle_text(session, raw).await {
            task.await.unwrap();
        }
        Self::drain(rx)
    }

    pub async fn authenticate(
        &self,
        session: &Arc<SessionHandle>,
        rx: &mut mpsc::Receiver<OutboundEvent>,
        email: &str,
    ) {
        let frame = serde_json::json!({ "type": "auth", "email": email }).to_string();
        let events = self.send(session, rx, &frame).await;
        assert!(
            matches!(events.as_slice(), [OutboundEvent::AuthSuccess { .. }]),
            "unexpected auth events: {events:?}"
        );
    }

    pub fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
