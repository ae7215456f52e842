use std::fmt;
use std::sync::Arc;

use shared::llms::CompletionSource;

use crate::services::history_store::HistoryStore;
use crate::services::identity::IdentityVerifier;
use crate::session::machine::{MachineSettings, SessionMachine};
use crate::session::registry::SessionRegistry;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) machine: SessionMachine,
    pub(crate) history: Arc<dyn HistoryStore>,
    pub(crate) verifier: Arc<dyn IdentityVerifier>,
    pub(crate) outbound_buffer: usize,
}

impl AppState {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        verifier: Arc<dyn IdentityVerifier>,
        completion: Arc<dyn CompletionSource>,
        settings: MachineSettings,
        outbound_buffer: usize,
    ) -> Self {
        let machine = SessionMachine::new(
            Arc::clone(&history),
            Arc::clone(&verifier),
            completion,
            settings,
        );
        Self {
            registry: Arc::new(SessionRegistry::new()),
            machine,
            history,
            verifier,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("machine", &self.machine)
            .field("active_sessions", &self.registry.len())
            .field("auth_mode", &self.verifier.mode())
            .finish_non_exhaustive()
    }
}
