//! Per-connection sessions: state, the registry that owns them, and the
//! state machine that turns inbound frames into outbound events.

pub mod error;
pub mod log;
pub mod machine;
pub mod registry;
pub mod relay;
pub mod state;
pub mod title;
