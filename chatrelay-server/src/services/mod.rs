//! Adapters to the relay's external collaborators: identity verification,
//! conversation history, and the hosted completion API.

pub mod completion_service;
pub mod history_store;
pub mod identity;
pub mod pg_history_store;
