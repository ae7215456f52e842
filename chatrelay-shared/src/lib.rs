#![cfg_attr(not(test), forbid(unsafe_code))]

//! Shared configuration, wire models, and completion-source abstractions
//! used by the `ChatRelay` server.

pub mod config;
pub mod llms;
pub mod models;
