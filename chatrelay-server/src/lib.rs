#![cfg_attr(not(test), forbid(unsafe_code))]

//! `ChatRelay` server: WebSocket sessions bound to verified identities,
//! streaming completions relayed from a hosted model, and per-user history.

pub mod app_state;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod services;
pub mod session;
pub mod tracer;

#[cfg(test)]
mod testing;
