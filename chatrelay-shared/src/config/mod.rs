//! # Configuration
//!
//! Server configuration structures, defaults per profile, and loading from
//! files and the environment.

pub mod server;

pub use server::{AuthMode, Config, ConfigError, LogFormat, Profile};
