//! # Completion Integration Module
//!
//! A unified interface over hosted large-language-model completion APIs.
//! The relay only depends on [`CompletionSource`]; concrete HTTP clients live
//! in the server crate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use shared::llms::{CompletionRequest, CompletionSource};
//! use shared::models::ChatMessage;
//!
//! let request = CompletionRequest::new(vec![ChatMessage::user("Hello")]);
//! let mut fragments = source.stream_completion(request).await?;
//! while let Some(fragment) = fragments.next().await {
//!     print!("{}", fragment?);
//! }
//! ```

pub mod errors;
pub mod traits;
pub mod types;

pub use errors::{CompletionError, CompletionResult};
pub use traits::{CompletionSource, FragmentStream};
pub use types::CompletionRequest;
