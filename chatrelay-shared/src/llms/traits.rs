//! # Completion Traits
//!
//! The streaming completion source consumed by the relay.

use crate::llms::{errors::CompletionResult, types::CompletionRequest};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Lazy, finite sequence of text fragments. The stream ending is the
/// end-of-response signal; an `Err` item means the upstream failed mid-stream.
pub type FragmentStream = Pin<Box<dyn Stream<Item = CompletionResult<String>> + Send + 'static>>;

/// A hosted model producing incremental output for a message history
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Start a streamed completion
    ///
    /// Dropping the returned stream cancels the upstream call.
    ///
    /// # Errors
    /// Returns an error if the request cannot be initiated. Individual stream
    /// items may also carry errors.
    async fn stream_completion(&self, request: CompletionRequest)
    -> CompletionResult<FragmentStream>;

    /// Identifier of the model serving requests, for logs and metrics
    fn model_name(&self) -> &str;
}
