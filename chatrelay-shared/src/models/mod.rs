pub mod chat;
pub mod timestamp;
pub mod user;
pub mod wire;

pub use chat::{ChatMessage, ConversationId, ConversationSummary, MessageRole, StoredMessage};
pub use timestamp::Timestamp;
pub use user::{AuthUser, Credential, Principal};
pub use wire::{ClientFrame, FrameError, InboundMessage, OutboundEvent, ProfileData};
