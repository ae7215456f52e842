pub mod conversations;
pub mod ws;
