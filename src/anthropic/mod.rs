pub mod analyzer;
pub mod client;
pub mod error;
pub mod types;

pub use analyzer::{ClaudeAnalyzer, DEFAULT_MODEL};
pub use client::{AnthropicClient, MessageSender};
pub use error::AnthropicError;
pub use types::{Message, MessagesRequest, MessagesResponse, Usage};
