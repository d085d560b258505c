// Data models for the chat-completion wire format

pub mod openai;

pub use openai::{ChatCompletionUsage, ChatMessage, Role};
