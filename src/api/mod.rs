//! API Module
//!
//! Request and response types exchanged with provider adapters.

pub mod chat;
pub mod embedding;

pub use chat::{ChatRequest, ChatResponse, Choice, ContentPart, ImageUrl, Message, MessageContent, Usage};
pub use embedding::{Embedding, EmbeddingInput, EmbeddingRequest, EmbeddingResponse};
