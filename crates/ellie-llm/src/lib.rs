//! # ellie-llm
//!
//! Narrow adapters over the two external model services Ellie depends on:
//! an LLM gateway (`call(org, prompt) -> text + model + trace id`) and an
//! embedding provider (`embed(texts) -> vectors`). Every LLM-mediated worker
//! is a thin prompt builder plus output parser on top of these.

pub mod embedding;
pub mod gateway;
pub mod json;
pub mod mock;

pub use embedding::{EmbeddingProvider, embed_checked};
pub use gateway::{LlmGateway, LlmReply, OpenAiGateway};
pub use json::{Structured, call_json, extract_json, parse_json};
pub use mock::{MockEmbedding, MockGateway};
