//! ChatBridge Connectors
//!
//! Backend adapters that speak to vendor HTTP APIs and translate their
//! streams into the common session-port protocol.

pub mod chatgpt_web;
pub mod openai;
mod sse;

pub use chatgpt_web::ChatgptWebClient;
pub use openai::{ApiStyle, OpenAiCompatible};
