//! ChatBridge Protocol
//!
//! Shared types exchanged between UI surfaces, the background host and content
//! scripts. Everything here is serialized as camelCase JSON, matching what the
//! extension pages already send.

use uuid::Uuid;

pub mod client;
pub mod control;
pub mod models;
pub mod server;
pub mod types;

pub use client::PortRequest;
pub use control::{ControlMessage, FetchFailure, FetchResponse, FetchResult};
pub use models::ModelGroup;
pub use server::StreamEvent;
pub use types::*;

/// Browser tab identifier
pub type TabId = u64;

/// Browser window identifier
pub type WindowId = u64;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
