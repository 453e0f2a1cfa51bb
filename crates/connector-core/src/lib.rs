//! ChatBridge connector core
//!
//! The pieces every backend adapter shares: the [`Port`] a session streams
//! over, the [`AbortScope`] that turns stop requests into cancellation, and
//! the [`Adapter`] contract the dispatcher calls.

pub mod abort;
pub mod port;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chatbridge_protocol::Session;
use thiserror::Error;

pub use abort::{AbortReason, AbortScope};
pub use port::{Port, PortError, PortEvent, PortId, PortListener};

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("{status} {body}")]
    Http { status: u16, body: String },

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("{0} is not available in this host")]
    Unavailable(String),
}

/// Where an HTTP-backed adapter sends its request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Authentication material fetched for hosted-web-session backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    AccessToken(String),
    SessionKey(String),
    Cookies(BTreeMap<String, String>),
}

/// Everything an adapter needs to answer one question
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub session: Session,
    pub target: Option<Target>,
    pub credential: Option<Credential>,
    /// Backend-specific flavour, e.g. `sydney` for Bing
    pub variant: Option<String>,
}

impl GenerateRequest {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            target: None,
            credential: None,
            variant: None,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }
}

/// A backend that streams an answer onto a session port.
///
/// Implementations post zero or more `{answer, done: false}` events and then
/// either `{done: true, session}` or return an error; the dispatcher turns
/// errors into `{error}`. They must honour `{stop: true}` and port
/// disconnects, normally through [`AbortScope`].
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn generate(&self, port: &Port, request: GenerateRequest) -> Result<(), ConnectorError>;
}
