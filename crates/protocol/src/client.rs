//! UI surface → background messages on a session port

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Session;

/// A request posted by a UI surface on its session port.
///
/// Either a new question (`session`) or a cancellation (`stop`). Unknown
/// fields are ignored so relayed payloads never fail to parse here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stop: bool,
}

impl PortRequest {
    pub fn ask(session: Session) -> Self {
        Self {
            session: Some(session),
            stop: false,
        }
    }

    pub fn stop() -> Self {
        Self {
            session: None,
            stop: true,
        }
    }

    /// Lenient parse of a raw port payload
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Whether a raw payload asks the far end to stop generating
    pub fn is_stop(value: &Value) -> bool {
        value.get("stop").and_then(Value::as_bool).unwrap_or(false)
    }
}
