//! Background → UI surface messages on a session port

use serde::{Deserialize, Serialize};

use crate::types::Session;

/// One event in an answer stream.
///
/// Incremental output is `{answer, done: false}`; a stream ends with either
/// `{done: true}` (optionally carrying the updated session) or `{error}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    /// Partial answer text (the full answer so far)
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            answer: Some(text.into()),
            done: Some(false),
            ..Default::default()
        }
    }

    /// Bare completion, used to acknowledge a stop request
    pub fn done() -> Self {
        Self {
            done: Some(true),
            ..Default::default()
        }
    }

    /// Completion carrying the session with its new record
    pub fn finished(session: Session) -> Self {
        Self {
            done: Some(true),
            session: Some(session),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.done == Some(true) || self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes() {
        assert_eq!(
            serde_json::to_value(StreamEvent::answer("par")).unwrap(),
            json!({ "answer": "par", "done": false })
        );
        assert_eq!(serde_json::to_value(StreamEvent::done()).unwrap(), json!({ "done": true }));
        assert_eq!(
            serde_json::to_value(StreamEvent::error("boom")).unwrap(),
            json!({ "error": "boom" })
        );
        assert!(StreamEvent::error("boom").is_terminal());
        assert!(!StreamEvent::answer("x").is_terminal());
    }
}
