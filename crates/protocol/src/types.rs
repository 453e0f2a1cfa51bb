//! Core types shared across the protocol

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::models::{self, ModelGroup};

/// Treat an explicit `null` like a missing field.
///
/// The extension initializes unset session fields to `null` rather than
/// leaving them out.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A single question/answer pair in a conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationRecord {
    #[serde(deserialize_with = "null_as_default")]
    pub question: String,
    #[serde(deserialize_with = "null_as_default")]
    pub answer: String,
}

/// User-defined backend selection that overrides `modelName`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiMode {
    #[serde(deserialize_with = "null_as_default")]
    pub group_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub item_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub is_custom: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub custom_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub custom_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub api_key: String,
    #[serde(deserialize_with = "null_as_default")]
    pub active: bool,
}

impl ApiMode {
    /// Model name this api mode resolves to.
    ///
    /// Groups that are always custom, and custom modes built on the generic
    /// `custom` item, are named after the group. Other custom modes suffix the
    /// preset item.
    pub fn to_model_name(&self) -> String {
        let always_custom = ModelGroup::from_key(&self.group_name)
            .map(ModelGroup::is_always_custom)
            .unwrap_or(false);
        if always_custom && !self.custom_name.is_empty() {
            return format!("{}-{}", self.group_name, self.custom_name);
        }
        if !self.is_custom {
            return self.item_name.clone();
        }
        if self.item_name == "custom" {
            format!("{}-{}", self.group_name, self.custom_name)
        } else {
            format!("{}-{}", self.item_name, self.custom_name)
        }
    }
}

/// One question/answer exchange, possibly multi-turn.
///
/// Fields the background does not interpret are kept in `extra` so a session
/// relayed to a content script arrives unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Session {
    #[serde(deserialize_with = "null_as_default")]
    pub session_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub model_name: String,
    pub api_mode: Option<ApiMode>,
    #[serde(deserialize_with = "null_as_default")]
    pub question: String,
    #[serde(deserialize_with = "null_as_default")]
    pub conversation_records: Vec<ConversationRecord>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn new(question: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            session_id: crate::new_id(),
            model_name: model_name.into(),
            question: question.into(),
            ..Default::default()
        }
    }

    /// Record an answer. A retry of the same question replaces the last answer
    /// instead of appending a new record.
    pub fn push_record(&mut self, question: &str, answer: &str) {
        if self.is_retry {
            if let Some(last) = self.conversation_records.last_mut() {
                if last.question == question {
                    last.answer = answer.to_string();
                    return;
                }
            }
        }
        self.conversation_records.push(ConversationRecord {
            question: question.to_string(),
            answer: answer.to_string(),
        });
    }

    /// Preset model key this session selects, with any customization suffix removed
    pub fn preset_model(&self) -> &str {
        match &self.api_mode {
            Some(mode) if !mode.item_name.is_empty() => &mode.item_name,
            _ => models::preset_part(&self.model_name),
        }
    }

    /// Whether the session belongs to the given model group
    pub fn uses_group(&self, group: ModelGroup) -> bool {
        match &self.api_mode {
            Some(mode) => mode.group_name == group.key(),
            None => group.contains(models::preset_part(&self.model_name)),
        }
    }
}
