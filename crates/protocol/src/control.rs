//! Runtime control messages
//!
//! One-shot `{type, data}` requests sent by content scripts or UI surfaces to
//! the background. Only `FETCH` and `GET_COOKIE` produce a response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TabId;

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConversation {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUrl {
    pub url: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub jump_back: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateUrl {
    pub tab_id: TabId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenUrl {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PinTab {
    pub tab_id: Option<TabId>,
    pub save_as_chatgpt_config: bool,
}

/// `fetch(input, init)` arguments, as far as the proxy honours them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchInit {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Fetch {
    pub input: String,
    #[serde(default)]
    pub init: FetchInit,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GetCookie {
    pub url: String,
    pub name: String,
}

/// The control-message catalogue
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Feedback(Value),
    DeleteConversation(DeleteConversation),
    NewUrl(NewUrl),
    SetChatgptTab,
    ActivateUrl(ActivateUrl),
    OpenUrl(OpenUrl),
    OpenChatWindow,
    RefreshMenu,
    PinTab(PinTab),
    Fetch(Fetch),
    GetCookie(GetCookie),
}

/// Why a control message could not be decoded
#[derive(Debug)]
pub enum ControlParse {
    /// Well-formed envelope with a `type` nobody handles
    Unknown(String),
    /// Missing envelope or bad `data` for a known type
    Invalid(serde_json::Error),
}

impl std::fmt::Display for ControlParse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlParse::Unknown(kind) => write!(f, "unknown message type {kind}"),
            ControlParse::Invalid(e) => write!(f, "invalid control message: {e}"),
        }
    }
}

impl std::error::Error for ControlParse {}

fn data<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, ControlParse> {
    serde_json::from_value(data).map_err(ControlParse::Invalid)
}

impl ControlMessage {
    pub fn parse(raw: Value) -> Result<Self, ControlParse> {
        let Envelope { kind, data: payload } =
            serde_json::from_value(raw).map_err(ControlParse::Invalid)?;
        let message = match kind.as_str() {
            "FEEDBACK" => ControlMessage::Feedback(payload),
            "DELETE_CONVERSATION" => ControlMessage::DeleteConversation(data(payload)?),
            "NEW_URL" => ControlMessage::NewUrl(data(payload)?),
            "SET_CHATGPT_TAB" => ControlMessage::SetChatgptTab,
            "ACTIVATE_URL" => ControlMessage::ActivateUrl(data(payload)?),
            "OPEN_URL" => ControlMessage::OpenUrl(data(payload)?),
            "OPEN_CHAT_WINDOW" => ControlMessage::OpenChatWindow,
            "REFRESH_MENU" => ControlMessage::RefreshMenu,
            "PIN_TAB" => {
                if payload.is_null() {
                    ControlMessage::PinTab(PinTab::default())
                } else {
                    ControlMessage::PinTab(data(payload)?)
                }
            }
            "FETCH" => ControlMessage::Fetch(data(payload)?),
            "GET_COOKIE" => ControlMessage::GetCookie(data(payload)?),
            _ => return Err(ControlParse::Unknown(kind)),
        };
        Ok(message)
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Feedback(_) => "FEEDBACK",
            ControlMessage::DeleteConversation(_) => "DELETE_CONVERSATION",
            ControlMessage::NewUrl(_) => "NEW_URL",
            ControlMessage::SetChatgptTab => "SET_CHATGPT_TAB",
            ControlMessage::ActivateUrl(_) => "ACTIVATE_URL",
            ControlMessage::OpenUrl(_) => "OPEN_URL",
            ControlMessage::OpenChatWindow => "OPEN_CHAT_WINDOW",
            ControlMessage::RefreshMenu => "REFRESH_MENU",
            ControlMessage::PinTab(_) => "PIN_TAB",
            ControlMessage::Fetch(_) => "FETCH",
            ControlMessage::GetCookie(_) => "GET_COOKIE",
        }
    }
}

/// Successful proxied fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub body: String,
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
}

/// Failed proxied fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub message: String,
    pub stack: Option<String>,
}

/// Serialized as the two-element array `[response, null]` or `[null, error]`
pub type FetchResult = (Option<FetchResponse>, Option<FetchFailure>);
