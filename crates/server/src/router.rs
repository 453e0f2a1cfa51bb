//! Side-effect router for one-shot runtime messages.
//!
//! Most messages are fire-and-forget: failures are logged and the caller gets
//! `null`. `FETCH` and `GET_COOKIE` answer, and their failures come back in
//! the response shape instead.

use std::sync::Arc;

use bytes::Bytes;
use chatbridge_connector_core::ConnectorError;
use chatbridge_connectors::ChatgptWebClient;
use chatbridge_protocol::control::{ControlParse, Fetch, PinTab};
use chatbridge_protocol::{ControlMessage, FetchFailure, FetchResponse, FetchResult, TabId};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::browser::{Browser, CreateTab, CreateWindow, PlatformError, TabUpdate, WindowType, INDEPENDENT_PANEL_PAGE};
use crate::config::{ConfigError, ConfigStore};
use crate::credentials::{CredentialError, CredentialSource};
use crate::intercept::{Interceptor, RequestBody, RequestDetails};

pub const CHAT_WINDOW_WIDTH: u32 = 500;
pub const CHAT_WINDOW_HEIGHT: u32 = 650;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to fetch: {0}")]
    Fetch(String),
}

/// Who sent a runtime message
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageSender {
    pub tab_id: Option<TabId>,
}

pub struct Router {
    config: ConfigStore,
    browser: Arc<dyn Browser>,
    credentials: Arc<dyn CredentialSource>,
    interceptor: Interceptor,
    http: reqwest::Client,
}

impl Router {
    pub fn new(
        config: ConfigStore,
        browser: Arc<dyn Browser>,
        credentials: Arc<dyn CredentialSource>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            interceptor: Interceptor::new(config.clone()),
            config,
            browser,
            credentials,
            http,
        }
    }

    /// Handle a raw `{type, data}` message. Returns the response, or `null`.
    pub async fn handle(&self, raw: Value, sender: MessageSender) -> Value {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = match ControlMessage::parse(raw) {
            Ok(message) => message,
            Err(ControlParse::Unknown(kind)) => {
                warn!(
                    component = "router",
                    event = "router.unknown_type",
                    message_type = %kind,
                    "Unknown message type received"
                );
                return Value::Null;
            }
            Err(e) => {
                error!(
                    component = "router",
                    event = "router.invalid",
                    message_type = %kind,
                    error = %e,
                    "Error processing message"
                );
                if kind == "FETCH" {
                    return fetch_result_value((None, Some(failure(&e))));
                }
                return Value::Null;
            }
        };

        info!(
            component = "router",
            event = "router.message",
            message_type = message.kind(),
            sender_tab = ?sender.tab_id,
            "Processing message"
        );
        let kind = message.kind();
        match self.route(message, sender).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    component = "router",
                    event = "router.failed",
                    message_type = kind,
                    error = %e,
                    "Error processing message"
                );
                Value::Null
            }
        }
    }

    pub async fn route(&self, message: ControlMessage, sender: MessageSender) -> Result<Value, RouterError> {
        match message {
            ControlMessage::Feedback(data) => {
                let token = self.credentials.chatgpt_access_token().await?;
                self.chatgpt_client().send_message_feedback(&token, &data).await?;
            }
            ControlMessage::DeleteConversation(data) => {
                let token = self.credentials.chatgpt_access_token().await?;
                self.chatgpt_client()
                    .delete_conversation(&token, &data.conversation_id)
                    .await?;
            }
            ControlMessage::NewUrl(data) => {
                self.browser
                    .create_tab(CreateTab {
                        url: data.url,
                        pinned: data.pinned,
                    })
                    .await?;
                if data.jump_back {
                    debug!(
                        component = "router",
                        event = "router.jump_back",
                        tab_id = ?sender.tab_id,
                        "Setting jump back tab"
                    );
                    self.config
                        .update(|c| c.notification_jump_back_tab_id = sender.tab_id)
                        .await?;
                }
            }
            ControlMessage::SetChatgptTab => {
                self.config
                    .update(|c| c.chatgpt_tab_id = sender.tab_id)
                    .await?;
            }
            ControlMessage::ActivateUrl(data) => {
                self.browser.update_tab(data.tab_id, TabUpdate::activate()).await?;
            }
            ControlMessage::OpenUrl(data) => self.browser.open_url(&data.url).await?,
            ControlMessage::OpenChatWindow => self.open_chat_window().await?,
            ControlMessage::RefreshMenu => self.browser.refresh_menu().await?,
            ControlMessage::PinTab(data) => self.pin_tab(data, sender).await?,
            ControlMessage::Fetch(fetch) => return Ok(fetch_result_value(self.fetch(fetch).await)),
            ControlMessage::GetCookie(query) => {
                return Ok(match self.browser.get_cookie(&query.url, &query.name).await {
                    Ok(Some(value)) => Value::String(value),
                    Ok(None) => Value::Null,
                    Err(e) => {
                        error!(
                            component = "router",
                            event = "router.cookie_failed",
                            url = %query.url,
                            name = %query.name,
                            error = %e,
                            "Error getting cookie"
                        );
                        Value::Null
                    }
                });
            }
        }
        Ok(Value::Null)
    }

    fn chatgpt_client(&self) -> ChatgptWebClient {
        ChatgptWebClient::new(
            self.http.clone(),
            self.config.get().custom_chat_gpt_web_api_url.clone(),
        )
    }

    async fn open_chat_window(&self) -> Result<(), RouterError> {
        let url = self.browser.extension_url(INDEPENDENT_PANEL_PAGE);
        let existing = self.browser.query_tabs(&url, WindowType::Popup).await;
        match existing.first() {
            Some(tab) if !self.config.get().always_create_new_conversation_window => {
                debug!(
                    component = "router",
                    event = "router.chat_window.focus",
                    window_id = tab.window_id,
                    "Focusing existing chat window"
                );
                self.browser.focus_window(tab.window_id).await?;
            }
            _ => {
                self.browser
                    .create_window(CreateWindow {
                        url,
                        window_type: WindowType::Popup,
                        width: CHAT_WINDOW_WIDTH,
                        height: CHAT_WINDOW_HEIGHT,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn pin_tab(&self, data: PinTab, sender: MessageSender) -> Result<(), RouterError> {
        let Some(tab_id) = data.tab_id.or(sender.tab_id) else {
            warn!(
                component = "router",
                event = "router.pin_tab.no_tab",
                "No tabId found for PIN_TAB message"
            );
            return Ok(());
        };
        self.browser.update_tab(tab_id, TabUpdate::pin()).await?;
        if data.save_as_chatgpt_config {
            self.config.update(|c| c.chatgpt_tab_id = Some(tab_id)).await?;
        }
        Ok(())
    }

    /// Proxied `fetch`. Never fails; errors come back as the second element.
    pub async fn fetch(&self, fetch: Fetch) -> FetchResult {
        let input = fetch.input.clone();
        match self.try_fetch(fetch).await {
            Ok(response) => (Some(response), None),
            Err(e) => {
                error!(
                    component = "router",
                    event = "router.fetch.failed",
                    url = %input,
                    error = %e,
                    "FETCH error"
                );
                (None, Some(failure(&e)))
            }
        }
    }

    async fn try_fetch(&self, fetch: Fetch) -> Result<FetchResponse, RouterError> {
        let Fetch { input, mut init } = fetch;

        // The token is refreshed and stored even if the request itself fails.
        if input.contains("bing.com") {
            let token = self.credentials.bing_access_token().await?;
            self.config.update(|c| c.bing_access_token = token).await?;
        }

        self.interceptor
            .before_request(&RequestDetails {
                url: input.clone(),
                body: init.body.as_ref().map(|body| RequestBody {
                    raw: vec![Bytes::from(body.clone())],
                    ..Default::default()
                }),
            })
            .await;
        self.interceptor.before_send_headers(&input, &mut init.headers);

        let method = init.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| RouterError::Fetch(e.to_string()))?;
        let mut request = self.http.request(method, &input);
        for (name, value) in &init.headers {
            request = request.header(name, value);
        }
        if let Some(body) = init.body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RouterError::Fetch(e.to_string()))?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| RouterError::Fetch(e.to_string()))?;
        if !status.is_success() {
            warn!(
                component = "router",
                event = "router.fetch.error_status",
                url = %input,
                status = status.as_u16(),
                "FETCH received error status"
            );
        }
        Ok(FetchResponse {
            body,
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
        })
    }
}

fn failure(e: &dyn std::error::Error) -> FetchFailure {
    let mut stack = Vec::new();
    let mut source = e.source();
    while let Some(cause) = source {
        stack.push(cause.to_string());
        source = cause.source();
    }
    FetchFailure {
        message: e.to_string(),
        stack: (!stack.is_empty()).then(|| stack.join("\n")),
    }
}

fn fetch_result_value(result: FetchResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}
