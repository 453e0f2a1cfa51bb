//! Backend dispatch.
//!
//! A session is classified into exactly one model group by walking
//! [`ModelGroup::DISPATCH_ORDER`]; the first group that claims it wins. The
//! dispatcher then resolves endpoint and credentials from the user config and
//! hands the session either to an adapter or, for ChatGPT web sessions with a
//! bound tab, to the tab relay. Every failure ends up as `{error}` on the
//! session port.

use std::collections::HashMap;
use std::sync::Arc;

use chatbridge_connector_core::{
    Adapter, ConnectorError, Credential, GenerateRequest, Port, Target,
};
use chatbridge_protocol::models::{self, ModelGroup};
use chatbridge_protocol::{PortRequest, Session, StreamEvent, TabId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::Browser;
use crate::config::{ConfigStore, UserConfig, DEFAULT_CUSTOM_MODEL_URL};
use crate::credentials::{CredentialError, CredentialSource};
use crate::redact::redacted;
use crate::relay::{RelayError, RelayRegistry};

const MOONSHOT_API_URL: &str = "https://api.moonshot.cn/v1/chat/completions";
const CLAUDE_API_URL: &str = "https://api.anthropic.com/v1/messages";
const CHATGLM_API_URL: &str = "https://open.bigmodel.cn/api/paas/v4/chat/completions";
const AZURE_API_VERSION: &str = "2024-02-01";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown model configuration")]
    UnknownModel,

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// First group, in dispatch order, the session belongs to
pub fn classify(session: &Session) -> Option<ModelGroup> {
    ModelGroup::DISPATCH_ORDER
        .into_iter()
        .find(|group| session.uses_group(*group))
}

/// What the dispatcher decided to do with a session
#[derive(Debug)]
pub enum Route {
    /// Forward to the content script of a logged-in ChatGPT tab
    Relay { tab_id: TabId, session: Session },
    Adapter {
        group: ModelGroup,
        request: GenerateRequest,
    },
}

fn trimmed(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim().trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Endpoint for the custom (OpenAI-compatible) backend
pub fn custom_target(session: &Session, config: &UserConfig) -> Target {
    match &session.api_mode {
        None => Target {
            url: trimmed(&config.custom_model_api_url)
                .unwrap_or_else(|| DEFAULT_CUSTOM_MODEL_URL.to_string()),
            api_key: trimmed(&config.custom_api_key),
            model: trimmed(&config.custom_model_name),
        },
        Some(mode) => Target {
            url: trimmed(&mode.custom_url)
                .or_else(|| trimmed(&config.custom_model_api_url))
                .unwrap_or_else(|| DEFAULT_CUSTOM_MODEL_URL.to_string()),
            api_key: trimmed(&mode.api_key).or_else(|| trimmed(&config.custom_api_key)),
            model: trimmed(&mode.custom_name),
        },
    }
}

fn effective_model_name(session: &Session) -> String {
    match &session.api_mode {
        Some(mode) => mode.to_model_name(),
        None => session.model_name.clone(),
    }
}

/// Endpoint for the vendor HTTP APIs, taken from the matching config fields
pub fn api_target(group: ModelGroup, session: &Session, config: &UserConfig) -> Option<Target> {
    let model_name = effective_model_name(session);
    let model = models::upstream_model(&model_name).map(str::to_string);
    let target = |url: String, key: &str| Target {
        url,
        api_key: trimmed(key),
        model: model.clone(),
    };
    Some(match group {
        ModelGroup::Custom => custom_target(session, config),
        ModelGroup::ChatgptApi => target(
            join_url(&config.custom_open_ai_api_url, "v1/chat/completions"),
            &config.api_key,
        ),
        ModelGroup::GptCompletionApi => target(
            join_url(&config.custom_open_ai_api_url, "v1/completions"),
            &config.api_key,
        ),
        ModelGroup::ClaudeApi => target(CLAUDE_API_URL.to_string(), &config.claude_api_key),
        ModelGroup::MoonshotApi => target(MOONSHOT_API_URL.to_string(), &config.moonshot_api_key),
        ModelGroup::ChatGlmApi => target(CHATGLM_API_URL.to_string(), &config.chatglm_api_key),
        ModelGroup::OllamaApi => target(
            join_url(&config.ollama_endpoint, "v1/chat/completions"),
            &config.ollama_api_key,
        ),
        ModelGroup::AzureOpenAiApi => target(
            format!(
                "{}?api-version={AZURE_API_VERSION}",
                join_url(
                    &config.azure_endpoint,
                    &format!("openai/deployments/{}/chat/completions", config.azure_deployment_name)
                )
            ),
            &config.azure_api_key,
        ),
        ModelGroup::GithubThirdPartyApi => Target {
            url: config.github_third_party_url.trim().to_string(),
            api_key: None,
            model: None,
        },
        ModelGroup::ChatgptWeb
        | ModelGroup::ClaudeWeb
        | ModelGroup::MoonshotWeb
        | ModelGroup::BingWeb
        | ModelGroup::GeminiWeb => return None,
    })
}

/// Adapters by model group. Groups without one report as unavailable.
#[derive(Default, Clone)]
pub struct AdapterSet {
    adapters: HashMap<ModelGroup, Arc<dyn Adapter>>,
}

impl AdapterSet {
    pub fn with(mut self, group: ModelGroup, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(group, adapter);
        self
    }

    pub fn get(&self, group: ModelGroup) -> Result<Arc<dyn Adapter>, ConnectorError> {
        self.adapters
            .get(&group)
            .cloned()
            .ok_or_else(|| ConnectorError::Unavailable(group.key().to_string()))
    }
}

pub struct Dispatcher {
    config: ConfigStore,
    browser: Arc<dyn Browser>,
    credentials: Arc<dyn CredentialSource>,
    adapters: AdapterSet,
    relays: Arc<RelayRegistry>,
}

impl Dispatcher {
    pub fn new(
        config: ConfigStore,
        browser: Arc<dyn Browser>,
        credentials: Arc<dyn CredentialSource>,
        adapters: AdapterSet,
        relays: Arc<RelayRegistry>,
    ) -> Self {
        Self {
            config,
            browser,
            credentials,
            adapters,
            relays,
        }
    }

    /// Answer one session on `port`. Never fails: errors are posted as `{error}`.
    pub async fn dispatch(&self, port: &Port, session: Session) {
        let config = self.config.get();
        info!(
            component = "dispatch",
            event = "dispatch.start",
            port_id = port.id(),
            model_name = %session.model_name,
            has_api_mode = session.api_mode.is_some(),
            "Dispatching session"
        );
        debug!(
            component = "dispatch",
            event = "dispatch.snapshot",
            session = %redacted(&session),
            config = %redacted(&*config),
            api_mode = %session.api_mode.as_ref().map(redacted).unwrap_or_default(),
            "Session details (redacted)"
        );

        let model_name = session.model_name.clone();
        if let Err(e) = self.execute(port, session, &config).await {
            warn!(
                component = "dispatch",
                event = "dispatch.failed",
                port_id = port.id(),
                model_name = %model_name,
                error = %e,
                "Dispatch failed"
            );
            if let Err(post_err) = port.post_message(&StreamEvent::error(e.to_string())) {
                debug!(
                    component = "dispatch",
                    event = "dispatch.report_failed",
                    port_id = port.id(),
                    error = %post_err,
                    "Port closed before the error could be reported"
                );
            }
        }
    }

    async fn execute(&self, port: &Port, session: Session, config: &UserConfig) -> Result<(), DispatchError> {
        match self.route(session, config).await? {
            Route::Relay { tab_id, session } => {
                let message =
                    serde_json::to_value(PortRequest::ask(session)).map_err(ConnectorError::from)?;
                self.bind_relay(port, tab_id, message).await;
                Ok(())
            }
            Route::Adapter { group, request } => {
                let adapter = self.adapters.get(group)?;
                adapter.generate(port, request).await?;
                Ok(())
            }
        }
    }

    /// Resolve where a session goes and what it needs to get there.
    pub async fn route(&self, session: Session, config: &UserConfig) -> Result<Route, DispatchError> {
        let group = classify(&session).ok_or(DispatchError::UnknownModel)?;
        debug!(
            component = "dispatch",
            event = "dispatch.classified",
            group = group.key(),
            "Session classified"
        );

        if let Some(target) = api_target(group, &session, config) {
            return Ok(Route::Adapter {
                group,
                request: GenerateRequest::new(session).with_target(target),
            });
        }

        let request = match group {
            ModelGroup::ChatgptWeb => {
                if let Some(tab_id) = self.bound_chatgpt_tab(config).await {
                    return Ok(Route::Relay { tab_id, session });
                }
                let token = self.credentials.chatgpt_access_token().await?;
                GenerateRequest::new(session)
                    .with_target(Target {
                        url: config.custom_chat_gpt_web_api_url.clone(),
                        ..Default::default()
                    })
                    .with_credential(Credential::AccessToken(token))
            }
            ModelGroup::ClaudeWeb => {
                let key = self.credentials.claude_session_key().await?;
                GenerateRequest::new(session).with_credential(Credential::SessionKey(key))
            }
            ModelGroup::MoonshotWeb => GenerateRequest::new(session),
            ModelGroup::BingWeb => {
                let token = self.credentials.bing_access_token().await?;
                let sydney = session.preset_model() == "bingFreeSydney";
                let request =
                    GenerateRequest::new(session).with_credential(Credential::AccessToken(token));
                if sydney {
                    request.with_variant("sydney")
                } else {
                    request
                }
            }
            ModelGroup::GeminiWeb => {
                let cookies = self.credentials.bard_cookies().await?;
                GenerateRequest::new(session).with_credential(Credential::Cookies(cookies))
            }
            _ => return Err(DispatchError::UnknownModel),
        };
        Ok(Route::Adapter { group, request })
    }

    async fn bound_chatgpt_tab(&self, config: &UserConfig) -> Option<TabId> {
        let tab_id = config.chatgpt_tab_id?;
        if !config.uses_default_chatgpt_web_url() {
            return None;
        }
        match self.browser.get_tab(tab_id).await {
            Ok(tab) => Some(tab.id),
            Err(e) => {
                warn!(
                    component = "dispatch",
                    event = "dispatch.chatgpt_tab_missing",
                    tab_id,
                    error = %e,
                    "Failed to get ChatGPT tab, using direct API"
                );
                None
            }
        }
    }

    async fn bind_relay(&self, port: &Port, tab_id: TabId, message: serde_json::Value) {
        let relay = self.relays.get_or_spawn(port);
        match relay.bind(tab_id, message).await {
            Ok(()) => debug!(
                component = "dispatch",
                event = "dispatch.relayed",
                port_id = port.id(),
                tab_id,
                "Session handed to ChatGPT tab"
            ),
            // The relay has already told the UI.
            Err(RelayError::Closed) => debug!(
                component = "dispatch",
                event = "dispatch.relay_closed",
                port_id = port.id(),
                "Relay gone before bind"
            ),
            Err(e) => warn!(
                component = "dispatch",
                event = "dispatch.relay_failed",
                port_id = port.id(),
                tab_id,
                error = %e,
                "Tab relay bind failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAdapter, FakeBrowser, FakeCredentials};
    use chatbridge_connector_core::PortEvent;
    use chatbridge_protocol::ApiMode;
    use serde_json::{json, Value};

    fn dispatcher(
        config: UserConfig,
        browser: Arc<FakeBrowser>,
        credentials: FakeCredentials,
        adapters: AdapterSet,
    ) -> Dispatcher {
        Dispatcher::new(
            ConfigStore::in_memory(config),
            browser.clone(),
            Arc::new(credentials),
            adapters,
            Arc::new(RelayRegistry::new(browser)),
        )
    }

    async fn next_message(listener: &mut chatbridge_connector_core::PortListener) -> Value {
        match listener.recv().await {
            PortEvent::Message(value) => value,
            PortEvent::Disconnected => panic!("port closed"),
        }
    }

    #[test]
    fn classification_follows_dispatch_order() {
        assert_eq!(classify(&Session::new("q", "customModel")), Some(ModelGroup::Custom));
        assert_eq!(
            classify(&Session::new("q", "chatgptApi4_8k-mine")),
            Some(ModelGroup::ChatgptApi)
        );
        assert_eq!(classify(&Session::new("q", "bingFreeSydney")), Some(ModelGroup::BingWeb));
        assert_eq!(classify(&Session::new("q", "ollamaModel-llama3")), Some(ModelGroup::OllamaApi));
        assert_eq!(classify(&Session::new("q", "mystery")), None);

        let mut session = Session::new("q", "chatgptFree35");
        session.api_mode = Some(ApiMode {
            group_name: "customApiModelKeys".into(),
            item_name: "custom".into(),
            is_custom: true,
            custom_name: "local".into(),
            ..Default::default()
        });
        assert_eq!(classify(&session), Some(ModelGroup::Custom));
    }

    #[test]
    fn custom_endpoint_resolution() {
        let config = UserConfig {
            custom_model_api_url: "  ".into(),
            custom_api_key: "cfg-key".into(),
            custom_model_name: "cfg-model".into(),
            ..Default::default()
        };
        let plain = custom_target(&Session::new("q", "customModel"), &config);
        assert_eq!(plain.url, DEFAULT_CUSTOM_MODEL_URL);
        assert_eq!(plain.api_key.as_deref(), Some("cfg-key"));
        assert_eq!(plain.model.as_deref(), Some("cfg-model"));

        let mut session = Session::new("q", "customModel");
        session.api_mode = Some(ApiMode {
            group_name: "customApiModelKeys".into(),
            custom_url: " http://llm.local/v1/chat/completions ".into(),
            custom_name: "mine".into(),
            ..Default::default()
        });
        let moded = custom_target(&session, &config);
        assert_eq!(moded.url, "http://llm.local/v1/chat/completions");
        assert_eq!(moded.api_key.as_deref(), Some("cfg-key"));
        assert_eq!(moded.model.as_deref(), Some("mine"));
    }

    #[test]
    fn vendor_targets_come_from_config() {
        let config = UserConfig {
            api_key: "sk".into(),
            custom_open_ai_api_url: "https://proxy.example/".into(),
            ollama_endpoint: "http://gpu:11434".into(),
            ..Default::default()
        };
        let chat = api_target(ModelGroup::ChatgptApi, &Session::new("q", "chatgptApi4_8k"), &config)
            .unwrap();
        assert_eq!(chat.url, "https://proxy.example/v1/chat/completions");
        assert_eq!(chat.model.as_deref(), Some("gpt-4"));
        assert_eq!(chat.api_key.as_deref(), Some("sk"));

        let ollama = api_target(
            ModelGroup::OllamaApi,
            &Session::new("q", "ollamaModel-llama3"),
            &config,
        )
        .unwrap();
        assert_eq!(ollama.url, "http://gpu:11434/v1/chat/completions");
        assert_eq!(ollama.model.as_deref(), Some("llama3"));
        assert!(ollama.api_key.is_none());

        assert!(api_target(ModelGroup::BingWeb, &Session::new("q", "bingFree4"), &config).is_none());
    }

    #[tokio::test]
    async fn unknown_model_reports_an_error() {
        let d = dispatcher(
            UserConfig::default(),
            FakeBrowser::new(),
            FakeCredentials::default(),
            AdapterSet::default(),
        );
        let (ui, background) = Port::pair("session");
        let mut ui_listener = ui.subscribe();

        d.dispatch(&background, Session::new("q", "mystery")).await;
        assert_eq!(
            next_message(&mut ui_listener).await,
            json!({ "error": DispatchError::UnknownModel.to_string() })
        );
    }

    #[tokio::test]
    async fn adapter_streams_onto_the_port() {
        let adapter = FakeAdapter::answering("hello");
        let d = dispatcher(
            UserConfig::default(),
            FakeBrowser::new(),
            FakeCredentials::default(),
            AdapterSet::default().with(ModelGroup::Custom, adapter.clone()),
        );
        let (ui, background) = Port::pair("session");
        let mut ui_listener = ui.subscribe();

        d.dispatch(&background, Session::new("hi", "customModel")).await;

        assert_eq!(
            next_message(&mut ui_listener).await,
            json!({ "answer": "hello", "done": false })
        );
        let done = next_message(&mut ui_listener).await;
        assert_eq!(done["done"], true);
        assert_eq!(done["session"]["conversationRecords"][0]["answer"], "hello");

        let requests = adapter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].target.as_ref().map(|t| t.url.as_str()),
            Some(DEFAULT_CUSTOM_MODEL_URL)
        );
    }

    #[tokio::test]
    async fn adapter_failures_become_error_events() {
        let d = dispatcher(
            UserConfig::default(),
            FakeBrowser::new(),
            FakeCredentials::default(),
            AdapterSet::default().with(ModelGroup::ChatgptApi, FakeAdapter::failing("boom")),
        );
        let (ui, background) = Port::pair("session");
        let mut ui_listener = ui.subscribe();

        d.dispatch(&background, Session::new("hi", "chatgptApi35")).await;
        assert_eq!(
            next_message(&mut ui_listener).await,
            json!({ "error": "Provider error: boom" })
        );

        d.dispatch(&background, Session::new("hi", "claude3OpusApi")).await;
        assert_eq!(
            next_message(&mut ui_listener).await,
            json!({ "error": "claudeApiModelKeys is not available in this host" })
        );
    }

    #[tokio::test]
    async fn bound_chatgpt_tab_goes_through_the_relay() {
        let browser = FakeBrowser::new();
        browser.add_tab(7, "https://chatgpt.com/");
        let d = dispatcher(
            UserConfig {
                chatgpt_tab_id: Some(7),
                ..Default::default()
            },
            browser.clone(),
            FakeCredentials::default(),
            AdapterSet::default(),
        );
        let (_ui, background) = Port::pair("session");

        let session = Session::new("hi", "chatgptFree35");
        d.dispatch(&background, session.clone()).await;

        let mut content = browser.take_content(7).expect("relay connected");
        match content.listener.recv().await {
            PortEvent::Message(value) => {
                assert_eq!(value["session"]["sessionId"], session.session_id.as_str());
                assert_eq!(value["session"]["question"], "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(d.relays.get(background.id()).is_some());
    }

    #[tokio::test]
    async fn missing_tab_or_custom_host_uses_the_access_token() {
        let browser = FakeBrowser::new();
        browser.add_tab(7, "https://chatgpt.com/");
        let adapter = FakeAdapter::answering("web");
        let d = dispatcher(
            UserConfig {
                chatgpt_tab_id: Some(7),
                custom_chat_gpt_web_api_url: "https://chat.example.com".into(),
                ..Default::default()
            },
            browser.clone(),
            FakeCredentials {
                chatgpt: Some("token".into()),
                ..Default::default()
            },
            AdapterSet::default().with(ModelGroup::ChatgptWeb, adapter.clone()),
        );
        let (_ui, background) = Port::pair("session");
        d.dispatch(&background, Session::new("hi", "chatgptFree35")).await;

        assert!(browser.connect_times(7).is_empty());
        let request = &adapter.requests()[0];
        assert_eq!(request.credential, Some(Credential::AccessToken("token".into())));

        let no_tab = dispatcher(
            UserConfig {
                chatgpt_tab_id: Some(99),
                ..Default::default()
            },
            browser,
            FakeCredentials::default(),
            AdapterSet::default(),
        );
        let (ui, background) = Port::pair("session");
        let mut ui_listener = ui.subscribe();
        no_tab.dispatch(&background, Session::new("hi", "chatgptFree35")).await;
        assert_eq!(
            next_message(&mut ui_listener).await,
            json!({ "error": "ChatGPT access token is not available. Please log in and try again." })
        );
    }

    #[tokio::test]
    async fn bing_sydney_selects_the_variant() {
        let adapter = FakeAdapter::answering("hi");
        let d = dispatcher(
            UserConfig::default(),
            FakeBrowser::new(),
            FakeCredentials {
                bing: Some("bing-token".into()),
                ..Default::default()
            },
            AdapterSet::default().with(ModelGroup::BingWeb, adapter.clone()),
        );
        let (_ui, background) = Port::pair("session");
        d.dispatch(&background, Session::new("q", "bingFreeSydney")).await;
        d.dispatch(&background, Session::new("q", "bingFree4")).await;

        let requests = adapter.requests();
        assert_eq!(requests[0].variant.as_deref(), Some("sydney"));
        assert_eq!(
            requests[0].credential,
            Some(Credential::AccessToken("bing-token".into()))
        );
        assert!(requests[1].variant.is_none());
    }
}
