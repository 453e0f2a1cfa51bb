//! User configuration.
//!
//! Reads are lock-free snapshots through `ArcSwap`; writes are serialized by
//! a mutex and persisted as pretty JSON before the new snapshot is published.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatbridge_protocol::TabId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_CHATGPT_WEB_URL: &str = "https://chatgpt.com";
pub const DEFAULT_CUSTOM_MODEL_URL: &str = "http://localhost:8000/v1/chat/completions";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_ARKOSE_REQ_PARAMS: &str = "cgb=vhwi";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserConfig {
    pub model_name: String,
    pub api_key: String,
    pub custom_open_ai_api_url: String,
    pub custom_model_api_url: String,
    pub custom_model_name: String,
    pub custom_api_key: String,
    pub custom_chat_gpt_web_api_url: String,
    pub chatgpt_tab_id: Option<TabId>,
    pub notification_jump_back_tab_id: Option<TabId>,
    pub always_create_new_conversation_window: bool,
    pub bing_access_token: String,
    pub claude_api_key: String,
    pub moonshot_api_key: String,
    pub ollama_endpoint: String,
    pub ollama_api_key: String,
    pub azure_endpoint: String,
    pub azure_api_key: String,
    pub azure_deployment_name: String,
    pub chatglm_api_key: String,
    pub github_third_party_url: String,
    pub chatgpt_arkose_req_url: String,
    pub chatgpt_arkose_req_form: String,
    pub chatgpt_arkose_req_params: String,
    pub chatgpt_access_token: String,
    pub claude_session_key: String,
    pub bard_cookies: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            model_name: "chatgptFree35".into(),
            api_key: String::new(),
            custom_open_ai_api_url: DEFAULT_OPENAI_URL.into(),
            custom_model_api_url: String::new(),
            custom_model_name: String::new(),
            custom_api_key: String::new(),
            custom_chat_gpt_web_api_url: DEFAULT_CHATGPT_WEB_URL.into(),
            chatgpt_tab_id: None,
            notification_jump_back_tab_id: None,
            always_create_new_conversation_window: false,
            bing_access_token: String::new(),
            claude_api_key: String::new(),
            moonshot_api_key: String::new(),
            ollama_endpoint: DEFAULT_OLLAMA_URL.into(),
            ollama_api_key: String::new(),
            azure_endpoint: String::new(),
            azure_api_key: String::new(),
            azure_deployment_name: String::new(),
            chatglm_api_key: String::new(),
            github_third_party_url: String::new(),
            chatgpt_arkose_req_url: String::new(),
            chatgpt_arkose_req_form: String::new(),
            chatgpt_arkose_req_params: DEFAULT_ARKOSE_REQ_PARAMS.into(),
            chatgpt_access_token: String::new(),
            claude_session_key: String::new(),
            bard_cookies: String::new(),
        }
    }
}

impl UserConfig {
    /// ChatGPT web requests only go through a bound tab while the web API
    /// still points at the default host.
    pub fn uses_default_chatgpt_web_url(&self) -> bool {
        self.custom_chat_gpt_web_api_url.trim_end_matches('/') == DEFAULT_CHATGPT_WEB_URL
    }
}

/// Shared handle to the live config (cheap to clone).
#[derive(Clone)]
pub struct ConfigStore {
    current: Arc<ArcSwap<UserConfig>>,
    path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    /// Load from `path`, starting from defaults when the file doesn't exist yet.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    component = "config",
                    event = "config.defaults",
                    path = %path.display(),
                    "No config file, using defaults"
                );
                UserConfig::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        info!(
            component = "config",
            event = "config.loaded",
            path = %path.display(),
            "Config loaded"
        );
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
            path: Some(path),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Store that never touches disk
    pub fn in_memory(config: UserConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
            path: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn get(&self) -> Arc<UserConfig> {
        self.current.load_full()
    }

    /// Apply `change` to a copy of the current config, persist it, then publish it.
    pub async fn update<F>(&self, change: F) -> Result<Arc<UserConfig>, ConfigError>
    where
        F: FnOnce(&mut UserConfig),
    {
        let _guard = self.write_lock.lock().await;
        let mut next = UserConfig::clone(&self.current.load());
        change(&mut next);

        if let Some(path) = &self.path {
            let json = serde_json::to_vec_pretty(&next)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ConfigError::Write {
                        path: path.clone(),
                        source,
                    })?;
            }
            tokio::fs::write(path, json)
                .await
                .map_err(|source| ConfigError::Write {
                    path: path.clone(),
                    source,
                })?;
        }

        let next = Arc::new(next);
        self.current.store(next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json")).await.unwrap();
        let config = store.get();
        assert_eq!(config.custom_chat_gpt_web_api_url, DEFAULT_CHATGPT_WEB_URL);
        assert!(config.chatgpt_tab_id.is_none());
        assert!(config.uses_default_chatgpt_web_url());
    }

    #[tokio::test]
    async fn updates_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let store = ConfigStore::load(&path).await.unwrap();

        store
            .update(|c| {
                c.chatgpt_tab_id = Some(7);
                c.bing_access_token = "tok".into();
            })
            .await
            .unwrap();
        assert_eq!(store.get().chatgpt_tab_id, Some(7));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["chatgptTabId"], 7);
        assert_eq!(raw["bingAccessToken"], "tok");

        let reloaded = ConfigStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get().chatgpt_tab_id, Some(7));
    }

    #[tokio::test]
    async fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "customModelApiUrl": "http://llm.local/v1" }"#).unwrap();

        let config = ConfigStore::load(&path).await.unwrap().get();
        assert_eq!(config.custom_model_api_url, "http://llm.local/v1");
        assert_eq!(config.ollama_endpoint, DEFAULT_OLLAMA_URL);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConfigStore::load(&path).await,
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn custom_web_url_disables_tab_binding() {
        let config = UserConfig {
            custom_chat_gpt_web_api_url: "https://chat.example.com".into(),
            ..Default::default()
        };
        assert!(!config.uses_default_chatgpt_web_url());
        let trailing = UserConfig {
            custom_chat_gpt_web_api_url: "https://chatgpt.com/".into(),
            ..Default::default()
        };
        assert!(trailing.uses_default_chatgpt_web_url());
    }
}
