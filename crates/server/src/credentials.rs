//! Credentials for hosted-web-session backends.
//!
//! How tokens are obtained is somebody else's job; the background only asks
//! for them at dispatch time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ConfigStore;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{0} is not available. Please log in and try again.")]
    Missing(&'static str),
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn chatgpt_access_token(&self) -> Result<String, CredentialError>;

    async fn bing_access_token(&self) -> Result<String, CredentialError>;

    async fn claude_session_key(&self) -> Result<String, CredentialError>;

    async fn bard_cookies(&self) -> Result<BTreeMap<String, String>, CredentialError>;
}

/// Reads credentials that helpers have already stored in the user config.
pub struct ConfigCredentials {
    config: ConfigStore,
}

impl ConfigCredentials {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }
}

fn present(value: &str, what: &'static str) -> Result<String, CredentialError> {
    let value = value.trim();
    if value.is_empty() {
        Err(CredentialError::Missing(what))
    } else {
        Ok(value.to_string())
    }
}

/// Parse a `name=value; name2=value2` cookie header.
pub fn parse_cookie_header(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[async_trait]
impl CredentialSource for ConfigCredentials {
    async fn chatgpt_access_token(&self) -> Result<String, CredentialError> {
        present(&self.config.get().chatgpt_access_token, "ChatGPT access token")
    }

    async fn bing_access_token(&self) -> Result<String, CredentialError> {
        present(&self.config.get().bing_access_token, "Bing access token")
    }

    async fn claude_session_key(&self) -> Result<String, CredentialError> {
        present(&self.config.get().claude_session_key, "Claude session key")
    }

    async fn bard_cookies(&self) -> Result<BTreeMap<String, String>, CredentialError> {
        let cookies = parse_cookie_header(&self.config.get().bard_cookies);
        if cookies.is_empty() {
            Err(CredentialError::Missing("Gemini cookies"))
        } else {
            Ok(cookies)
        }
    }
}
