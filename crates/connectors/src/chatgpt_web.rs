//! ChatGPT web conversation endpoints used outside of answer streaming

use chatbridge_connector_core::ConnectorError;
use serde_json::{json, Value};
use tracing::debug;

/// Client for the authenticated `backend-api` conversation routes.
#[derive(Clone)]
pub struct ChatgptWebClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatgptWebClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/backend-api/{}", self.base_url, path)
    }

    /// Submit thumbs-up/down feedback for a message
    pub async fn send_message_feedback(
        &self,
        access_token: &str,
        feedback: &Value,
    ) -> Result<(), ConnectorError> {
        let url = self.url("conversation/message_feedback");
        debug!(
            component = "chatgpt_web",
            event = "chatgpt_web.feedback",
            url = %url,
            "Sending message feedback"
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(feedback)
            .send()
            .await
            .map_err(|e| ConnectorError::Request(e.to_string()))?;
        check(response).await
    }

    /// Hide a conversation from the account's history
    pub async fn delete_conversation(
        &self,
        access_token: &str,
        conversation_id: &str,
    ) -> Result<(), ConnectorError> {
        let url = self.url(&format!("conversation/{conversation_id}"));
        debug!(
            component = "chatgpt_web",
            event = "chatgpt_web.delete_conversation",
            conversation_id = %conversation_id,
            "Deleting conversation"
        );
        let response = self
            .http
            .patch(&url)
            .bearer_auth(access_token)
            .json(&json!({ "is_visible": false }))
            .send()
            .await
            .map_err(|e| ConnectorError::Request(e.to_string()))?;
        check(response).await
    }
}

async fn check(response: reqwest::Response) -> Result<(), ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ConnectorError::Http {
        status: status.as_u16(),
        body,
    })
}
