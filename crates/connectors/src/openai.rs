//! OpenAI-compatible streaming adapter
//!
//! Serves every backend that speaks the OpenAI wire format: custom local
//! endpoints, the OpenAI API itself, Moonshot, Ollama's `/v1` surface and the
//! legacy completions endpoint.

use async_trait::async_trait;
use chatbridge_connector_core::{
    AbortScope, Adapter, ConnectorError, GenerateRequest, Port, Target,
};
use chatbridge_protocol::{Session, StreamEvent};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sse::SseDecoder;

/// Which OpenAI endpoint family a target speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    /// `/v1/chat/completions` with `messages`
    Chat,
    /// `/v1/completions` with a flat `prompt`
    Completion,
}

#[derive(Debug, PartialEq)]
enum Delta {
    Text(String),
    Finished,
    Empty,
}

impl ApiStyle {
    fn request_body(self, session: &Session, model: Option<&str>) -> Value {
        let mut body = match self {
            ApiStyle::Chat => {
                let mut messages = Vec::with_capacity(session.conversation_records.len() * 2 + 1);
                for record in &session.conversation_records {
                    messages.push(json!({ "role": "user", "content": record.question }));
                    messages.push(json!({ "role": "assistant", "content": record.answer }));
                }
                messages.push(json!({ "role": "user", "content": session.question }));
                json!({ "messages": messages, "stream": true })
            }
            ApiStyle::Completion => {
                let mut prompt = String::new();
                for record in &session.conversation_records {
                    prompt.push_str(&format!("Human: {}\nAI: {}\n", record.question, record.answer));
                }
                prompt.push_str(&format!("Human: {}\nAI: ", session.question));
                json!({ "prompt": prompt, "stream": true, "stop": ["\nHuman"] })
            }
        };
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            body["model"] = Value::from(model);
        }
        body
    }

    fn parse(self, data: &str) -> Result<Delta, ConnectorError> {
        if data.trim() == "[DONE]" {
            return Ok(Delta::Finished);
        }
        let value: Value = serde_json::from_str(data)?;
        if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
            return Err(ConnectorError::Provider(message.to_string()));
        }
        let choice = value.pointer("/choices/0");
        let text = match self {
            ApiStyle::Chat => choice.and_then(|c| c.pointer("/delta/content")),
            ApiStyle::Completion => choice.and_then(|c| c.get("text")),
        }
        .and_then(Value::as_str)
        .unwrap_or_default();
        let finished = choice
            .and_then(|c| c.get("finish_reason"))
            .is_some_and(|r| !r.is_null());

        Ok(if !text.is_empty() {
            Delta::Text(text.to_string())
        } else if finished {
            Delta::Finished
        } else {
            Delta::Empty
        })
    }
}

/// Streams answers from an OpenAI-compatible endpoint.
pub struct OpenAiCompatible {
    http: reqwest::Client,
    style: ApiStyle,
}

impl OpenAiCompatible {
    pub fn new(http: reqwest::Client, style: ApiStyle) -> Self {
        Self { http, style }
    }

    /// Returns the full answer, or `None` when the stream was cancelled.
    async fn stream(
        &self,
        port: &Port,
        target: &Target,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ConnectorError> {
        let body = self.style.request_body(session, target.model.as_deref());
        let mut builder = self.http.post(&target.url).json(&body);
        if let Some(key) = target.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            response = builder.send() => response.map_err(|e| ConnectorError::Request(e.to_string()))?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let mut chunks = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut answer = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                chunk = chunks.next() => chunk,
            };
            let (payloads, ended) = match chunk {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| ConnectorError::Request(e.to_string()))?;
                    (decoder.push(&chunk), false)
                }
                None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
            };
            for data in payloads {
                match self.style.parse(&data)? {
                    Delta::Text(text) => {
                        answer.push_str(&text);
                        port.post_message(&StreamEvent::answer(answer.clone()))?;
                    }
                    Delta::Finished => return Ok(Some(answer)),
                    Delta::Empty => {}
                }
            }
            if ended {
                return Ok(Some(answer));
            }
        }
    }
}

#[async_trait]
impl Adapter for OpenAiCompatible {
    async fn generate(&self, port: &Port, request: GenerateRequest) -> Result<(), ConnectorError> {
        let target = request
            .target
            .ok_or_else(|| ConnectorError::Provider("no endpoint configured".into()))?;
        let mut session = request.session;
        let question = session.question.clone();

        let scope = AbortScope::attach(port);
        let answer = self.stream(port, &target, &session, &scope.token()).await?;

        match answer {
            Some(answer) => {
                session.push_record(&question, &answer);
                port.post_message(&StreamEvent::finished(session))?;
            }
            None => debug!(
                component = "openai_connector",
                event = "openai.stream.cancelled",
                reason = ?scope.reason(),
                url = %target.url,
                "Stream cancelled"
            ),
        }
        Ok(())
    }
}
