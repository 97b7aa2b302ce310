//! Single typed call to the upstream OpenAI-compatible chat-completions
//! endpoint. Holds no retry/backoff logic of its own — that belongs to
//! the router; this module only builds the request and returns the raw
//! response for the caller to classify and stream.

use serde::Serialize;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::policy::GenParams;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "top_p")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, max_tokens: u32, stream: bool, params: &GenParams) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens,
            stream,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop.clone(),
            response_format: params.json_mode.unwrap_or(false).then(|| ResponseFormat { kind: "json_object".to_string() }),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayCallError {
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GatewayClient {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.gateway_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.gateway_api_key.clone(),
        }
    }

    /// Issues the call; does not inspect the status code so the router
    /// can classify non-2xx responses itself per the per-attempt lifecycle.
    pub async fn call(&self, req: &ChatRequest) -> Result<reqwest::Response, GatewayCallError> {
        self.client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| GatewayCallError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_mode_sets_response_format() {
        let params = GenParams { temperature: None, top_p: None, stop: None, json_mode: Some(true) };
        let req = ChatRequest::new("m", vec![], 10, true, &params);
        assert_eq!(req.response_format.unwrap().kind, "json_object");
    }

    #[test]
    fn omits_response_format_by_default() {
        let params = GenParams { temperature: None, top_p: None, stop: None, json_mode: None };
        let req = ChatRequest::new("m", vec![], 10, true, &params);
        assert!(req.response_format.is_none());
    }
}
