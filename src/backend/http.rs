use async_trait::async_trait;
use log::error;
use reqwest::{ Client as HttpClient, StatusCode, header::AUTHORIZATION };
use serde::Serialize;
use serde_json::Value;

use super::{ required_endpoint, AgentBackend, AgentReply, AgentRequest, BackendConfig };
use crate::error::RelayError;

/// Forwards prompts to an agent gateway that requires the caller's bearer
/// token.
pub struct HttpBackend {
    http: HttpClient,
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
}

impl HttpBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, RelayError> {
        Ok(Self {
            http: HttpClient::new(),
            endpoint: required_endpoint(config)?,
        })
    }
}

#[async_trait]
impl AgentBackend for HttpBackend {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, RelayError> {
        let token = request.bearer().ok_or(RelayError::Unauthorized)?;

        let resp = self.http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(
                &(InvokeRequest {
                    prompt: &request.prompt,
                    conversation_id: request.conversation_id.as_deref(),
                })
            )
            .send().await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RelayError::Unauthorized),
            s if s.is_success() => {
                let text = resp.text().await?;
                let raw = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
                let id = raw.get("id").and_then(Value::as_str).map(str::to_string);
                Ok(AgentReply { id, created_at: None, raw })
            }
            s => {
                let err_body = resp.text().await.unwrap_or_default();
                error!("Agent gateway returned {}: {}", s, err_body);
                Err(RelayError::Backend(format!("unexpected status {}", s)))
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }

    fn requires_auth(&self) -> bool {
        true
    }
}
