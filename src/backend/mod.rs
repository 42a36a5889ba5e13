pub mod echo;
pub mod graphql;
pub mod http;
pub mod process;

use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::RelayError;
use self::echo::EchoBackend;
use self::graphql::GraphqlBackend;
use self::http::HttpBackend;
use self::process::ProcessBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Echo,
    Graphql,
    Http,
    Process,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseBackendTypeError {
    message: String,
}

impl fmt::Display for ParseBackendTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseBackendTypeError {}

impl FromStr for BackendType {
    type Err = ParseBackendTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "echo" => Ok(BackendType::Echo),
            "graphql" | "appsync" => Ok(BackendType::Graphql),
            "http" => Ok(BackendType::Http),
            "process" | "subprocess" => Ok(BackendType::Process),
            _ =>
                Err(ParseBackendTypeError {
                    message: format!("Invalid backend type: '{}'", s),
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub backend_type: BackendType,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub command: Option<String>,
    pub command_args: Vec<String>,
    /// Extra environment handed to a spawned agent process.
    pub env: Vec<(String, String)>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Echo,
            endpoint: None,
            api_key: None,
            command: None,
            command_args: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// A prompt on its way to the agent.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    pub conversation_id: Option<String>,
    pub auth_token: Option<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Default::default() }
    }

    /// Bearer token, if one was supplied and is not blank.
    pub fn bearer(&self) -> Option<&str> {
        self.auth_token.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// What came back from the agent, before normalization.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub raw: Value,
}

impl AgentReply {
    pub fn raw(raw: Value) -> Self {
        Self { id: None, created_at: None, raw }
    }
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, RelayError>;

    fn name(&self) -> &'static str;

    /// Whether `invoke` refuses requests without a bearer token.
    fn requires_auth(&self) -> bool {
        false
    }
}

pub fn new_backend(config: &BackendConfig) -> Result<Arc<dyn AgentBackend>, RelayError> {
    let backend: Arc<dyn AgentBackend> = match config.backend_type {
        BackendType::Echo => Arc::new(EchoBackend),
        BackendType::Graphql => {
            let specific = GraphqlBackend::from_config(config)?;
            Arc::new(specific)
        }
        BackendType::Http => {
            let specific = HttpBackend::from_config(config)?;
            Arc::new(specific)
        }
        BackendType::Process => {
            let specific = ProcessBackend::from_config(config)?;
            Arc::new(specific)
        }
    };
    Ok(backend)
}

fn required_endpoint(config: &BackendConfig) -> Result<String, RelayError> {
    config.endpoint
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            RelayError::Backend(
                format!("AGENT_ENDPOINT is required for the {:?} backend", config.backend_type)
            )
        })
}
