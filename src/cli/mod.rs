use clap::Parser;
use std::time::Duration;

use crate::backend::{ BackendConfig, BackendType };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the HTTP relay endpoint.
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:3000")]
    pub http_addr: String,

    /// Host address and port for the WebSocket live channel. Disabled when unset.
    #[arg(long, env = "WS_ADDR")]
    pub ws_addr: Option<String>,

    /// Optional shared secret for the WebSocket handshake. If set, clients must sign a timestamp with it.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    // --- Agent Backend Args ---
    /// How prompts reach the agent (echo, graphql, http, process)
    #[arg(long, env = "BACKEND_TYPE", default_value = "echo")]
    pub backend_type: String,

    /// GraphQL or HTTP endpoint of the agent backend (e.g., https://xyz.appsync-api.us-east-1.amazonaws.com/graphql)
    #[arg(long, env = "AGENT_ENDPOINT")]
    pub agent_endpoint: Option<String>,

    /// API key sent as x-api-key to the GraphQL endpoint.
    #[arg(long, env = "AGENT_API_KEY", default_value = "")]
    pub agent_api_key: String,

    /// Executable spawned per request by the process backend.
    #[arg(long, env = "AGENT_COMMAND")]
    pub agent_command: Option<String>,

    /// Arguments for AGENT_COMMAND, separated by whitespace.
    #[arg(long, env = "AGENT_COMMAND_ARGS", value_delimiter = ' ', num_args = 0..)]
    pub agent_command_args: Vec<String>,

    /// Agent runtime ARN handed to the spawned process as AGENT_ARN.
    #[arg(long, env = "AGENT_ARN")]
    pub agent_arn: Option<String>,

    /// Seconds to wait for the agent before giving up. 0 waits forever.
    #[arg(long, env = "AGENT_TIMEOUT_SECS", default_value = "120")]
    pub agent_timeout_secs: u64,

    // --- Conversation Store Args ---
    /// Conversation store type (memory, redis)
    #[arg(long, env = "CONVERSATION_STORE", default_value = "memory")]
    pub conversation_store: String,

    /// Conversation store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "CONVERSATION_HOST", default_value = "redis://127.0.0.1:6379")]
    pub conversation_host: String,

    /// Prefix for Redis conversation keys.
    #[arg(long, env = "CONVERSATION_REDIS_PREFIX", default_value = "conversation:")]
    pub conversation_redis_prefix: String,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    pub fn backend_config(&self) -> Result<BackendConfig, String> {
        let backend_type: BackendType = self.backend_type.parse().map_err(|e| format!("{}", e))?;
        let mut env = Vec::new();
        if let Some(arn) = self.agent_arn.as_ref().filter(|a| !a.is_empty()) {
            env.push(("AGENT_ARN".to_string(), arn.clone()));
        }
        Ok(BackendConfig {
            backend_type,
            endpoint: self.agent_endpoint.clone(),
            api_key: Some(self.agent_api_key.clone()).filter(|k| !k.is_empty()),
            command: self.agent_command.clone(),
            command_args: self.agent_command_args
                .iter()
                .filter(|a| !a.is_empty())
                .cloned()
                .collect(),
            env,
        })
    }

    pub fn agent_timeout(&self) -> Option<Duration> {
        match self.agent_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
