use async_trait::async_trait;
use serde_json::Value;

use super::{ AgentBackend, AgentReply, AgentRequest };
use crate::error::RelayError;

/// Local stand-in that answers without any agent behind it.
pub struct EchoBackend;

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, RelayError> {
        Ok(AgentReply::raw(Value::String(format!("Echoing: {}", request.prompt.trim()))))
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_trimmed_prompt() {
        let reply = EchoBackend.invoke(&AgentRequest::new("  hi  ")).await.unwrap();
        assert_eq!(reply.raw, Value::String("Echoing: hi".into()));
    }
}
