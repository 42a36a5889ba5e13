use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use log::{ debug, error, warn };
use serde::{ Deserialize, Serialize };
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{ AsyncBufReadExt, AsyncWriteExt, BufReader };
use tokio::process::{ Child, Command };
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ AgentBackend, AgentReply, AgentRequest, BackendConfig };
use crate::envelope::parse_reply_text;
use crate::error::RelayError;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

/// Runs an external agent invoker per request. The prompt goes in on stdin
/// as one JSON object; the reply comes back as `{"chunk": ...}` lines.
pub struct ProcessBackend {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

#[derive(Serialize)]
struct PromptPayload<'a> {
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OutputLine {
    chunk: Option<String>,
    error: Option<String>,
}

impl ProcessBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, RelayError> {
        let command = config.command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RelayError::Backend("AGENT_COMMAND is required for the process backend".into()))?;
        Ok(Self {
            command: command.to_string(),
            args: config.command_args.clone(),
            env: config.env.clone(),
        })
    }

    /// Spawns the invoker and yields its chunks as they arrive. The stream
    /// ends with an error item if the child reports one or exits non-zero.
    /// Dropping the stream kills the child.
    pub fn stream_chunks(&self, prompt: &str) -> Result<ChunkStream, RelayError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Backend(format!("failed to spawn '{}': {}", self.command, e)))?;

        let mut stdin = child.stdin
            .take()
            .ok_or_else(|| RelayError::Backend("agent process stdin unavailable".into()))?;
        let stdout = child.stdout
            .take()
            .ok_or_else(|| RelayError::Backend("agent process stdout unavailable".into()))?;

        let mut payload = serde_json
            ::to_vec(&(PromptPayload { prompt }))
            .map_err(|e| RelayError::Backend(e.to_string()))?;
        payload.push(b'\n');

        let (tx, rx) = mpsc::channel(32);
        let command = self.command.clone();

        tokio::spawn(async move {
            // The child may exit without reading stdin.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!("Could not write prompt to '{}': {}", command, e);
            }
            drop(stdin);

            let mut lines = BufReader::new(stdout).lines();
            loop {
                let next = tokio::select! {
                    next = lines.next_line() => next,
                    _ = tx.closed() => {
                        kill_abandoned(&mut child, &command).await;
                        return;
                    }
                };
                match next {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<OutputLine>(line) {
                            Ok(OutputLine { error: Some(msg), .. }) => {
                                let _ = tx.send(Err(RelayError::Backend(msg))).await;
                                return;
                            }
                            Ok(OutputLine { chunk: Some(chunk), .. }) => {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => debug!("Ignoring agent output line without chunk: {}", line),
                            Err(e) => warn!("Skipping malformed agent output line ({}): {}", e, line),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(RelayError::Backend(e.to_string()))).await;
                        return;
                    }
                }
            }

            let status = tokio::select! {
                status = child.wait() => status,
                _ = tx.closed() => {
                    kill_abandoned(&mut child, &command).await;
                    return;
                }
            };
            match status {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    error!("Agent process '{}' exited with {}", command, status);
                    let _ = tx.send(
                        Err(RelayError::Backend(format!("agent process exited with {}", status)))
                    ).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(RelayError::Backend(e.to_string()))).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn kill_abandoned(child: &mut Child, command: &str) {
    debug!("Reply stream for '{}' was dropped, killing the agent process", command);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill agent process '{}': {}", command, e);
    }
}

#[async_trait]
impl AgentBackend for ProcessBackend {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, RelayError> {
        let mut stream = self.stream_chunks(&request.prompt)?;
        let mut assembled = String::new();
        while let Some(chunk) = stream.next().await {
            assembled.push_str(&chunk?);
        }

        Ok(AgentReply::raw(parse_reply_text(assembled)))
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;
    use crate::envelope::normalize;
    use serde_json::Value;

    fn sh(script: &str) -> ProcessBackend {
        ProcessBackend::from_config(&BackendConfig {
            backend_type: BackendType::Process,
            command: Some("sh".into()),
            command_args: vec!["-c".into(), script.into()],
            env: vec![("AGENT_ARN".into(), "arn:aws:test".into())],
            ..Default::default()
        }).unwrap()
    }

    #[tokio::test]
    async fn concatenates_chunks() {
        let backend = sh(r#"echo '{"chunk":"Hel"}'; echo ''; echo '{"chunk":"lo"}'"#);
        let reply = backend.invoke(&AgentRequest::new("hi")).await.unwrap();
        assert_eq!(reply.raw, Value::String("Hello".into()));
    }

    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let backend = sh(
            r#"read -r line; case "$line" in *'"prompt":"hello there"'*) echo '{"chunk":"seen"}' ;; esac"#
        );
        let reply = backend.invoke(&AgentRequest::new("hello there")).await.unwrap();
        assert_eq!(reply.raw, Value::String("seen".into()));
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let backend = sh(r#"printf '{"chunk":"%s"}\n' "$AGENT_ARN""#);
        let reply = backend.invoke(&AgentRequest::new("x")).await.unwrap();
        assert_eq!(reply.raw, Value::String("arn:aws:test".into()));
    }

    #[tokio::test]
    async fn split_json_envelope_is_reassembled() {
        let backend = sh(
            r#"echo '{"chunk":"{\"content\":[{\"text\":"}'; echo 'noise'; echo '{"chunk":"\"hi\"}]}"}'"#
        );
        let reply = backend.invoke(&AgentRequest::new("x")).await.unwrap();
        assert_eq!(normalize(&reply.raw).as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn error_line_fails_the_call() {
        let backend = sh(r#"echo '{"chunk":"part"}'; echo '{"error":"prompt missing"}'; exit 1"#);
        let err = backend.invoke(&AgentRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, RelayError::Backend(ref m) if m == "prompt missing"));
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_call() {
        let backend = sh(r#"echo '{"chunk":"x"}'; exit 3"#);
        let err = backend.invoke(&AgentRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, RelayError::Backend(_)));
    }

    #[tokio::test]
    async fn stream_yields_chunks_in_order() {
        let backend = sh(r#"for w in a b c; do printf '{"chunk":"%s"}\n' "$w"; done"#);
        let chunks: Vec<String> = backend
            .stream_chunks("x")
            .unwrap()
            .map(|c| c.unwrap())
            .collect().await;
        assert_eq!(chunks, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn timed_out_child_is_killed() {
        let marker = std::env::temp_dir().join(format!("relay-hung-agent-{}", uuid::Uuid::new_v4()));
        let backend = ProcessBackend::from_config(&BackendConfig {
            backend_type: BackendType::Process,
            command: Some("sh".into()),
            command_args: vec!["-c".into(), r#"sleep 1; touch "$MARKER""#.into()],
            env: vec![("MARKER".into(), marker.display().to_string())],
            ..Default::default()
        }).unwrap();

        let request = AgentRequest::new("x");
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            backend.invoke(&request)
        ).await;
        assert!(outcome.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn command_is_required() {
        let config = BackendConfig { backend_type: BackendType::Process, ..Default::default() };
        assert!(ProcessBackend::from_config(&config).is_err());
    }
}
