use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::{ debug, error };
use reqwest::{ Client as HttpClient, header::{ AUTHORIZATION, CONTENT_TYPE } };
use serde::{ Deserialize, Serialize };
use serde_json::Value;

use super::{ required_endpoint, AgentBackend, AgentReply, AgentRequest, BackendConfig };
use crate::error::RelayError;

pub const SEND_MESSAGE_MUTATION: &str = r#"
  mutation SendMessage($prompt: String!) {
    sendMessage(prompt: $prompt) {
      id
      conversationId
      role
      content
      createdAt
    }
  }
"#;

/// Sends prompts through the AppSync `sendMessage` mutation.
pub struct GraphqlBackend {
    http: HttpClient,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: PromptVariables<'a>,
}

#[derive(Serialize)]
struct PromptVariables<'a> {
    prompt: &'a str,
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Deserialize, Debug)]
struct GraphqlError {
    message: Option<String>,
}

impl GraphqlBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, RelayError> {
        Ok(Self {
            http: HttpClient::new(),
            endpoint: required_endpoint(config)?,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl AgentBackend for GraphqlBackend {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, RelayError> {
        let body = GraphqlRequest {
            query: SEND_MESSAGE_MUTATION,
            variables: PromptVariables { prompt: &request.prompt },
        };

        let mut req = self.http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        if let Some(token) = request.bearer() {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let err_body = resp.text().await.unwrap_or_default();
            error!("GraphQL endpoint returned {}: {}", status, err_body);
            return Err(RelayError::Backend(format!("unexpected status {}", status)));
        }

        let parsed: GraphqlResponse = resp.json().await?;
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            debug!("GraphQL errors: {:?}", errors);
            let first = errors
                .into_iter()
                .find_map(|e| e.message)
                .unwrap_or_else(|| "GraphQL mutation failed".to_string());
            return Err(RelayError::Backend(first));
        }

        let message = parsed.data
            .and_then(|d| match d {
                Value::Object(mut map) => map.remove("sendMessage"),
                _ => None,
            })
            .filter(|m| !m.is_null())
            .ok_or_else(|| {
                RelayError::SchemaMismatch("response did not contain sendMessage".into())
            })?;

        Ok(AgentReply {
            id: message.get("id").and_then(Value::as_str).map(str::to_string),
            created_at: message
                .get("createdAt")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc)),
            raw: message,
        })
    }

    fn name(&self) -> &'static str {
        "graphql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;
    use crate::envelope::normalize;
    use crate::test_support::serve;
    use axum::{ http::{ HeaderMap, StatusCode }, routing::post, Json, Router };
    use serde_json::json;

    fn backend(endpoint: String) -> GraphqlBackend {
        GraphqlBackend::from_config(&BackendConfig {
            backend_type: BackendType::Graphql,
            endpoint: Some(endpoint),
            api_key: Some("da2-test".into()),
            ..Default::default()
        }).unwrap()
    }

    #[tokio::test]
    async fn returns_message_record() {
        let app = Router::new().route(
            "/graphql",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("x-api-key").unwrap(), "da2-test");
                assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
                assert_eq!(body["variables"]["prompt"], "best CS programs?");
                Json(json!({
                    "data": {
                        "sendMessage": {
                            "id": "conv-1-1700000000000",
                            "conversationId": "conv-1",
                            "role": "assistant",
                            "content": "{\"result\":{\"content\":[{\"text\":\"Look at Waterloo.\"}]}}",
                            "createdAt": "2025-03-01T10:00:00Z"
                        }
                    }
                }))
            })
        );
        let base = serve(app).await;

        let mut req = AgentRequest::new("best CS programs?");
        req.auth_token = Some("tok".into());
        let reply = backend(format!("{}/graphql", base)).invoke(&req).await.unwrap();

        assert_eq!(reply.id.as_deref(), Some("conv-1-1700000000000"));
        assert!(reply.created_at.is_some());
        assert_eq!(normalize(&reply.raw).as_deref(), Some("Look at Waterloo."));
    }

    #[tokio::test]
    async fn graphql_errors_are_backend_failures() {
        let app = Router::new().route(
            "/graphql",
            post(|| async {
                Json(json!({"data": null, "errors": [{"message": "Lambda:Unhandled"}]}))
            })
        );
        let base = serve(app).await;
        let err = backend(format!("{}/graphql", base))
            .invoke(&AgentRequest::new("x")).await
            .unwrap_err();
        assert!(matches!(err, RelayError::Backend(ref m) if m == "Lambda:Unhandled"));
    }

    #[tokio::test]
    async fn missing_mutation_field_is_schema_mismatch() {
        let app = Router::new().route(
            "/graphql",
            post(|| async { Json(json!({"data": {"somethingElse": {}}})) })
        );
        let base = serve(app).await;
        let err = backend(format!("{}/graphql", base))
            .invoke(&AgentRequest::new("x")).await
            .unwrap_err();
        assert!(matches!(err, RelayError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn http_failure_status_is_backend_failure() {
        let app = Router::new().route(
            "/graphql",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") })
        );
        let base = serve(app).await;
        let err = backend(format!("{}/graphql", base))
            .invoke(&AgentRequest::new("x")).await
            .unwrap_err();
        assert!(matches!(err, RelayError::Backend(_)));
    }
}
