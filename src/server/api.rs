use crate::cli::Args;
use crate::conversation::ConversationClient;
use crate::error::RelayError;
use crate::models::chat::ConversationSummary;

use std::error::Error;
use std::net::SocketAddr;
use axum::{
    body::Bytes,
    extract::{ Path, State },
    http::{ header::AUTHORIZATION, HeaderMap, StatusCode },
    response::{ IntoResponse, Response },
    routing::{ delete, get, post },
    Json,
    Router,
};
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error, warn };

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequestBody {
    message: Option<Value>,
    conversation_id: Option<String>,
    auth_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponseBody {
    message: Option<String>,
    conversation_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    backend: &'static str,
}

#[derive(Clone)]
struct AppState {
    client: ConversationClient,
}

pub fn router(client: ConversationClient) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/conversations", get(list_conversations_handler))
        .route("/api/conversations/{id}", delete(delete_conversation_handler))
        .route("/api/health", get(health_handler))
        .layer(cors)
        .with_state(AppState { client })
}

pub async fn start_http_server(
    addr: &str,
    client: ConversationClient,
    args: Args,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = addr.parse::<SocketAddr>()?;
    let app = router(client);

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;
            info!("HTTPS relay listening on: https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        (true, _, _) => {
            error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
            return Err("Missing TLS certificate or key path".into());
        }
        (false, _, _) => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                format!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e)
            })?;
            info!("HTTP relay listening on: http://{}", addr);
            axum::serve(listener, app.into_make_service()).await?;
        }
    }

    Ok(())
}

fn error_response(err: &RelayError) -> Response {
    (err.status(), Json(ErrorBody { error: err.public_message() })).into_response()
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: ChatRequestBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!("Rejected chat request with invalid JSON: {}", e);
            return error_response(&RelayError::InvalidJson(e));
        }
    };

    let prompt = payload.message
        .as_ref()
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if prompt.is_empty() {
        return error_response(&RelayError::EmptyMessage);
    }

    let auth_token = payload.auth_token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| bearer_from_headers(&headers));

    match state.client
        .send_message(payload.conversation_id.as_deref(), prompt, auth_token.as_deref())
        .await
    {
        Ok(outcome) => {
            (StatusCode::OK, Json(ChatResponseBody {
                message: outcome.text,
                conversation_id: Some(outcome.conversation_id),
            })).into_response()
        }
        Err(e) => {
            error!("Chat relay failed: {}", e);
            error_response(&e)
        }
    }
}

async fn list_conversations_handler(State(state): State<AppState>) -> Response {
    match state.client.list_conversations().await {
        Ok(items) => Json::<Vec<ConversationSummary>>(items).into_response(),
        Err(e) => {
            error!("Listing conversations failed: {}", e);
            error_response(&e)
        }
    }
}

async fn delete_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.client.delete_conversation(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => {
            (StatusCode::NOT_FOUND, Json(ErrorBody { error: "Conversation not found.".into() }))
                .into_response()
        }
        Err(e) => {
            error!("Deleting conversation {} failed: {}", id, e);
            error_response(&e)
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthBody { status: "ok", backend: state.client.backend_name() })
}
