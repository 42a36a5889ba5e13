use crate::cli::Args;
use crate::conversation::{ ConversationClient, SendOutcome };
use crate::error::RelayError;
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::shell::{ AgentTurn, ChatShell, PendingSend };

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::collections::HashMap;

use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ debug, info, warn, error };
use futures::{ Sink, SinkExt, StreamExt };

type HmacSha256 = Hmac<Sha256>;
type SettledSend = (PendingSend, Result<SendOutcome, RelayError>);

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;
const MAX_CLOCK_SKEW_SECS: i64 = 300;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = match pkcs8_private_keys(&mut key_reader).next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    client: ConversationClient,
    api_key: Option<String>,
    args: Args,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            _ => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
        }
    } else {
        None
    };
    let protocol = if tls_acceptor.is_some() { "WSS" } else { "WS" };
    info!("{} live channel listening on: {}", protocol, addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let client = client.clone();
        let required_api_key = api_key.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = match tls_acceptor {
                Some(acceptor) =>
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            debug!("TLS handshake successful for {}", peer);
                            process_connection(peer, tls_stream, client, required_api_key).await
                        }
                        Err(e) => {
                            error!("TLS handshake error for {}: {}", peer, e);
                            Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                        }
                    }
                None => process_connection(peer, stream, client, required_api_key).await,
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

/// Checks the `ts`/`sig` query pair: `sig` must be the hex HMAC-SHA256 of
/// `ts` keyed by the shared secret, and `ts` must be within the skew window.
pub fn verify_signature(secret: &str, query: &str, now: i64) -> Result<(), &'static str> {
    let params: HashMap<String, String> =
        form_urlencoded::parse(query.as_bytes()).into_owned().collect();

    let ts = params.get("ts").or_else(|| params.get("X-Api-Ts"));
    let sig = params.get("sig").or_else(|| params.get("X-Api-Sign"));
    let (ts, sig) = match (ts, sig) {
        (Some(ts), Some(sig)) => (ts, sig),
        _ => return Err("missing ts/sig"),
    };

    let ts_i: i64 = ts.parse().map_err(|_| "bad timestamp")?;
    if (now - ts_i).abs() > MAX_CLOCK_SKEW_SECS {
        return Err("timestamp out of range");
    }

    let sig_bytes = hex::decode(sig).map_err(|_| "bad signature")?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad signature")?;
    mac.update(ts.as_bytes());
    mac.verify_slice(&sig_bytes).map_err(|_| "bad signature")
}

fn reject(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    client: ConversationClient,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => return Ok(response),
        };
        let query = req.uri().query().unwrap_or("");
        match verify_signature(secret, query, Utc::now().timestamp()) {
            Ok(()) => Ok(response),
            Err(reason) => {
                warn!("Rejected handshake from {}: {}", peer, reason);
                Err(reject(reason))
            }
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, client).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

async fn send_server_message<S>(tx: &mut S, peer: SocketAddr, msg: &ServerMessage) -> bool
    where S: Sink<Message> + Unpin, S::Error: std::fmt::Display
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode message for {}: {}", peer, e);
            return true;
        }
    };
    match tx.send(Message::Text(json)).await {
        Ok(()) => true,
        Err(e) => {
            error!("Error sending to {}: {}", peer, e);
            false
        }
    }
}

fn snapshot(shell: &ChatShell) -> ServerMessage {
    ServerMessage::Conversations {
        items: shell.conversations(),
        active_id: shell.active_id().to_string(),
    }
}

/// Runs one live session: client commands drive the shell, and agent
/// messages from the bus are pushed for conversations this session owns.
pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    client: ConversationClient
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("New WebSocket connection: {}", peer);

    let (mut tx, mut rx) = websocket.split();
    let mut shell = ChatShell::new();
    let mut events = client.bus().subscribe();
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<SettledSend>();

    if !send_server_message(&mut tx, peer, &snapshot(&shell)).await {
        return;
    }

    loop {
        tokio::select! {
            incoming = rx.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        info!("WebSocket connection closed or errored for {}: {}", peer, e);
                        break;
                    }
                    None => break,
                };

                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    let error_msg = ServerMessage::Error { message: "Message too large".to_string() };
                    send_server_message(&mut tx, peer, &error_msg).await;
                    break;
                }

                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Ping(data) => {
                        if tx.send(Message::Pong(data)).await.is_err() {
                            error!("Failed to send pong to {}", peer);
                            break;
                        }
                        continue;
                    }
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                        continue;
                    }
                    Message::Pong(_) | Message::Frame(_) => continue,
                };

                let command = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!("Failed to parse message from {}: {}", peer, e);
                        let error_msg = ServerMessage::Error {
                            message: format!("Failed to parse message: {}", e),
                        };
                        if !send_server_message(&mut tx, peer, &error_msg).await {
                            break;
                        }
                        continue;
                    }
                };

                if !handle_command(&mut tx, peer, &client, &mut shell, &settled_tx, command).await {
                    break;
                }
            }
            Some((pending, result)) = settled_rx.recv() => {
                if !finish_send(&mut tx, peer, &mut shell, pending, result).await {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let local = match shell.local_for_remote(&event.conversation_id) {
                            Some(local) => local.to_string(),
                            None => continue,
                        };
                        if shell.receive_live(&local, event.message.clone()) {
                            let push = ServerMessage::MessageReceived {
                                conversation_id: local,
                                message: event.message,
                            };
                            if !send_server_message(&mut tx, peer, &push).await {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Live channel for {} lagged, skipped {} events", peer, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    info!("WebSocket connection closed for {}", peer);
}

/// Returns false once the socket can no longer be written. Chat sends run
/// in their own task and come back through `settled`.
async fn handle_command<S>(
    tx: &mut S,
    peer: SocketAddr,
    client: &ConversationClient,
    shell: &mut ChatShell,
    settled: &mpsc::UnboundedSender<SettledSend>,
    command: ClientMessage
) -> bool
    where S: Sink<Message> + Unpin, S::Error: std::fmt::Display
{
    match command {
        ClientMessage::Chat { content, auth_token } => {
            let pending = match shell.begin_send(&content) {
                Ok(pending) => pending,
                Err(e) => {
                    return send_server_message(tx, peer, &ServerMessage::Error { message: e.to_string() }).await;
                }
            };
            if !send_server_message(tx, peer, &ServerMessage::Processing).await {
                return false;
            }

            let client = client.clone();
            let settled = settled.clone();
            tokio::spawn(async move {
                let result = client
                    .send_message(pending.remote_id.as_deref(), &pending.prompt, auth_token.as_deref())
                    .await;
                if settled.send((pending, result)).is_err() {
                    debug!("Session closed before the agent replied");
                }
            });
            true
        }
        ClientMessage::NewConversation => {
            shell.create_conversation();
            send_server_message(tx, peer, &snapshot(shell)).await
        }
        ClientMessage::SelectConversation { id } => {
            match shell.select(&id) {
                Ok(()) => send_server_message(tx, peer, &snapshot(shell)).await,
                Err(e) => send_server_message(tx, peer, &ServerMessage::Error { message: e.to_string() }).await,
            }
        }
        ClientMessage::DeleteConversation { id } => {
            match shell.delete(&id) {
                Ok(remote) => {
                    if let Some(remote) = remote {
                        if let Err(e) = client.delete_conversation(&remote).await {
                            error!("Failed to delete stored conversation {}: {}", remote, e);
                        }
                    }
                    send_server_message(tx, peer, &snapshot(shell)).await
                }
                Err(e) => send_server_message(tx, peer, &ServerMessage::Error { message: e.to_string() }).await,
            }
        }
        ClientMessage::ListConversations => send_server_message(tx, peer, &snapshot(shell)).await,
    }
}

async fn finish_send<S>(
    tx: &mut S,
    peer: SocketAddr,
    shell: &mut ChatShell,
    pending: PendingSend,
    result: Result<SendOutcome, RelayError>
) -> bool
    where S: Sink<Message> + Unpin, S::Error: std::fmt::Display
{
    let reply = match result {
        Ok(outcome) => {
            let message = outcome.message.clone();
            shell.complete_send(&pending, Ok(AgentTurn {
                remote_id: outcome.conversation_id,
                message: outcome.message,
            }));
            Some(message)
        }
        Err(e) => {
            error!("Agent relay failed for {}: {}", peer, e);
            shell.complete_send(&pending, Err(e.public_message()));
            shell.messages(&pending.conversation_id).last().cloned()
        }
    };

    if let Some(message) = reply {
        let response = ServerMessage::Response {
            conversation_id: pending.conversation_id,
            message,
        };
        if !send_server_message(tx, peer, &response).await {
            return false;
        }
    }
    send_server_message(tx, peer, &snapshot(shell)).await
}
