pub mod backend;
pub mod bus;
pub mod cli;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod models;
pub mod server;
pub mod shell;
pub mod store;

#[cfg(test)]
mod test_support;

use bus::MessageBus;
use cli::Args;
use conversation::ConversationClient;
use log::info;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("HTTP Address: {}", args.http_addr);
    info!("Live Channel Address: {}", args.ws_addr.as_deref().unwrap_or("disabled"));
    info!("Backend Type: {}", args.backend_type);
    info!("Agent Endpoint: {}", args.agent_endpoint.as_deref().unwrap_or("none"));
    info!("Agent Command: {}", args.agent_command.as_deref().unwrap_or("none"));
    info!("Agent Timeout: {}", match args.agent_timeout() {
        Some(limit) => format!("{}s", limit.as_secs()),
        None => "none".to_string(),
    });
    info!("Conversation Store: {}", args.conversation_store);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let backend_config = args.backend_config()?;
    let backend = backend::new_backend(&backend_config)?;
    let store = store::initialize_conversation_store(&args)?;
    let client = ConversationClient::new(store, backend, MessageBus::new(), args.agent_timeout());
    info!("Agent backend configured: {}", client.backend_name());

    let server = Server::new(client, args);
    server.run().await?;

    Ok(())
}
