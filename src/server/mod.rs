pub mod api;
pub mod websocket;

use crate::cli::Args;
use crate::conversation::ConversationClient;
use std::error::Error;

pub struct Server {
    http_addr: String,
    ws_addr: Option<String>,
    client: ConversationClient,
    args: Args,
}

impl Server {
    pub fn new(client: ConversationClient, args: Args) -> Self {
        Self {
            http_addr: args.http_addr.clone(),
            ws_addr: args.ws_addr.clone().filter(|a| !a.trim().is_empty()),
            client,
            args,
        }
    }

    /// Serves the HTTP relay and, when configured, the live channel. Returns
    /// when either listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        match &self.ws_addr {
            Some(ws_addr) => {
                tokio::try_join!(self.start_http_server(), self.start_ws_server(ws_addr))?;
            }
            None => self.start_http_server().await?,
        }
        Ok(())
    }

    async fn start_http_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(
            &self.http_addr,
            self.client.clone(),
            self.args.clone(),
        ).await
    }

    async fn start_ws_server(&self, ws_addr: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(
            ws_addr,
            self.client.clone(),
            self.args.server_api_key.clone(),
            self.args.clone(),
        ).await
    }
}
