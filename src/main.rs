//! mail-gateway-mcp-rs: multi-protocol mail gateway MCP server over stdio
//!
//! Exposes a uniform set of email tools (list, search, detail, archive,
//! send, fan-out search) backed by Gmail API accounts and IMAP/SMTP
//! accounts. Callers never pick a protocol; each account's configured kind
//! routes the operation.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and stdio serving
//! - [`config`]: Environment-driven configuration for accounts and timeouts
//! - [`errors`]: Application error taxonomy with MCP error mapping
//! - [`vault`]: Credential-at-rest encryption (scrypt-keyed AES-GCM)
//! - [`registry`]: Immutable account table with kind-based lookup
//! - [`pool`]: Per-account session pool with single-in-flight connects
//! - [`gmail`]: Gmail API transport and protocol handler
//! - [`imap`]: IMAP transport and protocol handler (one-shot sessions)
//! - [`smtp`]: SMTP submission for IMAP-kind accounts
//! - [`dispatch`]: Kind routing and guaranteed session release
//! - [`fanout`]: Concurrent all-accounts search with partial-failure tolerance
//! - [`dates`]: Search date-bound parsing with timezone precedence
//! - [`server`]: MCP tool handlers with validation
//! - [`models`]: Input/output DTOs and schema-bearing types
//! - [`mime`]: Message parsing shared by both backends

mod config;
mod dates;
mod dispatch;
mod errors;
mod fanout;
mod gmail;
mod imap;
mod mime;
mod models;
mod pool;
mod registry;
mod server;
mod smtp;
mod vault;

use config::GatewayConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing_subscriber::EnvFilter;

/// Application entry point
///
/// Initializes tracing from environment (stderr — stdout belongs to the
/// MCP transport), loads config, and serves the MCP server over stdio.
/// This process expects to be spawned by an MCP client.
///
/// # Environment Variables
///
/// See [`GatewayConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_GW_WORK_KIND=imap \
/// MAIL_GW_WORK_HOST=imap.example.com \
/// MAIL_GW_WORK_USER=user@example.com \
/// MAIL_GW_WORK_PASS=secret \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = GatewayConfig::load_from_env()?;
    let service = server::MailGatewayServer::new(config)?.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
