//! MCP Hub - bidirectional Model Context Protocol runtime.
//!
//! Connects to the external MCP servers listed in the servers file, merges their
//! tools with the built-in ones and serves the result over stdio or HTTP/SSE.

use clap::Parser;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcp_hub::config::{Args, Config, Mode};
use mcp_hub::error::{Error, Result};
use mcp_hub::mcp::client::Client;
use mcp_hub::mcp::handler::McpHandler;
use mcp_hub::mcp::server::McpServer;
use mcp_hub::mcp::transport::Platform;
use mcp_hub::metrics::Metrics;
use mcp_hub::registry::ToolRegistry;
use mcp_hub::tools;
use mcp_hub::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config: Config = args.into();
    init_logging(&config)?;

    info!("MCP Hub v{}", VERSION);
    info!("Mode: {:?}", config.mode);

    let metrics = Metrics::new();
    let registry = Arc::new(ToolRegistry::new(config.prefix.clone()).with_metrics(metrics.clone()));

    let builtin = tools::register_builtin_tools(&registry).await?;
    info!("Registered {} internal tools", builtin.len());

    connect_external_servers(&config, &registry).await?;

    let mut handler = McpHandler::new();
    let exposed = tools::expose_registry(&mut handler, registry.clone()).await?;
    info!("Serving {} tools", exposed);

    let mut server = McpServer::new(handler, config.name.clone()).with_metrics(metrics);
    if let Some(instructions) = &config.instructions {
        server = server.with_instructions(instructions.clone());
    }
    let server = Arc::new(server);
    tools::announce_tool_changes(&registry, &server);

    let outcome = match config.mode {
        Mode::Stdio => {
            info!("Starting stdio transport...");
            server.serve_stdio().await
        }
        Mode::Http => {
            info!("Starting HTTP transport on {}:{}...", config.host, config.port);
            mcp_hub::http::start_server(&config, server).await
        }
    };

    registry.disconnect_all().await;
    outcome
}

fn init_logging(config: &Config) -> Result<()> {
    // Logs go to stderr; stdout carries protocol frames in stdio mode.
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| Error::Config(format!("failed to initialize logging: {}", e)))
}

/// Connect every enabled server and import its tools. Failures are logged and skipped.
async fn connect_external_servers(config: &Config, registry: &ToolRegistry) -> Result<()> {
    let servers = config.load_servers()?;
    if servers.is_empty() {
        return Ok(());
    }
    info!("Connecting {} external server(s)", servers.len());

    let platform = Platform::native();
    let attempts = join_all(servers.iter().map(|server| Client::connect(server, &platform))).await;

    for (server, attempt) in servers.iter().zip(attempts) {
        let client = match attempt {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!(server = %server.name, "Skipping server: {}", e);
                continue;
            }
        };
        match registry.import_external(&server.name, client.clone()).await {
            Ok(count) => info!(server = %server.name, "Imported {} tools", count),
            Err(e) => {
                warn!(server = %server.name, "Tool import failed: {}", e);
                let _ = client.disconnect().await;
            }
        }
    }
    Ok(())
}
