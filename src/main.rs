//! socket-rpc CLI - run a demo server or talk to one.
//!
//! This is the main binary entry point. See the `socket_rpc` library
//! for the core functionality.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde_json::Value;
use socket_rpc::constants::{EVENT_CONNECTION, EVENT_DISCONNECT, EVENT_ERROR};
use socket_rpc::demo::DemoHandlers;
use socket_rpc::listeners::listener;
use socket_rpc::server::{MemorySessionStore, SocketEvent};
use socket_rpc::{Client, ClientEvent, Config, RequestOptions, Router, SocketRegistry, SocketServer};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "socket-rpc")]
#[command(version)]
#[command(about = "Request/response messaging over Unix sockets")]
struct Cli {
    /// JSON config file (defaults apply when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Socket path, overrides the config file
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo handlers until Ctrl+C
    Serve,
    /// Send one request and print the response
    Call {
        /// Event name
        event: String,
        /// Request payload as JSON (defaults to null)
        payload: Option<String>,
        /// Log in as this user id first
        #[arg(long)]
        user: Option<String>,
        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print broadcasts on an event until Ctrl+C
    Watch {
        /// Event name to subscribe to
        event: String,
        /// Log in as this user id first
        #[arg(long)]
        user: Option<String>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(socket) = &cli.socket {
        config = config.with_socket_path(socket.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: Config) -> Result<()> {
    let mut router = Router::new();
    router.register_group(&DemoHandlers);
    log::info!("Serving events: {}", router.events().join(", "));

    let registry = SocketRegistry::new(&config, router, Arc::new(MemorySessionStore::new()));
    registry.on(
        EVENT_CONNECTION,
        listener(|e: &SocketEvent| {
            log::info!("Connection {} (session {})", e.socket.id(), e.socket.session().id());
        }),
    );
    registry.on(
        EVENT_DISCONNECT,
        listener(|e: &SocketEvent| log::info!("Disconnect {}", e.socket.id())),
    );
    registry.on(
        EVENT_ERROR,
        listener(|e: &SocketEvent| {
            log::warn!("Socket {} error: {}", e.socket.id(), e.error.as_deref().unwrap_or("unknown"));
        }),
    );

    let server = SocketServer::start(config.socket_path.clone(), registry)?;
    println!("Listening on {}", server.socket_path().display());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    println!("Shutting down...");
    server.shutdown();
    Ok(())
}

async fn connect(config: Config, user: Option<String>) -> Result<Client> {
    let client = Client::new(config);
    client.on(
        EVENT_ERROR,
        listener(|e: &ClientEvent| {
            if let ClientEvent::Error(message) = e {
                eprintln!("{message}");
            }
        }),
    );
    client.connect()?;

    if let Some(id) = user {
        client
            .execute("login", &serde_json::json!({ "id": id }), RequestOptions::new())
            .await
            .context("Login failed")?;
    }
    Ok(client)
}

async fn call(
    config: Config,
    event: String,
    payload: Option<String>,
    user: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(&raw).context("Payload is not valid JSON")?,
        None => Value::Null,
    };
    let client = connect(config, user).await?;

    let mut options = RequestOptions::new();
    if let Some(ms) = timeout_ms {
        options = options.timeout(Duration::from_millis(ms));
    }
    let result = client.execute(&event, &payload, options).await;
    client.close();

    let data = result?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn watch(config: Config, event: String, user: Option<String>) -> Result<()> {
    let client = connect(config, user).await?;
    client.on(
        &event,
        listener(|e: &ClientEvent| {
            if let ClientEvent::Broadcast(envelope) = e {
                match serde_json::to_string(&envelope.data) {
                    Ok(line) => println!("{line}"),
                    Err(e) => log::warn!("Unprintable broadcast: {e}"),
                }
            }
        }),
    );
    println!("Watching '{event}' (Ctrl+C to stop)");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    client.close();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;

    match cli.command {
        Commands::Serve => runtime.block_on(serve(config)),
        Commands::Call {
            event,
            payload,
            user,
            timeout_ms,
        } => runtime.block_on(call(config, event, payload, user, timeout_ms)),
        Commands::Watch { event, user } => runtime.block_on(watch(config, event, user)),
    }
}
