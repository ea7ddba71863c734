mod auth;
mod client;
mod config;
mod error;
mod protocol;
mod server;
mod sse;
mod upstream;

use clap::{Parser, Subcommand};
use client::{ClientConfig, RelayClient};
use config::Config;
use std::io::Write;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "agent-relay", version, about = "Streaming relay in front of ADK agents")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "RELAY_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server
    Serve(Config),
    /// Chat with a running relay from the terminal
    Chat(ChatArgs),
}

#[derive(Debug, clap::Args)]
struct ChatArgs {
    #[arg(long, env = "RELAY_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    #[arg(long)]
    user_id: Option<String>,

    #[arg(long)]
    session_id: Option<String>,

    /// List the user's sessions instead of chatting
    #[arg(long, requires = "user_id")]
    list_sessions: bool,

    /// Message to send; omit to read lines from stdin
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Command::Serve(config) => server::run(config).await,
        Command::Chat(args) => chat(args).await,
    }
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_relay=info,tower_http=info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

async fn chat(args: ChatArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut client = RelayClient::new(ClientConfig {
        base_url: args.url,
        user_id: args.user_id,
        session_id: args.session_id,
    });

    if args.list_sessions {
        let sessions = client.list_sessions().await?;
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if let Some(message) = args.message {
        return send(&mut client, message).await;
    }

    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdin));
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        send(&mut client, line).await?;
    }

    Ok(())
}

async fn send(
    client: &mut RelayClient,
    message: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    client
        .send_message(message, |event| {
            print!("{}", event.visible_text());
            let _ = std::io::stdout().flush();
            async {}
        })
        .await?;
    println!();
    if let Some(session_id) = client.session_id() {
        tracing::debug!(session_id, "Continuing session");
    }
    Ok(())
}
