mod client_commands;

use std::path::{Path, PathBuf};

use {
    chatrelay_agents::ChatOption,
    chatrelay_config::ChatRelayConfig,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

const DEFAULT_URL: &str = "http://127.0.0.1:10800";

#[derive(Parser)]
#[command(name = "chatrelay", about = "Streaming chat relay server and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of discovering chatrelay.{toml,yaml,json}.
    #[arg(long, global = true, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server.
    Serve {
        #[arg(long, env = "CHATRELAY_BIND")]
        bind: Option<String>,
        #[arg(long, env = "CHATRELAY_PORT")]
        port: Option<u16>,
    },
    /// Submit a query and print the streamed reply.
    Chat {
        query: String,
        #[arg(short, long, default_value = "default")]
        session: String,
        /// Capability switch, `name` or `name=true|false`. Repeatable.
        #[arg(short, long = "option", value_parser = client_commands::parse_option)]
        options: Vec<ChatOption>,
        #[arg(long, default_value = DEFAULT_URL, env = "CHATRELAY_URL")]
        url: String,
    },
    /// Show a session's message history.
    History {
        #[arg(short, long, default_value = "default")]
        session: String,
        #[arg(long, default_value = DEFAULT_URL, env = "CHATRELAY_URL")]
        url: String,
    },
    /// Clear a session's message history.
    Clear {
        #[arg(short, long, default_value = "default")]
        session: String,
        #[arg(long, default_value = DEFAULT_URL, env = "CHATRELAY_URL")]
        url: String,
    },
    /// Check that a relay server is up.
    Health {
        #[arg(long, default_value = DEFAULT_URL, env = "CHATRELAY_URL")]
        url: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ChatRelayConfig> {
    match path {
        Some(path) => chatrelay_config::load_config(path),
        None => Ok(chatrelay_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        Commands::Serve { bind, port } => {
            info!(version = env!("CARGO_PKG_VERSION"), "chatrelay starting");
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            chatrelay_gateway::start_gateway(config).await
        },
        Commands::Chat {
            query,
            session,
            options,
            url,
        } => client_commands::chat(url.trim_end_matches('/'), &query, &session, options).await,
        Commands::History { session, url } => {
            client_commands::history(url.trim_end_matches('/'), &session).await
        },
        Commands::Clear { session, url } => {
            client_commands::clear(url.trim_end_matches('/'), &session).await
        },
        Commands::Health { url } => client_commands::health(url.trim_end_matches('/')).await,
    }
}
