use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wumpus::config::Config;
use wumpus::events::EventRouter;
use wumpus::gateway::GatewayClient;
use wumpus::http::{ApiRequest, HttpClient, Method};
use wumpus::snowflake::Snowflake;

#[derive(Parser)]
#[command(name = "wumpus")]
#[command(about = "Wumpus CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Ask the REST API for the gateway URL, recommended shards, and identify budget.
    GatewayInfo {
        /// Config file path (default: WUMPUS_CONFIG_PATH or ~/.wumpus/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Open a gateway session and print every dispatch as `NAME payload`. Ctrl-C closes the session.
    Connect {
        /// Config file path (default: WUMPUS_CONFIG_PATH or ~/.wumpus/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway intents bitset (default from config).
        #[arg(long)]
        intents: Option<u64>,
    },

    /// Send one REST request through the rate-limited dispatcher and print the response body.
    Request {
        /// HTTP method, e.g. GET or POST.
        method: String,

        /// Route relative to the API base, e.g. /users/@me.
        route: String,

        /// JSON request body.
        #[arg(long, value_name = "JSON")]
        body: Option<String>,

        /// Config file path (default: WUMPUS_CONFIG_PATH or ~/.wumpus/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Decode a snowflake id into its timestamp and counters.
    Snowflake {
        id: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("wumpus {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::GatewayInfo { config }) => {
            if let Err(e) = run_gateway_info(config).await {
                log::error!("gateway-info failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Connect { config, intents }) => {
            if let Err(e) = run_connect(config, intents).await {
                log::error!("connect failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Request {
            method,
            route,
            body,
            config,
        }) => {
            if let Err(e) = run_request(config, &method, &route, body.as_deref()).await {
                log::error!("request failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Snowflake { id }) => {
            if let Err(e) = run_snowflake(&id) {
                log::error!("snowflake failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn load(config_path: Option<PathBuf>) -> anyhow::Result<Config> {
    let (config, path) = wumpus::config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    Ok(config)
}

async fn run_gateway_info(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let http = HttpClient::from_config(&config);
    let info = http.gateway_bot().await.context("GET /gateway/bot")?;
    println!("url: {}", info.url);
    println!("shards: {}", info.shards);
    let limit = &info.session_start_limit;
    println!(
        "session starts: {}/{} remaining, resets in {} ms, max concurrency {}",
        limit.remaining, limit.total, limit.reset_after, limit.max_concurrency
    );
    Ok(())
}

async fn run_connect(config_path: Option<PathBuf>, intents: Option<u64>) -> anyhow::Result<()> {
    let mut config = load(config_path)?;
    if let Some(i) = intents {
        config.gateway.intents = i;
    }
    let token = wumpus::config::resolve_token(&config)
        .context("no token: set WUMPUS_TOKEN or \"token\" in the config file")?;
    let http = HttpClient::from_config(&config);
    let router = EventRouter::new().on_any(|name: &str, payload: &serde_json::Value| {
        println!("{} {}", name, payload);
    });
    let (mut client, shutdown) = GatewayClient::new(config.gateway.clone(), token, http, router);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl-C: {}", e);
            return;
        }
        log::info!("shutdown signal received, closing the gateway session");
        shutdown.shutdown();
    });

    client.run().await?;
    Ok(())
}

async fn run_request(
    config_path: Option<PathBuf>,
    method: &str,
    route: &str,
    body: Option<&str>,
) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method {}", method))?;
    let mut req = ApiRequest::new(method, route);
    if let Some(b) = body {
        let json: serde_json::Value = serde_json::from_str(b).context("parsing --body")?;
        req = req.json(json);
    }
    let http = HttpClient::from_config(&config);
    let value = http.request(req).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_snowflake(id: &str) -> anyhow::Result<()> {
    let id: Snowflake = id
        .parse()
        .with_context(|| format!("not a snowflake: {}", id))?;
    let d = id.deconstruct();
    println!("id: {}", d.id);
    println!("timestamp: {}", d.timestamp.to_rfc3339());
    println!("worker: {}", d.worker_id);
    println!("process: {}", d.process_id);
    println!("increment: {}", d.increment);
    Ok(())
}
