//! fingate CLI - drive a running runtime from the command line.
//!
//! See the `fingate` library for the protocol engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fingate::{Connection, Gateway, GatewayConfig, Identity, MessageListener};
use mimalloc::MiMalloc;
use serde_json::Value;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "fingate")]
#[command(version)]
#[command(about = "Drive an application runtime over its inter-application bus")]
struct Cli {
    /// Config file (default: <config dir>/fingate/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Runtime host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Runtime port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the runtime version
    Version,
    /// Invoke a static method, e.g. `fin.System.getVersion`
    Invoke {
        /// Dotted method path
        method: String,
        /// Arguments as JSON (bare words are sent as strings)
        args: Vec<String>,
        /// Keep a remote reference to the result and print its id
        #[arg(long)]
        proxy: bool,
    },
    /// Publish a JSON message on a topic
    Publish {
        /// Topic name
        topic: String,
        /// Message as JSON (bare words are sent as strings)
        message: String,
    },
    /// Print messages on a topic until Ctrl-C
    Subscribe {
        /// Topic name
        topic: String,
        /// Only messages from this application uuid
        #[arg(long)]
        uuid: Option<String>,
        /// Only messages from this window name (requires --uuid)
        #[arg(long, requires = "uuid")]
        name: Option<String>,
    },
    /// Round-trip a ping through the agent
    Ping {
        /// Number of pings
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(run(cli.command, config))
}

fn load_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = GatewayConfig::load_from(path)?;
            config.apply_env_overrides();
            config
        }
        None => GatewayConfig::load()?,
    };
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    Ok(config)
}

async fn run(command: Commands, config: GatewayConfig) -> Result<()> {
    match command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Version => {
            let gateway = open_gateway(&config).await?;
            let version = gateway.invoke("fin.System.getVersion", &[]).await;
            let _ = gateway.close().await;
            let version = version?;
            println!("{}", version.as_str().unwrap_or("unknown"));
        }
        Commands::Invoke {
            method,
            args,
            proxy,
        } => {
            let gateway = open_gateway(&config).await?;
            let args: Vec<Value> = args.iter().map(String::as_str).map(parse_json_arg).collect();
            let result = gateway.call(proxy, None, &method, &args).await;
            let _ = gateway.close().await;
            let result = result?;
            match result.result() {
                Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
                None => println!("(no result)"),
            }
            if let Some(id) = result.proxy_id() {
                println!("proxy: {}", id);
            }
        }
        Commands::Publish { topic, message } => {
            let conn = connect(&config).await?;
            conn.bus().publish(&topic, parse_json_arg(&message)).await?;
            conn.disconnect().await?;
        }
        Commands::Subscribe { topic, uuid, name } => {
            let conn = connect(&config).await?;
            let source = uuid.map(|uuid| Identity::new(uuid, name.unwrap_or_default()));
            let listener = MessageListener::new(|source, message| {
                println!("[{}] {}", source, message);
            });
            conn.bus()
                .subscribe(source.as_ref(), &topic, listener.clone())
                .await?;
            eprintln!("Listening on {} (Ctrl-C to stop)", topic);

            tokio::signal::ctrl_c().await?;
            conn.bus().unsubscribe(source.as_ref(), &topic, &listener).await?;
            conn.disconnect().await?;
        }
        Commands::Ping { count } => {
            let gateway = open_gateway(&config).await?;
            for i in 0..count {
                match gateway.ping().await {
                    Ok(rtt) => println!("pong {}: {:?}", i + 1, rtt),
                    Err(e) => {
                        let _ = gateway.close().await;
                        return Err(e.into());
                    }
                }
            }
            gateway.close().await?;
        }
    }
    Ok(())
}

async fn connect(config: &GatewayConfig) -> Result<Arc<Connection>> {
    let conn = Connection::new(config.connection_options());
    conn.connect()
        .await
        .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?;
    Ok(conn)
}

async fn open_gateway(config: &GatewayConfig) -> Result<Gateway> {
    let conn = connect(config).await?;
    Gateway::open(conn, config.gateway_options())
        .await
        .context("Failed to start gateway")
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_json_arg(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
