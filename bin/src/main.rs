use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use satlink_codec::{LinkConnector, Value};
use satlink_dispatch::{AppRegistry, CmdError, ErrorRegistry};
use satlink_multiplexer::{
    json::{json_to_value, value_to_json},
    MplexClient, MplexConfig, MplexError, Multiplexer,
};
use satlink_transport_stream::{StreamConfig, TcpConnector, UnixConnector};

/// Share one satellite link between local programs, or talk to a running multiplexer
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Rendezvous socket, a bare name is placed in $XDG_RUNTIME_DIR
    #[arg(env = "SATLINK_SOCKET", short, long, default_value = "satlink")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the multiplexer in front of a satellite
    Serve {
        /// Satellite reachable over tcp, host:port
        #[arg(env, long, conflicts_with = "unix")]
        tcp: Option<String>,

        /// Satellite reachable over a unix socket
        #[arg(env, long)]
        unix: Option<PathBuf>,

        /// Byte in front of every frame, needed when the link also carries console text
        #[arg(env, long)]
        lead_in: Option<u8>,

        /// JSON config file, command line flags override it
        #[arg(env, short, long)]
        config: Option<PathBuf>,

        /// Reliable window size
        #[arg(env, long)]
        window: Option<u32>,

        /// Retransmit timeout in milliseconds
        #[arg(env, long)]
        timeout_ms: Option<u64>,

        /// Satellite watchdog interval in milliseconds, 0 disables it
        #[arg(env, long)]
        watchdog_ms: Option<u64>,

        /// Give up after this many failed connection attempts
        #[arg(env, long)]
        max_retries: Option<u32>,

        /// Fetch sys.cfg from the satellite after every connect
        #[arg(env, long)]
        fetch_config: bool,
    },
    /// Send one command through a running multiplexer and print the answer as JSON
    Call {
        /// Dotted command path, like sys.cfg or mplex.state
        path: String,

        /// JSON argument
        data: Option<String>,

        /// Subscribe with this cadence in milliseconds and print every item
        #[arg(long)]
        repeat: Option<u32>,

        /// Call timeout in milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Mplex(#[from] MplexError),
    #[error("{0}")]
    Cmd(#[from] CmdError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(String),
}

#[async_std::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::builder().format_timestamp_millis().init();
    if let Err(e) = run(Args::parse()).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    match args.command {
        Command::Serve {
            tcp,
            unix,
            lead_in,
            config,
            window,
            timeout_ms,
            watchdog_ms,
            max_retries,
            fetch_config,
        } => {
            let mut cfg = match config {
                Some(file) => load_config(&file)?,
                None => MplexConfig::default(),
            };
            cfg.socket = args.socket;
            if let Some(window) = window {
                cfg.reliable.window = window;
            }
            if let Some(timeout_ms) = timeout_ms {
                cfg.reliable.timeout_ms = timeout_ms;
            }
            if let Some(watchdog_ms) = watchdog_ms {
                cfg.watchdog_ms = watchdog_ms;
            }
            if max_retries.is_some() {
                cfg.backoff.max_retries = max_retries;
            }
            cfg.fetch_config |= fetch_config;
            serve(cfg, tcp, unix, lead_in).await
        }
        Command::Call { path, data, repeat, timeout_ms } => call(args.socket, path, data, repeat, timeout_ms).await,
    }
}

fn load_config(file: &Path) -> Result<MplexConfig, CliError> {
    let text = std::fs::read_to_string(file).map_err(|e| CliError::Config(format!("{}: {}", file.display(), e)))?;
    Ok(serde_json::from_str(&text)?)
}

async fn serve(cfg: MplexConfig, tcp: Option<String>, unix: Option<PathBuf>, lead_in: Option<u8>) -> Result<(), CliError> {
    let stream = StreamConfig { lead_in, ..Default::default() };
    let connector: Arc<dyn LinkConnector> = match (tcp, unix) {
        (Some(addr), _) => Arc::new(TcpConnector::new(&addr, stream)),
        (None, Some(path)) => Arc::new(UnixConnector::new(path, stream)),
        (None, None) => return Err(CliError::Config("one of --tcp or --unix is required".into())),
    };
    let mplex = Multiplexer::new(cfg, connector, Arc::new(ErrorRegistry::new()), Arc::new(AppRegistry::new()));
    log::info!("serving on {}", mplex.socket().display());
    mplex.run().await?;
    Ok(())
}

async fn call(socket: PathBuf, path: String, data: Option<String>, repeat: Option<u32>, timeout_ms: u64) -> Result<(), CliError> {
    let socket = MplexConfig { socket, ..Default::default() }.socket_path();
    let client = MplexClient::connect(&socket).await?;
    let action: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let data = match data {
        Some(text) => json_to_value(serde_json::from_str(&text)?),
        None => Value::Nil,
    };

    let res = match repeat {
        None => client.call_timeout(&action, data, Duration::from_millis(timeout_ms)).await.map(|v| println!("{}", value_to_json(&v))),
        Some(cadence_ms) => match client.subscribe(&action, data, cadence_ms).await {
            Ok(mut items) => {
                let mut res = Ok(());
                while let Some(item) = items.next().await {
                    match item {
                        Ok(v) => println!("{}", value_to_json(&v)),
                        Err(e) => {
                            res = Err(e);
                            break;
                        }
                    }
                }
                res
            }
            Err(e) => Err(e),
        },
    };
    client.close().await;
    Ok(res?)
}
