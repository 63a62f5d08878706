// src/main.rs - blocklink command line
use blocklink::bridge::{BridgeEvent, BridgeHandle};
use blocklink::config::{self, Config};
use blocklink::firmware::transfer::fetch_image;
use blocklink::firmware::{CatalogCache, FirmwareRelease};
use blocklink::hardware::{Connector, SerialConnector, SimulatedDevice};
use blocklink::{blocks, linker, web};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_CONFIG: &str = "blocklink.toml";

#[derive(Parser)]
#[command(name = "blocklink", version, about = "Compile block programs and drive the board")]
struct Cli {
    /// Configuration file (defaults to ./blocklink.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Serial port to use instead of USB id discovery
    #[arg(long, global = true)]
    port: Option<String>,
    /// Talk to an in-process simulated board
    #[arg(long, global = true)]
    simulate: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the block registry as JSON
    Blocks,
    /// Compile a block graph (JSON) to a MicroPython program
    Compile {
        graph: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print only the generated user code
        #[arg(long)]
        user_code: bool,
    },
    /// Show available firmware releases
    Catalog,
    /// Flash firmware onto the board
    Flash {
        /// Release version (defaults to the recommended release)
        #[arg(long)]
        version: Option<String>,
    },
    /// Run a block program and show its output
    Run {
        graph: PathBuf,
        /// Stop after this many seconds (Ctrl-C stops earlier)
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
    /// Store a block program as the board's boot program
    Save { graph: PathBuf },
    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load(cli.config.as_deref())?;
    if let Some(port) = cli.port.clone() {
        config.device.port = Some(port);
    }

    match cli.command {
        Command::Blocks => {
            println!("{}", serde_json::to_string_pretty(&blocks::registry())?);
        }
        Command::Compile { graph, output, user_code } => {
            let program = linker::compile_json(&std::fs::read_to_string(&graph)?)?;
            let text = if user_code { program.user_code() } else { program.source() };
            match output {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    tracing::info!("Wrote {} bytes to {} ({})", text.len(), path.display(), program.digest());
                }
                None => println!("{}", text),
            }
        }
        Command::Catalog => {
            let catalog = CatalogCache::from_config(&config.catalog)?.fetch_catalog().await;
            if catalog.offline {
                tracing::warn!("Registry unreachable, listing the bundled release only");
            }
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Command::Flash { version } => {
            let release = pick_release(&config, version.as_deref()).await?;
            let http = http_client(&config)?;
            let image = fetch_image(&http, &release, config.flash.min_transfer_ratio).await?;
            let bridge = spawn_bridge(&config, cli.simulate);
            bridge.connect().await?;
            let task = bridge.flash(image, release.size).await?;
            let mut progress = task.progress.clone();
            let reporter = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let p = *progress.borrow();
                    if p.total > 0 {
                        tracing::info!("Flashing: {}% ({}/{} bytes)", p.written * 100 / p.total, p.written, p.total);
                    }
                }
            });
            let result = task.wait().await;
            reporter.abort();
            let report = result?;
            println!("Flashed firmware {} ({} bytes at {:#x})", release.version, report.written, report.address);
            bridge.disconnect().await?;
        }
        Command::Run { graph, seconds } => {
            let program = linker::compile_json(&std::fs::read_to_string(&graph)?)?;
            let bridge = spawn_bridge(&config, cli.simulate);
            bridge.connect().await?;
            let mut output = Box::pin(bridge.terminal_stream());
            bridge.run(program).await?;
            let deadline = tokio::time::sleep(Duration::from_secs(seconds));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    chunk = output.next() => match chunk {
                        Some(text) => print!("{}", text),
                        None => break,
                    },
                    _ = &mut deadline => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            if bridge.status().is_connected() {
                bridge.stop().await?;
            }
            bridge.disconnect().await?;
        }
        Command::Save { graph } => {
            let program = linker::compile_json(&std::fs::read_to_string(&graph)?)?;
            let bridge = spawn_bridge(&config, cli.simulate);
            bridge.connect().await?;
            let outcome = bridge.save(program).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            bridge.disconnect().await?;
        }
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.web.bind.clone());
            let bridge = spawn_bridge(&config, cli.simulate);
            let mut events = bridge.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let BridgeEvent::Disconnected { reason } = event {
                        tracing::warn!("Board disconnected: {}", reason);
                    }
                }
            });
            let state = web::AppState {
                catalog: Arc::new(CatalogCache::from_config(&config.catalog)?),
                http: http_client(&config)?,
                min_transfer_ratio: config.flash.min_transfer_ratio,
                bridge,
            };
            web::serve(state, &bind).await?;
        }
    }
    Ok(())
}

fn load(path: Option<&Path>) -> Result<Config, BoxError> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            Ok(config::load_config(&path.to_string_lossy())?)
        }
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(config::load_config(DEFAULT_CONFIG)?),
        None => {
            tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG);
            Ok(Config::default())
        }
    }
}

fn http_client(config: &Config) -> Result<reqwest::Client, BoxError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.catalog.request_timeout_secs.max(60)))
        .user_agent(concat!("blocklink/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn spawn_bridge(config: &Config, simulate: bool) -> BridgeHandle {
    let connector: Arc<dyn Connector> = if simulate {
        tracing::info!("Using a simulated board");
        Arc::new(SimulatedDevice::default().connector())
    } else {
        Arc::new(SerialConnector)
    };
    BridgeHandle::spawn(connector, config)
}

async fn pick_release(config: &Config, version: Option<&str>) -> Result<FirmwareRelease, BoxError> {
    let catalog = CatalogCache::from_config(&config.catalog)?.fetch_catalog().await;
    let release = match version {
        Some(version) => catalog.find(version),
        None => catalog.recommended(),
    };
    release
        .cloned()
        .ok_or_else(|| format!("no firmware release {}", version.unwrap_or("recommended")).into())
}
