use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use inside_bar_trader::gateway::BrokerGateway;
use inside_bar_trader::{PaperGateway, Scheduler, SystemClock, TraderConfig};

#[derive(Parser, Debug)]
#[command(name = "inside-bar-trader")]
#[command(about = "Intraday inside-bar breakout trader")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (defaults to the chosen preset)
    #[arg(short, long, global = true, env = "TRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Preset used when no config file is given
    #[arg(long, global = true, value_enum, default_value_t = Preset::Hourly)]
    preset: Preset,

    /// Account size override, in dollars
    #[arg(long, global = true, env = "TRADER_ACCOUNT_SIZE")]
    account_size: Option<f64>,

    /// Risk fraction override (0.005 = 0.5%)
    #[arg(long, global = true, env = "TRADER_RISK_FRACTION")]
    risk_fraction: Option<f64>,

    /// Candidate symbols, one per line, used instead of the scanners
    #[arg(long, global = true)]
    symbols_file: Option<PathBuf>,

    /// Broker to trade through
    #[arg(long, global = true, value_enum, default_value_t = GatewayKind::Paper)]
    gateway: GatewayKind,

    /// JSON bars/positions fixture for the paper gateway
    #[arg(long, global = true)]
    paper_data: Option<PathBuf>,

    /// TWS / IB Gateway host
    #[arg(long, global = true, env = "IB_HOST", default_value = "127.0.0.1")]
    ib_host: String,

    /// TWS / IB Gateway port (7497 paper, 7496 live)
    #[arg(long, global = true, env = "IB_PORT", default_value = "7497")]
    ib_port: u16,

    /// API client id
    #[arg(long, global = true, env = "IB_CLIENT_ID", default_value = "2")]
    client_id: i32,

    /// Skip the live-port confirmation prompt
    #[arg(long, global = true)]
    yes: bool,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Trade the session: scan hourly, enter on breakouts, liquidate at the close
    Run,
    /// One scan and detection pass; prints the candidates found
    Scan,
    /// One stop maintenance pass over working stops
    AdjustStops,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Preset {
    Hourly,
    Swing,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum GatewayKind {
    Paper,
    Ib,
}

/// Ports TWS and IB Gateway use for live (real money) accounts
const LIVE_PORTS: [u16; 2] = [7496, 4001];

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let default_level = if args.verbose { "inside_bar_trader=debug" } else { "inside_bar_trader=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(&args)?;
    info!(
        "Account ${:.0}, risk {:.2}% (${:.2}/trade), {} bars, detector {}",
        config.account_size,
        config.risk_fraction * 100.0,
        config.risk_budget(),
        config.bar_request.bar_size,
        config.detector
    );

    match args.gateway {
        GatewayKind::Paper => {
            let gateway = match &args.paper_data {
                Some(path) => PaperGateway::from_json_file(path).await?,
                None => {
                    warn!("Paper gateway without --paper-data: no market data, nothing will trigger");
                    PaperGateway::new()
                }
            };
            execute(args.command, config, gateway).await
        }
        GatewayKind::Ib => connect_ib(&args, config).await,
    }
}

#[cfg(feature = "ibkr")]
async fn connect_ib(args: &Args, config: TraderConfig) -> Result<()> {
    if LIVE_PORTS.contains(&args.ib_port) && !args.yes && !confirm_live()? {
        println!("Live trading cancelled.");
        return Ok(());
    }

    let gateway = inside_bar_trader::gateway::IbGateway::connect(&args.ib_host, args.ib_port, args.client_id).await?;
    execute(args.command, config, gateway).await
}

#[cfg(not(feature = "ibkr"))]
async fn connect_ib(args: &Args, _config: TraderConfig) -> Result<()> {
    if LIVE_PORTS.contains(&args.ib_port) {
        warn!("Port {} is a live trading port", args.ib_port);
    }
    bail!("Built without Interactive Brokers support; rebuild with `--features ibkr`")
}

#[cfg_attr(not(feature = "ibkr"), allow(dead_code))]
fn confirm_live() -> Result<bool> {
    println!("\nWARNING: LIVE TRADING PORT");
    println!("This will execute real trades with real money.");
    println!("Type 'CONFIRM' to proceed or anything else to cancel:");

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "CONFIRM")
}

fn load_config(args: &Args) -> Result<TraderConfig> {
    let mut config = match &args.config {
        Some(path) => TraderConfig::from_toml_file(path)?,
        None => match args.preset {
            Preset::Hourly => TraderConfig::hourly(),
            Preset::Swing => TraderConfig::swing_daily(),
        },
    };

    if let Some(size) = args.account_size {
        config.account_size = size;
    }
    if let Some(fraction) = args.risk_fraction {
        config.risk_fraction = fraction;
    }
    if let Some(path) = &args.symbols_file {
        config.static_symbols = read_symbols(path)?;
        info!("Loaded {} symbols from {}", config.static_symbols.len(), path.display());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// One symbol per line; blank lines and `#` comments skipped
fn read_symbols(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read symbols file {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_uppercase)
        .collect())
}

async fn execute<G: BrokerGateway>(command: Commands, config: TraderConfig, gateway: G) -> Result<()> {
    let mut scheduler = Scheduler::new(config, gateway, SystemClock)?;

    match command {
        Commands::Run => {
            let handle = scheduler.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, stopping after the current poll");
                    handle.shutdown();
                }
            });

            let report = scheduler.run().await?;
            println!("{}", report);
        }
        Commands::Scan => {
            let added = scheduler.rescan().await;
            for symbol in &added {
                if let Some(entry) = scheduler.watchlist().get(symbol) {
                    println!(
                        "{:<8} inside bar {}  high {:.4}  low {:.4}",
                        symbol, entry.setup.confirmation.timestamp, entry.setup.confirmation.high, entry.setup.confirmation.low
                    );
                }
            }
            println!("{} candidates", added.len());
            scheduler.disconnect().await;
        }
        Commands::AdjustStops => {
            let moved = scheduler.adjust_stops().await;
            println!("{} stops raised", moved);
            scheduler.disconnect().await;
        }
    }

    Ok(())
}
