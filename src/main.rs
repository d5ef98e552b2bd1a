use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pingwarden::analysis::{FeatureVector, ModelLookup, ModelStore};
use pingwarden::config::MonitorConfig;
use pingwarden::probes::{ProbeKind, Prober, Target};

#[derive(Parser)]
#[command(
    name = "pingwarden",
    about = "Unattended reachability and latency monitor with anomaly alerts",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $PINGWARDEN_CONFIG, then /etc/pingwarden/pingwarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitor daemon (scheduler + status API)
    Run,

    /// Load and validate the configuration, then print the target table
    CheckConfig,

    /// Probe one address and print its feature vector
    Probe {
        /// Host name or IP address
        address: String,

        /// Number of attempts
        #[arg(long, default_value = "4")]
        count: u32,

        /// Per-attempt timeout in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,

        /// Use a TCP connect probe to this port instead of ICMP
        #[arg(long)]
        port: Option<u16>,
    },

    /// Export probe history as JSON lines for model training
    Export {
        /// Only export this target
        #[arg(long)]
        target: Option<String>,

        /// Output file (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show model artifact status for every configured target
    Models,
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        // A one-shot probe needs no config file.
        Commands::Probe { .. } => MonitorConfig::default(),
        _ => MonitorConfig::resolve(cli.config.as_deref())?,
    };
    init_tracing(&config.logging.level, cli.json_logs || config.logging.json);

    match cli.command {
        Commands::Run => {
            tracing::info!(targets = config.targets.len(), "Starting pingwarden");
            pingwarden::serve(config).await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!(
                "Configuration OK: {} target(s), tick {}s, cycle budget {}ms",
                config.targets.len(),
                config.scheduler.tick_interval_secs,
                config.cycle_budget().as_millis()
            );
            println!(
                "{:<24} | {:<20} | {:<5} | {:>6} | {:>5} | {:>8}",
                "Target", "Address", "Kind", "Every", "Count", "Timeout"
            );
            println!("{:-<24}-|-{:-<20}-|-{:-<5}-|-{:-<6}-|-{:-<5}-|-{:-<8}", "", "", "", "", "", "");
            for t in config.targets() {
                println!(
                    "{:<24} | {:<20} | {:<5} | {:>5}t | {:>5} | {:>6}ms",
                    t.id,
                    t.address,
                    t.kind,
                    t.every_ticks,
                    t.probe_count,
                    t.timeout.as_millis()
                );
            }
        }
        Commands::Probe {
            address,
            count,
            timeout_ms,
            port,
        } => {
            let mut target = Target::icmp(&address);
            target.probe_count = count.max(1);
            target.timeout = Duration::from_millis(timeout_ms.max(1));
            if let Some(port) = port {
                target.kind = ProbeKind::Tcp;
                target.port = Some(port);
                target.id = format!("{}:{}", address, port);
            }
            tracing::info!(target = %target.id, kind = %target.kind, count, "Probing");

            let results = Prober::system().run(&target).await;
            let features = FeatureVector::from_results(&target.id, &results, chrono::Utc::now());
            let out = serde_json::json!({
                "results": results,
                "features": features,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Export { target, output } => {
            let pool = pingwarden::storage::open_pool(&config.storage.db_path)?;
            let mut sink: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(
                    std::fs::File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?,
                )),
                None => Box::new(BufWriter::new(std::io::stdout().lock())),
            };
            let n = pingwarden::storage::export_jsonl(&pool, target.as_deref(), &mut *sink)?;
            tracing::info!(records = n, ?output, "Export finished");
        }
        Commands::Models => {
            let store = ModelStore::new(&config.models.dir);
            println!("{:<24} | {:<10} | {:<16} | {:>7} | Trained", "Target", "Status", "Kind", "Version");
            println!("{:-<24}-|-{:-<10}-|-{:-<16}-|-{:-<7}-|-{:-<25}", "", "", "", "", "");
            for t in config.targets() {
                match store.lookup(&t.id) {
                    ModelLookup::Model(m) => println!(
                        "{:<24} | {:<10} | {:<16} | {:>7} | {}",
                        t.id,
                        "loaded",
                        m.kind_name(),
                        m.version,
                        m.trained_at.to_rfc3339()
                    ),
                    ModelLookup::Missing => println!(
                        "{:<24} | {:<10} | {:<16} | {:>7} | (static thresholds; expected {})",
                        t.id,
                        "missing",
                        "-",
                        "-",
                        store.artifact_path(&t.id).display()
                    ),
                    ModelLookup::Rejected(reason) => println!(
                        "{:<24} | {:<10} | {:<16} | {:>7} | {}",
                        t.id, "rejected", "-", "-", reason
                    ),
                }
            }
        }
    }

    Ok(())
}
