//! Breath Session Agent CLI
//!
//! Runs CO2/humidity breathing sessions against a serial sensor.

use anyhow::{bail, Context};
use breath_session_agent::{
    audit::create_shared_log_with_persistence,
    config::Config,
    core::SessionRecord,
    source::{MockFactory, MockProfile, SampleSource, SerialFactory, SourceError, SourceFactory},
    store::{JsonFileStore, MemoryStore, SessionStore},
    CancelFlag, IngestionLog, PortRegistry, ReplaySource, SessionRunner, VERSION,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "breath-session")]
#[command(version = VERSION)]
#[command(about = "CO2/humidity breathing-session ingestion agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where samples come from.
#[derive(clap::Args, Clone)]
struct SourceArgs {
    /// Serial port of the sensor
    #[arg(long, env = "CO2_SERIAL_PORT")]
    port: Option<String>,

    /// Baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Use the synthetic sensor instead of hardware
    #[arg(long)]
    mock: bool,

    /// Do not pace the synthetic sensor at the nominal sample rate
    #[arg(long, requires = "mock")]
    fast: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session for a user and store the result
    Run {
        /// User the session belongs to
        #[arg(long)]
        user_id: String,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Print raw sensor readings until Ctrl+C
    Stream {
        #[command(flatten)]
        source: SourceArgs,

        /// Stop after this many readings
        #[arg(long)]
        count: Option<u64>,
    },

    /// Run detection over a recorded capture file
    Replay {
        /// User the session belongs to
        #[arg(long)]
        user_id: String,

        /// Capture with one "<co2>,<humidity>" line per reading
        #[arg(long)]
        file: PathBuf,

        /// Store the result in the data directory
        #[arg(long)]
        persist: bool,
    },

    /// Show the latest stored session for a user
    Latest {
        #[arg(long)]
        user_id: String,
    },

    /// Set a manually entered measurement field
    SetField {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        field: String,

        /// JSON value; anything that is not valid JSON is stored as a string
        #[arg(long)]
        value: String,
    },

    /// Show ingestion statistics
    Status,

    /// Show configuration
    Config,

    /// Serve login triggers and session polling over HTTP
    #[cfg(feature = "server")]
    Serve {
        /// HTTP port
        #[arg(long, default_value = "8787")]
        http_port: u16,

        #[command(flatten)]
        source: SourceArgs,
    },
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { user_id, source } => cmd_run(&user_id, &source),
        Commands::Stream { source, count } => cmd_stream(&source, count),
        Commands::Replay {
            user_id,
            file,
            persist,
        } => cmd_replay(&user_id, &file, persist),
        Commands::Latest { user_id } => cmd_latest(&user_id),
        Commands::SetField {
            user_id,
            field,
            value,
        } => cmd_set_field(&user_id, &field, &value),
        Commands::Status => cmd_status(),
        Commands::Config => cmd_config(),
        #[cfg(feature = "server")]
        Commands::Serve { http_port, source } => cmd_serve(http_port, &source),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration and apply command-line overrides.
fn load_config(source: Option<&SourceArgs>) -> anyhow::Result<Config> {
    let mut config = Config::load().context("loading configuration")?;
    if let Some(args) = source {
        if let Some(port) = &args.port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = args.baud {
            config.serial.baud_rate = baud;
        }
    }
    config.validate()?;
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SessionStore>> {
    let store = JsonFileStore::open(&config.data_path)
        .with_context(|| format!("opening data directory {:?}", config.data_path))?;
    Ok(Arc::new(store))
}

fn source_factory(
    config: &Config,
    args: &SourceArgs,
    ports: PortRegistry,
) -> Arc<dyn SourceFactory> {
    if args.mock {
        let interval = if args.fast || config.sample_rate_hz <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / config.sample_rate_hz)
        };
        let port = format!("mock:{}", config.serial.port);
        Arc::new(MockFactory::new(port, MockProfile::default(), ports).with_interval(interval))
    } else {
        Arc::new(SerialFactory::new(config.serial.clone(), ports))
    }
}

fn cancel_on_ctrlc() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    ctrlc::set_handler(move || flag.cancel()).expect("Error setting Ctrl+C handler");
    cancel
}

fn new_runner(config: Config, store: Arc<dyn SessionStore>) -> SessionRunner {
    let log = create_shared_log_with_persistence(config.data_path.join("ingestion.json"));
    SessionRunner::new(config, store).with_log(log)
}

fn cmd_run(user_id: &str, args: &SourceArgs) -> anyhow::Result<()> {
    let config = load_config(Some(args))?;
    let store = open_store(&config)?;

    println!("Breath Session Agent v{VERSION}");
    println!();
    if args.mock {
        println!("Source: synthetic sensor");
    } else {
        println!(
            "Source: {} @ {} baud",
            config.serial.port, config.serial.baud_rate
        );
    }
    println!("User: {user_id}");
    println!("Press Ctrl+C to stop");
    println!();

    let factory = source_factory(&config, args, PortRegistry::global().clone());
    let runner = new_runner(config, store);
    let cancel = cancel_on_ctrlc();

    let record = runner.run_from(user_id, factory.as_ref(), &cancel);
    print_record(&record);
    Ok(())
}

fn cmd_stream(args: &SourceArgs, count: Option<u64>) -> anyhow::Result<()> {
    let config = load_config(Some(args))?;
    let factory = source_factory(&config, args, PortRegistry::global().clone());
    let mut source = factory.open()?;
    let cancel = cancel_on_ctrlc();

    println!("Streaming from {} (Ctrl+C to stop)", source.describe());

    let mut received = 0u64;
    while !cancel.is_cancelled() && count.map(|n| received < n).unwrap_or(true) {
        match source.next_sample() {
            Ok(sample) => {
                received += 1;
                let flag = if config.detector.in_range(sample.co2_ppm, sample.humidity_pct) {
                    ""
                } else {
                    "  (out of range)"
                };
                println!(
                    "[{}] #{:<5} CO2 {:>8.1} ppm   RH {:>5.1} %{}",
                    sample.timestamp.format("%H:%M:%S"),
                    sample.seq,
                    sample.co2_ppm,
                    sample.humidity_pct,
                    flag
                );
            }
            Err(SourceError::MalformedLine { seq, line, reason }) => {
                eprintln!("#{seq}: skipped {line:?} ({reason})");
            }
            Err(SourceError::ReadTimeout(waited)) => {
                eprintln!("No reading within {:.1}s", waited.as_secs_f64());
            }
            Err(e) => {
                source.close();
                bail!("stream stopped: {e}");
            }
        }
    }

    source.close();
    println!("{received} readings");
    Ok(())
}

fn cmd_replay(user_id: &str, file: &Path, persist: bool) -> anyhow::Result<()> {
    let config = load_config(None)?;
    let mut source = ReplaySource::from_path(file)?;

    let store: Arc<dyn SessionStore> = if persist {
        open_store(&config)?
    } else {
        Arc::new(MemoryStore::new())
    };
    let runner = if persist {
        new_runner(config, store)
    } else {
        SessionRunner::new(config, store)
    };

    let record = runner.run_with_source(user_id, &mut source, &CancelFlag::new());
    print_record(&record);
    Ok(())
}

fn cmd_latest(user_id: &str) -> anyhow::Result<()> {
    let config = load_config(None)?;
    let store = open_store(&config)?;

    match store.get_latest_session(user_id)? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("no session stored for user {user_id}"),
    }
}

fn cmd_set_field(user_id: &str, field: &str, raw: &str) -> anyhow::Result<()> {
    let config = load_config(None)?;
    let store = open_store(&config)?;

    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw));
    store.set_manual_field(user_id, field, value)?;

    if let Some(doc) = store.get_measurements(user_id)? {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    }
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Breath Session Agent Status");
    println!("===========================");
    println!();
    println!("Configuration:");
    println!(
        "  Serial port: {} @ {} baud",
        config.serial.port, config.serial.baud_rate
    );
    println!(
        "  Stability threshold: {} ppm",
        config.detector.stability_threshold_ppm
    );
    println!(
        "  Minimum plateau step: {} ppm",
        config.detector.min_plateau_delta_ppm
    );
    println!(
        "  Session ceiling: {}s",
        config.max_session_duration.as_secs()
    );
    println!("  Data directory: {:?}", config.data_path);
    println!();

    let stats_path = config.data_path.join("ingestion.json");
    if stats_path.exists() {
        println!("{}", IngestionLog::with_persistence(stats_path).summary());
    } else {
        println!("No previous session data found.");
    }
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(feature = "server")]
fn cmd_serve(http_port: u16, args: &SourceArgs) -> anyhow::Result<()> {
    use breath_session_agent::server::{run, ServerConfig};
    use breath_session_agent::SessionSupervisor;

    let config = load_config(Some(args))?;
    let store = open_store(&config)?;
    let factory = source_factory(&config, args, PortRegistry::global().clone());
    let runner = Arc::new(new_runner(config, store.clone()));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let supervisor =
            SessionSupervisor::new(runner, factory, tokio::runtime::Handle::current());
        let (addr, shutdown_tx) =
            run(ServerConfig::new(http_port), supervisor.clone(), store).await?;

        println!("Breath Session Agent v{VERSION}");
        println!("Listening on http://{addr} (Ctrl+C to stop)");

        tokio::signal::ctrl_c().await?;
        let _ = shutdown_tx.send(());
        supervisor.shutdown();
        Ok::<(), anyhow::Error>(())
    })?;

    // Dropping the runtime waits for cancelled sessions to write their final record
    drop(runtime);
    Ok(())
}

fn print_record(record: &SessionRecord) {
    println!();
    println!("Session {}", record.session_id);
    println!("  Status: {}", record.status);
    if let Some(reason) = &record.failure_reason {
        println!("  Reason: {reason}");
    }
    println!("  Samples: {}", record.sample_count());
    if !record.rejected_lines.is_empty() {
        println!("  Rejected lines: {}", record.rejected_lines.len());
    }
    for (i, plateau) in record.plateaus.iter().enumerate() {
        let label = if i == 0 {
            "Baseline".to_string()
        } else {
            format!("Plateau {i}")
        };
        println!(
            "  {label}: {:.1} ppm, {:.1} %RH (sample {})",
            plateau.co2_value, plateau.humidity_value, plateau.sample_index
        );
    }
    if let Some(secs) = record.duration_secs() {
        println!("  Duration: {secs:.1}s");
    }
}
