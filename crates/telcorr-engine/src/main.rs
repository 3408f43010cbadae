//! telcorr - streaming log and span correlation
//!
//! Groups logs and spans into time windows by correlation key and exports one
//! summary per key and window.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;
use telcorr_core::config::{ConfigLoader, EngineConfig};
use telcorr_core::{LogBatch, RawBatch, RawLogRecord, RawSpan, ResourceContext, SpanBatch};
use telcorr_engine::{CorrelationEngine, EngineHandle};
use telcorr_export::{dlq, ExporterManager};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "telcorr")]
#[command(version)]
#[command(about = "Streaming log and span correlation engine", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TELCORR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Correlate batches read from a JSONL file ("-" for stdin)
    Run {
        /// Input file, one log or span batch per line
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Keep running after the input ends, until Ctrl+C
        #[arg(long)]
        follow: bool,

        /// Print engine metrics when done (prometheus, json)
        #[arg(long)]
        metrics: Option<String>,
    },

    /// Run with generated traffic and print the summaries
    Demo {
        /// Traces generated per window
        #[arg(long, default_value = "3")]
        traces: usize,

        /// Number of windows to generate
        #[arg(long, default_value = "2")]
        windows: u32,

        /// Window length in seconds
        #[arg(long, default_value = "1")]
        window_secs: u64,
    },

    /// Inspect or replay the dead letter queue
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum DlqAction {
    /// Number of queued dead letters
    Count,

    /// Show the oldest dead letters without removing them
    Peek {
        #[arg(short, long, default_value = "20")]
        num: usize,
    },

    /// Remove the oldest dead letters and print them
    Drain {
        #[arg(short, long, default_value = "20")]
        num: usize,
    },

    /// Re-export dead letters through the configured sinks
    Replay {
        #[arg(short, long, default_value = "100")]
        num: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.engine.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    match cli.command {
        Commands::Run {
            input,
            follow,
            metrics,
        } => run_command(config, input, follow, metrics).await,
        Commands::Demo {
            traces,
            windows,
            window_secs,
        } => demo_command(config, traces, windows, window_secs).await,
        Commands::Dlq { action } => dlq_command(config, action).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> EngineConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            EngineConfig::default()
        }
    }
}

async fn run_command(
    config: EngineConfig,
    input: PathBuf,
    follow: bool,
    metrics_format: Option<String>,
) -> anyhow::Result<()> {
    let (engine, handle) = CorrelationEngine::from_config(config)?;
    let running = tokio::spawn(engine.run());

    let reader: Box<dyn BufRead + Send> = if input.as_os_str() == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(&input)
            .with_context(|| format!("opening {}", input.display()))?;
        Box::new(BufReader::new(file))
    };

    let (accepted, rejected) = replay_lines(&handle, reader).await?;
    info!(accepted, rejected, "Input consumed");

    if follow {
        println!("Press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
    }

    handle.shutdown();
    let report = running.await?;
    eprintln!(
        "{} windows closed, {} summaries, {} exports aborted at shutdown",
        report.windows_closed, report.summaries, report.shutdown.aborted
    );

    match metrics_format.as_deref() {
        Some("json") => println!("{}", serde_json::to_string_pretty(&handle.metrics().to_json())?),
        Some(_) => print!("{}", handle.metrics().to_prometheus()),
        None => {}
    }
    Ok(())
}

/// Enqueue every batch line; malformed lines are skipped with a warning
async fn replay_lines(
    handle: &EngineHandle,
    reader: Box<dyn BufRead + Send>,
) -> anyhow::Result<(usize, usize)> {
    let mut accepted = 0;
    let mut rejected = 0;

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let batch: RawBatch = match serde_json::from_str(&line) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Skipping line {}: {}", n + 1, e);
                rejected += 1;
                continue;
            }
        };
        match handle.ingest().enqueue(batch).await {
            Ok(()) => accepted += 1,
            Err(e) => {
                warn!("Line {}: {}", n + 1, e);
                rejected += 1;
            }
        }
    }
    Ok((accepted, rejected))
}

async fn demo_command(
    mut config: EngineConfig,
    traces: usize,
    windows: u32,
    window_secs: u64,
) -> anyhow::Result<()> {
    config.window.duration_secs = window_secs.max(1);
    config.export.jsonl.enabled = false;
    config.export.webhook.enabled = false;
    config.export.audit.enabled = true;

    let (engine, handle) = CorrelationEngine::from_config(config)?;
    let running = tokio::spawn(engine.run());

    for window in 0..windows {
        for i in 0..traces {
            for batch in demo_batches(window, i) {
                if let Err(e) = handle.ingest().enqueue(batch).await {
                    warn!("Demo batch rejected: {}", e);
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(window_secs.max(1))).await;
    }

    handle.shutdown();
    running.await?;

    for summary in handle.index().all().iter() {
        println!("{}", serde_json::to_string(&*summary)?);
    }
    Ok(())
}

/// A checkout trace whose payment call shows up as a separate trace that
/// shares the order's resource id
fn demo_batches(window: u32, i: usize) -> Vec<RawBatch> {
    let order = format!("order-{}-{}", window, i);
    let checkout_trace = format!("{:032x}", (window as u128) << 64 | (i as u128) << 1);
    let payment_trace = format!("{:032x}", (window as u128) << 64 | (i as u128) << 1 | 1);

    let mut attributes = HashMap::new();
    attributes.insert("resource_id".to_string(), serde_json::json!(order));

    let checkout_logs = (0..3)
        .map(|n| RawLogRecord {
            severity_text: Some(if n == 2 { "WARN" } else { "INFO" }.to_string()),
            body: Some(format!("checkout step {}", n)),
            trace_id: Some(checkout_trace.clone()),
            attributes: attributes.clone(),
            ..Default::default()
        })
        .collect();
    let checkout_span = RawSpan {
        trace_id: Some(checkout_trace.clone()),
        span_id: Some(format!("{}-root", order)),
        name: "POST /checkout".to_string(),
        peer_service: Some("payment".to_string()),
        attributes: attributes.clone(),
        ..Default::default()
    };
    let payment_span = RawSpan {
        trace_id: Some(payment_trace),
        span_id: Some(format!("{}-pay", order)),
        parent_span_id: Some(format!("{}-root", order)),
        name: "charge".to_string(),
        attributes,
        ..Default::default()
    };

    vec![
        RawBatch::Logs(LogBatch::new(
            ResourceContext::local("checkout", "demo"),
            checkout_logs,
        )),
        RawBatch::Spans(SpanBatch::new(
            ResourceContext::local("checkout", "demo"),
            vec![checkout_span],
        )),
        RawBatch::Spans(SpanBatch::new(
            ResourceContext::local("payment", "demo"),
            vec![payment_span],
        )),
    ]
}

async fn dlq_command(config: EngineConfig, action: DlqAction) -> anyhow::Result<()> {
    let queue = dlq::from_settings(&config.dlq)?;
    if config.dlq.backend != "sqlite" {
        warn!("The memory dead letter queue is empty outside a running engine");
    }

    match action {
        DlqAction::Count => println!("{}", queue.depth().await?),
        DlqAction::Peek { num } => {
            for letter in queue.peek(num).await? {
                println!("{}", serde_json::to_string(&letter)?);
            }
        }
        DlqAction::Drain { num } => {
            for letter in queue.drain(num).await? {
                println!("{}", serde_json::to_string(&letter)?);
            }
        }
        DlqAction::Replay { num } => {
            let metrics = telcorr_core::metrics::create_metrics();
            let manager = ExporterManager::from_config(&config, queue, metrics)?;
            let report = manager.replay_dead_letters(num).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
