#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use native_bridge::config::{default_config_dir, BridgeConfig};
use native_bridge::native::{LoopbackNative, NativeBackend};
use native_bridge::observability::{load_events, resolve_trace_path};
use native_bridge::{parse, CorrelationEngine, EngineStats, PendingReply};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const PUMP_DRAIN_POLL: Duration = Duration::from_millis(5);

/// Correlate calls and replies exchanged with a native library over one
/// unordered inbound channel.
#[derive(Parser, Debug)]
#[command(name = "native-bridge")]
#[command(version)]
#[command(about = "Call/response correlation for native library bridges.", long_about = None)]
struct Cli {
    /// Path to config.toml (default: ~/.native-bridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode one raw inbound message and print the parsed response
    Parse {
        /// Raw message, usually a JSON object
        raw: String,
    },

    /// Replay recorded inbound traffic against a loopback backend
    #[command(long_about = "\
Replay recorded inbound traffic against a loopback backend.

One call is issued per operation in --calls, in order. Every line of the input
is then delivered as one inbound message. Broadcast events and call results are
printed as JSON lines.

Examples:
  native-bridge replay --calls login,list --file traffic.jsonl
  printf 'ack-123\\n' | native-bridge replay --calls ack")]
    Replay {
        /// Recorded inbound messages, one per line (default: stdin)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Comma-separated operations to call before replaying
        #[arg(long, value_delimiter = ',')]
        calls: Vec<String>,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Inspect the dispatch trace
    Trace {
        #[command(subcommand)]
        trace_command: TraceCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `native-bridge`.

Examples:
  source <(native-bridge completions bash)
  native-bridge completions zsh > ~/.zfunc/_native-bridge")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show {
        /// Print the resolved config file path instead
        #[arg(long)]
        path: bool,
    },
    /// Dump the configuration JSON Schema to stdout
    Schema,
}

#[derive(Subcommand, Debug)]
enum TraceCommands {
    /// Show recent trace events, newest first
    List {
        /// Maximum number of events to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only show events of this type (e.g. `call_timeout`)
        #[arg(long)]
        event: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Completions stay stdout-only: no config, no logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Logs go to stderr so JSON output on stdout stays machine-readable.
    let subscriber = fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config_path = match cli.config {
        Some(path) if path.as_os_str().is_empty() => bail!("--config cannot be empty"),
        Some(path) => path,
        None => default_config_dir()?.join("config.toml"),
    };

    match cli.command {
        Commands::Parse { raw } => {
            let response = parse(raw.as_str());
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        Commands::Replay { file, calls } => {
            let config = BridgeConfig::load(&config_path).await?;
            match file {
                Some(path) => {
                    let input = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?;
                    replay(config, &calls, input).await.map(drop)
                }
                None => replay(config, &calls, tokio::io::stdin()).await.map(drop),
            }
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show { path: true } => {
                println!("{}", config_path.display());
                Ok(())
            }
            ConfigCommands::Show { path: false } => {
                let config = BridgeConfig::load(&config_path).await?;
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(BridgeConfig);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
        },

        Commands::Completions { .. } => Ok(()),

        Commands::Trace { trace_command } => match trace_command {
            TraceCommands::List { limit, event } => {
                let config = BridgeConfig::load(&config_path).await?;
                let path = resolve_trace_path(&config.trace, &config.config_dir);
                for event in load_events(&path, limit, event.as_deref())? {
                    println!("{}", serde_json::to_string(&event)?);
                }
                Ok(())
            }
        },
    }
}

fn write_shell_completion<W: Write>(shell: Shell, writer: &mut W) -> Result<()> {
    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, bin_name, writer);
    writer.flush()?;
    Ok(())
}

async fn replay<R>(config: BridgeConfig, calls: &[String], input: R) -> Result<EngineStats>
where
    R: AsyncRead + Unpin,
{
    let backend = Arc::new(LoopbackNative::new());
    let engine = CorrelationEngine::new(config, backend.clone());
    engine.init()?;

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match serde_json::to_string(&json!({ "event": event })) {
                Ok(line) => println!("{line}"),
                Err(error) => tracing::warn!(%error, "failed to encode broadcast event"),
            }
        }
    });

    let mut pending: Vec<PendingReply> = Vec::with_capacity(calls.len());
    for operation in calls.iter().map(|op| op.trim()).filter(|op| !op.is_empty()) {
        let sender = backend.clone();
        let timeout = engine.config().response_timeout();
        pending.push(engine.issue(operation, timeout, || {
            sender.send(operation, &Value::Null)
        })?);
    }

    let mut lines = BufReader::new(input).lines();
    let mut delivered = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        backend.emit(line)?;
        delivered += 1;
    }
    info!(delivered, calls = pending.len(), "replay input consumed");

    for reply in pending {
        let operation = reply.operation().to_string();
        let line = match reply.wait().await {
            Ok(response) => json!({ "call": operation, "response": response }),
            Err(error) => json!({ "call": operation, "error": error.to_string() }),
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    // Let the pump drain whatever is still queued before the stream closes.
    let delivered = u64::try_from(delivered).unwrap_or(u64::MAX);
    let mut drain = tokio::time::interval(PUMP_DRAIN_POLL);
    drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while engine.stats().inbound_total < delivered {
        drain.tick().await;
    }
    let stats = engine.stats();
    engine.dispose();
    printer.await?;
    info!(
        matched = stats.matched_total,
        heuristic = stats.heuristic_matches_total,
        broadcast = stats.broadcasts_total,
        "replay finished"
    );
    Ok(stats)
}
