//! # Deep Research Agent CLI
//!
//! Plans a topic into research goals, searches each one and writes a
//! technical report. Runs offline with mock providers when no API keys are
//! configured.
//!
//! ## Quick Start
//! ```bash
//! cargo run -- research "Rust async runtimes"
//! cargo run -- serve --port 8000
//! ```

// =============================================================================
// IMPORTS
// =============================================================================
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use deep_research_agent::llm::COMPLETION_UNAVAILABLE;
use deep_research_agent::storage::DEFAULT_LIST_LIMIT;
use deep_research_agent::{server, Capabilities, Config, ResearchAgent, RunLog};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
/// # Rust Concept: Subcommands with Clap
///
/// `#[derive(Subcommand)]` on an enum turns each variant into a subcommand
/// with its own arguments. `global = true` makes a flag usable after any of
/// them.
#[derive(Parser, Debug)]
#[command(
    name = "deep-research-agent",
    version,
    about = "Plan, search and write a technical report on any topic",
    long_about = r#"
Deep Research Agent - plan, search, write.

For a topic it will:
  1. Break the topic into research goals
  2. Search the web for each goal
  3. Write a technical report from the collected findings

PROVIDERS:
  OPENAI_API_KEY   live text completion (mock responses without it)
  TAVILY_API_KEY   live web search (mock results without it)

EXAMPLES:
  # Research a topic and print the report
  deep-research-agent research "Rust async runtimes"

  # Keep the report in the run-log
  deep-research-agent research --save "Vector databases"

  # Serve HTTP and WebSocket endpoints
  deep-research-agent serve --port 8000
"#
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Completion model (overrides OPENAI_MODEL)
    #[arg(short = 'm', long = "model", global = true, env = "OPENAI_MODEL")]
    model: Option<String>,

    /// Run-log file (overrides RUNS_PATH)
    #[arg(long = "runs-path", global = true, value_name = "FILE")]
    runs_path: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline to completion and print the report
    Research {
        /// The topic to research
        #[arg(value_name = "TOPIC")]
        topic: String,

        /// Append the result to the run-log
        #[arg(short = 's', long = "save")]
        save: bool,

        /// Print the final state as JSON instead of the report
        #[arg(long = "json")]
        json: bool,
    },

    /// Start the HTTP / WebSocket server
    Serve {
        #[arg(long = "host")]
        host: Option<String>,

        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
    },

    /// Show recent runs from the run-log
    Runs {
        #[arg(short = 'n', long = "limit", default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
}

// =============================================================================
// MAIN FUNCTION
// =============================================================================
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    init_logging(args.verbose, &config.log_level)?;

    if let Some(model) = args.model {
        info!(model = %model, "Using model from command line");
        config.model = model;
    }
    if let Some(path) = args.runs_path {
        config.runs_path = path;
    }

    config.validate().context("Invalid configuration")?;
    info!(model = %config.model, runs_path = %config.runs_path.display(), "Configuration loaded");

    match args.command {
        Command::Research { topic, save, json } => research(&config, &topic, save, json).await,
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            warn_missing_keys(&config);
            server::serve(&config).await.context("Server failed")
        }
        Command::Runs { limit } => list_runs(&config, limit).await,
    }
}

// =============================================================================
// COMMANDS
// =============================================================================
async fn research(config: &Config, topic: &str, save: bool, as_json: bool) -> Result<()> {
    let topic = topic.trim();
    if topic.is_empty() {
        anyhow::bail!("Topic must not be empty");
    }

    warn_missing_keys(config);

    let caps = Capabilities::from_config(config);
    let backend = caps.completion.name().to_string();
    let agent = ResearchAgent::new(caps);

    let state = agent.run(topic).await;
    let report = state.report().unwrap_or_default();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("\n{}", "=".repeat(60));
        println!("RESEARCH REPORT: {}", topic);
        println!("{}\n", "=".repeat(60));
        println!("{}", report);
        println!("\n{}", "=".repeat(60));
    }

    if report.starts_with(COMPLETION_UNAVAILABLE) {
        eprintln!("\nTip: the completion provider did not answer.");
        eprintln!("   Check OPENAI_API_KEY and OPENAI_MODEL, or raise PROVIDER_TIMEOUT_SECS.");
    }

    if save {
        let log = RunLog::new(config.runs_path.clone());
        let metadata = json!({ "backend": backend, "steps": state.steps_taken });
        let record = log
            .save(topic, report, metadata)
            .await
            .context("Failed to save run")?;
        info!(id = record.id, path = %log.path().display(), "Run saved");
    }

    info!("Research completed");
    Ok(())
}

async fn list_runs(config: &Config, limit: usize) -> Result<()> {
    let runs = RunLog::new(config.runs_path.clone()).list(limit).await;

    if runs.is_empty() {
        println!("No runs recorded in {}", config.runs_path.display());
        return Ok(());
    }

    for run in runs {
        let preview: String = run.report.lines().next().unwrap_or("").chars().take(80).collect();
        println!("#{:<4} {}  {}", run.id, run.ts, run.topic);
        println!("      {}", preview);
    }
    Ok(())
}

fn warn_missing_keys(config: &Config) {
    for key in config.missing_keys() {
        warn!(key, "Provider key not set, using mock provider");
    }
}

// =============================================================================
// LOGGING INITIALIZATION
// =============================================================================
/// Initialize the tracing subscriber for structured logging.
///
/// `--verbose` forces debug; otherwise `RUST_LOG` (or `info`) decides.
/// Logs go to stderr so `--json` output stays machine readable.
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}
