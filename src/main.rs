use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use agentforge::domain::OrchestrationStatus;
use agentforge::{CliConfig, HttpLlmInvoker, Orchestrator};

/// agentforge: an autonomous multi-agent orchestration engine
#[derive(Parser, Debug)]
#[command(name = "agentforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a goal to completion and print the final report
    Run {
        /// The goal to accomplish
        goal: String,

        /// Additional context for the Planner
        #[arg(short, long, default_value = "")]
        context: String,

        /// Path to a YAML configuration file
        #[arg(short = 'f', long)]
        config: Option<PathBuf>,

        /// Working directory the Tester runs automated suites from
        #[arg(short, long)]
        working_dir: Option<PathBuf>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print effective configuration after file and environment overrides
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration as YAML
    Show {
        /// Path to a YAML configuration file
        #[arg(short = 'f', long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            goal,
            context,
            config,
            working_dir,
            verbose,
        } => handle_run_command(goal, context, config, working_dir, verbose).await,
        Command::Config {
            command: ConfigCommand::Show { config },
        } => handle_config_show(config),
    }
}

/// `~/.config/agentforge/config.yaml` (or platform equivalent), used when
/// `--config` isn't given and no such file is required to exist.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("agentforge").join("config.yaml"))
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(default_config_path)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

async fn handle_run_command(
    goal: String,
    context: String,
    config_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    init_logging(verbose);

    let config_path = resolve_config_path(config_path);
    let mut config = CliConfig::load_with_env(config_path.as_ref()).context("failed to load configuration")?;
    if let Some(working_dir) = working_dir {
        config.working_dir = working_dir;
    }

    let api_key = config
        .api_key
        .clone()
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .context("no API key configured (set AGENTFORGE_API_KEY, ANTHROPIC_API_KEY, or api_key in the config file)")?;
    let invoker = Arc::new(HttpLlmInvoker::new(api_key, config.model.clone()));

    info!(%goal, "starting run");
    let orchestrator = Orchestrator::new(config, invoker);
    orchestrator.initialize(goal, context).await;
    let report = orchestrator.run().await.context("orchestration run failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status != OrchestrationStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_config_show(config_path: Option<PathBuf>) -> Result<()> {
    let config_path = resolve_config_path(config_path);
    let config = CliConfig::load_with_env(config_path.as_ref()).context("failed to load configuration")?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
