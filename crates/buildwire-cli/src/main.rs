// ABOUTME: Entry point for the buildwire binary.
// ABOUTME: Parses arguments, loads config and dispatches to the command implementations.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use buildwire_cli::commands::{self, Overrides};
use buildwire_core::BuildwireConfig;
use buildwire_proto::{Actor, Status};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "buildwire")]
#[command(about = "Build-orchestration protocol client")]
#[command(version)]
struct Cli {
    /// Load configuration from this file instead of the default location
    #[arg(long, global = true, env = "BUILDWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Server URL (ws:// or wss://)
    #[arg(long, global = true, env = "BUILDWIRE_URL")]
    url: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, env = "BUILDWIRE_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session that answers build requests and questions
    Serve {
        /// Actor to speak as (System, User or Coder)
        #[arg(long)]
        actor: Option<Actor>,
    },

    /// Request a build and follow it until it finishes
    Build {
        /// What to build
        description: String,

        /// Extra requirement (repeatable)
        #[arg(long = "requirement", short = 'r')]
        requirements: Vec<String>,
    },

    /// Ask the server a question
    Ask {
        question: String,

        /// Seconds to wait for the answer
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// Decode a file holding one envelope or a JSON array of envelopes
    Validate { file: PathBuf },

    /// Configuration file helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config file
    Init,

    /// Print the effective configuration
    Show,

    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match &cli.log_file {
        Some(path) => buildwire_log::init_file(path),
        None => buildwire_log::init(),
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let overrides = Overrides {
        url: cli.url.clone(),
        actor: None,
    };

    match cli.command {
        Commands::Serve { actor } => {
            let config = effective_config(&cli.config, &Overrides { actor, ..overrides })?;
            commands::serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Build {
            description,
            requirements,
        } => {
            let config = effective_config(&cli.config, &overrides)?;
            let status = commands::build(config, &description, &requirements).await?;
            Ok(if status == Status::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Ask { question, timeout } => {
            let config = effective_config(&cli.config, &overrides)?;
            let answer =
                commands::ask(config, &question, Duration::from_secs(timeout.max(1))).await?;
            println!("{answer}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { file } => {
            let (lines, all_valid) = commands::validate_file(&file)?;
            for line in lines {
                println!("{line}");
            }
            Ok(if all_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Config(cmd) => {
            run_config(cmd, &cli.config, &overrides)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn effective_config(path: &Option<PathBuf>, overrides: &Overrides) -> Result<BuildwireConfig> {
    let mut config = commands::load_config(path.as_deref())?;
    overrides.apply(&mut config);
    Ok(config)
}

fn run_config(cmd: ConfigCommands, path: &Option<PathBuf>, overrides: &Overrides) -> Result<()> {
    match cmd {
        ConfigCommands::Init => {
            let written = match path {
                Some(path) => {
                    if !path.exists() {
                        std::fs::write(path, BuildwireConfig::default_toml())
                            .with_context(|| format!("failed to write {}", path.display()))?;
                    }
                    path.clone()
                }
                None => BuildwireConfig::init()?,
            };
            println!("Config written to {}", written.display());
        }
        ConfigCommands::Show => {
            let config = effective_config(path, overrides)?;
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            print!("{rendered}");
        }
        ConfigCommands::Path => {
            let shown = path.clone().unwrap_or_else(BuildwireConfig::config_path);
            println!("{}", shown.display());
        }
    }
    Ok(())
}
