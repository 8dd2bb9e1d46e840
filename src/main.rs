//! # DataSync QA adapter CLI (`datasync-qa`)
//!
//! Runs the HTTP adapter and exposes the same operations for local use.
//!
//! ## Usage
//!
//! ```bash
//! datasync-qa --config ./config/datasync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `datasync-qa serve` | Start the HTTP server |
//! | `datasync-qa token` | Print an access token for the admin user |
//! | `datasync-qa hash-password <pw>` | Print an Argon2 hash for `admin_password_hash` |
//! | `datasync-qa engine status` | Load the engine and print its status |
//! | `datasync-qa engine sync` | Validate and dispatch a table sync |
//! | `datasync-qa engine init` | Scaffold a new engine module |
//! | `datasync-qa qa run` | Run the test suite |
//! | `datasync-qa coverage` | Print the coverage summary |
//!
//! A missing config file is not an error: defaults plus environment
//! overrides are used.

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datasync_qa::auth::{hash_password, TokenService};
use datasync_qa::config::{self, Config};
use datasync_qa::coverage;
use datasync_qa::engine::{
    run_blocking, scaffold_engine, FallbackEngine, ScriptEngineLoader, SyncEngine,
};
use datasync_qa::qa::{self, TestMode};
use datasync_qa::server;
use datasync_qa::sync::{dispatch_sync, SyncRequest};

/// DataSync QA adapter: authenticated HTTP front end for a table-sync engine
/// and the project's test runner.
#[derive(Parser)]
#[command(name = "datasync-qa", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/datasync.toml`. A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/datasync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print a bearer token for the configured admin user.
    Token {
        /// Subject to put in the token. Defaults to `auth.admin_username`.
        #[arg(long)]
        username: Option<String>,
    },

    /// Print an Argon2 PHC hash of a password.
    HashPassword {
        password: String,
    },

    /// Inspect or scaffold the sync engine.
    Engine {
        #[command(subcommand)]
        action: EngineAction,
    },

    /// Run the project's tests.
    Qa {
        #[command(subcommand)]
        action: QaAction,
    },

    /// Print the coverage summary as JSON.
    Coverage,
}

#[derive(Subcommand)]
enum EngineAction {
    /// Load the engine and print its status report.
    Status,

    /// Sync tables through the engine. Dry run unless `--apply` is given.
    Sync {
        /// Table names (comma-separated). Omit to sync every table.
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Perform a real sync instead of a dry run.
        #[arg(long)]
        apply: bool,
    },

    /// Write a template engine module to `<home>/src/<module>.lua`.
    Init,
}

#[derive(Subcommand)]
enum QaAction {
    /// Run the test command and exit with its return code.
    Run {
        /// `auto`, `ai` or `pytest`.
        #[arg(long, default_value = "auto")]
        mode: TestMode,

        /// Print output as it is produced.
        #[arg(long)]
        stream: bool,
    },
}

fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // Config is loaded per command so `hash-password` works without one.
    let load_config = || config::load_or_default(&cli.config);

    match cli.command {
        Commands::Serve => {
            let cfg = load_config()?;
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "datasync-qa starting");
            server::run_server(&cfg).await?;
        }
        Commands::Token { username } => {
            let tokens = TokenService::new(&load_config()?.auth);
            let subject = username.unwrap_or_else(|| tokens.admin_username().to_string());
            println!("{}", tokens.issue_token(&subject)?);
        }
        Commands::HashPassword { password } => {
            println!("{}", hash_password(&password)?);
        }
        Commands::Engine { action } => run_engine_command(action, &load_config()?).await?,
        Commands::Qa {
            action: QaAction::Run { mode, stream },
        } => {
            let cfg = load_config()?;
            let code = if stream {
                run_tests_streamed(mode, &cfg).await?
            } else {
                run_tests_buffered(mode, &cfg).await?
            };
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Coverage => {
            let summary = coverage::summarize(&load_config()?.qa);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

async fn run_engine_command(action: EngineAction, cfg: &Config) -> anyhow::Result<()> {
    let loader = Arc::new(ScriptEngineLoader::new(&cfg.engine));
    match action {
        EngineAction::Status => {
            let status_loader = loader.clone();
            let loaded = tokio::task::spawn_blocking(move || status_loader.try_load()).await?;
            let engine: Arc<dyn SyncEngine> = match loaded {
                Ok(engine) => {
                    eprintln!("engine: {}", engine.origin());
                    Arc::new(engine)
                }
                Err(e) => {
                    eprintln!("engine unavailable ({}): {}", e.kind(), e);
                    Arc::new(FallbackEngine::from_error(&e))
                }
            };
            let status = run_blocking(engine, |e| e.sync_status()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        EngineAction::Sync { tables, apply } => {
            let request = SyncRequest {
                tables,
                dry_run: !apply,
            };
            let result = dispatch_sync(request, &cfg.engine.allowed_tables, loader).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        EngineAction::Init => {
            let path = scaffold_engine(&cfg.engine)?;
            println!("Created engine module: {}", path.display());
        }
    }
    Ok(())
}

async fn run_tests_buffered(mode: TestMode, cfg: &Config) -> anyhow::Result<i32> {
    let report = qa::run_buffered(mode, &cfg.qa).await?;
    print!("{}", report.output);
    std::io::stdout().flush()?;

    eprintln!("command: {}", report.command);
    if report.timed_out {
        eprintln!("timed out");
    }
    match report.coverage {
        Some(pct) => eprintln!("coverage: {:.2}%", pct),
        None => eprintln!("coverage: unavailable"),
    }
    Ok(report.returncode.unwrap_or(1))
}

async fn run_tests_streamed(mode: TestMode, cfg: &Config) -> anyhow::Result<i32> {
    let (stream, exit) = qa::run_streamed(mode, cfg.qa.clone())?;
    futures::pin_mut!(stream);
    let mut stdout = tokio::io::stdout();
    while let Some(Ok(chunk)) = stream.next().await {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }
    Ok(exit.await.ok().flatten().unwrap_or(1))
}
