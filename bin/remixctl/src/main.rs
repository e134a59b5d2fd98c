mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "remixctl")]
#[command(about = "Rate-limited, login-aware project remix automation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (default ~/.remixctl)
    #[arg(long, global = true, env = "REMIXCTL_HOME")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the session, reusing a fresh one when present
    Auth {
        /// Discard the stored session and log in again
        #[arg(long)]
        force: bool,

        /// Print the full bearer token instead of a masked preview
        #[arg(long)]
        show: bool,
    },

    /// Remix a project
    Remix {
        /// Project to remix (defaults to project.defaultProjectId / projectUrl)
        project_id: Option<String>,

        /// Do not include the project's edit history
        #[arg(long)]
        no_history: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Retries for transient failures (overrides safety.maxRetries)
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Show rate limits, quotas and circuit breaker state
    Status {
        /// Include the remix ledger and recent attempts
        #[arg(long)]
        verbose: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear all safety counters and the remix ledger
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let ctx = commands::Context::load(cli.data_dir)?;

    match cli.command {
        Commands::Auth { force, show } => {
            commands::auth::run(&ctx, force, show).await?;
        }
        Commands::Remix {
            project_id,
            no_history,
            yes,
            json,
            retries,
        } => {
            let opts = commands::remix::RemixOptions {
                project_id,
                include_history: !no_history,
                skip_confirmation: yes,
                json,
                retries,
            };
            commands::remix::run(&ctx, opts).await?;
        }
        Commands::Status { verbose, json } => {
            commands::status::run(&ctx, verbose || cli.verbose, json).await?;
        }
        Commands::Reset { confirm } => {
            commands::reset::run(&ctx, confirm).await?;
        }
    }

    Ok(())
}
