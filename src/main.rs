//! # Azure DevOps harness CLI (`azdo`)
//!
//! ```bash
//! azdo --config ./config/azdo.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `azdo init` | Create the SQLite state database |
//! | `azdo sources` | List entity types and whether the scope enables them |
//! | `azdo check [--remote]` | Validate configuration, optionally against the API |
//! | `azdo sync` | Run one full or slim sync and emit JSONL documents |
//! | `azdo checkpoint show\|reset` | Inspect or clear stored cursors |
//! | `azdo completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! azdo init
//! azdo sync --output ./data/documents.jsonl
//! azdo sync --slim --scope everything --progress json
//! azdo checkpoint reset --entity commit
//! ```

use std::io::Write;
use std::path::PathBuf;

use azdo_harness::models::DocumentMode;
use azdo_harness::progress::ProgressMode;
use azdo_harness::sync_cmd::{self, SyncOptions};
use azdo_harness::{config, logging, migrate, sources};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};

/// Azure DevOps harness: turns work items, commits, test runs, releases and
/// wiki pages into indexable documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/azdo.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "azdo", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/azdo.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state database.
    ///
    /// Creates the SQLite file with the checkpoints and sync_runs tables.
    /// Running it again is safe.
    Init,

    /// List entity types and whether the configured scope enables them.
    Sources,

    /// Validate the configuration.
    Check {
        /// Also issue one authenticated work-item query.
        #[arg(long)]
        remote: bool,
    },

    /// Run one sync and emit documents as JSON lines.
    ///
    /// Documents go to `--output`, `[output].path`, or stdout. Cursors are
    /// loaded from and saved to the state database. Ctrl-C stops after the
    /// page in flight.
    Sync {
        /// Emit slim documents (ids and access metadata only).
        #[arg(long)]
        slim: bool,

        /// Ignore stored cursors and sync every entity type from scratch.
        #[arg(long)]
        full: bool,

        /// Override `connector.content_scope` for this run.
        #[arg(long)]
        scope: Option<String>,

        /// JSONL output file.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Inspect or clear stored cursors.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Show the cursor for each entity type and recent runs.
    Show,
    /// Delete stored cursors so the next sync starts from scratch.
    Reset {
        /// Only reset this entity type (work_item, commit, test_result, release, wiki_page).
        #[arg(long)]
        entity: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let mut out = Vec::new();
        clap_complete::generate(*shell, &mut cmd, "azdo", &mut out);
        std::io::stdout().write_all(&out)?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Check { remote } => {
            sync_cmd::run_check(&cfg, remote).await?;
        }
        Commands::Sync {
            slim,
            full,
            scope,
            output,
            progress,
        } => {
            let options = SyncOptions {
                mode: if slim { DocumentMode::Slim } else { DocumentMode::Full },
                full,
                scope,
                output,
                progress: progress
                    .map(ProgressMode::from)
                    .unwrap_or_else(ProgressMode::default_for_tty),
            };
            sync_cmd::run_sync(&cfg, options).await?;
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show => sync_cmd::show_checkpoints(&cfg).await?,
            CheckpointAction::Reset { entity } => {
                sync_cmd::reset_checkpoints(&cfg, entity.as_deref()).await?
            }
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}
