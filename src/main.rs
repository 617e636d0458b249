//! ChromiumTo - shared Chromium kernel for Electron and CEF applications
//!
//! Command-line entry point.
//!
//! # Overview
//!
//! The binary initializes:
//! - Runtime settings ([`Settings`]: defaults, `settings.yaml`, `CHROMIUMTO_*`)
//! - Logging (daily rotating file, console with `--verbose`)
//! - A tokio runtime; scans run on a blocking thread while the async side
//!   renders progress events and listens for Ctrl-C
//! - The app document store ([`chromiumto::ConfigManager`]) in the data directory
//!
//! Every filesystem mutation goes through [`chromiumto::RedirectEngine`].

mod commands;

use anyhow::Result;
use camino::Utf8PathBuf;
use chromiumto::{APP_NAME, Metrics, Settings, VERSION};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Debug logging, mirrored to the console
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find Chromium-based applications
    Scan {
        /// Walk every local volume instead of the usual install directories
        #[arg(long)]
        full: bool,
    },
    /// List detected applications
    List {
        /// Only applications in the redirected index
        #[arg(long)]
        redirected: bool,
    },
    /// Show the redirection state of an application
    Status { path: Utf8PathBuf },
    /// Replace kernel files with links into the shared kernel
    Redirect {
        #[arg(required_unless_present = "all")]
        paths: Vec<Utf8PathBuf>,
        /// Every detected application that is not redirected yet
        #[arg(long, conflicts_with = "paths")]
        all: bool,
    },
    /// Put the original kernel files back
    Restore {
        #[arg(required_unless_present = "all")]
        paths: Vec<Utf8PathBuf>,
        /// Every application in the redirected index
        #[arg(long, conflicts_with = "paths")]
        all: bool,
    },
    /// Manage the shared kernel
    Kernel {
        #[command(subcommand)]
        command: KernelCommands,
    },
    /// Inspect or discard backups
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Manage full-scan exclusions
    Exclusions {
        #[command(subcommand)]
        command: ExclusionCommands,
    },
    /// Repair the redirected index from the backups on disk
    Reconcile,
}

#[derive(Subcommand)]
enum KernelCommands {
    Show,
    /// Seed the shared kernel with copies of an application's kernel files
    Init {
        app: Utf8PathBuf,
        #[arg(long, help = "Kernel directory (default: <data_dir>/SharedChrome)")]
        target: Option<Utf8PathBuf>,
    },
    /// Use an existing directory as the shared kernel
    Set { dir: Utf8PathBuf },
    /// Copy an unpacked Chromium runtime in as the shared kernel
    Import {
        source: Utf8PathBuf,
        #[arg(long, help = "Kernel directory (default: <data_dir>/SharedChrome)")]
        target: Option<Utf8PathBuf>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    List,
    /// Delete a leftover backup whose originals are all in place
    Discard { path: Utf8PathBuf },
}

#[derive(Subcommand)]
enum ExclusionCommands {
    List,
    Add { pattern: String },
    Remove { pattern: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let debug_mode = settings.debug_mode || cli.verbose;
    let _guard = if settings.console_log || cli.verbose {
        chromiumto::logging::setup_logging_with_console(
            &settings.log_dir,
            "chromiumto",
            debug_mode,
            true,
        )?
    } else {
        chromiumto::logging::setup_logging(&settings.log_dir, "chromiumto", debug_mode)?
    };

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("chromiumto-worker")
        .build()?;

    let metrics = Arc::new(Metrics::new());
    let result = runtime.block_on(run(cli.command, &settings, metrics.clone()));

    metrics.log_summary();
    runtime.shutdown_timeout(Duration::from_secs(5));

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    tracing::info!("Shutdown complete");
    result
}

async fn run(command: Commands, settings: &Settings, metrics: Arc<Metrics>) -> Result<()> {
    let registry = settings.config_manager()?;

    match command {
        Commands::Scan { full } => commands::cmd_scan(registry, full, metrics).await?,
        Commands::List { redirected } => commands::cmd_list(&registry, redirected)?,
        Commands::Status { path } => commands::cmd_status(&registry, &path)?,
        Commands::Redirect { paths, all } => {
            let engine = commands::engine(registry, metrics)?;
            commands::cmd_redirect(&engine, paths, all)?
        }
        Commands::Restore { paths, all } => {
            let engine = commands::engine(registry, metrics)?;
            commands::cmd_restore(&engine, paths, all)?
        }
        Commands::Kernel { command } => {
            let mut engine = commands::engine(registry, metrics)?;
            let default_target = settings.shared_kernel_dir();
            match command {
                KernelCommands::Show => commands::cmd_kernel_show(&engine),
                KernelCommands::Init { app, target } => commands::cmd_kernel_init(
                    &mut engine,
                    &app,
                    &target.unwrap_or(default_target),
                )?,
                KernelCommands::Set { dir } => commands::cmd_kernel_set(&mut engine, &dir)?,
                KernelCommands::Import { source, target } => commands::cmd_kernel_import(
                    &mut engine,
                    &source,
                    &target.unwrap_or(default_target),
                )?,
            }
        }
        Commands::Backups { command } => {
            let engine = commands::engine(registry, metrics)?;
            match command {
                BackupCommands::List => commands::cmd_backups_list(&engine)?,
                BackupCommands::Discard { path } => commands::cmd_backups_discard(&engine, &path)?,
            }
        }
        Commands::Exclusions { command } => match command {
            ExclusionCommands::List => commands::cmd_exclusions_list(&registry)?,
            ExclusionCommands::Add { pattern } => commands::cmd_exclusions_add(&registry, pattern)?,
            ExclusionCommands::Remove { pattern } => {
                commands::cmd_exclusions_remove(&registry, &pattern)?
            }
        },
        Commands::Reconcile => {
            let engine = commands::engine(registry, metrics)?;
            commands::cmd_reconcile(&engine)?
        }
    }

    Ok(())
}
