// src/main.rs
//! newpkg - CLI entry point

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use newpkg::{Config, DepcleanMode, DepcleanOptions, InstallOptions, RemoveOptions, UpgradeOptions};
use std::io;
use std::path::PathBuf;
use std::process;

mod commands;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "newpkg")]
#[command(version)]
#[command(about = "Source-based package manager with checkpointed builds and rollback", long_about = None)]
struct Cli {
    /// Run against this root instead of / (paths, db, and ports rebase)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Site configuration file to apply on top of the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and install packages from the ports tree
    Install {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,

        /// Resume each package from its checkpoint
        #[arg(long)]
        resume: bool,

        /// Show the install order without building
        #[arg(long)]
        dry_run: bool,

        /// Concurrent source downloads
        #[arg(long, value_name = "N")]
        parallel: Option<u32>,

        /// Retries for downloads and build commands
        #[arg(long, value_name = "N")]
        retry: Option<u32>,

        /// Reinstall already-installed targets and re-fetch sources
        #[arg(short, long)]
        force: bool,

        /// Override the bootstrap stage (pass1, pass2, normal)
        #[arg(long, value_name = "S")]
        stage: Option<newpkg::Stage>,

        /// Keep going after a package fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Uninstall packages
    Remove {
        /// Package names or name-version identifiers
        #[arg(required = true)]
        packages: Vec<String>,

        /// Proceed without prompting
        #[arg(long)]
        auto: bool,

        /// Override protected and reverse-dependency guards
        #[arg(short, long)]
        force: bool,

        /// Also remove configuration and state directories
        #[arg(long)]
        purge: bool,

        /// Show what would be removed
        #[arg(long)]
        dry_run: bool,

        /// Continue an interrupted remove batch
        #[arg(long)]
        resume: bool,

        /// Skip the orphan report after removals
        #[arg(long)]
        no_depclean: bool,

        /// Skip the dependency-graph refresh after removals
        #[arg(long)]
        no_sync: bool,
    },

    /// Upgrade packages to the versions in the ports tree
    Upgrade {
        /// Package names (all installed packages with --all)
        packages: Vec<String>,

        /// Upgrade everything installed
        #[arg(long)]
        all: bool,

        /// Continue an interrupted batch, failed package first
        #[arg(long)]
        resume: bool,

        /// Show planned upgrades without building
        #[arg(long)]
        dry_run: bool,

        /// Upgrade even when versions match
        #[arg(short, long)]
        force: bool,

        /// Remove leftover files and orphans without confirmation
        #[arg(long)]
        auto: bool,

        /// Restore the most recent snapshot instead of upgrading
        #[arg(long)]
        rollback: bool,

        /// Skip the ports-tree commit
        #[arg(long)]
        no_commit: bool,

        /// Override the bootstrap stage (pass1, pass2, normal)
        #[arg(long, value_name = "S")]
        stage: Option<newpkg::Stage>,
    },

    /// Remove packages nothing depends on
    Depclean {
        /// Remove every eligible orphan without asking
        #[arg(long, conflicts_with_all = ["interactive", "dry_run"])]
        auto: bool,

        /// Confirm each candidate
        #[arg(long)]
        interactive: bool,

        /// Only report candidates (default)
        #[arg(long)]
        dry_run: bool,

        /// Remove even when the double-check still sees dependents
        #[arg(short, long)]
        force: bool,

        /// Verify surviving packages afterwards
        #[arg(long)]
        verify: bool,

        /// Drop the dependency-graph cache first
        #[arg(long)]
        purge_cache: bool,

        /// Commit the ports tree after removals
        #[arg(long)]
        auto_commit: bool,
    },

    /// Manifest database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Create the database directories and an empty index
    Init,

    /// Register a manifest from a JSON file
    Add {
        file: PathBuf,
        /// Replace an existing manifest with the same identity
        #[arg(long)]
        replace: bool,
    },

    /// Move manifests to the backup area
    Remove {
        query: String,
        /// Allow a bare name to remove several versions
        #[arg(short, long)]
        force: bool,
    },

    /// Show installed package details
    Query {
        query: String,
        /// List owned files only
        #[arg(long)]
        files: bool,
        /// Dump the manifest JSON
        #[arg(long)]
        raw: bool,
    },

    /// List installed packages
    List {
        /// Filter by bootstrap stage
        #[arg(long)]
        stage: Option<newpkg::Stage>,
        /// Print the index entries as JSON
        #[arg(long)]
        json: bool,
        /// Print only the count
        #[arg(long)]
        count: bool,
    },

    /// Show what depends on a package
    Revdeps { name: String },

    /// List packages to rebuild after a change to one, in dependency order
    Rebuild { name: String },

    /// Export the dependency graph to a file
    Graph {
        /// Output format
        #[arg(long, default_value = "json", value_parser = ["json", "dot"])]
        format: String,
        /// Output file path
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Show which package owns a file
    Provides { path: String },

    /// Archive the manifest database
    Backup,

    /// Restore the database from an archive (latest when omitted)
    Restore { archive: Option<String> },

    /// Rebuild the index from the manifest files
    Reindex,

    /// Check owned files against the recorded checksums
    Verify { query: String },

    /// List packages nothing depends on
    Orphans,

    /// Search names, descriptions, and origins
    Search { term: String },

    /// Disk usage of a package's files
    Size { query: String },

    /// Rebuild the dependency-graph cache
    Sync,
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    newpkg::chroot::install_signal_handlers();

    // usage errors exit 1; --help and --version exit 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            process::exit(code);
        }
    };
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<newpkg::Error>()
                .map(newpkg::Error::exit_code)
                .unwrap_or(1);
            process::exit(code);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.root {
        Some(root) => Config::for_root(root),
        None => Config::load()?,
    };
    if let Some(site) = &cli.config {
        config.apply_site(site)?;
    }

    match cli.command {
        Some(Commands::Install {
            packages,
            resume,
            dry_run,
            parallel,
            retry,
            force,
            stage,
            continue_on_error,
        }) => {
            if let Some(n) = parallel {
                config.parallel = n;
            }
            if let Some(n) = retry {
                config.retry = n;
            }
            commands::cmd_install(
                &config,
                &packages,
                &InstallOptions {
                    resume,
                    dry_run,
                    force,
                    stage,
                    continue_on_error,
                },
            )
        }

        Some(Commands::Remove {
            packages,
            auto,
            force,
            purge,
            dry_run,
            resume,
            no_depclean,
            no_sync,
        }) => commands::cmd_remove(
            &config,
            &packages,
            &RemoveOptions {
                auto,
                force,
                purge,
                dry_run,
                resume,
                no_depclean,
                no_sync,
            },
        ),

        Some(Commands::Upgrade {
            packages,
            all,
            resume,
            dry_run,
            force,
            auto,
            rollback,
            no_commit,
            stage,
        }) => commands::cmd_upgrade(
            &config,
            &packages,
            &UpgradeOptions {
                all,
                resume,
                dry_run,
                force,
                auto,
                rollback,
                no_commit,
                stage,
                continue_on_error: false,
            },
        ),

        Some(Commands::Depclean {
            auto,
            interactive,
            dry_run: _,
            force,
            verify,
            purge_cache,
            auto_commit,
        }) => {
            let mode = if auto {
                DepcleanMode::Auto
            } else if interactive {
                DepcleanMode::Interactive
            } else {
                DepcleanMode::DryRun
            };
            commands::cmd_depclean(
                &config,
                &DepcleanOptions {
                    mode,
                    force,
                    verify,
                    purge_cache,
                    auto_commit,
                },
            )
        }

        Some(Commands::Db { command }) => match command {
            DbCommands::Init => commands::cmd_db_init(&config),
            DbCommands::Add { file, replace } => commands::cmd_db_add(&config, &file, replace),
            DbCommands::Remove { query, force } => commands::cmd_db_remove(&config, &query, force),
            DbCommands::Query { query, files, raw } => {
                commands::cmd_db_query(&config, &query, files, raw)
            }
            DbCommands::List { stage, json, count } => {
                commands::cmd_db_list(&config, stage, json, count)
            }
            DbCommands::Revdeps { name } => commands::cmd_db_revdeps(&config, &name),
            DbCommands::Rebuild { name } => commands::cmd_db_rebuild(&config, &name),
            DbCommands::Graph { format, out } => commands::cmd_db_graph(&config, &format, &out),
            DbCommands::Provides { path } => commands::cmd_db_provides(&config, &path),
            DbCommands::Backup => commands::cmd_db_backup(&config),
            DbCommands::Restore { archive } => {
                commands::cmd_db_restore(&config, archive.as_deref())
            }
            DbCommands::Reindex => commands::cmd_db_reindex(&config),
            DbCommands::Verify { query } => commands::cmd_db_verify(&config, &query),
            DbCommands::Orphans => commands::cmd_db_orphans(&config),
            DbCommands::Search { term } => commands::cmd_db_search(&config, &term),
            DbCommands::Size { query } => commands::cmd_db_size(&config, &query),
            DbCommands::Sync => commands::cmd_graph_sync(&config),
        },

        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "newpkg", &mut io::stdout());
            Ok(0)
        }

        None => {
            println!("newpkg v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'newpkg --help' for usage information");
            Ok(0)
        }
    }
}
