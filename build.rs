// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: alternate root directory
fn root_arg() -> Arg {
    Arg::new("root")
        .long("root")
        .value_name("PATH")
        .help("Run against this root instead of / (paths, db, and ports rebase)")
}

/// Common argument: site configuration file
fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .value_name("PATH")
        .help("Site configuration file to apply on top of the defaults")
}

fn flag(name: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(long).action(ArgAction::SetTrue).help(help)
}

fn force_arg(help: &'static str) -> Arg {
    Arg::new("force")
        .short('f')
        .long("force")
        .action(ArgAction::SetTrue)
        .help(help)
}

fn stage_arg() -> Arg {
    Arg::new("stage")
        .long("stage")
        .value_name("S")
        .help("Override the bootstrap stage (pass1, pass2, normal)")
}

fn build_cli() -> Command {
    Command::new("newpkg")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Source-based package manager with checkpointed builds and rollback")
        .subcommand_required(false)
        .arg(root_arg())
        .arg(config_arg())
        .subcommand(
            Command::new("install")
                .about("Build and install packages from the ports tree")
                .arg(Arg::new("packages").required(true).num_args(1..).help("Package names"))
                .arg(flag("resume", "resume", "Resume each package from its checkpoint"))
                .arg(flag("dry_run", "dry-run", "Show the install order without building"))
                .arg(Arg::new("parallel").long("parallel").value_name("N")
                    .help("Concurrent source downloads"))
                .arg(Arg::new("retry").long("retry").value_name("N")
                    .help("Retries for downloads and build commands"))
                .arg(force_arg("Reinstall already-installed targets and re-fetch sources"))
                .arg(stage_arg())
                .arg(flag("continue_on_error", "continue-on-error",
                    "Keep going after a package fails")),
        )
        .subcommand(
            Command::new("remove")
                .about("Uninstall packages")
                .arg(Arg::new("packages").required(true).num_args(1..)
                    .help("Package names or name-version identifiers"))
                .arg(flag("auto", "auto", "Proceed without prompting"))
                .arg(force_arg("Override protected and reverse-dependency guards"))
                .arg(flag("purge", "purge", "Also remove configuration and state directories"))
                .arg(flag("dry_run", "dry-run", "Show what would be removed"))
                .arg(flag("resume", "resume", "Continue an interrupted remove batch"))
                .arg(flag("no_depclean", "no-depclean", "Skip the orphan report after removals"))
                .arg(flag("no_sync", "no-sync",
                    "Skip the dependency-graph refresh after removals")),
        )
        .subcommand(
            Command::new("upgrade")
                .about("Upgrade packages to the versions in the ports tree")
                .arg(Arg::new("packages").num_args(0..)
                    .help("Package names (all installed packages with --all)"))
                .arg(flag("all", "all", "Upgrade everything installed"))
                .arg(flag("resume", "resume",
                    "Continue an interrupted batch, failed package first"))
                .arg(flag("dry_run", "dry-run", "Show planned upgrades without building"))
                .arg(force_arg("Upgrade even when versions match"))
                .arg(flag("auto", "auto",
                    "Remove leftover files and orphans without confirmation"))
                .arg(flag("rollback", "rollback",
                    "Restore the most recent snapshot instead of upgrading"))
                .arg(flag("no_commit", "no-commit", "Skip the ports-tree commit"))
                .arg(stage_arg()),
        )
        .subcommand(
            Command::new("depclean")
                .about("Remove packages nothing depends on")
                .arg(flag("auto", "auto", "Remove every eligible orphan without asking")
                    .conflicts_with_all(["interactive", "dry_run"]))
                .arg(flag("interactive", "interactive", "Confirm each candidate"))
                .arg(flag("dry_run", "dry-run", "Only report candidates (default)"))
                .arg(force_arg("Remove even when the double-check still sees dependents"))
                .arg(flag("verify", "verify", "Verify surviving packages afterwards"))
                .arg(flag("purge_cache", "purge-cache",
                    "Drop the dependency-graph cache first"))
                .arg(flag("auto_commit", "auto-commit",
                    "Commit the ports tree after removals")),
        )
        .subcommand(
            Command::new("db")
                .about("Manifest database operations")
                .subcommand(
                    Command::new("init")
                        .about("Create the database directories and an empty index"),
                )
                .subcommand(
                    Command::new("add")
                        .about("Register a manifest from a JSON file")
                        .arg(Arg::new("file").required(true).help("Manifest JSON file"))
                        .arg(flag("replace", "replace",
                            "Replace an existing manifest with the same identity")),
                )
                .subcommand(
                    Command::new("remove")
                        .about("Move manifests to the backup area")
                        .arg(Arg::new("query").required(true))
                        .arg(force_arg("Allow a bare name to remove several versions")),
                )
                .subcommand(
                    Command::new("query")
                        .about("Show installed package details")
                        .arg(Arg::new("query").required(true))
                        .arg(flag("files", "files", "List owned files only"))
                        .arg(flag("raw", "raw", "Dump the manifest JSON")),
                )
                .subcommand(
                    Command::new("list")
                        .about("List installed packages")
                        .arg(Arg::new("stage").long("stage").value_name("S")
                            .help("Filter by bootstrap stage"))
                        .arg(flag("json", "json", "Print the index entries as JSON"))
                        .arg(flag("count", "count", "Print only the count")),
                )
                .subcommand(
                    Command::new("revdeps")
                        .about("Show what depends on a package")
                        .arg(Arg::new("name").required(true)),
                )
                .subcommand(
                    Command::new("rebuild")
                        .about("List packages to rebuild after a change to one, in dependency order")
                        .arg(Arg::new("name").required(true)),
                )
                .subcommand(
                    Command::new("graph")
                        .about("Export the dependency graph to a file")
                        .arg(Arg::new("format").long("format").value_name("FORMAT")
                            .value_parser(["json", "dot"]).default_value("json")
                            .help("Output format"))
                        .arg(Arg::new("out").short('o').long("out").value_name("FILE")
                            .required(true).help("Output file path")),
                )
                .subcommand(
                    Command::new("provides")
                        .about("Show which package owns a file")
                        .arg(Arg::new("path").required(true)),
                )
                .subcommand(Command::new("backup").about("Archive the manifest database"))
                .subcommand(
                    Command::new("restore")
                        .about("Restore the database from an archive (latest when omitted)")
                        .arg(Arg::new("archive").help("Archive path or bare filename")),
                )
                .subcommand(
                    Command::new("reindex")
                        .about("Rebuild the index from the manifest files"),
                )
                .subcommand(
                    Command::new("verify")
                        .about("Check owned files against the recorded checksums")
                        .arg(Arg::new("query").required(true)),
                )
                .subcommand(
                    Command::new("orphans").about("List packages nothing depends on"),
                )
                .subcommand(
                    Command::new("search")
                        .about("Search names, descriptions, and origins")
                        .arg(Arg::new("term").required(true)),
                )
                .subcommand(
                    Command::new("size")
                        .about("Disk usage of a package's files")
                        .arg(Arg::new("query").required(true)),
                )
                .subcommand(
                    Command::new("sync").about("Rebuild the dependency-graph cache"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completions")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("newpkg.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
