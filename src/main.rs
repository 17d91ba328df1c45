//! dbhub - command-line access to a local store.
//!
//! Operates directly on the storage directory; useful for administration and
//! for seeding a store before the server is pointed at it.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

use dbhub::config::HubConfig;
use dbhub::hub::{Hub, Revision, UploadRequest};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse global options, everything after the command is its own.
    let mut root: Option<PathBuf> = None;
    let mut verbose = false;
    let mut rest: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-r" | "--root" if rest.is_empty() => {
                i += 1;
                if i < args.len() {
                    root = Some(PathBuf::from(&args[i]));
                }
            }
            "-v" | "--verbose" if rest.is_empty() => {
                verbose = true;
            }
            "-h" | "--help" if rest.is_empty() => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" if rest.is_empty() => {
                println!("dbhub v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => rest.push(arg.to_string()),
        }
        i += 1;
    }

    init_tracing(verbose);

    let mut config = HubConfig::from_env();
    if let Some(root) = root {
        config.storage_dir = root;
    }

    let Some((command, command_args)) = rest.split_first() else {
        print_help();
        return ExitCode::FAILURE;
    };

    let hub = match Hub::open(config) {
        Ok(hub) => hub,
        Err(e) => {
            eprintln!("Error opening store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match command.as_str() {
        "list" => cmd_list(&hub),
        "branches" => cmd_branches(&hub, command_args),
        "history" => cmd_history(&hub, command_args),
        "upload" => cmd_upload(&hub, command_args),
        "download" => cmd_download(&hub, command_args),
        "branch" => cmd_branch(&hub, command_args),
        "stats" => cmd_stats(&hub),
        other => {
            eprintln!("Unknown command: {}", other);
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,dbhub=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_help() {
    println!("dbhub - versioned storage for database files");
    println!();
    println!("Usage: dbhub [OPTIONS] COMMAND [ARGS]");
    println!();
    println!("Options:");
    println!("  -r, --root PATH        Storage directory (default: $DBHUB_STORAGE_DIR or ./dbhub-data)");
    println!("  -v, --verbose          Enable verbose output");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
    println!();
    println!("Commands:");
    println!("  list                               List databases");
    println!("  branches DB                        List branches of a database");
    println!("  history DB [BRANCH]                Show the history of a branch");
    println!("  upload FILE [upload options]       Upload a database file");
    println!("  download DB [--branch B | --commit C] [-o OUTPUT]");
    println!("                                     Write a stored version to OUTPUT (default: DB)");
    println!("  branch DB FROM NEW                 Create branch NEW at the head of FROM");
    println!("  stats                              Show object counts");
    println!();
    println!("Upload options:");
    println!("  --name NAME            Database name (default: the file name)");
    println!("  --branch NAME          Target branch (default: $DBHUB_DEFAULT_BRANCH or master)");
    println!("  -m, --message TEXT     Commit message (required)");
    println!("  --author NAME          Author name");
    println!("  --email EMAIL          Author email");
}

/// Pull the value following a flag.
fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} needs a value", flag))
}

fn positional<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("missing argument: {}", name))
}

fn cmd_list(hub: &Hub) -> CliResult {
    let databases = hub.list_databases()?;
    for name in &databases {
        println!("{}", name);
    }
    println!("({} databases)", databases.len());
    Ok(())
}

fn cmd_branches(hub: &Hub, args: &[String]) -> CliResult {
    let db = positional(args, 0, "DB")?;
    for (branch, head) in &hub.list_branches(db)? {
        println!("{}\t{}", branch, head);
    }
    Ok(())
}

fn cmd_history(hub: &Hub, args: &[String]) -> CliResult {
    let db = positional(args, 0, "DB")?;
    let branch = match args.get(1) {
        Some(b) => b.clone(),
        None => hub.config().default_branch.to_string(),
    };

    for commit in hub.branch_history(db, &branch)? {
        println!(
            "{}  {}  {}  {}",
            commit.id.short(),
            commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
            commit.author(),
            commit.summary()
        );
    }
    Ok(())
}

fn cmd_upload(hub: &Hub, args: &[String]) -> CliResult {
    let file = PathBuf::from(positional(args, 0, "FILE")?);
    let mut request = UploadRequest {
        database: file_name(&file)?,
        ..Default::default()
    };

    let mut author: (Option<String>, Option<String>) = (None, None);
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--name" => request.database = flag_value(args, &mut i, "--name")?.to_string(),
            "--branch" => request.branch = Some(flag_value(args, &mut i, "--branch")?.to_string()),
            "-m" | "--message" => request.message = flag_value(args, &mut i, "--message")?.to_string(),
            "--author" => author.0 = Some(flag_value(args, &mut i, "--author")?.to_string()),
            "--email" => author.1 = Some(flag_value(args, &mut i, "--email")?.to_string()),
            other => return Err(format!("unknown upload option: {}", other).into()),
        }
        i += 1;
    }
    request.author_name = author.0;
    request.author_email = author.1;

    request.bytes = std::fs::read(&file)?;
    let modified = std::fs::metadata(&file)?.modified()?;
    request.last_modified = Some(DateTime::<Utc>::from(modified));

    let receipt = hub.upload(request)?;
    println!(
        "{} {} -> {} ({} bytes)",
        receipt.location,
        receipt.branch,
        receipt.commit_id,
        receipt.size
    );
    Ok(())
}

fn cmd_download(hub: &Hub, args: &[String]) -> CliResult {
    let db = positional(args, 0, "DB")?;
    let mut output = PathBuf::from(db);

    let mut revision = Revision::DefaultBranch;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--branch" => revision = Revision::Branch(flag_value(args, &mut i, "--branch")?.to_string()),
            "--commit" => revision = Revision::Commit(flag_value(args, &mut i, "--commit")?.to_string()),
            "-o" | "--output" => output = PathBuf::from(flag_value(args, &mut i, "--output")?),
            other => return Err(format!("unknown download option: {}", other).into()),
        }
        i += 1;
    }

    let download = hub.download(db, &revision)?;
    std::fs::write(&output, &download.bytes)?;
    println!(
        "{} @ {} -> {} ({} bytes)",
        download.name,
        download.commit.short(),
        output.display(),
        download.bytes.len()
    );
    Ok(())
}

fn cmd_branch(hub: &Hub, args: &[String]) -> CliResult {
    let db = positional(args, 0, "DB")?;
    let from = positional(args, 1, "FROM")?;
    let new = positional(args, 2, "NEW")?;

    let head = hub.create_branch(db, from, new)?;
    println!("created {} at {}", new, head.short());
    Ok(())
}

fn cmd_stats(hub: &Hub) -> CliResult {
    println!("{}", hub.repository().stats()?);
    Ok(())
}

fn file_name(path: &Path) -> Result<String, String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| format!("cannot take a database name from {}", path.display()))
}
