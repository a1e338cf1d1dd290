mod walk;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cairn_core::config::Settings;
use cairn_core::repo::{init_repository, open_repository};
use cairn_core::save::{save_stream, SaveOptions};
use cairn_types::error::CairnError;

use walk::FsWalker;

const EXIT_FAILURE: i32 = 1;
const EXIT_REPO_INACCESSIBLE: i32 = 3;

#[derive(Parser)]
#[command(
    name = "cairn",
    version,
    about = "Deduplicating, content-addressed backups",
    after_help = "\
Environment variables:
  CAIRN_DIR         Repository directory (overridden by --repo)
  CAIRN_PASSPHRASE  Passphrase for encrypted repositories"
)]
struct Cli {
    /// Repository directory (defaults to $CAIRN_DIR)
    #[arg(short = 'r', long, global = true)]
    repo: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Encrypt the repository (passphrase from CAIRN_PASSPHRASE)
        #[arg(long)]
        encrypted: bool,

        /// Hashsplit boundary bits (bup.blobbits)
        #[arg(long)]
        blobbits: Option<u32>,

        /// Hashsplit directory listings (bup.treesplit)
        #[arg(long)]
        treesplit: bool,

        /// Separate data and metadata packs (bup.separatemeta)
        #[arg(long)]
        separatemeta: bool,

        /// Local index cache directory (bup.cachedir)
        #[arg(long)]
        cachedir: Option<PathBuf>,
    },

    /// Save paths as a new commit on a branch
    Save {
        /// Branch to advance
        #[arg(long)]
        name: String,

        /// Prefix to strip from stored paths
        #[arg(long)]
        strip: Option<String>,

        /// Commit timestamp as seconds since the epoch
        #[arg(long)]
        date: Option<i64>,

        /// Commit timestamp as an RFC 3339 date
        #[arg(short = 'd')]
        date_str: Option<String>,

        /// Commit message
        #[arg(short = 'm', long)]
        message: Option<String>,

        /// Paths to save
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let repo_dir = match cli
        .repo
        .clone()
        .or_else(|| std::env::var_os("CAIRN_DIR").map(PathBuf::from))
    {
        Some(dir) => dir,
        None => {
            eprintln!("error: no repository given (use --repo or CAIRN_DIR)");
            std::process::exit(EXIT_REPO_INACCESSIBLE);
        }
    };

    let result = match cli.command {
        Commands::Init {
            encrypted,
            blobbits,
            treesplit,
            separatemeta,
            cachedir,
        } => run_init(&repo_dir, encrypted, blobbits, treesplit, separatemeta, cachedir),
        Commands::Save {
            name,
            strip,
            date,
            date_str,
            message,
            paths,
        } => run_save(&repo_dir, &name, strip, date, date_str, message, &paths),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(exit_code(&e));
    }
}

/// Repository-inaccessible failures get their own exit code so wrapper
/// scripts can tell "fix the path/passphrase" from "save failed".
fn exit_code(e: &CairnError) -> i32 {
    match e {
        CairnError::RepoNotFound(_)
        | CairnError::RepoAlreadyExists(_)
        | CairnError::AuthFailure(_) => EXIT_REPO_INACCESSIBLE,
        CairnError::Config(msg) if msg.contains("passphrase") => EXIT_REPO_INACCESSIBLE,
        _ => EXIT_FAILURE,
    }
}

fn passphrase_from_env() -> Option<String> {
    std::env::var("CAIRN_PASSPHRASE")
        .ok()
        .filter(|p| !p.is_empty())
}

fn run_init(
    repo_dir: &std::path::Path,
    encrypted: bool,
    blobbits: Option<u32>,
    treesplit: bool,
    separatemeta: bool,
    cachedir: Option<PathBuf>,
) -> Result<(), CairnError> {
    let mut settings = Settings::default();
    if let Some(bits) = blobbits {
        settings.blob_bits = bits;
    }
    settings.treesplit = treesplit;
    settings.separatemeta = separatemeta;
    settings.cachedir = cachedir;

    let passphrase = if encrypted {
        Some(passphrase_from_env().ok_or_else(|| {
            CairnError::Config("encrypted init requires CAIRN_PASSPHRASE".into())
        })?)
    } else {
        None
    };

    init_repository(repo_dir, settings, passphrase.as_deref())?;
    println!("Repository initialized at: {}", repo_dir.display());
    Ok(())
}

fn run_save(
    repo_dir: &std::path::Path,
    branch: &str,
    strip: Option<String>,
    date: Option<i64>,
    date_str: Option<String>,
    message: Option<String>,
    paths: &[String],
) -> Result<(), CairnError> {
    let mut repo = open_repository(repo_dir, passphrase_from_env().as_deref())?;

    let mut opts = SaveOptions::new(branch);
    opts.author_name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "cairn".to_string());
    opts.author_email = format!("cairn@{}", opts.author_name);
    if let Some(epoch) = date {
        opts.when = epoch;
    } else if let Some(raw) = &date_str {
        opts.when = chrono::DateTime::parse_from_rfc3339(raw)
            .map_err(|e| CairnError::Config(format!("bad -d date '{raw}': {e}")))?
            .timestamp();
    }
    if let Some(msg) = message {
        opts.message = msg;
    }

    let walker = FsWalker::new(paths, strip.as_deref())?;
    let skip_counter = walker.error_counter();
    let commit_id = save_stream(&mut *repo, walker, &opts)?;

    println!("{branch}: {commit_id}");
    let skipped = skip_counter.load(std::sync::atomic::Ordering::Relaxed);
    if skipped > 0 {
        eprintln!("warning: skipped {skipped} unreadable entries");
    }
    Ok(())
}
