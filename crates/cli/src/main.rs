//! modelmerge command-line tool.
//!
//! Inspects branches, compares revisions of the model document, and merges
//! branches structurally. All merge semantics live in `modelmerge-core`;
//! this binary renders results and asks the questions the core cannot.

mod diff;
mod merge;
mod status;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use modelmerge_core::config::{ModelMergeConfig, OnFailure};
use modelmerge_core::merge::Preference;
use modelmerge_core::store::RevisionStore;

use crate::merge::MergeOverrides;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// modelmerge command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "modelmerge",
    version,
    about = "Structural merging of a versioned model document"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./modelmerge.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./modelmerge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Show local and remote branches relative to HEAD.
    Status,

    /// Compare the document between two revisions.
    Diff {
        /// Revision the changes are reported from.
        left: String,

        /// Revision the changes lead to.
        #[arg(default_value = "HEAD")]
        right: String,

        /// Common ancestor for a three-way comparison.
        #[arg(long)]
        base: Option<String>,
    },

    /// Merge a branch into the current branch.
    Merge {
        /// Branch (or remote-tracking branch) to merge.
        branch: String,

        /// What to do when the merged document is invalid:
        /// prompt, ours, theirs, cancel.
        #[arg(long)]
        on_failure: Option<OnFailure>,

        /// Winner of attribute conflicts: ours or theirs.
        #[arg(long)]
        attribute: Option<Preference>,

        /// Winner of containment conflicts: ours or theirs.
        #[arg(long)]
        containment: Option<Preference>,
    },

    /// Fetch from the configured remote.
    Fetch {
        /// Remote name (defaults to the configured remote).
        remote: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins, then `--log-level`, then the config file, then `warn`.
fn init_logging(cli: &Cli) {
    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            ModelMergeConfig::load_from_file(&cli.config)
                .ok()
                .map(|c| c.logging.log_level)
        })
        .unwrap_or_else(|| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Status => {
            let (config, base_dir) = load_config(&cli.config)?;
            status::run_status(&open_store(&config, &base_dir)?)
        }
        Commands::Diff { left, right, base } => {
            let (config, base_dir) = load_config(&cli.config)?;
            diff::run_diff(
                &open_store(&config, &base_dir)?,
                &left,
                &right,
                base.as_deref(),
            )
        }
        Commands::Merge {
            branch,
            on_failure,
            attribute,
            containment,
        } => {
            let (config, base_dir) = load_config(&cli.config)?;
            let overrides = MergeOverrides {
                on_failure,
                attribute,
                containment,
            };
            merge::run_merge(config, base_dir, branch, overrides).await
        }
        Commands::Fetch { remote } => {
            let (config, base_dir) = load_config(&cli.config)?;
            cmd_fetch(config, base_dir, remote).await
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Load and resolve the configuration, together with the directory relative
/// repository paths are resolved against.
fn load_config(path: &Path) -> Result<(ModelMergeConfig, PathBuf)> {
    let config =
        ModelMergeConfig::load_and_resolve(path).context("failed to load configuration file")?;
    Ok((config, config_dir(path)))
}

fn config_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn open_store(config: &ModelMergeConfig, base_dir: &Path) -> Result<RevisionStore> {
    config
        .open_store(base_dir)
        .context("failed to open repository")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    let body = ModelMergeConfig::default()
        .to_toml()
        .context("failed to render default configuration")?;
    let contents = format!(
        "# modelmerge configuration\n\
         # Secrets are never stored here: [remote] token_env names the\n\
         # environment variable holding the access token.\n\n{}",
        body
    );
    std::fs::write(output, contents).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Point [repository] at your working tree and document");
    println!("  2. Optionally set [committer] and the [remote] credentials");
    println!(
        "  3. Validate with: modelmerge validate --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        ModelMergeConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    // Missing variables only warn here.
    let _ = config.resolve_env_vars();
    println!("  {}", style::success("Environment variable references processed"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All fields are valid"));

    let policy = config.policy();
    println!();
    println!("Configuration summary:");
    println!("  Repository    : {}", config.repository.path.display());
    println!("  Document      : {}", config.repository.document.display());
    println!("  Lock file     : {}", config.repository.lock_file);
    println!(
        "  Committer     : {}",
        config
            .committer
            .as_ref()
            .map(|c| format!("{} <{}>", c.name, c.email))
            .unwrap_or_else(|| "repository default".to_string())
    );
    println!("  Attribute wins: {}", policy.attribute);
    println!("  Structure wins: {}", policy.containment);
    println!("  File favor    : {:?}", config.merge.file_favor);
    println!("  On failure    : {:?}", config.merge.on_integrity_failure);
    println!(
        "  Validators    : {}",
        config.integrity_checker().validator_names().count()
    );
    println!("  Remote        : {}", config.remote.name);
    if config.remote.username.is_some() {
        println!(
            "  Remote token  : {}",
            if config.remote.token.is_some() {
                "set"
            } else {
                "NOT SET"
            }
        );
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

async fn cmd_fetch(config: ModelMergeConfig, base_dir: PathBuf, remote: Option<String>) -> Result<()> {
    let remote = remote.unwrap_or_else(|| config.remote.name.clone());
    let credentials = config.credentials().context("remote credentials")?;

    let name = remote.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let store = open_store(&config, &base_dir)?;
        store
            .fetch(&name, credentials.as_ref())
            .with_context(|| format!("failed to fetch from '{}'", name))
    })
    .await
    .context("fetch worker panicked")??;

    println!("{}", style::success(&format!("Fetched {}", remote)));
    Ok(())
}
