//! `modelmerge merge`: run the merge engine on a blocking worker.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::Select;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use modelmerge_core::config::{ModelMergeConfig, OnFailure};
use modelmerge_core::merge::{
    FallbackChoice, FallbackReport, FallbackResolver, FixedFallback, MergeOutcome, MergeReport,
    Preference,
};
use modelmerge_core::{JsonDocumentIo, MergeEngine};

use crate::style;

/// Command-line overrides of the `[merge]` section.
#[derive(Debug, Default)]
pub struct MergeOverrides {
    pub on_failure: Option<OnFailure>,
    pub attribute: Option<Preference>,
    pub containment: Option<Preference>,
}

pub async fn run_merge(
    config: ModelMergeConfig,
    base_dir: PathBuf,
    branch: String,
    overrides: MergeOverrides,
) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(format!("Merging {}...", branch));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let worker_spinner = spinner.clone();
    let target = branch.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<MergeOutcome> {
        let store = config
            .open_store(&base_dir)
            .context("failed to open repository")?;
        let io = JsonDocumentIo;

        let mut policy = config.policy();
        if let Some(p) = overrides.attribute {
            policy.attribute = p;
        }
        if let Some(p) = overrides.containment {
            policy.containment = p;
        }
        let on_failure = overrides
            .on_failure
            .unwrap_or(config.merge.on_integrity_failure);

        let engine = MergeEngine::new(&store, &io)
            .with_policy(policy)
            .with_strategy(config.merge.file_favor)
            .with_checker(config.integrity_checker());
        let engine = match on_failure.fixed_choice() {
            Some(choice) => engine.with_fallback(FixedFallback(choice)),
            None => engine.with_fallback(PromptFallback {
                spinner: worker_spinner,
            }),
        };

        engine
            .merge(&target)
            .with_context(|| format!("failed to merge '{}'", target))
    })
    .await
    .context("merge worker panicked")?;

    spinner.finish_and_clear();
    let outcome = result?;

    println!();
    match &outcome {
        MergeOutcome::AlreadyUpToDate => {
            println!("{}", style::success("Already up to date"));
        }
        MergeOutcome::FastForwarded { to } => {
            println!(
                "{}",
                style::success(&format!("Fast-forwarded to {} {}", to.short_id(), to.summary()))
            );
        }
        MergeOutcome::Merged { commit, report } => {
            println!(
                "{}",
                style::success(&format!("Merged {} as {}", branch, commit.short_id()))
            );
            print_report(report);
        }
        MergeOutcome::MergedWithConflictsResolved {
            side,
            commit,
            report,
        } => {
            println!(
                "{}",
                style::warn(&format!(
                    "Merged {} as {} by taking {} wholesale",
                    branch,
                    commit.short_id(),
                    side
                ))
            );
            print_report(report);
        }
        MergeOutcome::Cancelled => {
            println!(
                "{}",
                style::error("Merge cancelled; the repository is back at its previous HEAD")
            );
        }
    }
    println!();
    Ok(())
}

fn print_report(report: &MergeReport) {
    println!();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Differences", "Applied", "Skipped", "Conflicts", "Ours", "Theirs", "Attachments"]);
    table.add_row(vec![
        Cell::new(report.differences),
        Cell::new(report.applied),
        Cell::new(report.skipped),
        Cell::new(report.conflicts),
        Cell::new(report.resolved_ours),
        Cell::new(report.resolved_theirs),
        Cell::new(report.attachments_repaired),
    ]);
    println!("{}", table);

    if !report.violations.is_empty() {
        println!();
        println!("{}", style::header("Integrity violations"));
        for v in &report.violations {
            println!("  {}", v);
        }
    }
    if !report.conflicted_paths.is_empty() {
        println!();
        println!("{}", style::header("Conflicted files"));
        for p in &report.conflicted_paths {
            println!("  {}", p);
        }
    }
}

/// Asks the user how to leave a merge that cannot be committed as computed.
/// Falls back to cancelling when no terminal is attached.
struct PromptFallback {
    spinner: ProgressBar,
}

impl FallbackResolver for PromptFallback {
    fn choose(&self, report: &FallbackReport) -> FallbackChoice {
        self.spinner.suspend(|| {
            println!();
            println!(
                "{}",
                style::warn(&format!("Merging {} needs a decision", report.branch))
            );
            for v in &report.violations {
                println!("  {}", v);
            }
            for p in &report.conflicted_paths {
                println!("  conflicted: {}", p);
            }
            println!();

            let options = [
                format!("Take {} (keep the current branch)", style::ours()),
                format!("Take {} (use {})", style::theirs(), report.branch),
                "Cancel the merge".to_string(),
            ];
            let picked = Select::new()
                .with_prompt("How should the merge continue?")
                .items(&options)
                .default(2)
                .interact();
            match picked {
                Ok(0) => FallbackChoice::TakeOurs,
                Ok(1) => FallbackChoice::TakeTheirs,
                Ok(_) => FallbackChoice::Cancel,
                Err(e) => {
                    warn!(error = %e, "no interactive terminal; cancelling merge");
                    FallbackChoice::Cancel
                }
            }
        })
    }
}
