//! Read-only structural comparison between revisions.

use anyhow::{Context, Result};

use modelmerge_core::compare::{compare_revisions, Side};
use modelmerge_core::store::RevisionStore;
use modelmerge_core::JsonDocumentIo;

use crate::style;

pub fn run_diff(
    store: &RevisionStore,
    left: &str,
    right: &str,
    base: Option<&str>,
) -> Result<()> {
    let comparison = compare_revisions(store, &JsonDocumentIo, left, right, base)
        .with_context(|| format!("failed to compare {} and {}", left, right))?;

    println!();
    match base {
        Some(base) => println!(
            "{}",
            style::header(&format!("{} vs {} (base {})", left, right, base))
        ),
        None => println!("{}", style::header(&format!("{} vs {}", left, right))),
    }
    println!();

    if comparison.is_empty() {
        println!("{}", style::success("Documents are structurally identical"));
        println!();
        return Ok(());
    }

    for d in &comparison.differences {
        let origin = match (base, d.source) {
            (None, _) => String::new(),
            (Some(_), Side::Left) => format!("{} ", style::ours()),
            (Some(_), Side::Right) => format!("{} ", style::theirs()),
            (Some(_), Side::Both) => format!("{} ", style::dim("both")),
        };
        println!("  {}{}", origin, d);
    }

    if comparison.has_conflicts() {
        println!();
        println!(
            "{}",
            style::header(&format!("Conflicts ({})", comparison.conflicts.len()))
        );
        for (n, conflict) in comparison.conflicts.iter().enumerate() {
            println!("  #{} {}", n + 1, conflict.kind);
            for d in comparison.members(conflict) {
                println!("      {}", d);
            }
        }
    }

    println!();
    println!(
        "{} difference(s), {} conflict(s)",
        comparison.differences.len(),
        comparison.conflicts.len()
    );
    Ok(())
}
