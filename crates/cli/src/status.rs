//! Branch status table.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use modelmerge_core::store::{BranchInfo, BranchKind, RevisionStore, TrackingStatus};

use crate::style;

pub fn run_status(store: &RevisionStore) -> Result<()> {
    let status = store
        .branch_statuses()
        .context("failed to read branch status")?;

    println!();
    match status.current() {
        Some(current) => println!("{}", style::header(&format!("On branch {}", current.name))),
        None => println!("{}", style::warn("HEAD is detached")),
    }
    println!();

    if status.branches.is_empty() {
        println!("{}", style::dim("No branches yet."));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "", "Branch", "Kind", "Upstream", "vs HEAD", "Merged", "Latest",
    ]);

    for b in &status.branches {
        table.add_row(vec![
            Cell::new(style::current_marker(b.is_current)),
            Cell::new(&b.name),
            Cell::new(match b.kind {
                BranchKind::Local => "local",
                BranchKind::Remote => "remote",
            }),
            Cell::new(tracking_label(b.tracking)),
            Cell::new(head_delta(b)),
            Cell::new(if b.merged_into_current { "yes" } else { "no" }),
            Cell::new(format!(
                "{} {} ({})",
                b.latest.short_id(),
                truncate(b.latest.summary(), 40),
                b.latest.time.format("%Y-%m-%d")
            )),
        ]);
    }
    println!("{}", table);

    let unintegrated = status.unintegrated().count();
    let unpushed = status.unpushed().count();
    let gone = status.upstream_deleted().count();
    println!();
    if unintegrated > 0 {
        println!(
            "  {} branch(es) carry commits not yet merged into HEAD",
            unintegrated
        );
    }
    if unpushed > 0 {
        println!("  {} branch(es) have unpushed commits", unpushed);
    }
    if gone > 0 {
        println!(
            "  {}",
            style::warn(&format!("{} branch(es) lost their upstream", gone))
        );
    }
    println!();
    Ok(())
}

fn tracking_label(tracking: TrackingStatus) -> String {
    match tracking {
        TrackingStatus::LocalOnly => "—".into(),
        TrackingStatus::RemoteOnly => "not tracked".into(),
        TrackingStatus::Tracking { ahead: 0, behind: 0 } => "up to date".into(),
        TrackingStatus::Tracking { ahead, behind } => format!("↑{} ↓{}", ahead, behind),
        TrackingStatus::UpstreamDeleted => "gone".into(),
        TrackingStatus::TrackedRemote => "tracked".into(),
    }
}

fn head_delta(b: &BranchInfo) -> String {
    if b.is_current {
        return "—".into();
    }
    format!("+{} / -{}", b.ahead_of_head, b.behind_head)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
