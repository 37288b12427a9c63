use crate::cmd::controller;
use crate::output::{joined, print_json, print_table};
use anyhow::Context;
use scratch_core::lifecycle::{CreateOutcome, ScratchStatus};
use scratch_core::ScratchEnvironment;
use std::path::Path;

// ---------------------------------------------------------------------------
// create
// ---------------------------------------------------------------------------

pub fn create(
    root: &Path,
    branch: &str,
    name: Option<&str>,
    profile: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let result = ctl
        .create(branch, name, profile)
        .with_context(|| format!("failed to create scratch for '{branch}'"))?;

    if json {
        return print_json(&result);
    }
    let verb = match result.outcome {
        CreateOutcome::Created => "Created",
        CreateOutcome::Updated => "Updated",
    };
    println!("{verb} scratch '{}' \u{2192} {}", result.scratch.identity, result.url);
    println!("  services: {}", joined(&result.scratch.services));
    if let Some(db) = &result.scratch.database {
        println!("  database: {db}");
    }
    if let Some(update) = &result.update {
        println!("  changed:  {}", joined(&update.changed));
        println!("  removed:  {}", joined(&update.removed));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list / status
// ---------------------------------------------------------------------------

fn state_label(status: &ScratchStatus) -> String {
    match &status.in_flight {
        Some(op) => format!("{op}\u{2026}"),
        None => status.state.to_string(),
    }
}

pub fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let scratches = ctl.list().context("failed to list scratches")?;

    if json {
        return print_json(&scratches);
    }
    if scratches.is_empty() {
        println!("No scratches. Create one with: scratch create <branch>");
        return Ok(());
    }
    let rows = scratches
        .iter()
        .map(|s| {
            vec![
                s.identity.to_string(),
                state_label(s),
                s.live.to_string(),
                s.scratch
                    .as_ref()
                    .map(|m| m.branch.clone())
                    .unwrap_or_default(),
                s.url.clone(),
            ]
        })
        .collect();
    print_table(&["IDENTITY", "STATE", "LIVE", "BRANCH", "URL"], rows);
    Ok(())
}

pub fn status(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let status = ctl
        .status(name)
        .with_context(|| format!("failed to read scratch '{name}'"))?;

    if json {
        return print_json(&status);
    }
    println!("Scratch: {}", status.identity);
    println!("State:   {} ({})", state_label(&status), status.live);
    println!("URL:     {}", status.url);
    if let Some(m) = &status.scratch {
        println!("Branch:  {}", m.branch);
        if let Some(profile) = &m.profile {
            println!("Profile: {profile}");
        }
        if let Some(db) = &m.database {
            println!("DB:      {db}");
        }
        for f in &m.failures {
            println!("  failure: {f}");
        }
    }
    if let Some(err) = &status.runtime_error {
        println!("Runtime: {err}");
    }
    if !status.services.is_empty() {
        println!();
        let rows = status
            .services
            .iter()
            .map(|s| {
                vec![
                    s.service.clone(),
                    s.state.clone(),
                    if s.health.is_empty() {
                        "-".to_string()
                    } else {
                        s.health.clone()
                    },
                ]
            })
            .collect();
        print_table(&["SERVICE", "STATE", "HEALTH"], rows);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifecycle operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum LifecycleOp {
    Start,
    Stop,
    Restart,
    Rebuild,
    WipeDatabase,
}

impl LifecycleOp {
    fn verb(self) -> &'static str {
        match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Restart => "restart",
            LifecycleOp::Rebuild => "rebuild",
            LifecycleOp::WipeDatabase => "wipe the database of",
        }
    }
}

pub fn run(root: &Path, op: LifecycleOp, name: &str, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let result = match op {
        LifecycleOp::Start => ctl.start(name),
        LifecycleOp::Stop => ctl.stop(name),
        LifecycleOp::Restart => ctl.restart(name),
        LifecycleOp::Rebuild => ctl.rebuild(name),
        LifecycleOp::WipeDatabase => ctl.wipe_database(name),
    };
    let scratch: ScratchEnvironment =
        result.with_context(|| format!("failed to {} '{name}'", op.verb()))?;

    if json {
        print_json(&scratch)?;
    } else {
        println!("{}: {}", scratch.identity, scratch.state);
    }
    Ok(())
}

pub fn update(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let report = ctl
        .update(name)
        .with_context(|| format!("failed to update '{name}'"))?;

    if json {
        return print_json(&report);
    }
    if report.changed.is_empty() && report.removed.is_empty() && !report.redeployed {
        println!("{name}: up to date");
        return Ok(());
    }
    println!("{name}: updated");
    println!("  changed:   {}", joined(&report.changed));
    println!("  removed:   {}", joined(&report.removed));
    println!("  new env:   {}", joined(&report.env_added));
    Ok(())
}

pub fn delete(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    ctl.delete(name)
        .with_context(|| format!("failed to delete '{name}'"))?;

    if json {
        print_json(&serde_json::json!({ "deleted": name }))?;
    } else {
        println!("Deleted scratch '{name}'");
    }
    Ok(())
}
