use crate::cmd::controller;
use crate::output::{joined, print_json};
use anyhow::{bail, Context};
use clap::Subcommand;
use scratch_core::lifecycle::EnvReport;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum EnvSubcommand {
    /// Print env files (all, or one)
    Show { name: String, file: Option<String> },

    /// Replace an env file, or set individual keys in it
    ///
    /// With KEY=VALUE arguments the keys are set in the current content;
    /// otherwise the new content is read from --from or stdin.
    Set {
        name: String,
        file: String,
        assignments: Vec<String>,
        #[arg(long, conflicts_with = "assignments")]
        from: Option<PathBuf>,
    },

    /// Re-render env files from their templates (all, or the named ones)
    Reset { name: String, files: Vec<String> },
}

pub fn run(root: &Path, subcmd: EnvSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        EnvSubcommand::Show { name, file } => show(root, &name, file.as_deref(), json),
        EnvSubcommand::Set {
            name,
            file,
            assignments,
            from,
        } => set(root, &name, &file, &assignments, from.as_deref(), json),
        EnvSubcommand::Reset { name, files } => reset(root, &name, files, json),
    }
}

fn show(root: &Path, name: &str, file: Option<&str>, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let mut files = ctl
        .read_env(name)
        .with_context(|| format!("failed to read env files of '{name}'"))?;
    if let Some(file) = file {
        let stem = scratch_core::envfile::validate_name(file)?;
        files.retain(|k, _| *k == stem);
        if files.is_empty() {
            bail!("'{name}' has no env file '{stem}'");
        }
    }

    if json {
        let map: BTreeMap<_, _> = files.into_iter().map(|(k, f)| (k, f.content)).collect();
        return print_json(&map);
    }
    let single = files.len() == 1;
    for (stem, f) in files {
        if !single {
            println!("# --- {stem}.env");
        }
        print!("{}", f.content);
        if !f.content.ends_with('\n') && !f.content.is_empty() {
            println!();
        }
    }
    Ok(())
}

fn set(
    root: &Path,
    name: &str,
    file: &str,
    assignments: &[String],
    from: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let content = if !assignments.is_empty() {
        let stem = scratch_core::envfile::validate_name(file)?;
        let current = ctl
            .read_env(name)
            .with_context(|| format!("failed to read env files of '{name}'"))?
            .remove(&stem)
            .map(|f| f.content)
            .unwrap_or_default();
        apply_assignments(&current, assignments)?
    } else if let Some(path) = from {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    } else {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read env content from stdin")?;
        buf
    };

    let files = BTreeMap::from([(file.to_string(), content)]);
    let report = ctl
        .write_env(name, &files)
        .with_context(|| format!("failed to write env file '{file}' of '{name}'"))?;
    print_report(name, &report, json)
}

fn reset(root: &Path, name: &str, files: Vec<String>, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let only = (!files.is_empty()).then_some(files);
    let report = ctl
        .reset_env(name, only.as_deref())
        .with_context(|| format!("failed to reset env files of '{name}'"))?;
    print_report(name, &report, json)
}

fn print_report(name: &str, report: &EnvReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    println!("{name}: {} changed", joined(&report.changed));
    if !report.redeployed.is_empty() {
        println!("  redeployed: {}", joined(&report.redeployed));
    }
    Ok(())
}

/// Set `KEY=VALUE` pairs in env file content. An existing key keeps its
/// line position; new keys are appended.
fn apply_assignments(content: &str, assignments: &[String]) -> anyhow::Result<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    for a in assignments {
        let Some((key, _)) = a.split_once('=') else {
            bail!("expected KEY=VALUE, got '{a}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("expected KEY=VALUE, got '{a}'");
        }
        let existing = lines.iter().position(|l| {
            let l = l.trim_start();
            let l = l.strip_prefix("export ").unwrap_or(l);
            l.split_once('=').is_some_and(|(k, _)| k.trim() == key)
        });
        match existing {
            Some(i) => lines[i] = a.clone(),
            None => lines.push(a.clone()),
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}
