use crate::cmd::controller;
use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;

pub fn container(
    root: &Path,
    name: &str,
    service: Option<&str>,
    tail: Option<usize>,
) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let output = ctl
        .logs(name, service, tail)
        .with_context(|| format!("failed to read logs of '{name}'"))?;
    print!("{output}");
    Ok(())
}

pub fn oplogs(root: &Path, name: &str, file: Option<&str>, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;

    if let Some(file) = file {
        let text = ctl
            .oplog(name, file)
            .with_context(|| format!("failed to read operation log '{file}'"))?;
        print!("{text}");
        return Ok(());
    }

    let entries = ctl
        .oplogs(name)
        .with_context(|| format!("failed to list operation logs of '{name}'"))?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No operation logs for '{name}'.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.operation.clone(),
                e.file.clone(),
            ]
        })
        .collect();
    print_table(&["STARTED", "OPERATION", "FILE"], rows);
    Ok(())
}
