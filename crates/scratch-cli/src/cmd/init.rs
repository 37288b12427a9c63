use anyhow::Context;
use scratch_core::config::{DEFAULT_CONFIG, DEFAULT_ENV_TEMPLATE};
use scratch_core::{io, paths};
use std::path::Path;

const EXAMPLE_TEMPLATE: &str = "backend.env";

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing scratch in: {}", root.display());

    let config_path = paths::config_path(root);
    report(
        paths::CONFIG_FILE,
        io::write_if_missing(&config_path, DEFAULT_CONFIG.as_bytes())
            .with_context(|| format!("failed to write {}", config_path.display()))?,
    );

    let templates = root.join(paths::DEFAULT_ENV_TEMPLATES_DIR);
    io::ensure_dir(&templates)
        .with_context(|| format!("failed to create {}", templates.display()))?;
    let template = templates.join(EXAMPLE_TEMPLATE);
    report(
        &format!("{}/{EXAMPLE_TEMPLATE}", paths::DEFAULT_ENV_TEMPLATES_DIR),
        io::write_if_missing(&template, DEFAULT_ENV_TEMPLATE.as_bytes())
            .with_context(|| format!("failed to write {}", template.display()))?,
    );

    let releases = root.join(paths::DEFAULT_RELEASES_DIR);
    io::ensure_dir(&releases)
        .with_context(|| format!("failed to create {}", releases.display()))?;

    println!("\nNext: scratch config validate && scratch create <branch>");
    Ok(())
}

fn report(path: &str, created: bool) {
    if created {
        println!("  created: {path}");
    } else {
        println!("  exists:  {path}");
    }
}
