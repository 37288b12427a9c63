use crate::cmd::controller;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum SharedSubcommand {
    /// Live state of the shared services
    List,
    /// Start shared services (all when none are named)
    Start { services: Vec<String> },
    /// Stop shared services (all when none are named)
    Stop { services: Vec<String> },
}

pub fn run(root: &Path, subcmd: SharedSubcommand, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    match subcmd {
        SharedSubcommand::List => {
            let services = ctl.list_shared().context("failed to query shared services")?;
            if json {
                return print_json(&services);
            }
            if services.is_empty() {
                println!("No shared services running.");
                return Ok(());
            }
            let rows = services
                .iter()
                .map(|s| vec![s.service.clone(), s.state.clone(), s.health.clone()])
                .collect();
            print_table(&["SERVICE", "STATE", "HEALTH"], rows);
            Ok(())
        }
        SharedSubcommand::Start { services } => {
            ctl.start_shared(&services)
                .context("failed to start shared services")?;
            if json {
                print_json(&serde_json::json!({ "started": services }))
            } else {
                println!("Shared services started.");
                Ok(())
            }
        }
        SharedSubcommand::Stop { services } => {
            ctl.stop_shared(&services)
                .context("failed to stop shared services")?;
            if json {
                print_json(&serde_json::json!({ "stopped": services }))
            } else {
                println!("Shared services stopped.");
                Ok(())
            }
        }
    }
}
