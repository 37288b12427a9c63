pub mod config;
pub mod env;
pub mod ingress;
pub mod init;
pub mod logs;
pub mod scratch;
pub mod serve;
pub mod shared;

use anyhow::Context;
use scratch_core::Controller;
use std::path::Path;

/// Load the controller for `root`, with the config path in the error chain.
pub fn controller(root: &Path) -> anyhow::Result<Controller> {
    Controller::load(root).with_context(|| {
        format!(
            "failed to load {}",
            scratch_core::paths::config_path(root).display()
        )
    })
}
