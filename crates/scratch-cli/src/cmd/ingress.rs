use crate::cmd::controller;
use std::path::Path;

/// Print the static nginx server block. The proxy reaches the control API
/// at `upstream`, defaulting to the configured server port on loopback.
pub fn run(root: &Path, upstream: Option<&str>) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let upstream = upstream
        .map(str::to_string)
        .unwrap_or_else(|| format!("127.0.0.1:{}", ctl.config().server.port));
    print!("{}", ctl.ingress_rule(&upstream));
    Ok(())
}
