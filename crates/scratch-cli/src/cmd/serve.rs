use std::path::Path;

pub fn run(root: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(scratch_server::serve(root, host, port))
}
