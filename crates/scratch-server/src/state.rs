use chrono::{DateTime, Utc};
use scratch_core::{routing, Controller};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub controller: Arc<Controller>,
    /// Fallback page template, read once at startup.
    pub fallback: Arc<str>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: Controller) -> Self {
        let root = controller.root().to_path_buf();
        let fallback = routing::fallback_template(controller.config(), &root);
        Self {
            root,
            controller: Arc::new(controller),
            fallback: fallback.into(),
            started_at: Utc::now(),
        }
    }

    /// Load `scratch.yaml` under `root` and drive the real container runtime.
    pub fn load(root: &Path) -> scratch_core::Result<Self> {
        Ok(Self::new(Controller::load(root)?))
    }
}
