use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File and directory names
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "scratch.yaml";
pub const DEFAULT_RELEASES_DIR: &str = "releases";
pub const DEFAULT_ENV_TEMPLATES_DIR: &str = "templates/env";

pub const SHARED_DIR: &str = ".shared";
pub const MANIFEST_FILE: &str = ".scratch.yaml";
pub const DESCRIPTOR_FILE: &str = "compose.yaml";
pub const LOGS_DIR: &str = "logs";
pub const SOCKETS_DIR: &str = "sockets";
pub const ENV_DIR: &str = "env";

pub const SOCKET_EXT: &str = "sock";
pub const ENV_EXT: &str = "env";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn scratch_dir(releases: &Path, identity: &str) -> PathBuf {
    releases.join(identity)
}

pub fn manifest_path(releases: &Path, identity: &str) -> PathBuf {
    scratch_dir(releases, identity).join(MANIFEST_FILE)
}

pub fn descriptor_path(releases: &Path, identity: &str) -> PathBuf {
    scratch_dir(releases, identity).join(DESCRIPTOR_FILE)
}

pub fn logs_dir(releases: &Path, identity: &str) -> PathBuf {
    scratch_dir(releases, identity).join(LOGS_DIR)
}

pub fn sockets_dir(releases: &Path, identity: &str) -> PathBuf {
    scratch_dir(releases, identity).join(SOCKETS_DIR)
}

pub fn socket_path(releases: &Path, identity: &str, service: &str) -> PathBuf {
    sockets_dir(releases, identity).join(format!("{service}.{SOCKET_EXT}"))
}

pub fn env_dir(releases: &Path, identity: &str) -> PathBuf {
    scratch_dir(releases, identity).join(ENV_DIR)
}

pub fn env_file_path(releases: &Path, identity: &str, name: &str) -> PathBuf {
    env_dir(releases, identity).join(format!("{name}.{ENV_EXT}"))
}

pub fn shared_dir(releases: &Path) -> PathBuf {
    releases.join(SHARED_DIR)
}

pub fn shared_descriptor_path(releases: &Path) -> PathBuf {
    shared_dir(releases).join(DESCRIPTOR_FILE)
}

/// Strip the `.env` extension from a template or env file name.
pub fn env_name(file_name: &str) -> &str {
    file_name
        .strip_suffix(&format!(".{ENV_EXT}"))
        .unwrap_or(file_name)
}
