use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("config file not found: run 'scratch init'")]
    ConfigNotFound,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("invalid identity '{0}': must contain at least one of [a-z0-9_-]")]
    InvalidIdentity(String),

    #[error("identity '{0}' is reserved for the control plane")]
    ReservedIdentity(String),

    #[error("scratch not found: {0}")]
    NotFound(String),

    #[error("scratch '{identity}' is busy: {operation} in progress")]
    Busy { identity: String, operation: String },

    #[error("scratch '{identity}' cannot go from {from} to {to}")]
    InvalidTransition {
        identity: String,
        from: String,
        to: String,
    },

    #[error("invalid path '{0}': must stay inside the scratch env directory")]
    InvalidPath(String),

    #[error("command failed with exit code {exit_code}: {stderr}")]
    ScriptFailure { exit_code: i32, stderr: String },

    #[error("no routing endpoint for '{identity}' service '{service}'")]
    RoutingUnavailable { identity: String, service: String },

    #[error("scratch '{identity}' is degraded: {}", reasons.join("; "))]
    Degraded {
        identity: String,
        reasons: Vec<String>,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("no database configured for this project")]
    NoDatabase,

    #[error("failed to spawn '{program}': {message}")]
    SpawnFailed { program: String, message: String },

    #[error("command cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScratchError>;
