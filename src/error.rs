use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmsError {
    #[error("no domain named '{name}'")]
    #[diagnostic(help("run `vms list` to see the domains known to this connection"))]
    NotFound { name: String },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("{message}")]
    InvalidState { message: String },

    #[error("connection to {target} unusable: {message}")]
    #[diagnostic(help("ensure libvirtd is running and you have access to the connection URI"))]
    Connection { target: String, message: String },

    #[error("{message}")]
    Operation { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl VmsError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        VmsError::InvalidState {
            message: message.into(),
        }
    }

    /// Short machine-readable name of the error kind, used in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            VmsError::NotFound { .. } => "not_found",
            VmsError::InvalidPattern { .. } => "invalid_pattern",
            VmsError::InvalidState { .. } => "invalid_state",
            VmsError::Connection { .. } => "connection",
            VmsError::Operation { .. } => "operation",
            VmsError::Cancelled => "cancelled",
            VmsError::ConfigLoad { .. } | VmsError::ConfigParse { .. } => "config",
            VmsError::Validation { .. } => "validation",
        }
    }
}
