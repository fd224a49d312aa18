//! Error types for gantry operations

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while provisioning or tearing down a fleet.
///
/// Configuration errors are raised before any cloud resource exists. Resolution
/// errors are scoped to a single host. Operation errors carry the provider's
/// own code and message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A `port/proto` entry that does not parse
    #[error("{0}")]
    InvalidPort(String),

    /// A host names neither an image nor an image family (or both)
    #[error("host {host}: {reason}")]
    MissingImageSelector { host: String, reason: &'static str },

    /// None of the candidate SSH key paths exist
    #[error("could not find {kind} SSH key, tried: {}", display_paths(.tried))]
    KeyNotFound {
        kind: &'static str,
        tried: Vec<PathBuf>,
    },

    /// A named resource does not exist in the provider
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// A long-running operation finished with an embedded error
    #[error("operation on {resource} failed: [{code}] {message}")]
    Operation {
        resource: String,
        code: String,
        message: String,
    },

    /// The instance was created but has no NAT address to reach it on
    #[error("instance {0} has no external address")]
    NoExternalAddress(String),

    /// Gave up waiting on an operation; its outcome is unknown
    #[error("timed out after {waited:?} waiting for operation {operation}; its outcome is unknown")]
    OperationTimeout { operation: String, waited: Duration },

    /// Non-success HTTP status from the provider API
    #[error("compute api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Network level failure talking to the provider
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Could not obtain or use credentials
    #[error("authorization error: {0}")]
    Auth(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A root-access bootstrap step failed on a host
    #[error("bootstrap of {host} failed during {step}: {message}")]
    Bootstrap {
        host: String,
        step: &'static str,
        message: String,
    },

    /// Work was not started because the run was cancelled
    #[error("cancelled before {0} started")]
    Cancelled(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("'{}'", p.display()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// The resource is already gone; deletes treat this as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api { status, .. } => *status == 404,
            Self::Operation { code, .. } => code == "RESOURCE_NOT_FOUND",
            _ => false,
        }
    }

    /// The insert collided with an existing resource of the same name.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 409,
            Self::Operation { code, .. } => code == "RESOURCE_ALREADY_EXISTS",
            _ => false,
        }
    }

    /// Transport, throttling, server-side and rejected-token failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::OperationTimeout { .. } => true,
            Self::Api { status, .. } => matches!(*status, 401 | 429 | 500..=599),
            _ => false,
        }
    }

    /// Whether the request certainly had no effect, so even a
    /// non-idempotent call can be sent again.
    pub fn is_retryable_before_send(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_connect(),
            Self::Api { status, .. } => matches!(*status, 401 | 429),
            _ => false,
        }
    }
}
