//! Error types shared by the reconciliation engine and its collaborators.

use thiserror::Error;

/// Errors raised while wiring or running the agent.
///
/// Reconciler failures are deliberately absent: they are `anyhow::Error`
/// values that stay inside the engine and only drive retries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("controller manager was started more than once")]
    AlreadyStarted,

    #[error("cannot register reconciler {name}: manager already started")]
    WiringAfterStart { name: String },

    #[error("reconciler {0} not found")]
    ReconcilerNotFound(String),

    #[error("reconciler {name} is not a {expected}")]
    ReconcilerTypeMismatch { name: String, expected: &'static str },

    #[error("reconciler {name} is already registered")]
    DuplicateReconciler { name: String },

    #[error("unable to create reconciler {name}: {source}")]
    ReconcilerConstruction {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("options {0} and {1} are mutually exclusive")]
    MutuallyExclusive(&'static str, &'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("console error: {0}")]
    Console(#[from] ConsoleError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the remote console API.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl ConsoleError {
    /// `true` when the console reported that the requested object no longer exists.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
