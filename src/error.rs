//! Error types for reconcile-rs.

use thiserror::Error;

/// Boxed error used for causes coming from user code (sources, reconcilers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fatal controller errors. Anything in here aborts `Controller::start`.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "controller was started more than once; this is likely caused by registering it with a supervisor twice"
    )]
    AlreadyStarted,

    #[error("failed to start source {name}: {cause}")]
    SourceStart {
        name: String,
        #[source]
        cause: BoxError,
    },

    #[error("failed to wait for {controller} caches to sync {name}: {cause}")]
    SourceSync {
        controller: String,
        name: String,
        #[source]
        cause: BoxError,
    },

    #[error(
        "timed out waiting for source {name} to start; ensure that its start method is non-blocking"
    )]
    SourceTimeout { name: String },

    #[error("source task for {name} did not complete: {reason}")]
    SourceTask { name: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
