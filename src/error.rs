//! Error types for the tunnel engine and configuration loading.
//!
//! HTTP handlers never surface these directly; the router and route modules
//! map each variant to a status code at the edge.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of a single tunnel's connection pool.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The pool was destroyed, or was destroyed while this borrow was waiting.
    #[error("tunnel agent closed")]
    Closed,

    /// No remote connection became available before the deadline.
    #[error("no tunnel connection available within {0:?}")]
    Timeout(Duration),

    /// The pool could not open its listening socket.
    #[error("failed to bind tunnel listener: {0}")]
    Bind(#[source] io::Error),
}

/// Failures of tunnel registration.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A live tunnel already owns this id.
    #[error("subdomain {0} is already in use")]
    IdInUse(String),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Failures while relaying a protocol upgrade to the backend.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("upgrade i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed backend response head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("backend response head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("backend closed the connection before sending a response head")]
    ClosedBeforeHead,

    #[error("backend sent an invalid status code")]
    InvalidStatus,
}

/// Failures while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
