//! Error taxonomy for the `heatflow` pipeline.
//!
//! Each stage owns a typed error so the caller can tell a rejected login
//! apart from a broken window or a bad log line. None of the library code
//! retries; every error carries enough context (path, resource id, window
//! bounds, line number) for the orchestrator to decide whether to re-run
//! the whole batch.

use thiserror::Error;

use crate::models::Window;

pub type Result<T> = std::result::Result<T, Error>;

// ---

/// Umbrella error returned by the pipeline entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure below the request/response seam.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),
}

/// Login failed. Never retried by the library.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("authentication response did not contain a token")]
    MissingToken,

    #[error("authentication request failed: {0}")]
    Transport(#[from] TransportError),
}

/// The server answered, but not in the shape we expect.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{path}: unexpected HTTP {status}")]
    Status { path: String, status: u16 },

    #[error("{path}: malformed response: {reason}")]
    Malformed { path: String, reason: String },

    #[error("entity listing is empty")]
    NoEntity,

    #[error("{path}: request failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: TransportError,
    },
}

/// A single window failed, which fails the whole requested range.
#[derive(Debug, Error)]
#[error("fetching resource {resource_id} for {window}: {kind}")]
pub struct FetchError {
    pub resource_id: String,
    pub window: Window,
    pub kind: FetchErrorKind,
}

#[derive(Debug, Error)]
pub enum FetchErrorKind {
    #[error("{0}")]
    Transport(TransportError),

    #[error("unexpected HTTP {0}")]
    Status(u16),

    #[error("malformed readings payload: {0}")]
    Payload(String),

    #[error("range deadline exceeded")]
    Timeout,
}

/// An unparseable sensor-log line. `line` is 1-based.
#[derive(Debug, Error, PartialEq)]
#[error("line {line}: {reason}")]
pub struct MalformedRecordError {
    pub line: usize,
    pub reason: String,
}

/// Invalid static configuration, caught at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no external device configured")]
    NoExternal,

    #[error("more than one external device configured: {0:?}")]
    MultipleExternal(Vec<String>),

    #[error("no internal device configured")]
    NoInternal,

    #[error("device {0} is assigned both internal and external roles")]
    ConflictingRole(String),

    #[error("home {0:?} not found in configuration")]
    UnknownHome(String),

    #[error("{name} must be a positive whole number of seconds, got {seconds}s")]
    InvalidDuration { name: &'static str, seconds: i64 },

    #[error("range start {start} is after end {end}")]
    InvertedRange { start: String, end: String },
}
