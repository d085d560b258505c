// Error handling module
// Defines the error taxonomy for the workload engine

use std::path::PathBuf;

use thiserror::Error;

use crate::models::Role;

/// Failures of a single chat-completion call.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection, timeout or body transfer failure
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success status from the endpoint
    #[error("Endpoint error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Malformed or error-bearing stream event
    #[error("Stream protocol error: {0}")]
    Protocol(String),

    /// Agent slot has no model mapped to it
    #[error("No model configured for agent slot {0}")]
    UnknownAgent(usize),

    /// The unit of work never ran to completion on the dispatch worker
    #[error("Request aborted: {0}")]
    Aborted(String),
}

/// Failures of the dispatch bridge itself.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dispatch bridge is shut down")]
    Closed,

    #[error("Failed to start dispatch worker: {0}")]
    Startup(String),

    #[error("Unit of work panicked before completing")]
    Panicked,
}

impl From<DispatchError> for ClientError {
    fn from(err: DispatchError) -> Self {
        ClientError::Aborted(err.to_string())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConversationError {
    #[error("Role order violated: {found} cannot follow {previous:?}")]
    RoleOrder { previous: Option<Role>, found: Role },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {user_id} already issued {issued} request(s); fast-forward must precede the first request")]
    AlreadyStarted { user_id: u64, issued: usize },
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to read trace file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed trace record: {0}")]
    Malformed(String),

    #[error("Trace file {0} contains no usable records")]
    Empty(PathBuf),
}

#[derive(Error, Debug, PartialEq)]
pub enum MetricsError {
    #[error("No data: {0}")]
    NoData(String),

    #[error("Histogram error: {0}")]
    Histogram(String),
}

/// Contradictory or invalid startup configuration. Always fatal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("When --trace-file is used, you may not pass: {0}")]
    TraceConflict(String),

    #[error("Workload '{workload}' requires: {missing}")]
    Missing { workload: String, missing: String },

    #[error("Invalid value for {flag}: {reason}")]
    Invalid { flag: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write results to {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to flush results to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
