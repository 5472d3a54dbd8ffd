// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// The main error enum, representing all possible failures within ACE.
/// Using `thiserror` allows for clean error definitions and automatic
/// `From` trait implementations.
#[derive(Error, Debug)]
pub enum AceError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cluster '{0}' not found")]
    ClusterNotFound(String),

    #[error("Invalid cluster spec: {0}")]
    InvalidClusterSpec(String),

    #[error("No primary key or replica-identity unique key on table '{0}'")]
    NoKey(String),

    #[error("Schema divergence: {0}")]
    SchemaDivergence(String),

    #[error("Partial hash failure: {0}")]
    PartialHashFailure(String),

    #[error("Task '{0}' already reached a terminal state")]
    AlreadyTerminal(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Authentication failure: {0}")]
    Auth(String),

    #[error("Connection refused by node '{node}': {detail}")]
    ConnectRefused { node: String, detail: String },

    #[error("Authentication failed on node '{node}'")]
    AuthFailed { node: String },

    #[error("Statement timed out on node '{node}'")]
    StatementTimeout { node: String },

    #[error("SQL Error: {0}")]
    Sql(String),

    #[error("Repair Error: {0}")]
    RepairError(String),

    #[error("Diff file error: {0}")]
    DiffFile(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl AceError {
    /// A short machine-readable tag, persisted alongside the message in a
    /// failed task's result.
    pub fn kind(&self) -> &'static str {
        match self {
            AceError::Io(_) => "io",
            AceError::ClusterNotFound(_) => "cluster_not_found",
            AceError::InvalidClusterSpec(_) => "invalid_cluster_spec",
            AceError::NoKey(_) => "no_key",
            AceError::SchemaDivergence(_) => "schema_divergence",
            AceError::PartialHashFailure(_) => "partial_hash_failure",
            AceError::AlreadyTerminal(_) => "already_terminal",
            AceError::TaskNotFound(_) => "task_not_found",
            AceError::Validation(_) => "validation",
            AceError::Auth(_) => "auth",
            AceError::ConnectRefused { .. } => "connect_refused",
            AceError::AuthFailed { .. } => "auth_failed",
            AceError::StatementTimeout { .. } => "statement_timeout",
            AceError::Sql(_) => "sql",
            AceError::RepairError(_) => "repair",
            AceError::DiffFile(_) => "diff_file",
            AceError::Internal(_) => "internal",
        }
    }

    /// Whether the failure is worth one retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AceError::Io(_)
                | AceError::ConnectRefused { .. }
                | AceError::StatementTimeout { .. }
        )
    }

    /// Classifies a driver error observed while talking to `node`. Statement
    /// timeouts and bad credentials get their own variants so that callers
    /// can decide on retries; everything else is surfaced verbatim.
    pub fn from_pg(e: tokio_postgres::Error, node: &str) -> Self {
        match e.code() {
            Some(code) if *code == SqlState::QUERY_CANCELED => AceError::StatementTimeout {
                node: node.to_string(),
            },
            Some(code)
                if *code == SqlState::INVALID_PASSWORD
                    || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
            {
                AceError::AuthFailed {
                    node: node.to_string(),
                }
            }
            Some(_) => AceError::Sql(format!("node '{node}': {e}")),
            // No SQLSTATE means the failure happened below the protocol,
            // typically a refused or dropped connection.
            None => AceError::ConnectRefused {
                node: node.to_string(),
                detail: e.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for AceError {
    fn from(e: serde_json::Error) -> Self {
        AceError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<uuid::Error> for AceError {
    fn from(e: uuid::Error) -> Self {
        AceError::Internal(format!("Failed to generate UUID: {e}"))
    }
}
