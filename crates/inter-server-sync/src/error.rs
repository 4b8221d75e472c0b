//! Error types for the inter-server-sync library.

use thiserror::Error;

/// Main error type for export and import operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or protocol error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Schema metadata is missing or inconsistent
    #[error("Schema error: {0}")]
    Schema(String),

    /// A statement issued against the source failed
    #[error("Query failed: {message}\n  Statement: {sql}")]
    Query { sql: String, message: String },

    /// The bundle was produced by a different product or version
    #[error(
        "Wrong version detected. Bundle: {bundle_product} {bundle_version}; \
         server: {server_product} {server_version}"
    )]
    VersionMismatch {
        bundle_product: String,
        bundle_version: String,
        server_product: String,
        server_version: String,
    },

    /// Export bundle is missing files or is not usable
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// An external tool (rsync, spacecmd) failed
    #[error("Command {command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was interrupted (SIGINT, SIGTERM)
    #[error("Run cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Query error for a failing statement
    pub fn query(sql: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Query {
            sql: sql.into(),
            message: message.to_string(),
        }
    }

    /// Create an ExternalCommand error
    pub fn command(command: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::ExternalCommand {
            command: command.into(),
            message: message.to_string(),
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 1,
            SyncError::Database(_) | SyncError::Pool { .. } => 2,
            SyncError::Schema(_) | SyncError::Query { .. } => 3,
            SyncError::VersionMismatch { .. } => 4,
            SyncError::Bundle(_) => 5,
            SyncError::ExternalCommand { .. } => 6,
            SyncError::Io(_) => 7,
            SyncError::Json(_) => 10,
            SyncError::Cancelled => 10,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
