//! Error types for sandbox provisioning and configuration.

use thiserror::Error;

/// Step of the provisioning pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Create,
    Initialize,
    Grant,
    Drop,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self {
            ProvisionStep::Create => "create",
            ProvisionStep::Initialize => "initialize",
            ProvisionStep::Grant => "grant",
            ProvisionStep::Drop => "drop",
        };
        f.write_str(step)
    }
}

/// Errors surfaced by the sandbox registry and provisioner.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The database engine could not be reached with the given credential.
    #[error("cannot connect to database {database} as {user}: {source}")]
    Connection {
        user: String,
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// A create, init or grant statement failed.
    #[error("{step} step failed for {database}: {source}")]
    Provisioning {
        step: ProvisionStep,
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("cannot read init script {path}: {source}")]
    InitScript {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// Only produced by in-memory provisioners used in tests.
    #[cfg(test)]
    #[error("injected {0} failure")]
    Injected(ProvisionStep),
}

impl SandboxError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SandboxError::Connection { .. })
    }
}

/// Invalid startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be set")]
    Missing { field: &'static str },

    #[error("{field} {value:?} is not a plain lowercase identifier")]
    BadIdentifier { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}
