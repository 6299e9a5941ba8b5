//! Short-lived database connections.
//!
//! Nothing here is pooled. Every provisioning step and every tenant query
//! opens its own connection and closes it before returning.

use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;
use tracing::{debug, warn};

use crate::config::{Credential, ManagerConfig};
use crate::error::SandboxError;

/// Opens connections as either the admin or the low-trust role.
#[derive(Debug, Clone)]
pub struct Connector {
    host: String,
    port: u16,
    admin: Credential,
    sandbox: Credential,
    base_db: String,
}

impl Connector {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            admin: config.admin.clone(),
            sandbox: config.sandbox.clone(),
            base_db: config.base_db.clone(),
        }
    }

    /// Admin connection to the base database, for CREATE/DROP DATABASE.
    pub async fn admin_catalog(&self) -> Result<PgConnection, SandboxError> {
        self.open(&self.admin, &self.base_db).await
    }

    /// Admin connection to a sandbox database, for init scripts and grants.
    pub async fn admin_sandbox(&self, database: &str) -> Result<PgConnection, SandboxError> {
        self.open(&self.admin, database).await
    }

    /// Low-trust connection used to run tenant SQL.
    pub async fn tenant(&self, database: &str) -> Result<PgConnection, SandboxError> {
        self.open(&self.sandbox, database).await
    }

    async fn open(&self, cred: &Credential, database: &str) -> Result<PgConnection, SandboxError> {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&cred.user)
            .password(&cred.password)
            .database(database)
            .ssl_mode(PgSslMode::Disable);
        debug!(user = %cred.user, database, "opening connection");
        PgConnection::connect_with(&options)
            .await
            .map_err(|source| SandboxError::Connection {
                user: cred.user.clone(),
                database: database.to_string(),
                source,
            })
    }
}

/// Close a connection, logging rather than failing if the goodbye is lost.
/// Dropping a `PgConnection` also closes the socket, so error paths that
/// return early with `?` still release it.
pub async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "error closing connection");
    }
}
