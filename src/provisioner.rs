//! Creating, initializing, locking down and dropping sandbox databases.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::{ManagerConfig, SandboxLimits};
use crate::connection::{close, Connector};
use crate::error::{ProvisionStep, SandboxError};
use crate::identity::{quote_ident, DatabaseName, SANDBOX_PREFIX};

/// Administrative operations on sandbox databases.
///
/// Every method opens its own admin connection. Implementations must make
/// `drop_database` idempotent.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_database(&self, name: &DatabaseName) -> Result<(), SandboxError>;

    /// Run the init script inside `name`.
    async fn initialize_database(&self, name: &DatabaseName) -> Result<(), SandboxError>;

    /// Give the low-trust role its scoped privileges inside `name`.
    async fn grant_sandbox_privileges(&self, name: &DatabaseName) -> Result<(), SandboxError>;

    async fn drop_database(&self, name: &DatabaseName) -> Result<(), SandboxError>;

    /// Every sandbox database currently present on the server.
    async fn list_sandbox_databases(&self) -> Result<Vec<DatabaseName>, SandboxError>;

    /// Check that an admin connection can be opened.
    async fn ping(&self) -> Result<(), SandboxError>;
}

/// Run create, init and grant in order. If init or grant fails the database
/// is dropped before the error is returned. A failed create is not rolled
/// back, since the name may belong to a database we never made.
pub async fn provision(
    provisioner: &dyn Provisioner,
    name: &DatabaseName,
) -> Result<(), SandboxError> {
    provisioner.create_database(name).await?;

    let built = async {
        provisioner.initialize_database(name).await?;
        provisioner.grant_sandbox_privileges(name).await
    }
    .await;

    if let Err(e) = built {
        warn!(database = %name, error = %e, "provisioning failed, rolling back");
        if let Err(drop_err) = provisioner.drop_database(name).await {
            warn!(database = %name, error = %drop_err, "rollback drop failed");
        }
        return Err(e);
    }
    Ok(())
}

/// The statements that fence the low-trust role into one sandbox, in the
/// order they are applied.
pub fn grant_statements(
    database: &DatabaseName,
    role: &str,
    base_db: &str,
    limits: &SandboxLimits,
) -> Vec<String> {
    let db = database.quoted();
    let role = quote_ident(role);
    let base = quote_ident(base_db);
    let timeout_ms = limits.statement_timeout.as_millis();
    vec![
        format!("GRANT CONNECT, TEMPORARY ON DATABASE {db} TO {role}"),
        format!("GRANT USAGE, CREATE ON SCHEMA public TO {role}"),
        format!("GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA public TO {role}"),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA public \
             GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {role}"
        ),
        format!("GRANT USAGE, SELECT, UPDATE ON ALL SEQUENCES IN SCHEMA public TO {role}"),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA public \
             GRANT USAGE, SELECT, UPDATE ON SEQUENCES TO {role}"
        ),
        // Only fences the base database once PUBLIC has lost CONNECT on it.
        format!("REVOKE ALL ON DATABASE {base} FROM {role}"),
        format!("REVOKE CREATE ON SCHEMA information_schema FROM {role}"),
        format!("REVOKE CREATE ON SCHEMA pg_catalog FROM {role}"),
        format!("ALTER ROLE {role} IN DATABASE {db} SET statement_timeout = '{timeout_ms}ms'"),
        format!("ALTER ROLE {role} IN DATABASE {db} SET work_mem = '{}'", limits.work_mem),
        format!("ALTER ROLE {role} IN DATABASE {db} SET allow_system_table_mods = off"),
    ]
}

/// [`Provisioner`] backed by a PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PgProvisioner {
    connector: Connector,
    admin_user: String,
    sandbox_user: String,
    base_db: String,
    init_sql: PathBuf,
    limits: SandboxLimits,
}

impl PgProvisioner {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            connector: Connector::new(config),
            admin_user: config.admin.user.clone(),
            sandbox_user: config.sandbox.user.clone(),
            base_db: config.base_db.clone(),
            init_sql: config.init_sql.clone(),
            limits: config.limits.clone(),
        }
    }
}

fn failed(step: ProvisionStep, name: &DatabaseName) -> impl FnOnce(sqlx::Error) -> SandboxError + '_ {
    move |source| SandboxError::Provisioning {
        step,
        database: name.to_string(),
        source,
    }
}

#[async_trait]
impl Provisioner for PgProvisioner {
    async fn create_database(&self, name: &DatabaseName) -> Result<(), SandboxError> {
        let stmt = format!(
            "CREATE DATABASE {} OWNER {}",
            name.quoted(),
            quote_ident(&self.admin_user)
        );
        let mut conn = self.connector.admin_catalog().await?;
        sqlx::Executor::execute(&mut conn, sqlx::raw_sql(&stmt))
            .await
            .map_err(failed(ProvisionStep::Create, name))?;
        close(conn).await;
        info!(database = %name, "created sandbox database");
        Ok(())
    }

    async fn initialize_database(&self, name: &DatabaseName) -> Result<(), SandboxError> {
        let script = tokio::fs::read_to_string(&self.init_sql)
            .await
            .map_err(|source| SandboxError::InitScript {
                path: self.init_sql.display().to_string(),
                source,
            })?;
        let mut conn = self.connector.admin_sandbox(name.as_str()).await?;
        sqlx::Executor::execute(&mut conn, sqlx::raw_sql(&script))
            .await
            .map_err(failed(ProvisionStep::Initialize, name))?;
        close(conn).await;
        debug!(database = %name, "ran init script");
        Ok(())
    }

    async fn grant_sandbox_privileges(&self, name: &DatabaseName) -> Result<(), SandboxError> {
        let statements = grant_statements(name, &self.sandbox_user, &self.base_db, &self.limits);
        let mut conn = self.connector.admin_sandbox(name.as_str()).await?;
        for stmt in &statements {
            sqlx::Executor::execute(&mut conn, sqlx::raw_sql(stmt))
                .await
                .map_err(failed(ProvisionStep::Grant, name))?;
        }
        close(conn).await;
        debug!(database = %name, role = %self.sandbox_user, "granted sandbox privileges");
        Ok(())
    }

    async fn drop_database(&self, name: &DatabaseName) -> Result<(), SandboxError> {
        // FORCE terminates tenant connections still attached to the sandbox.
        let stmt = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", name.quoted());
        let mut conn = self.connector.admin_catalog().await?;
        sqlx::Executor::execute(&mut conn, sqlx::raw_sql(&stmt))
            .await
            .map_err(failed(ProvisionStep::Drop, name))?;
        close(conn).await;
        info!(database = %name, "dropped sandbox database");
        Ok(())
    }

    async fn list_sandbox_databases(&self) -> Result<Vec<DatabaseName>, SandboxError> {
        let mut conn = self.connector.admin_catalog().await?;
        let names = sqlx::query_scalar::<_, String>(
            "SELECT datname FROM pg_database WHERE datistemplate = false AND starts_with(datname, $1)",
        )
        .bind(SANDBOX_PREFIX)
        .fetch_all(&mut conn)
        .await
        .map_err(|source| SandboxError::Connection {
            user: self.admin_user.clone(),
            database: self.base_db.clone(),
            source,
        })?;
        close(conn).await;
        Ok(names
            .iter()
            .filter_map(|n| DatabaseName::from_catalog(n).ok())
            .collect())
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        let mut conn = self.connector.admin_catalog().await?;
        let result = sqlx::Executor::execute(&mut conn, sqlx::raw_sql("SELECT 1")).await;
        close(conn).await;
        result.map(|_| ()).map_err(|source| SandboxError::Connection {
            user: self.admin_user.clone(),
            database: self.base_db.clone(),
            source,
        })
    }
}

/// In-memory provisioner with failure injection, for registry and router
/// tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct FakeProvisioner {
        live: Mutex<HashSet<DatabaseName>>,
        pub(crate) fail_create: AtomicBool,
        pub(crate) fail_init: AtomicBool,
        pub(crate) fail_grant: AtomicBool,
        pub(crate) fail_drop: AtomicBool,
        pub(crate) creates: AtomicUsize,
        pub(crate) drops: AtomicUsize,
        delay: Duration,
    }

    impl FakeProvisioner {
        /// Every create sleeps for `delay`, so concurrent callers overlap.
        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub(crate) fn live(&self) -> HashSet<DatabaseName> {
            self.live.lock().unwrap().clone()
        }

        pub(crate) fn is_live(&self, name: &DatabaseName) -> bool {
            self.live.lock().unwrap().contains(name)
        }

        /// Pretend a database exists that the registry never created.
        pub(crate) fn insert_stray(&self, name: DatabaseName) {
            self.live.lock().unwrap().insert(name);
        }
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn create_database(&self, name: &DatabaseName) -> Result<(), SandboxError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(SandboxError::Injected(ProvisionStep::Create));
            }
            self.live.lock().unwrap().insert(name.clone());
            Ok(())
        }

        async fn initialize_database(&self, _name: &DatabaseName) -> Result<(), SandboxError> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(SandboxError::Injected(ProvisionStep::Initialize));
            }
            Ok(())
        }

        async fn grant_sandbox_privileges(&self, _name: &DatabaseName) -> Result<(), SandboxError> {
            if self.fail_grant.load(Ordering::SeqCst) {
                return Err(SandboxError::Injected(ProvisionStep::Grant));
            }
            Ok(())
        }

        async fn drop_database(&self, name: &DatabaseName) -> Result<(), SandboxError> {
            self.drops.fetch_add(1, Ordering::SeqCst);
            if self.fail_drop.load(Ordering::SeqCst) {
                return Err(SandboxError::Injected(ProvisionStep::Drop));
            }
            self.live.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_sandbox_databases(&self) -> Result<Vec<DatabaseName>, SandboxError> {
            Ok(self.live().into_iter().collect())
        }

        async fn ping(&self) -> Result<(), SandboxError> {
            Ok(())
        }
    }
}
