//! Server and sandbox manager configuration.

use clap::Args;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::identity::is_plain_identifier;

/// Options for `querylab serve`. Every flag can also come from the
/// environment.
#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "SERVER_PORT", default_value = "8080")]
    pub port: u16,

    /// Database host
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value = "5432")]
    pub db_port: u16,

    /// Privileged role used to create, initialize and drop sandboxes
    #[arg(long, env = "DB_ADMIN_USER", default_value = "")]
    pub admin_user: String,

    #[arg(long, env = "DB_ADMIN_PASSWORD", default_value = "", hide_env_values = true)]
    pub admin_password: String,

    /// Low-trust role that runs user queries
    #[arg(long, env = "DB_SANDBOX_USER", default_value = "")]
    pub sandbox_user: String,

    #[arg(long, env = "DB_SANDBOX_PASSWORD", default_value = "", hide_env_values = true)]
    pub sandbox_password: String,

    /// Base (catalog) database the admin connects to for CREATE/DROP
    #[arg(long, env = "DB_NAME", default_value = "querylab")]
    pub base_db: String,

    /// SQL script run in every new sandbox
    #[arg(long, env = "INIT_SQL", default_value = "init.sql")]
    pub init_sql: PathBuf,

    /// Idle seconds before a session is evicted
    #[arg(long, env = "SESSION_TIMEOUT_SECS", default_value = "3600")]
    pub session_timeout_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// statement_timeout applied to the sandbox role, in milliseconds
    #[arg(long, env = "SANDBOX_STATEMENT_TIMEOUT_MS", default_value = "5000")]
    pub statement_timeout_ms: u64,

    /// work_mem applied to the sandbox role
    #[arg(long, env = "SANDBOX_WORK_MEM", default_value = "4MB")]
    pub work_mem: String,

    /// Maximum rows returned per query
    #[arg(long, env = "QUERY_MAX_ROWS", default_value = "1000")]
    pub max_rows: usize,

    /// Directory with the static frontend
    #[arg(long, env = "FRONTEND_DIR", default_value = "./frontend")]
    pub frontend_dir: PathBuf,

    /// Drop every sandbox database on shutdown
    #[arg(long, env = "DROP_SANDBOXES_ON_SHUTDOWN", default_value = "true", action = clap::ArgAction::Set)]
    pub drop_on_shutdown: bool,
}

/// Load a `.env` file from the working directory (or a parent) into the
/// process environment. Variables that are already set are kept. Returns the
/// file that was read, or `None` when there is none.
pub fn load_env_file() -> Result<Option<PathBuf>, dotenvy::Error> {
    env_file_outcome(dotenvy::dotenv())
}

fn env_file_outcome(
    loaded: Result<PathBuf, dotenvy::Error>,
) -> Result<Option<PathBuf>, dotenvy::Error> {
    match loaded {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// A role name and its password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-role limits applied inside each sandbox database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub statement_timeout: Duration,
    pub work_mem: String,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(5),
            work_mem: "4MB".to_string(),
        }
    }
}

/// Immutable configuration shared by the registry, the provisioner and the
/// query path.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    pub admin: Credential,
    pub sandbox: Credential,
    pub base_db: String,
    pub init_sql: PathBuf,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub limits: SandboxLimits,
    pub max_rows: usize,
}

impl ManagerConfig {
    /// Check everything that later gets interpolated into DDL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let idents = [
            ("DB_ADMIN_USER", &self.admin.user),
            ("DB_SANDBOX_USER", &self.sandbox.user),
            ("DB_NAME", &self.base_db),
        ];
        for (field, value) in idents {
            if value.is_empty() {
                return Err(ConfigError::Missing { field });
            }
            if !is_plain_identifier(value) {
                return Err(ConfigError::BadIdentifier {
                    field,
                    value: value.clone(),
                });
            }
        }
        if !is_work_mem(&self.limits.work_mem) {
            return Err(ConfigError::BadIdentifier {
                field: "SANDBOX_WORK_MEM",
                value: self.limits.work_mem.clone(),
            });
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "SESSION_TIMEOUT_SECS",
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "SWEEP_INTERVAL_SECS",
            });
        }
        Ok(())
    }
}

// `4MB`, `512kB`, `1GB` or a bare number of kilobytes.
fn is_work_mem(s: &str) -> bool {
    let digits = s.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && matches!(&s[digits..], "" | "kB" | "MB" | "GB")
}

impl TryFrom<&ServeArgs> for ManagerConfig {
    type Error = ConfigError;

    fn try_from(args: &ServeArgs) -> Result<Self, Self::Error> {
        let config = ManagerConfig {
            host: args.db_host.clone(),
            port: args.db_port,
            admin: Credential {
                user: args.admin_user.clone(),
                password: args.admin_password.clone(),
            },
            sandbox: Credential {
                user: args.sandbox_user.clone(),
                password: args.sandbox_password.clone(),
            },
            base_db: args.base_db.clone(),
            init_sql: args.init_sql.clone(),
            session_timeout: Duration::from_secs(args.session_timeout_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            limits: SandboxLimits {
                statement_timeout: Duration::from_millis(args.statement_timeout_ms),
                work_mem: args.work_mem.clone(),
            },
            max_rows: args.max_rows,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ManagerConfig {
    ManagerConfig {
        host: "localhost".to_string(),
        port: 5432,
        admin: Credential {
            user: "querylab_admin".to_string(),
            password: "admin-secret".to_string(),
        },
        sandbox: Credential {
            user: "sandbox_user".to_string(),
            password: "sandbox-secret".to_string(),
        },
        base_db: "querylab".to_string(),
        init_sql: PathBuf::from("init.sql"),
        session_timeout: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(60),
        limits: SandboxLimits::default(),
        max_rows: 1000,
    }
}
