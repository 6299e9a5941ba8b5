//! Shared application state.

use std::sync::Arc;

use crate::query::TenantQueries;
use crate::registry::SandboxRegistry;

/// State handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SandboxRegistry>,
    pub queries: Arc<TenantQueries>,
}

impl AppState {
    pub fn new(registry: Arc<SandboxRegistry>, queries: TenantQueries) -> Self {
        Self {
            registry,
            queries: Arc::new(queries),
        }
    }
}
