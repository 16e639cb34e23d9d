//! Tenant limits.
//!
//! The registry is read on every admission, so lookups are synchronous and
//! served from memory. [`InMemoryTenantRegistry::spawn_refresh`] keeps the
//! cache in step with the `tenants` table.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use db::DbPool;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Ceilings applied to one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantLimits {
    pub max_concurrent_executions: usize,
    pub max_steps_per_workflow: usize,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            max_steps_per_workflow: 100,
        }
    }
}

/// Resolves a tenant to its limits.
pub trait TenantRegistry: Send + Sync {
    fn limits(&self, tenant_id: Uuid) -> TenantLimits;
}

/// Lock-protected map of tenant limits with a fallback for unknown tenants.
#[derive(Debug)]
pub struct InMemoryTenantRegistry {
    defaults: TenantLimits,
    tenants: RwLock<HashMap<Uuid, TenantLimits>>,
}

impl InMemoryTenantRegistry {
    pub fn new(defaults: TenantLimits) -> Self {
        Self {
            defaults,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, tenant_id: Uuid, limits: TenantLimits) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id, limits);
    }

    /// Swap the whole table in one step.
    pub fn replace_all(&self, tenants: HashMap<Uuid, TenantLimits>) {
        *self.tenants.write().unwrap_or_else(PoisonError::into_inner) = tenants;
    }

    /// Reload every tenant from the database. Returns how many were loaded.
    pub async fn refresh_from_db(&self, pool: &DbPool) -> Result<usize, db::DbError> {
        let rows = db::repository::tenants::list_tenants(pool).await?;
        let tenants: HashMap<Uuid, TenantLimits> = rows
            .into_iter()
            .map(|row| {
                (
                    row.id,
                    TenantLimits {
                        max_concurrent_executions: row.max_concurrent_executions.max(0) as usize,
                        max_steps_per_workflow: row.max_steps_per_workflow.max(0) as usize,
                    },
                )
            })
            .collect();
        let count = tenants.len();
        self.replace_all(tenants);
        debug!(count, "tenant limits refreshed");
        Ok(count)
    }

    /// Reload from the database every `interval` until the task is aborted.
    /// A failed reload keeps the previous table.
    pub fn spawn_refresh(self: Arc<Self>, pool: DbPool, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh_from_db(&pool).await {
                    warn!("tenant refresh failed, keeping cached limits: {e}");
                }
            }
        })
    }
}

impl TenantRegistry for InMemoryTenantRegistry {
    fn limits(&self, tenant_id: Uuid) -> TenantLimits {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .copied()
            .unwrap_or(self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tenant_gets_defaults() {
        let defaults = TenantLimits { max_concurrent_executions: 2, max_steps_per_workflow: 7 };
        let registry = InMemoryTenantRegistry::new(defaults);
        assert_eq!(registry.limits(Uuid::new_v4()), defaults);
    }

    #[test]
    fn replace_all_drops_previous_entries() {
        let registry = InMemoryTenantRegistry::new(TenantLimits::default());
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let custom = TenantLimits { max_concurrent_executions: 1, max_steps_per_workflow: 1 };
        registry.set(old, custom);

        registry.replace_all(HashMap::from([(new, custom)]));

        assert_eq!(registry.limits(old), TenantLimits::default());
        assert_eq!(registry.limits(new), custom);
    }
}
