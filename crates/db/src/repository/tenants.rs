//! Tenant limit lookups.

use sqlx::PgPool;

use crate::{DbError, models::TenantRow};

/// Return every tenant with its configured limits.
pub async fn list_tenants(pool: &PgPool) -> Result<Vec<TenantRow>, DbError> {
    let rows = sqlx::query_as::<_, TenantRow>(
        r#"
        SELECT id, name, max_concurrent_executions, max_steps_per_workflow
        FROM tenants
        ORDER BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
