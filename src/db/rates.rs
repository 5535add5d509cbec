//! Project-rate operations.
//!
//! Rate usage is an arbitrary-precision counter stored as a decimal string;
//! the core never does arithmetic on it.

use sqlx::postgres::{PgExecutor, PgTransaction};

use crate::error::Result;

/// A project-rate row joined with its declaration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRateRow {
    pub id: i64,
    pub project_id: i64,
    pub rate_id: i64,
    pub rate_name: String,
    pub unit: String,
    pub rate_limit: Option<i64>,
    pub window_ns: Option<i64>,
    pub usage_as_bigint: String,
}

pub async fn rates_for_service(
    executor: impl PgExecutor<'_>,
    project_id: i64,
    service_id: i64,
) -> Result<Vec<ProjectRateRow>> {
    let rows = sqlx::query_as::<_, ProjectRateRow>(
        "SELECT pr.id, pr.project_id, pr.rate_id, cr.name AS rate_name, cr.unit, \
                pr.rate_limit, pr.window_ns, pr.usage_as_bigint \
         FROM project_rates pr \
         JOIN cluster_rates cr ON cr.id = pr.rate_id \
         WHERE pr.project_id = $1 AND cr.service_id = $2 \
         ORDER BY cr.name ASC",
    )
    .bind(project_id)
    .bind(service_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Store the latest reported usage verbatim. Rates the driver did not report
/// are simply not written, leaving their previous counter in place.
pub async fn store_usage(
    tx: &mut PgTransaction<'_>,
    project_rate_id: i64,
    usage: &str,
) -> Result<()> {
    sqlx::query("UPDATE project_rates SET usage_as_bigint = $2 WHERE id = $1")
        .bind(project_rate_id)
        .bind(usage)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
