//! Commitment lifecycle queries.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::postgres::PgExecutor;

use crate::error::Result;

/// Move planned commitments whose confirmation window has opened to pending.
pub async fn transition_planned(executor: impl PgExecutor<'_>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE project_commitments SET state = 'pending' \
         WHERE state = 'planned' AND (confirm_by IS NULL OR confirm_by <= NOW())",
    )
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Expire commitments whose end date has passed, in any live state.
pub async fn expire_due(executor: impl PgExecutor<'_>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE project_commitments SET state = 'expired' \
         WHERE state IN ('planned', 'pending', 'active') AND expires_at <= NOW()",
    )
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// A pending commitment with the capacity context needed to decide
/// confirmation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingCommitment {
    pub id: i64,
    pub uuid: String,
    pub project_id: i64,
    pub az_resource_id: i64,
    pub amount: i64,
    pub notify_on_confirm: bool,
    pub az: String,
    pub raw_capacity: i64,
    pub resource_name: String,
    pub service_type: String,
}

/// Pending commitments in creation order, oldest first.
pub async fn pending_in_order(executor: impl PgExecutor<'_>) -> Result<Vec<PendingCommitment>> {
    let rows = sqlx::query_as::<_, PendingCommitment>(
        "SELECT pc.id, pc.uuid, pc.project_id, pc.az_resource_id, pc.amount, \
                pc.notify_on_confirm, caz.az, caz.raw_capacity, \
                cr.name AS resource_name, cs.type AS service_type \
         FROM project_commitments pc \
         JOIN cluster_az_resources caz ON caz.id = pc.az_resource_id \
         JOIN cluster_resources cr ON cr.id = caz.resource_id \
         JOIN cluster_services cs ON cs.id = cr.service_id \
         WHERE pc.state = 'pending' \
         ORDER BY pc.created_at ASC",
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Sum of active commitment amounts per cluster-AZ-resource. Active
/// commitments count against available capacity.
pub async fn active_amounts_by_az_resource(
    executor: impl PgExecutor<'_>,
) -> Result<HashMap<i64, i64>> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT az_resource_id, COALESCE(SUM(amount), 0)::BIGINT \
         FROM project_commitments WHERE state = 'active' \
         GROUP BY az_resource_id",
    )
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().collect())
}

pub async fn confirm(executor: impl PgExecutor<'_>, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE project_commitments SET state = 'active', confirmed_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

/// An active commitment close enough to expiry to warrant a notification.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExpiringCommitment {
    pub id: i64,
    pub uuid: String,
    pub project_id: i64,
    pub amount: i64,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub az: String,
    pub resource_name: String,
    pub service_type: String,
}

pub async fn expiring_soon_unnotified(
    executor: impl PgExecutor<'_>,
    notice_period: Duration,
) -> Result<Vec<ExpiringCommitment>> {
    let rows = sqlx::query_as::<_, ExpiringCommitment>(
        "SELECT pc.id, pc.uuid, pc.project_id, pc.amount, pc.expires_at, \
                caz.az, cr.name AS resource_name, cs.type AS service_type \
         FROM project_commitments pc \
         JOIN cluster_az_resources caz ON caz.id = pc.az_resource_id \
         JOIN cluster_resources cr ON cr.id = caz.resource_id \
         JOIN cluster_services cs ON cs.id = cr.service_id \
         WHERE pc.state = 'active' AND NOT pc.notified_for_expiration \
           AND pc.expires_at <= NOW() + make_interval(secs => $1)",
    )
    .bind(notice_period.as_secs_f64())
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn mark_notified_for_expiration(
    executor: impl PgExecutor<'_>,
    id: i64,
) -> Result<()> {
    sqlx::query("UPDATE project_commitments SET notified_for_expiration = TRUE WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}
