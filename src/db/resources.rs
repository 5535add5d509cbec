//! Project-resource and project-AZ-resource operations.

use sqlx::postgres::{PgExecutor, PgTransaction};

use crate::error::Result;

/// A project-resource row joined with its declaration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectResourceRow {
    pub id: i64,
    pub project_id: i64,
    pub resource_id: i64,
    pub resource_name: String,
    pub unit: String,
    pub topology: String,
    pub quota: Option<i64>,
    pub backend_quota: Option<i64>,
    pub forbidden: bool,
    pub max_quota_from_outside_admin: Option<i64>,
    pub max_quota_from_local_admin: Option<i64>,
    pub override_quota_from_config: Option<i64>,
}

pub async fn resources_for_service(
    executor: impl PgExecutor<'_>,
    project_id: i64,
    service_id: i64,
) -> Result<Vec<ProjectResourceRow>> {
    let rows = sqlx::query_as::<_, ProjectResourceRow>(
        "SELECT pr.id, pr.project_id, pr.resource_id, cr.name AS resource_name, cr.unit, \
                cr.topology, pr.quota, pr.backend_quota, pr.forbidden, \
                pr.max_quota_from_outside_admin, pr.max_quota_from_local_admin, \
                pr.override_quota_from_config \
         FROM project_resources pr \
         JOIN cluster_resources cr ON cr.id = pr.resource_id \
         WHERE pr.project_id = $1 AND cr.service_id = $2 \
         ORDER BY cr.name ASC",
    )
    .bind(project_id)
    .bind(service_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Upsert a project-resource from a scrape observation.
///
/// The backend quota is overwritten (it is the authoritative observation);
/// the approved quota is only seeded on first sight and otherwise retained,
/// so operator-set values survive subsequent scrapes.
pub async fn upsert_scraped_resource(
    tx: &mut PgTransaction<'_>,
    project_id: i64,
    resource_id: i64,
    initial_quota: Option<i64>,
    backend_quota: Option<i64>,
) -> Result<ProjectResourceRow> {
    let row = sqlx::query_as::<_, ProjectResourceRow>(
        "WITH upserted AS ( \
             INSERT INTO project_resources (project_id, resource_id, quota, backend_quota) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (project_id, resource_id) DO UPDATE SET \
                 backend_quota = EXCLUDED.backend_quota, \
                 quota = COALESCE(project_resources.quota, EXCLUDED.quota) \
             RETURNING * \
         ) \
         SELECT u.id, u.project_id, u.resource_id, cr.name AS resource_name, cr.unit, \
                cr.topology, u.quota, u.backend_quota, u.forbidden, \
                u.max_quota_from_outside_admin, u.max_quota_from_local_admin, \
                u.override_quota_from_config \
         FROM upserted u JOIN cluster_resources cr ON cr.id = u.resource_id",
    )
    .bind(project_id)
    .bind(resource_id)
    .bind(initial_quota)
    .bind(backend_quota)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row)
}

/// Look up or create the cluster-AZ-resource row backing a per-AZ usage
/// observation. Quota scrapes may report zones the capacity scraper has not
/// seen yet; those get a zero-capacity row.
pub async fn ensure_az_resource(
    tx: &mut PgTransaction<'_>,
    resource_id: i64,
    az: &str,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "WITH ins AS ( \
             INSERT INTO cluster_az_resources (resource_id, az) VALUES ($1, $2) \
             ON CONFLICT (resource_id, az) DO NOTHING \
             RETURNING id \
         ) \
         SELECT id FROM ins \
         UNION ALL \
         SELECT id FROM cluster_az_resources WHERE resource_id = $1 AND az = $2 \
         LIMIT 1",
    )
    .bind(resource_id)
    .bind(az)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// An existing project-AZ-resource row with its zone name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectAzResourceRow {
    pub id: i64,
    pub az_resource_id: i64,
    pub az: String,
    pub usage: i64,
    pub historical_usage: serde_json::Value,
}

pub async fn az_rows_for_resource(
    executor: impl PgExecutor<'_>,
    project_id: i64,
    resource_id: i64,
) -> Result<Vec<ProjectAzResourceRow>> {
    let rows = sqlx::query_as::<_, ProjectAzResourceRow>(
        "SELECT paz.id, paz.az_resource_id, caz.az, paz.usage, paz.historical_usage \
         FROM project_az_resources paz \
         JOIN cluster_az_resources caz ON caz.id = paz.az_resource_id \
         WHERE paz.project_id = $1 AND caz.resource_id = $2",
    )
    .bind(project_id)
    .bind(resource_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_az_resource(
    tx: &mut PgTransaction<'_>,
    project_id: i64,
    az_resource_id: i64,
    quota: Option<i64>,
    usage: i64,
    physical_usage: Option<i64>,
    subresources: serde_json::Value,
    historical_usage: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO project_az_resources \
             (project_id, az_resource_id, quota, usage, physical_usage, subresources, \
              historical_usage) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (project_id, az_resource_id) DO UPDATE SET \
             quota = EXCLUDED.quota, \
             usage = EXCLUDED.usage, \
             physical_usage = EXCLUDED.physical_usage, \
             subresources = EXCLUDED.subresources, \
             historical_usage = EXCLUDED.historical_usage",
    )
    .bind(project_id)
    .bind(az_resource_id)
    .bind(quota)
    .bind(usage)
    .bind(physical_usage)
    .bind(subresources)
    .bind(historical_usage)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Drop AZ rows for zones the scrape no longer reports.
pub async fn delete_az_rows_absent(
    tx: &mut PgTransaction<'_>,
    project_id: i64,
    resource_id: i64,
    present_az_resource_ids: &[i64],
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM project_az_resources paz \
         USING cluster_az_resources caz \
         WHERE paz.az_resource_id = caz.id \
           AND paz.project_id = $1 AND caz.resource_id = $2 \
           AND paz.az_resource_id <> ALL($3)",
    )
    .bind(project_id)
    .bind(resource_id)
    .bind(present_az_resource_ids)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

/// Set the approved quota, e.g. from the API write path or the reconciler.
pub async fn update_quota(
    executor: impl PgExecutor<'_>,
    project_resource_id: i64,
    quota: i64,
) -> Result<()> {
    sqlx::query("UPDATE project_resources SET quota = $2 WHERE id = $1")
        .bind(project_resource_id)
        .bind(quota)
        .execute(executor)
        .await?;
    Ok(())
}

/// Overwrite the observed backend quota, e.g. after a re-scrape following a
/// successful push.
pub async fn update_backend_quota(
    executor: impl PgExecutor<'_>,
    project_resource_id: i64,
    backend_quota: i64,
) -> Result<()> {
    sqlx::query("UPDATE project_resources SET backend_quota = $2 WHERE id = $1")
        .bind(project_resource_id)
        .bind(backend_quota)
        .execute(executor)
        .await?;
    Ok(())
}

/// Everything the consistency reconciler needs for one project-resource.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReconcileRow {
    pub id: i64,
    pub project_id: i64,
    pub project_service_id: i64,
    pub resource_name: String,
    pub project_name: String,
    pub domain_name: String,
    pub quota: Option<i64>,
    pub backend_quota: Option<i64>,
    pub forbidden: bool,
    pub max_quota_from_outside_admin: Option<i64>,
    pub max_quota_from_local_admin: Option<i64>,
    pub override_quota_from_config: Option<i64>,
}

pub async fn all_for_reconciliation(
    executor: impl PgExecutor<'_>,
    service_id: i64,
) -> Result<Vec<ReconcileRow>> {
    let rows = sqlx::query_as::<_, ReconcileRow>(
        "SELECT pr.id, pr.project_id, ps.id AS project_service_id, \
                cr.name AS resource_name, p.name AS project_name, d.name AS domain_name, \
                pr.quota, pr.backend_quota, pr.forbidden, \
                pr.max_quota_from_outside_admin, pr.max_quota_from_local_admin, \
                pr.override_quota_from_config \
         FROM project_resources pr \
         JOIN cluster_resources cr ON cr.id = pr.resource_id \
         JOIN projects p ON p.id = pr.project_id \
         JOIN domains d ON d.id = p.domain_id \
         JOIN project_services ps ON ps.project_id = pr.project_id \
                                 AND ps.service_id = cr.service_id \
         WHERE cr.service_id = $1 AND cr.has_quota \
         ORDER BY ps.id ASC, cr.name ASC",
    )
    .bind(service_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}
