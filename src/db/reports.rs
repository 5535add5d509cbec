//! Read-only projections for the REST API. Plain read-committed snapshots;
//! a scrape in progress is simply not visible yet.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;

use crate::datamodel::models::{Domain, Project};
use crate::error::Result;

/// One (service, resource) line of the cluster report, with capacity summed
/// over availability zones.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterResourceReport {
    pub service_type: String,
    pub resource_name: String,
    pub unit: String,
    pub topology: String,
    pub has_capacity: bool,
    pub capacity: i64,
    pub capacity_usage: i64,
    pub scraped_at: Option<DateTime<Utc>>,
    pub scrape_error_message: String,
}

pub async fn cluster_report(executor: impl PgExecutor<'_>) -> Result<Vec<ClusterResourceReport>> {
    let rows = sqlx::query_as::<_, ClusterResourceReport>(
        "SELECT cs.type AS service_type, cr.name AS resource_name, cr.unit, cr.topology, \
                cr.has_capacity, \
                COALESCE(SUM(caz.raw_capacity), 0)::BIGINT AS capacity, \
                COALESCE(SUM(caz.usage), 0)::BIGINT AS capacity_usage, \
                cs.scraped_at, cs.scrape_error_message \
         FROM cluster_services cs \
         JOIN cluster_resources cr ON cr.service_id = cs.id \
         LEFT JOIN cluster_az_resources caz ON caz.resource_id = cr.id \
         GROUP BY cs.type, cr.name, cr.unit, cr.topology, cr.has_capacity, \
                  cs.scraped_at, cs.scrape_error_message \
         ORDER BY cs.type ASC, cr.name ASC",
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// One (project, service, resource) line of a domain's project report.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectResourceReport {
    pub project_uuid: String,
    pub project_name: String,
    pub service_type: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub scrape_error_message: String,
    pub quota_desynced_at: Option<DateTime<Utc>>,
    pub resource_name: Option<String>,
    pub unit: Option<String>,
    pub quota: Option<i64>,
    pub backend_quota: Option<i64>,
    pub usage: i64,
}

pub async fn project_report(
    executor: impl PgExecutor<'_>,
    domain_id: i64,
) -> Result<Vec<ProjectResourceReport>> {
    let rows = sqlx::query_as::<_, ProjectResourceReport>(
        "SELECT p.uuid AS project_uuid, p.name AS project_name, cs.type AS service_type, \
                ps.scraped_at, ps.scrape_error_message, ps.quota_desynced_at, \
                cr.name AS resource_name, cr.unit, pr.quota, pr.backend_quota, \
                COALESCE(SUM(paz.usage), 0)::BIGINT AS usage \
         FROM projects p \
         JOIN project_services ps ON ps.project_id = p.id \
         JOIN cluster_services cs ON cs.id = ps.service_id \
         LEFT JOIN cluster_resources cr ON cr.service_id = cs.id \
         LEFT JOIN project_resources pr ON pr.resource_id = cr.id AND pr.project_id = p.id \
         LEFT JOIN cluster_az_resources caz ON caz.resource_id = cr.id \
         LEFT JOIN project_az_resources paz ON paz.az_resource_id = caz.id \
                                           AND paz.project_id = p.id \
         WHERE p.domain_id = $1 \
         GROUP BY p.uuid, p.name, cs.type, ps.scraped_at, ps.scrape_error_message, \
                  ps.quota_desynced_at, cr.name, cr.unit, pr.quota, pr.backend_quota \
         ORDER BY p.name ASC, cs.type ASC, cr.name ASC",
    )
    .bind(domain_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn domain_by_uuid(
    executor: impl PgExecutor<'_>,
    uuid: &str,
) -> Result<Option<Domain>> {
    let domain = sqlx::query_as::<_, Domain>("SELECT id, uuid, name FROM domains WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(executor)
        .await?;
    Ok(domain)
}

pub async fn project_in_domain_by_uuid(
    executor: impl PgExecutor<'_>,
    domain_id: i64,
    uuid: &str,
) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>(
        "SELECT id, domain_id, uuid, name, parent_uuid FROM projects \
         WHERE domain_id = $1 AND uuid = $2",
    )
    .bind(domain_id)
    .bind(uuid)
    .fetch_optional(executor)
    .await?;
    Ok(project)
}
