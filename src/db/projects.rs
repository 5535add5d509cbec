//! Database operations for domain and project discovery.

use sqlx::postgres::{PgExecutor, PgTransaction};

use crate::datamodel::models::{Domain, Project};
use crate::error::Result;
use crate::plugins::{DiscoveredDomain, DiscoveredProject};

pub async fn all_domains(executor: impl PgExecutor<'_>) -> Result<Vec<Domain>> {
    let domains =
        sqlx::query_as::<_, Domain>("SELECT id, uuid, name FROM domains ORDER BY name ASC")
            .fetch_all(executor)
            .await?;
    Ok(domains)
}

pub async fn find_domain_by_uuid(
    executor: impl PgExecutor<'_>,
    uuid: &str,
) -> Result<Option<Domain>> {
    let domain = sqlx::query_as::<_, Domain>("SELECT id, uuid, name FROM domains WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(executor)
        .await?;
    Ok(domain)
}

/// Insert or rename a domain. Returns the row and whether anything changed,
/// so the discovery loop can report exact mutation counts.
pub async fn upsert_domain(
    tx: &mut PgTransaction<'_>,
    discovered: &DiscoveredDomain,
) -> Result<(Domain, bool)> {
    let existing = find_domain_by_uuid(&mut **tx, &discovered.uuid).await?;
    match existing {
        Some(domain) if domain.name == discovered.name => Ok((domain, false)),
        Some(mut domain) => {
            sqlx::query("UPDATE domains SET name = $2 WHERE id = $1")
                .bind(domain.id)
                .bind(&discovered.name)
                .execute(&mut **tx)
                .await?;
            domain.name = discovered.name.clone();
            Ok((domain, true))
        }
        None => {
            let domain = sqlx::query_as::<_, Domain>(
                "INSERT INTO domains (uuid, name) VALUES ($1, $2) RETURNING id, uuid, name",
            )
            .bind(&discovered.uuid)
            .bind(&discovered.name)
            .fetch_one(&mut **tx)
            .await?;
            Ok((domain, true))
        }
    }
}

/// Delete domains whose uuid is no longer reported. Cascades to all owned
/// projects and their rows.
pub async fn delete_domains_absent(
    executor: impl PgExecutor<'_>,
    present_uuids: &[String],
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM domains WHERE uuid <> ALL($1)")
        .bind(present_uuids)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub async fn projects_in_domain(
    executor: impl PgExecutor<'_>,
    domain_id: i64,
) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT id, domain_id, uuid, name, parent_uuid FROM projects WHERE domain_id = $1",
    )
    .bind(domain_id)
    .fetch_all(executor)
    .await?;
    Ok(projects)
}

/// Create a project and seed its scheduling rows: one project-service per
/// known cluster service and one project-rate per known cluster rate, all
/// due immediately (`next_scrape_at` defaults to now, `scraped_at` NULL).
pub async fn create_project(
    tx: &mut PgTransaction<'_>,
    domain_id: i64,
    discovered: &DiscoveredProject,
) -> Result<i64> {
    let project_id: i64 = sqlx::query_scalar(
        "INSERT INTO projects (domain_id, uuid, name, parent_uuid) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(domain_id)
    .bind(&discovered.uuid)
    .bind(&discovered.name)
    .bind(&discovered.parent_uuid)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO project_services (project_id, service_id) \
         SELECT $1, id FROM cluster_services",
    )
    .bind(project_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO project_rates (project_id, rate_id) \
         SELECT $1, id FROM cluster_rates",
    )
    .bind(project_id)
    .execute(&mut **tx)
    .await?;

    Ok(project_id)
}

/// Update project metadata if it drifted. Returns true when a write happened.
pub async fn update_project_metadata(
    executor: impl PgExecutor<'_>,
    project_id: i64,
    discovered: &DiscoveredProject,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE projects SET name = $2, parent_uuid = $3 \
         WHERE id = $1 AND (name IS DISTINCT FROM $2 OR parent_uuid IS DISTINCT FROM $3)",
    )
    .bind(project_id)
    .bind(&discovered.name)
    .bind(&discovered.parent_uuid)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete this domain's projects that the identity backend no longer lists.
/// Cascades to all project-* rows.
pub async fn delete_projects_absent(
    executor: impl PgExecutor<'_>,
    domain_id: i64,
    present_uuids: &[String],
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM projects WHERE domain_id = $1 AND uuid <> ALL($2)")
        .bind(domain_id)
        .bind(present_uuids)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
