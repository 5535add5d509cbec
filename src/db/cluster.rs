//! Cluster-level rows: service/resource/rate declarations and capacity.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgExecutor, PgTransaction};

use crate::cluster::Cluster;
use crate::datamodel::models::ClusterAzResource;
use crate::datamodel::types::{AvailabilityZone, CapacityData};
use crate::error::Result;
use anyhow::Context;

/// Reconcile the cluster_* declaration rows with the loaded drivers.
///
/// Runs once at collector startup: rows appear on first sight of a declared
/// service/resource/rate and disappear when the declaration is gone.
pub async fn sync_declarations(pool: &PgPool, cluster: &Cluster) -> Result<()> {
    let mut tx = pool.begin().await?;

    let mut declared_types = Vec::new();
    for plugin in cluster.registry.quota_plugins() {
        let service_type = plugin.service_type();
        declared_types.push(service_type.to_string());

        let service_id: i64 = sqlx::query_scalar(
            "INSERT INTO cluster_services (type) VALUES ($1) \
             ON CONFLICT (type) DO UPDATE SET type = EXCLUDED.type \
             RETURNING id",
        )
        .bind(service_type)
        .fetch_one(&mut *tx)
        .await?;

        let mut resource_names = Vec::new();
        for info in plugin.resources() {
            resource_names.push(info.name.clone());
            sqlx::query(
                "INSERT INTO cluster_resources (service_id, name, unit, topology, has_quota) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (service_id, name) DO UPDATE \
                 SET unit = EXCLUDED.unit, topology = EXCLUDED.topology, \
                     has_quota = EXCLUDED.has_quota",
            )
            .bind(service_id)
            .bind(&info.name)
            .bind(&info.unit)
            .bind(info.topology.as_str())
            .bind(info.has_quota)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM cluster_resources WHERE service_id = $1 AND name <> ALL($2)")
            .bind(service_id)
            .bind(&resource_names)
            .execute(&mut *tx)
            .await?;

        let mut rate_names = Vec::new();
        for info in plugin.rates() {
            rate_names.push(info.name.clone());
            sqlx::query(
                "INSERT INTO cluster_rates (service_id, name, unit, topology, has_usage) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (service_id, name) DO UPDATE \
                 SET unit = EXCLUDED.unit, topology = EXCLUDED.topology, \
                     has_usage = EXCLUDED.has_usage",
            )
            .bind(service_id)
            .bind(&info.name)
            .bind(&info.unit)
            .bind(info.topology.as_str())
            .bind(info.has_usage)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM cluster_rates WHERE service_id = $1 AND name <> ALL($2)")
            .bind(service_id)
            .bind(&rate_names)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("DELETE FROM cluster_services WHERE type <> ALL($1)")
        .bind(&declared_types)
        .execute(&mut *tx)
        .await?;

    // Projects created before a new service/rate declaration need their
    // scheduling rows seeded too.
    sqlx::query(
        "INSERT INTO project_services (project_id, service_id) \
         SELECT p.id, cs.id FROM projects p CROSS JOIN cluster_services cs \
         ON CONFLICT (project_id, service_id) DO NOTHING",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO project_rates (project_id, rate_id) \
         SELECT p.id, cr.id FROM projects p CROSS JOIN cluster_rates cr \
         ON CONFLICT (project_id, rate_id) DO NOTHING",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Map service type to cluster_services row id.
pub async fn service_ids_by_type(executor: impl PgExecutor<'_>) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT type, id FROM cluster_services")
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().collect())
}

/// Map resource name to cluster_resources row id for one service.
pub async fn resource_ids_for_service(
    executor: impl PgExecutor<'_>,
    service_id: i64,
) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT name, id FROM cluster_resources WHERE service_id = $1")
            .bind(service_id)
            .fetch_all(executor)
            .await?;
    Ok(rows.into_iter().collect())
}

pub async fn service_id_for_type(executor: impl PgExecutor<'_>, service_type: &str) -> Result<i64> {
    let id: i64 = sqlx::query_scalar("SELECT id FROM cluster_services WHERE type = $1")
        .bind(service_type)
        .fetch_optional(executor)
        .await?
        .with_context(|| format!("no cluster_services row for type {service_type:?}"))?;
    Ok(id)
}

/// Write one resource's capacity observations.
///
/// `last_nonzero_raw_capacity` latches the newest non-zero reading and is
/// never cleared; a zero reading with history present is a transient outage,
/// without history it is an AZ still being built up.
pub async fn store_capacity(
    tx: &mut PgTransaction<'_>,
    service_type: &str,
    resource_name: &str,
    per_az: &BTreeMap<AvailabilityZone, CapacityData>,
) -> Result<()> {
    let resource_id: i64 = sqlx::query_scalar(
        "SELECT cr.id FROM cluster_resources cr \
         JOIN cluster_services cs ON cs.id = cr.service_id \
         WHERE cs.type = $1 AND cr.name = $2",
    )
    .bind(service_type)
    .bind(resource_name)
    .fetch_optional(&mut **tx)
    .await?
    .with_context(|| format!("no cluster resource {service_type}/{resource_name}"))?;

    sqlx::query("UPDATE cluster_resources SET has_capacity = TRUE WHERE id = $1 AND NOT has_capacity")
        .bind(resource_id)
        .execute(&mut **tx)
        .await?;

    for (az, data) in per_az {
        sqlx::query(
            "INSERT INTO cluster_az_resources \
                 (resource_id, az, raw_capacity, usage, last_nonzero_raw_capacity, subcapacities) \
             VALUES ($1, $2, $3, $4, CASE WHEN $3 > 0 THEN $3 END, $5) \
             ON CONFLICT (resource_id, az) DO UPDATE SET \
                 raw_capacity = EXCLUDED.raw_capacity, \
                 usage = EXCLUDED.usage, \
                 subcapacities = EXCLUDED.subcapacities, \
                 last_nonzero_raw_capacity = CASE \
                     WHEN EXCLUDED.raw_capacity > 0 THEN EXCLUDED.raw_capacity \
                     ELSE cluster_az_resources.last_nonzero_raw_capacity END",
        )
        .bind(resource_id)
        .bind(az.as_str())
        .bind(data.capacity as i64)
        .bind(data.usage as i64)
        .bind(serde_json::Value::Array(data.subcapacities.clone()))
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Record a successful capacity pass for one service: attach the capacitor's
/// metrics blob and advance the scrape schedule.
pub async fn record_service_capacity_success(
    executor: impl PgExecutor<'_>,
    service_type: &str,
    serialized_metrics: &str,
    next_interval: Duration,
) -> Result<()> {
    sqlx::query(
        "UPDATE cluster_services \
         SET scraped_at = NOW(), scrape_error_message = '', serialized_metrics = $2, \
             next_scrape_at = NOW() + make_interval(secs => $3) \
         WHERE type = $1",
    )
    .bind(service_type)
    .bind(serialized_metrics)
    .bind(next_interval.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

/// Store a capacity scrape error on the services this capacitor last fed.
pub async fn record_service_capacity_error(
    executor: impl PgExecutor<'_>,
    service_types: &[String],
    message: &str,
) -> Result<()> {
    sqlx::query("UPDATE cluster_services SET scrape_error_message = $2 WHERE type = ANY($1)")
        .bind(service_types)
        .bind(message)
        .execute(executor)
        .await?;
    Ok(())
}

/// All capacity rows for one resource, by AZ.
pub async fn az_resources_for(
    executor: impl PgExecutor<'_>,
    service_type: &str,
    resource_name: &str,
) -> Result<Vec<ClusterAzResource>> {
    let rows = sqlx::query_as::<_, ClusterAzResource>(
        "SELECT caz.id, caz.resource_id, caz.az, caz.raw_capacity, caz.usage, \
                caz.last_nonzero_raw_capacity, caz.subcapacities \
         FROM cluster_az_resources caz \
         JOIN cluster_resources cr ON cr.id = caz.resource_id \
         JOIN cluster_services cs ON cs.id = cr.service_id \
         WHERE cs.type = $1 AND cr.name = $2 \
         ORDER BY caz.az ASC",
    )
    .bind(service_type)
    .bind(resource_name)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}
