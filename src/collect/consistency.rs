//! Consistency/constraint reconciler.
//!
//! Periodically re-derives every project-resource's effective quota and
//! desired backend quota from configuration, and marks project-services
//! whose backend quota drifted as desynced. The computation itself lives in
//! [`crate::collect::compute`] and is shared with the scraper and the API
//! validation pipeline.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::collect::compute;
use crate::config::CollectorConfig;
use crate::db;
use crate::error::Result;

/// Mutation counts for one reconciliation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub quotas_updated: u64,
    pub services_marked_desynced: u64,
    pub services_cleared: u64,
}

pub struct ConsistencyLoop {
    pool: PgPool,
    cluster: Arc<Cluster>,
    cfg: CollectorConfig,
}

impl ConsistencyLoop {
    pub fn new(pool: PgPool, cluster: Arc<Cluster>, cfg: CollectorConfig) -> Self {
        Self { pool, cluster, cfg }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("consistency reconciler started");
        loop {
            match reconcile_once(&self.pool, &self.cluster).await {
                Ok(stats) => debug!(
                    quotas_updated = stats.quotas_updated,
                    marked_desynced = stats.services_marked_desynced,
                    cleared = stats.services_cleared,
                    "reconciliation pass complete"
                ),
                Err(e) => warn!(error = ?e, "reconciliation pass failed"),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(self.cfg.consistency_interval) => {}
            }
        }
        info!("consistency reconciler exiting");
    }
}

/// One full reconciliation pass over every enabled service.
pub async fn reconcile_once(pool: &PgPool, cluster: &Cluster) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();
    let service_ids = db::cluster::service_ids_by_type(pool).await?;

    for plugin in cluster.registry.quota_plugins() {
        let service_type = plugin.service_type();
        let Some(&service_id) = service_ids.get(service_type) else {
            continue;
        };

        let rows = db::resources::all_for_reconciliation(pool, service_id).await?;

        // Rows arrive grouped by project-service; one transaction per
        // project-service keeps the §4.4 ordering guarantee.
        let mut index = 0;
        while index < rows.len() {
            let project_service_id = rows[index].project_service_id;
            let group_end = rows[index..]
                .iter()
                .position(|r| r.project_service_id != project_service_id)
                .map(|offset| index + offset)
                .unwrap_or(rows.len());

            let mut tx = pool.begin().await?;
            let mut any_desynced = false;

            for row in &rows[index..group_end] {
                let behavior = cluster.behavior_for(service_type, &row.resource_name);
                let policy = compute::QuotaPolicy {
                    constraint: cluster.constraints.for_project(
                        &row.domain_name,
                        &row.project_name,
                        service_type,
                        &row.resource_name,
                    ),
                    behavior: &behavior,
                    forbidden: row.forbidden,
                    override_quota: row
                        .override_quota_from_config
                        .and_then(|v| u64::try_from(v).ok()),
                    max_quota_from_outside_admin: row
                        .max_quota_from_outside_admin
                        .and_then(|v| u64::try_from(v).ok()),
                    max_quota_from_local_admin: row
                        .max_quota_from_local_admin
                        .and_then(|v| u64::try_from(v).ok()),
                };

                let current = row.quota.unwrap_or(0).max(0) as u64;
                let effective = compute::effective_quota(current, &policy);
                if effective.constraint_overrides_admin_max {
                    error!(
                        service = service_type,
                        resource = row.resource_name,
                        project = row.project_name,
                        domain = row.domain_name,
                        quota = effective.value,
                        "constraint minimum exceeds admin-imposed maximum, minimum wins"
                    );
                }

                if effective.value != current || row.quota.is_none() {
                    db::resources::update_quota(&mut *tx, row.id, effective.value as i64).await?;
                    stats.quotas_updated += 1;
                }

                let desired = compute::desired_backend_quota(
                    effective.value,
                    &behavior,
                    cluster.bursting_max_multiplier,
                );
                if desired.negative_multiplier_rejected {
                    error!(
                        service = service_type,
                        resource = row.resource_name,
                        "negative burst multiplier rejected at runtime"
                    );
                }
                match row.backend_quota {
                    Some(observed) if observed >= 0 && observed as u64 == desired.value => {}
                    _ => any_desynced = true,
                }
            }

            let was_desynced = db::services::desynced_at(&mut *tx, project_service_id)
                .await?
                .is_some();
            if any_desynced {
                db::services::mark_desynced(&mut *tx, project_service_id).await?;
                if !was_desynced {
                    stats.services_marked_desynced += 1;
                }
            } else if was_desynced {
                db::services::clear_desynced(&mut *tx, project_service_id).await?;
                stats.services_cleared += 1;
            }

            tx.commit().await?;
            index = group_end;
        }
    }

    Ok(stats)
}
