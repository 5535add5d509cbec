//! Quota sync pusher.
//!
//! Claims project-services whose approved quota no longer matches the
//! observed backend quota and pushes the recomputed values through the
//! driver's `set_quota`. At most one push per project-service is in flight
//! at a time, enforced by the claim lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::collect::compute;
use crate::config::CollectorConfig;
use crate::db;
use crate::db::services::ClaimedProjectService;
use crate::error::{DriverError, Result};
use crate::metrics::{Metrics, OUTCOME_ERROR, OUTCOME_SUCCESS};

pub struct QuotaSyncWorker {
    pool: PgPool,
    cluster: Arc<Cluster>,
    cfg: CollectorConfig,
    metrics: Arc<Metrics>,
}

impl QuotaSyncWorker {
    pub fn new(
        pool: PgPool,
        cluster: Arc<Cluster>,
        cfg: CollectorConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            cluster,
            cfg,
            metrics,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("quota sync pusher started");
        loop {
            let outcome = tokio::select! {
                _ = shutdown_rx.recv() => break,
                outcome = self.tick() => outcome,
            };

            let sleep = match outcome {
                Ok(true) => continue,
                Ok(false) => self.cfg.poll_floor,
                Err(e) => {
                    warn!(error = ?e, "sync cycle failed");
                    self.cfg.poll_floor
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(sleep) => {}
            }
        }
        info!("quota sync pusher exiting");
    }

    /// Claim and push at most one desynced project-service. Returns whether
    /// a row was claimed.
    pub async fn tick(&self) -> Result<bool> {
        let Some(claim) = db::services::claim_desynced(&self.pool, self.cfg.claim_lease).await?
        else {
            return Ok(false);
        };
        self.push_claimed(&claim).await?;
        Ok(true)
    }

    async fn push_claimed(&self, claim: &ClaimedProjectService) -> Result<()> {
        let service_type = claim.service_type.as_str();
        let Some(plugin) = self.cluster.registry.quota_plugin(service_type) else {
            warn!(service = service_type, "desynced row for unknown service type");
            return Ok(());
        };
        let project = claim.project_ref();

        // Recompute the target quotas from the current rows.
        let rows =
            db::resources::resources_for_service(&self.pool, claim.project_id, claim.service_id)
                .await?;
        let mut targets: BTreeMap<String, u64> = BTreeMap::new();
        let mut desired_by_resource: Vec<(i64, u64)> = Vec::new();
        for row in &rows {
            let behavior = self.cluster.behavior_for(service_type, &row.resource_name);
            let approved = row.quota.unwrap_or(0).max(0) as u64;
            let desired = compute::desired_backend_quota(
                approved,
                &behavior,
                self.cluster.bursting_max_multiplier,
            );
            if desired.negative_multiplier_rejected {
                error!(
                    service = service_type,
                    resource = row.resource_name,
                    "negative burst multiplier rejected at runtime"
                );
            }
            targets.insert(row.resource_name.clone(), desired.value);
            desired_by_resource.push((row.id, desired.value));
        }

        debug!(
            service = service_type,
            project = project.uuid,
            resources = targets.len(),
            "pushing quota"
        );

        let started = Instant::now();
        let outcome =
            match time::timeout(self.cfg.scrape_timeout, plugin.set_quota(&project, &targets))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DriverError::Transient(anyhow!(
                    "set_quota timed out after {:?}",
                    self.cfg.scrape_timeout
                ))),
            };
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                let mut tx = self.pool.begin().await?;
                if self.cfg.rescrape_after_push {
                    // Re-read the authoritative backend quotas instead of
                    // trusting the call.
                    match time::timeout(self.cfg.scrape_timeout, plugin.scrape(&project)).await {
                        Ok(Ok(result)) => {
                            for row in &rows {
                                if let Some(data) = result.resources.get(&row.resource_name) {
                                    db::resources::update_backend_quota(
                                        &mut *tx, row.id, data.quota,
                                    )
                                    .await?;
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "re-scrape after push failed, trusting the call")
                        }
                        Err(_) => warn!("re-scrape after push timed out, trusting the call"),
                    }
                } else {
                    for (project_resource_id, desired) in &desired_by_resource {
                        db::resources::update_backend_quota(
                            &mut *tx,
                            *project_resource_id,
                            *desired as i64,
                        )
                        .await?;
                    }
                }
                db::services::record_sync_success(&mut *tx, claim.id, elapsed).await?;
                tx.commit().await?;

                self.metrics
                    .quota_syncs
                    .with_label_values(&[service_type, OUTCOME_SUCCESS])
                    .inc();
                info!(
                    service = service_type,
                    project = claim.project_uuid,
                    elapsed = format!("{elapsed:.2?}"),
                    "quota pushed to backend"
                );
            }
            Err(e) => {
                warn!(
                    service = service_type,
                    project = claim.project_uuid,
                    error = %e,
                    "quota push failed"
                );
                let backoff = compute::exponential_backoff(
                    self.cfg.sync_retry_interval,
                    self.cfg.backoff_factor,
                    claim.consecutive_sync_errors,
                    self.cfg.max_backoff,
                );
                db::services::record_sync_failure(
                    &self.pool,
                    claim.id,
                    &e.to_string(),
                    backoff,
                    elapsed,
                )
                .await?;
                self.metrics
                    .quota_syncs
                    .with_label_values(&[service_type, OUTCOME_ERROR])
                    .inc();
            }
        }
        Ok(())
    }
}
