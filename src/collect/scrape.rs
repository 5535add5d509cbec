//! Quota/usage scraper (one worker per service type).
//!
//! Claims the most overdue project-service of its type, polls the backend
//! driver, and applies the result in a single transaction: project-resource
//! upserts with the quota rule, per-AZ usage rows, desync detection, and the
//! scheduling bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::collect::compute;
use crate::collect::jittered;
use crate::config::CollectorConfig;
use crate::datamodel::types::{ResourceData, Topology};
use crate::db;
use crate::db::services::ClaimedProjectService;
use crate::error::{DriverError, Result};
use crate::metrics::{Metrics, OUTCOME_ERROR, OUTCOME_SUCCESS};
use crate::plugins::{QuotaPlugin, ScrapeResult};

pub struct QuotaScrapeWorker {
    pool: PgPool,
    cluster: Arc<Cluster>,
    plugin: Arc<dyn QuotaPlugin>,
    service_id: i64,
    cfg: CollectorConfig,
    metrics: Arc<Metrics>,
}

impl QuotaScrapeWorker {
    pub fn new(
        pool: PgPool,
        cluster: Arc<Cluster>,
        plugin: Arc<dyn QuotaPlugin>,
        service_id: i64,
        cfg: CollectorConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            cluster,
            plugin,
            service_id,
            cfg,
            metrics,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(service = self.plugin.service_type(), "quota scrape worker started");
        loop {
            let outcome = tokio::select! {
                _ = shutdown_rx.recv() => break,
                outcome = self.tick() => outcome,
            };

            let sleep = match outcome {
                Ok(true) => continue,
                Ok(false) => self.idle_sleep().await,
                Err(e) => {
                    warn!(
                        service = self.plugin.service_type(),
                        error = ?e,
                        "scrape cycle failed"
                    );
                    self.cfg.poll_floor
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(sleep) => {}
            }
        }
        info!(service = self.plugin.service_type(), "quota scrape worker exiting");
    }

    /// Claim and process at most one project-service. Returns whether a row
    /// was claimed.
    pub async fn tick(&self) -> Result<bool> {
        let Some(claim) =
            db::services::claim_due_scrape(&self.pool, self.service_id, self.cfg.claim_lease)
                .await?
        else {
            return Ok(false);
        };
        self.scrape_claimed(&claim).await?;
        Ok(true)
    }

    /// Sleep until the next row becomes due, at least the poll floor. Capped
    /// so that rows seeded by discovery mid-sleep are picked up promptly.
    async fn idle_sleep(&self) -> Duration {
        let cap = self.cfg.poll_floor.max(Duration::from_secs(60));
        match db::services::next_scrape_due_in(&self.pool, self.service_id).await {
            Ok(Some(until_due)) => until_due.clamp(self.cfg.poll_floor, cap),
            Ok(None) => cap,
            Err(e) => {
                warn!(error = ?e, "failed to query next due time");
                self.cfg.poll_floor
            }
        }
    }

    async fn scrape_claimed(&self, claim: &ClaimedProjectService) -> Result<()> {
        let project = claim.project_ref();
        debug!(
            service = self.plugin.service_type(),
            project = project.uuid,
            "scraping quota/usage"
        );

        let started = Instant::now();
        let outcome = match time::timeout(self.cfg.scrape_timeout, self.plugin.scrape(&project))
            .await
        {
            Ok(result) => result.and_then(|r| self.validate(r)),
            Err(_) => Err(DriverError::Transient(anyhow!(
                "scrape timed out after {:?}",
                self.cfg.scrape_timeout
            ))),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                self.apply_scrape(claim, &result, elapsed).await?;
                self.metrics
                    .scrapes
                    .with_label_values(&[self.plugin.service_type(), OUTCOME_SUCCESS])
                    .inc();
                debug!(
                    service = self.plugin.service_type(),
                    project = claim.project_uuid,
                    elapsed = format!("{elapsed:.2?}"),
                    "scrape complete"
                );
            }
            Err(e) => {
                if e.is_contract_violation() {
                    error!(
                        service = self.plugin.service_type(),
                        project = claim.project_uuid,
                        error = %e,
                        "scrape rejected, the driver violated its contract"
                    );
                } else {
                    warn!(
                        service = self.plugin.service_type(),
                        project = claim.project_uuid,
                        error = %e,
                        "scrape failed"
                    );
                }
                let backoff = compute::exponential_backoff(
                    self.cfg.scrape_interval,
                    self.cfg.backoff_factor,
                    claim.consecutive_scrape_errors,
                    self.cfg.max_backoff,
                );
                db::services::record_scrape_error(
                    &self.pool,
                    claim.id,
                    &e.to_string(),
                    backoff,
                    elapsed,
                )
                .await?;
                self.metrics
                    .scrapes
                    .with_label_values(&[self.plugin.service_type(), OUTCOME_ERROR])
                    .inc();
            }
        }
        Ok(())
    }

    /// Every reported resource name must be declared by the driver.
    fn validate(&self, result: ScrapeResult) -> Result<ScrapeResult, DriverError> {
        let service_type = self.plugin.service_type();
        for name in result.resources.keys() {
            if !self.cluster.has_resource(service_type, name) {
                return Err(DriverError::contract(format!(
                    "scrape reported undeclared resource {service_type}/{name}"
                )));
            }
        }
        Ok(result)
    }

    /// Apply one successful scrape in a single transaction.
    async fn apply_scrape(
        &self,
        claim: &ClaimedProjectService,
        result: &ScrapeResult,
        elapsed: Duration,
    ) -> Result<()> {
        let service_type = self.plugin.service_type();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let resource_ids =
            db::cluster::resource_ids_for_service(&mut *tx, self.service_id).await?;
        let existing: HashMap<String, db::resources::ProjectResourceRow> =
            db::resources::resources_for_service(&mut *tx, claim.project_id, self.service_id)
                .await?
                .into_iter()
                .map(|row| (row.resource_name.clone(), row))
                .collect();

        let mut any_desynced = false;
        for info in self.plugin.resources() {
            let Some(&resource_id) = resource_ids.get(&info.name) else {
                anyhow::bail!("no cluster_resources row for {service_type}/{}", info.name);
            };
            let reported: Option<&ResourceData> = result.resources.get(&info.name);
            let behavior = self.cluster.behavior_for(service_type, &info.name);

            // A quota-bearing resource gets a project-resource row whether or
            // not the driver reported it this time.
            let mut az_quota: Option<i64> = None;
            if info.has_quota {
                let existing_row = existing.get(&info.name);
                let policy = compute::QuotaPolicy {
                    constraint: self.cluster.constraints.for_project(
                        &claim.domain_name,
                        &claim.project_name,
                        service_type,
                        &info.name,
                    ),
                    behavior: &behavior,
                    forbidden: existing_row.is_some_and(|r| r.forbidden),
                    override_quota: existing_row
                        .and_then(|r| r.override_quota_from_config)
                        .and_then(|v| u64::try_from(v).ok()),
                    max_quota_from_outside_admin: existing_row
                        .and_then(|r| r.max_quota_from_outside_admin)
                        .and_then(|v| u64::try_from(v).ok()),
                    max_quota_from_local_admin: existing_row
                        .and_then(|r| r.max_quota_from_local_admin)
                        .and_then(|v| u64::try_from(v).ok()),
                };

                let reported_quota = reported.map(|r| r.quota);
                let initial = compute::initial_quota(
                    reported_quota.and_then(|q| u64::try_from(q).ok()),
                    info.auto_approve_initial_quota,
                    &policy,
                ) as i64;

                let row = db::resources::upsert_scraped_resource(
                    &mut tx,
                    claim.project_id,
                    resource_id,
                    Some(initial),
                    reported_quota,
                )
                .await?;

                let approved = row.quota.unwrap_or(0).max(0) as u64;
                let desired = compute::desired_backend_quota(
                    approved,
                    &behavior,
                    self.cluster.bursting_max_multiplier,
                );
                if desired.negative_multiplier_rejected {
                    error!(
                        service = service_type,
                        resource = info.name,
                        "negative burst multiplier rejected at runtime"
                    );
                }
                match row.backend_quota {
                    Some(observed) if observed >= 0 && observed as u64 == desired.value => {}
                    _ => any_desynced = true,
                }

                if info.topology == Topology::AzAware {
                    az_quota = row.quota;
                }
            }

            // Per-AZ usage rows, for quota-bearing and usage-only resources
            // alike.
            let reported_az = reported.map(|r| r.per_az.clone()).unwrap_or_default();
            let normalized = compute::normalize_per_az(info.topology, &reported_az);
            let existing_az: HashMap<String, db::resources::ProjectAzResourceRow> =
                db::resources::az_rows_for_resource(&mut *tx, claim.project_id, resource_id)
                    .await?
                    .into_iter()
                    .map(|row| (row.az.clone(), row))
                    .collect();

            let keep_subresources = self.cluster.subresources_enabled(service_type, &info.name);
            let mut present_ids = Vec::new();
            for (az, usage) in &normalized {
                let az_resource_id =
                    db::resources::ensure_az_resource(&mut tx, resource_id, az.as_str()).await?;
                let history = compute::append_usage_history(
                    existing_az
                        .get(az.as_str())
                        .map(|row| &row.historical_usage)
                        .unwrap_or(&Value::Null),
                    now,
                    usage.usage,
                );
                let subresources = if keep_subresources {
                    Value::Array(usage.subresources.clone())
                } else {
                    Value::Array(Vec::new())
                };
                db::resources::upsert_az_resource(
                    &mut tx,
                    claim.project_id,
                    az_resource_id,
                    az_quota,
                    usage.usage as i64,
                    usage.physical_usage.map(|v| v as i64),
                    subresources,
                    history,
                )
                .await?;
                present_ids.push(az_resource_id);
            }
            db::resources::delete_az_rows_absent(
                &mut tx,
                claim.project_id,
                resource_id,
                &present_ids,
            )
            .await?;
        }

        if any_desynced {
            db::services::mark_desynced(&mut *tx, claim.id).await?;
        } else {
            db::services::clear_desynced(&mut *tx, claim.id).await?;
        }

        db::services::record_scrape_success(
            &mut *tx,
            claim.id,
            jittered(self.cfg.scrape_interval),
            elapsed,
            &result.serialized_metrics,
        )
        .await?;

        tx.commit().await?;

        // Surface driver metrics outside the transaction.
        match self.plugin.collect_metrics(&result.serialized_metrics) {
            Ok(samples) => {
                for sample in samples {
                    self.metrics
                        .plugin_samples
                        .with_label_values(&[service_type, &sample.name])
                        .set(sample.value);
                }
            }
            Err(e) => warn!(service = service_type, error = %e, "collect_metrics failed"),
        }

        Ok(())
    }
}
