//! Rate scraper (one worker per service type).
//!
//! Rates are monotonically increasing counters of arbitrary precision. The
//! driver owns reset detection: it receives the opaque state it returned on
//! the previous call (empty string on the first one) and the scheduler stores
//! whatever counter value it returns, verbatim.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use num_bigint::BigUint;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::collect::compute;
use crate::collect::jittered;
use crate::config::CollectorConfig;
use crate::db;
use crate::db::services::ClaimedProjectService;
use crate::error::{DriverError, Result};
use crate::metrics::{Metrics, OUTCOME_ERROR, OUTCOME_SUCCESS};
use crate::plugins::{QuotaPlugin, RateScrapeResult};

pub struct RateScrapeWorker {
    pool: PgPool,
    cluster: Arc<Cluster>,
    plugin: Arc<dyn QuotaPlugin>,
    service_id: i64,
    cfg: CollectorConfig,
    metrics: Arc<Metrics>,
}

impl RateScrapeWorker {
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
        if self.plugin.rates().is_empty() {
            info!(
                service = self.plugin.service_type(),
                "service declares no rates, rate worker idle"
            );
            let _ = shutdown_rx.recv().await;
            return;
        }

        info!(service = self.plugin.service_type(), "rate scrape worker started");
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
                        "rate scrape cycle failed"
                    );
                    self.cfg.poll_floor
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(sleep) => {}
            }
        }
        info!(service = self.plugin.service_type(), "rate scrape worker exiting");
    }

    /// Claim and process at most one project-service. Returns whether a row
    /// was claimed.
    pub async fn tick(&self) -> Result<bool> {
        let Some(claim) =
            db::services::claim_due_rate_scrape(&self.pool, self.service_id, self.cfg.claim_lease)
                .await?
        else {
            return Ok(false);
        };
        self.scrape_claimed(&claim).await?;
        Ok(true)
    }

    async fn idle_sleep(&self) -> Duration {
        let cap = self.cfg.poll_floor.max(Duration::from_secs(60));
        match db::services::next_rate_scrape_due_in(&self.pool, self.service_id).await {
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
            "scraping rates"
        );

        let started = Instant::now();
        let outcome = match time::timeout(
            self.cfg.scrape_timeout,
            self.plugin
                .scrape_rates(&project, &claim.serialized_scrape_state),
        )
        .await
        {
            Ok(result) => result.and_then(|r| self.validate(r)),
            Err(_) => Err(DriverError::Transient(anyhow!(
                "rate scrape timed out after {:?}",
                self.cfg.scrape_timeout
            ))),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                self.apply_rates(claim, &result, elapsed).await?;
                self.metrics
                    .rate_scrapes
                    .with_label_values(&[self.plugin.service_type(), OUTCOME_SUCCESS])
                    .inc();
            }
            Err(e) => {
                if e.is_contract_violation() {
                    error!(
                        service = self.plugin.service_type(),
                        project = claim.project_uuid,
                        error = %e,
                        "rate scrape rejected, the driver violated its contract"
                    );
                } else {
                    warn!(
                        service = self.plugin.service_type(),
                        project = claim.project_uuid,
                        error = %e,
                        "rate scrape failed"
                    );
                }
                let backoff = compute::exponential_backoff(
                    self.cfg.rate_scrape_interval,
                    self.cfg.backoff_factor,
                    claim.consecutive_rate_scrape_errors,
                    self.cfg.max_backoff,
                );
                db::services::record_rate_scrape_error(
                    &self.pool,
                    claim.id,
                    &e.to_string(),
                    backoff,
                    elapsed,
                )
                .await?;
                self.metrics
                    .rate_scrapes
                    .with_label_values(&[self.plugin.service_type(), OUTCOME_ERROR])
                    .inc();
            }
        }
        Ok(())
    }

    /// Every reported rate must be declared, and every usage value must be a
    /// plain decimal string.
    fn validate(&self, result: RateScrapeResult) -> Result<RateScrapeResult, DriverError> {
        let service_type = self.plugin.service_type();
        for (name, usage) in &result.rates {
            if self.cluster.rate_info(service_type, name).is_none() {
                return Err(DriverError::contract(format!(
                    "rate scrape reported undeclared rate {service_type}/{name}"
                )));
            }
            if BigUint::from_str(usage).is_err() {
                return Err(DriverError::contract(format!(
                    "rate {service_type}/{name} reported non-decimal usage {usage:?}"
                )));
            }
        }
        Ok(result)
    }

    /// Store the reported counters and the driver's new state in one
    /// transaction. Rates without a reported value keep their old counter.
    async fn apply_rates(
        &self,
        claim: &ClaimedProjectService,
        result: &RateScrapeResult,
        elapsed: Duration,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let rows =
            db::rates::rates_for_service(&mut *tx, claim.project_id, self.service_id).await?;
        for row in &rows {
            if let Some(usage) = result.rates.get(&row.rate_name) {
                db::rates::store_usage(&mut tx, row.id, usage).await?;
            }
        }

        db::services::record_rate_scrape_success(
            &mut *tx,
            claim.id,
            &result.state,
            jittered(self.cfg.rate_scrape_interval),
            elapsed,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
