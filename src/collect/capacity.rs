//! Capacity scraper (one worker per capacitor).
//!
//! Runs on a fixed interval rather than a claim queue: capacity is
//! cluster-level state and this process is the only writer for its cluster.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tokio::sync::{Mutex, broadcast};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::config::CollectorConfig;
use crate::datamodel::types::{AvailabilityZone, Topology, sum_capacity};
use crate::db;
use crate::error::{DriverError, Result};
use crate::metrics::{Metrics, OUTCOME_ERROR, OUTCOME_SUCCESS};
use crate::plugins::{CapacityPlugin, CapacityScrapeResult};

pub struct CapacityWorker {
    pool: sqlx::PgPool,
    cluster: Arc<Cluster>,
    plugin: Arc<dyn CapacityPlugin>,
    cfg: CollectorConfig,
    metrics: Arc<Metrics>,
    /// Service types this capacitor fed on its last successful pass; an
    /// error is recorded on exactly these rows.
    last_served: Mutex<Vec<String>>,
}

impl CapacityWorker {
    pub fn new(
        pool: sqlx::PgPool,
        cluster: Arc<Cluster>,
        plugin: Arc<dyn CapacityPlugin>,
        cfg: CollectorConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            cluster,
            plugin,
            cfg,
            metrics,
            last_served: Mutex::new(Vec::new()),
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(capacitor = self.plugin.capacitor_id(), "capacity worker started");
        loop {
            if let Err(e) = self.scrape_once().await {
                warn!(
                    capacitor = self.plugin.capacitor_id(),
                    error = ?e,
                    "capacity pass failed"
                );
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(self.cfg.capacity_interval) => {}
            }
        }
        info!(capacitor = self.plugin.capacitor_id(), "capacity worker exiting");
    }

    /// One full capacity pass; public so tests can drive it directly.
    pub async fn scrape_once(&self) -> Result<()> {
        let capacitor_id = self.plugin.capacitor_id();
        let started = Instant::now();

        let outcome = match time::timeout(self.cfg.scrape_timeout, self.plugin.scrape()).await {
            Ok(result) => result.and_then(|r| self.validate(r)),
            Err(_) => Err(DriverError::Transient(anyhow!(
                "capacity scrape timed out after {:?}",
                self.cfg.scrape_timeout
            ))),
        };

        match outcome {
            Ok(result) => {
                self.apply_capacity(&result).await?;
                self.metrics
                    .capacity_scrapes
                    .with_label_values(&[capacitor_id, OUTCOME_SUCCESS])
                    .inc();
                debug!(
                    capacitor = capacitor_id,
                    services = result.capacities.len(),
                    elapsed = format!("{:.2?}", started.elapsed()),
                    "capacity pass complete"
                );
                Ok(())
            }
            Err(e) => {
                if e.is_contract_violation() {
                    error!(capacitor = capacitor_id, error = %e, "capacity scrape rejected");
                } else {
                    warn!(capacitor = capacitor_id, error = %e, "capacity scrape failed");
                }
                let last_served = self.last_served.lock().await.clone();
                if !last_served.is_empty() {
                    db::cluster::record_service_capacity_error(
                        &self.pool,
                        &last_served,
                        &e.to_string(),
                    )
                    .await?;
                }
                self.metrics
                    .capacity_scrapes
                    .with_label_values(&[capacitor_id, OUTCOME_ERROR])
                    .inc();
                Ok(())
            }
        }
    }

    /// Every reported (service, resource) must be declared by some quota
    /// driver.
    fn validate(&self, result: CapacityScrapeResult) -> Result<CapacityScrapeResult, DriverError> {
        for (service_type, resources) in &result.capacities {
            for resource_name in resources.keys() {
                if !self.cluster.has_resource(service_type, resource_name) {
                    return Err(DriverError::contract(format!(
                        "capacitor {} reported undeclared resource {service_type}/{resource_name}",
                        self.plugin.capacitor_id()
                    )));
                }
            }
        }
        Ok(result)
    }

    async fn apply_capacity(&self, result: &CapacityScrapeResult) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mut served = Vec::new();
        for (service_type, resources) in &result.capacities {
            served.push(service_type.clone());
            for (resource_name, per_az) in resources {
                let Some(info) = self.cluster.resource_info(service_type, resource_name) else {
                    continue;
                };

                // Flat resources land on the synthetic "any" zone.
                let mut normalized = per_az.clone();
                if info.topology == Topology::Flat {
                    let total = sum_capacity(normalized.values());
                    normalized.clear();
                    normalized.insert(AvailabilityZone::any(), total);
                }

                if !self.cluster.subcapacities_enabled(service_type, resource_name) {
                    for data in normalized.values_mut() {
                        data.subcapacities.clear();
                    }
                }

                db::cluster::store_capacity(&mut tx, service_type, resource_name, &normalized)
                    .await?;
            }

            db::cluster::record_service_capacity_success(
                &mut *tx,
                service_type,
                &result.serialized_metrics,
                self.cfg.capacity_interval,
            )
            .await?;
        }

        tx.commit().await?;
        *self.last_served.lock().await = served;
        Ok(())
    }
}
