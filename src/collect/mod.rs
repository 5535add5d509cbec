//! The collector: all long-running worker loops.
//!
//! There is no in-process work queue; the database is the queue. Every loop
//! claims its next target with `FOR UPDATE SKIP LOCKED`, talks to the backend
//! outside any transaction, and records the outcome in a single transaction
//! so readers never observe a partial update.

pub mod capacity;
pub mod commitments;
pub mod compute;
pub mod consistency;
pub mod discovery;
pub mod mail;
pub mod rates;
pub mod scrape;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::config::CollectorConfig;
use crate::db;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::services::Service;

/// Spread repeated timers by ±5% so that all project-services seeded at the
/// same instant do not stay due at the same instant forever.
pub(crate) fn jittered(duration: Duration) -> Duration {
    let factor = rand::rng().random_range(0.95..1.05);
    duration.mul_f64(factor)
}

/// The service that owns every collector loop: discovery, one quota/usage
/// worker and one rate worker per service type, one capacity worker per
/// capacitor, the consistency reconciler, the quota sync pusher, the mail
/// drainer, the commitment sweeper and the metrics listener.
pub struct CollectorService {
    pool: PgPool,
    cluster: Arc<Cluster>,
    cfg: CollectorConfig,
    metrics: Arc<Metrics>,
    mailer: Arc<dyn mail::MailDelivery>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl CollectorService {
    pub fn new(
        pool: PgPool,
        cluster: Arc<Cluster>,
        cfg: CollectorConfig,
        metrics: Arc<Metrics>,
        mailer: Arc<dyn mail::MailDelivery>,
    ) -> Self {
        Self {
            pool,
            cluster,
            cfg,
            metrics,
            mailer,
            handles: Vec::new(),
            shutdown_tx: None,
        }
    }

    /// Reconcile declarations and spawn all loops.
    pub async fn start(&mut self) -> Result<()> {
        db::cluster::sync_declarations(&self.pool, &self.cluster).await?;
        let service_ids = db::cluster::service_ids_by_type(&self.pool).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let discovery = discovery::DiscoveryLoop::new(
            self.pool.clone(),
            self.cluster.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
        );
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { discovery.run(rx).await }));

        for plugin in self.cluster.registry.quota_plugins() {
            let service_type = plugin.service_type().to_string();
            let Some(&service_id) = service_ids.get(&service_type) else {
                warn!(service = service_type, "no cluster_services row, skipping workers");
                continue;
            };

            let worker = scrape::QuotaScrapeWorker::new(
                self.pool.clone(),
                self.cluster.clone(),
                plugin.clone(),
                service_id,
                self.cfg.clone(),
                self.metrics.clone(),
            );
            let rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));

            let worker = rates::RateScrapeWorker::new(
                self.pool.clone(),
                self.cluster.clone(),
                plugin.clone(),
                service_id,
                self.cfg.clone(),
                self.metrics.clone(),
            );
            let rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        for plugin in self.cluster.registry.capacity_plugins() {
            let worker = capacity::CapacityWorker::new(
                self.pool.clone(),
                self.cluster.clone(),
                plugin.clone(),
                self.cfg.clone(),
                self.metrics.clone(),
            );
            let rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        let reconciler = consistency::ConsistencyLoop::new(
            self.pool.clone(),
            self.cluster.clone(),
            self.cfg.clone(),
        );
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { reconciler.run(rx).await }));

        let pusher = sync::QuotaSyncWorker::new(
            self.pool.clone(),
            self.cluster.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
        );
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { pusher.run(rx).await }));

        let drainer = mail::MailWorker::new(
            self.pool.clone(),
            self.mailer.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
        );
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { drainer.run(rx).await }));

        let sweeper = commitments::CommitmentSweeper::new(
            self.pool.clone(),
            self.cluster.clone(),
            self.cfg.clone(),
        );
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { sweeper.run(rx).await }));

        let metrics = self.metrics.clone();
        let address = self.cfg.metrics_listen_address.clone();
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(&address, metrics, rx).await {
                warn!(error = ?e, "metrics listener failed");
            }
        }));

        info!(tasks = handles.len(), "collector loops spawned");
        self.handles = handles;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for CollectorService {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn run(&mut self) -> Result<()> {
        self.start().await?;
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down collector");
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        } else {
            anyhow::bail!("collector was never started");
        }

        let results = futures::future::join_all(self.handles.drain(..)).await;
        let panicked = results.iter().filter(|r| r.is_err()).count();
        if panicked > 0 {
            anyhow::bail!("{panicked} collector task(s) panicked during shutdown");
        }

        info!("all collector loops exited");
        Ok(())
    }
}
