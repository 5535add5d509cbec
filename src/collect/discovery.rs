//! Domain/project discovery loop.
//!
//! Periodically enumerates the identity backend and reconciles the domains
//! and projects tables. Progress is committed per domain, so an identity
//! error mid-cycle keeps everything already processed; the next cycle
//! retries the rest.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info};

use crate::cluster::Cluster;
use crate::config::CollectorConfig;
use crate::db;
use crate::error::Result;
use crate::metrics::{Metrics, OUTCOME_ERROR, OUTCOME_SUCCESS};

/// Mutation counts for one discovery cycle. A cycle against an unchanged
/// identity backend reports all zeroes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub domains_created_or_renamed: u64,
    pub domains_deleted: u64,
    pub projects_created: u64,
    pub projects_updated: u64,
    pub projects_deleted: u64,
}

impl DiscoveryStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

pub struct DiscoveryLoop {
    pool: PgPool,
    cluster: Arc<Cluster>,
    cfg: CollectorConfig,
    metrics: Arc<Metrics>,
}

impl DiscoveryLoop {
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
        info!("discovery loop started");
        loop {
            match discover_once(&self.pool, &self.cluster).await {
                Ok(stats) => {
                    self.metrics
                        .discovery_runs
                        .with_label_values(&[OUTCOME_SUCCESS])
                        .inc();
                    if stats.is_noop() {
                        debug!("discovery cycle complete, nothing changed");
                    } else {
                        info!(
                            domains_changed = stats.domains_created_or_renamed,
                            domains_deleted = stats.domains_deleted,
                            projects_created = stats.projects_created,
                            projects_updated = stats.projects_updated,
                            projects_deleted = stats.projects_deleted,
                            "discovery cycle complete"
                        );
                    }
                }
                Err(e) => {
                    // Identity errors abort the cycle only; committed domains
                    // stay.
                    error!(error = ?e, "discovery cycle aborted");
                    self.metrics
                        .discovery_runs
                        .with_label_values(&[OUTCOME_ERROR])
                        .inc();
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(self.cfg.discover_interval) => {}
            }
        }
        info!("discovery loop exiting");
    }
}

/// One full discovery cycle. Free function so tests and the loop share it.
///
/// Running it twice against an unchanged identity backend produces zero
/// database mutations on the second run.
pub async fn discover_once(pool: &PgPool, cluster: &Cluster) -> Result<DiscoveryStats> {
    let discovery = cluster.registry.discovery();
    let mut stats = DiscoveryStats::default();

    let domains = discovery.list_domains().await?;

    for discovered_domain in &domains {
        // The project listing happens before the transaction opens; no
        // transaction is held across a backend call.
        let projects = discovery.list_projects(discovered_domain).await?;

        let mut tx = pool.begin().await?;

        let (domain, changed) = db::projects::upsert_domain(&mut tx, discovered_domain).await?;
        if changed {
            stats.domains_created_or_renamed += 1;
        }

        let known: std::collections::HashMap<String, i64> =
            db::projects::projects_in_domain(&mut *tx, domain.id)
                .await?
                .into_iter()
                .map(|p| (p.uuid, p.id))
                .collect();

        let mut present_uuids = Vec::with_capacity(projects.len());
        for project in &projects {
            present_uuids.push(project.uuid.clone());
            match known.get(&project.uuid) {
                Some(&project_id) => {
                    if db::projects::update_project_metadata(&mut *tx, project_id, project).await? {
                        stats.projects_updated += 1;
                    }
                }
                None => {
                    db::projects::create_project(&mut tx, domain.id, project).await?;
                    stats.projects_created += 1;
                    debug!(
                        domain = discovered_domain.name,
                        project = project.name,
                        "new project discovered"
                    );
                }
            }
        }

        stats.projects_deleted +=
            db::projects::delete_projects_absent(&mut *tx, domain.id, &present_uuids).await?;

        tx.commit().await?;
    }

    // Domains that disappeared upstream go last, in their own transaction.
    let present: Vec<String> = domains.iter().map(|d| d.uuid.clone()).collect();
    stats.domains_deleted = db::projects::delete_domains_absent(pool, &present).await?;

    Ok(stats)
}
