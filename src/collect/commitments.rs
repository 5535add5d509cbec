//! Commitment sweeper.
//!
//! Walks the commitment lifecycle forward: planned commitments whose
//! confirmation window opened become pending, pending ones are confirmed
//! oldest-first while committable capacity remains, everything past its end
//! date expires, and owners of soon-expiring commitments get an outbox
//! notification.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::config::CollectorConfig;
use crate::db;
use crate::error::Result;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub promoted_to_pending: u64,
    pub confirmed: u64,
    pub expired: u64,
    pub expiration_notices: u64,
}

pub struct CommitmentSweeper {
    pool: PgPool,
    cluster: Arc<Cluster>,
    cfg: CollectorConfig,
}

impl CommitmentSweeper {
    pub fn new(pool: PgPool, cluster: Arc<Cluster>, cfg: CollectorConfig) -> Self {
        Self { pool, cluster, cfg }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("commitment sweeper started");
        loop {
            match sweep_once(&self.pool, &self.cluster, &self.cfg).await {
                Ok(stats) => debug!(
                    promoted = stats.promoted_to_pending,
                    confirmed = stats.confirmed,
                    expired = stats.expired,
                    notices = stats.expiration_notices,
                    "commitment sweep complete"
                ),
                Err(e) => warn!(error = ?e, "commitment sweep failed"),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(self.cfg.commitment_interval) => {}
            }
        }
        info!("commitment sweeper exiting");
    }
}

/// One full sweep; free function so tests can drive it directly.
pub async fn sweep_once(
    pool: &PgPool,
    cluster: &Cluster,
    cfg: &CollectorConfig,
) -> Result<SweepStats> {
    let mut stats = SweepStats::default();
    let mut tx = pool.begin().await?;

    stats.expired = db::commitments::expire_due(&mut *tx).await?;
    stats.promoted_to_pending = db::commitments::transition_planned(&mut *tx).await?;

    // Confirm pending commitments oldest-first, as long as the committable
    // capacity of their AZ resource allows. Active commitments count against
    // that capacity even before any usage materializes.
    let mut active_amounts: HashMap<i64, i64> =
        db::commitments::active_amounts_by_az_resource(&mut *tx).await?;
    for pending in db::commitments::pending_in_order(&mut *tx).await? {
        let behavior = cluster.behavior_for(&pending.service_type, &pending.resource_name);
        let committable = behavior
            .overcommit_factor
            .apply_to(pending.raw_capacity.max(0) as u64) as i64;
        let committed = active_amounts
            .get(&pending.az_resource_id)
            .copied()
            .unwrap_or(0);

        if committed + pending.amount > committable {
            debug!(
                commitment = pending.uuid,
                az = pending.az,
                amount = pending.amount,
                committed,
                committable,
                "commitment not confirmable yet"
            );
            continue;
        }

        db::commitments::confirm(&mut *tx, pending.id).await?;
        *active_amounts.entry(pending.az_resource_id).or_insert(0) += pending.amount;
        stats.confirmed += 1;

        if pending.notify_on_confirm {
            db::mail::enqueue(
                &mut *tx,
                pending.project_id,
                &format!("Commitment {} confirmed", pending.uuid),
                &format!(
                    "Your commitment over {} {}/{} in {} is now active.",
                    pending.amount, pending.service_type, pending.resource_name, pending.az
                ),
            )
            .await?;
        }
    }

    // Expiration notices, once per commitment.
    for expiring in
        db::commitments::expiring_soon_unnotified(&mut *tx, cfg.expiration_notice_period).await?
    {
        db::mail::enqueue(
            &mut *tx,
            expiring.project_id,
            &format!("Commitment {} expires soon", expiring.uuid),
            &format!(
                "Your commitment over {} {}/{} in {} expires at {}.",
                expiring.amount,
                expiring.service_type,
                expiring.resource_name,
                expiring.az,
                expiring.expires_at.to_rfc3339()
            ),
        )
        .await?;
        db::commitments::mark_notified_for_expiration(&mut *tx, expiring.id).await?;
        stats.expiration_notices += 1;
    }

    tx.commit().await?;
    Ok(stats)
}
