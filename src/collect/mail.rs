//! Mail outbox drainer.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

use crate::collect::compute;
use crate::config::CollectorConfig;
use crate::datamodel::models::MailNotification;
use crate::db;
use crate::error::Result;
use crate::metrics::{Metrics, OUTCOME_ERROR, OUTCOME_SUCCESS};

/// Transport seam for outbox submission; tests inject a recorder, production
/// wires whatever the deployment uses.
#[async_trait::async_trait]
pub trait MailDelivery: Send + Sync {
    async fn deliver(&self, mail: &MailNotification) -> Result<()>;
}

/// Delivery that only logs; the default when no transport is configured.
pub struct LogMailer;

#[async_trait::async_trait]
impl MailDelivery for LogMailer {
    async fn deliver(&self, mail: &MailNotification) -> Result<()> {
        info!(
            project_id = mail.project_id,
            subject = mail.subject,
            "mail notification (no transport configured)"
        );
        Ok(())
    }
}

const SUBMIT_BACKOFF_BASE: Duration = Duration::from_secs(60);
const SUBMIT_BACKOFF_MAX: Duration = Duration::from_secs(6 * 60 * 60);

pub struct MailWorker {
    pool: PgPool,
    mailer: Arc<dyn MailDelivery>,
    cfg: CollectorConfig,
    metrics: Arc<Metrics>,
}

impl MailWorker {
    pub fn new(
        pool: PgPool,
        mailer: Arc<dyn MailDelivery>,
        cfg: CollectorConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            mailer,
            cfg,
            metrics,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("mail worker started");
        loop {
            let outcome = tokio::select! {
                _ = shutdown_rx.recv() => break,
                outcome = self.tick() => outcome,
            };

            match outcome {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!(error = ?e, "mail cycle failed"),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = time::sleep(self.cfg.mail_interval) => {}
            }
        }
        info!("mail worker exiting");
    }

    /// Claim and submit at most one outbox row. Returns whether a row was
    /// claimed.
    pub async fn tick(&self) -> Result<bool> {
        let Some(mail) = db::mail::claim_due(&self.pool, self.cfg.claim_lease).await? else {
            return Ok(false);
        };

        match self.mailer.deliver(&mail).await {
            Ok(()) => {
                db::mail::delete(&self.pool, mail.id).await?;
                self.metrics
                    .mail_submissions
                    .with_label_values(&[OUTCOME_SUCCESS])
                    .inc();
                debug!(mail_id = mail.id, "mail submitted");
            }
            Err(e) => {
                warn!(mail_id = mail.id, error = ?e, "mail submission failed");
                let backoff = compute::exponential_backoff(
                    SUBMIT_BACKOFF_BASE,
                    2.0,
                    mail.failed_submissions,
                    SUBMIT_BACKOFF_MAX,
                );
                db::mail::record_failure(&self.pool, mail.id, backoff).await?;
                self.metrics
                    .mail_submissions
                    .with_label_values(&[OUTCOME_ERROR])
                    .inc();
            }
        }
        Ok(true)
    }
}
