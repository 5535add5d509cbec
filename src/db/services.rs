//! Scheduling-state operations on project_services rows.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgExecutor;
use std::time::Duration;

use crate::error::Result;
use crate::plugins::ProjectRef;

/// A project-service row claimed for scraping or quota sync, joined with the
/// identity fields drivers need.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedProjectService {
    pub id: i64,
    pub project_id: i64,
    pub service_id: i64,
    pub service_type: String,
    pub consecutive_scrape_errors: i32,
    pub consecutive_rate_scrape_errors: i32,
    pub consecutive_sync_errors: i32,
    pub serialized_scrape_state: String,
    pub project_uuid: String,
    pub project_name: String,
    pub domain_uuid: String,
    pub domain_name: String,
}

impl ClaimedProjectService {
    pub fn project_ref(&self) -> ProjectRef {
        ProjectRef {
            uuid: self.project_uuid.clone(),
            name: self.project_name.clone(),
            domain_uuid: self.domain_uuid.clone(),
            domain_name: self.domain_name.clone(),
        }
    }
}

const CLAIM_COLUMNS: &str = "ps.id, ps.project_id, ps.service_id, cs.type AS service_type, \
     ps.consecutive_scrape_errors, ps.consecutive_rate_scrape_errors, ps.consecutive_sync_errors, \
     ps.serialized_scrape_state, \
     p.uuid AS project_uuid, p.name AS project_name, d.uuid AS domain_uuid, d.name AS domain_name";

/// Claim the most overdue project-service of one service type for a
/// quota/usage scrape, preferring stale rows.
///
/// The claim clears `stale` and pushes `next_scrape_at` forward by the lease
/// so that other workers skip the row while the scrape is in flight. The
/// scrape outcome overwrites the provisional timestamp.
pub async fn claim_due_scrape(
    pool: &PgPool,
    service_id: i64,
    lease: Duration,
) -> Result<Option<ClaimedProjectService>> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, ClaimedProjectService>(&format!(
        "SELECT {CLAIM_COLUMNS} \
         FROM project_services ps \
         JOIN cluster_services cs ON cs.id = ps.service_id \
         JOIN projects p ON p.id = ps.project_id \
         JOIN domains d ON d.id = p.domain_id \
         WHERE ps.service_id = $1 AND (ps.stale OR ps.next_scrape_at <= NOW()) \
         ORDER BY ps.stale DESC, ps.next_scrape_at ASC \
         LIMIT 1 \
         FOR UPDATE OF ps SKIP LOCKED"
    ))
    .bind(service_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(ref claim) = claimed {
        sqlx::query(
            "UPDATE project_services \
             SET stale = FALSE, next_scrape_at = NOW() + make_interval(secs => $2) \
             WHERE id = $1",
        )
        .bind(claim.id)
        .bind(lease.as_secs_f64())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(claimed)
}

/// Record a successful quota/usage scrape. Runs on the transaction that also
/// wrote the resource rows, so readers never observe a partial update.
pub async fn record_scrape_success(
    executor: impl PgExecutor<'_>,
    project_service_id: i64,
    next_interval: Duration,
    duration: Duration,
    serialized_metrics: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE project_services \
         SET scraped_at = NOW(), checked_at = NOW(), stale = FALSE, \
             scrape_error_message = '', consecutive_scrape_errors = 0, \
             scrape_duration_secs = $2, serialized_metrics = $3, \
             next_scrape_at = NOW() + make_interval(secs => $4) \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .bind(duration.as_secs_f64())
    .bind(serialized_metrics)
    .bind(next_interval.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

/// Record a failed quota/usage scrape: the error text is persisted, the error
/// counter grows and the next attempt is pushed out by `backoff`.
/// `scraped_at` keeps its previous value.
pub async fn record_scrape_error(
    executor: impl PgExecutor<'_>,
    project_service_id: i64,
    message: &str,
    backoff: Duration,
    duration: Duration,
) -> Result<()> {
    sqlx::query(
        "UPDATE project_services \
         SET checked_at = NOW(), stale = FALSE, \
             scrape_error_message = $2, \
             consecutive_scrape_errors = consecutive_scrape_errors + 1, \
             scrape_duration_secs = $3, \
             next_scrape_at = NOW() + make_interval(secs => $4) \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .bind(message)
    .bind(duration.as_secs_f64())
    .bind(backoff.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

/// Claim the most overdue project-service of one service type for a rate
/// scrape. Same lease semantics as [`claim_due_scrape`].
pub async fn claim_due_rate_scrape(
    pool: &PgPool,
    service_id: i64,
    lease: Duration,
) -> Result<Option<ClaimedProjectService>> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, ClaimedProjectService>(&format!(
        "SELECT {CLAIM_COLUMNS} \
         FROM project_services ps \
         JOIN cluster_services cs ON cs.id = ps.service_id \
         JOIN projects p ON p.id = ps.project_id \
         JOIN domains d ON d.id = p.domain_id \
         WHERE ps.service_id = $1 AND (ps.rates_stale OR ps.rates_next_scrape_at <= NOW()) \
         ORDER BY ps.rates_stale DESC, ps.rates_next_scrape_at ASC \
         LIMIT 1 \
         FOR UPDATE OF ps SKIP LOCKED"
    ))
    .bind(service_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(ref claim) = claimed {
        sqlx::query(
            "UPDATE project_services \
             SET rates_stale = FALSE, rates_next_scrape_at = NOW() + make_interval(secs => $2) \
             WHERE id = $1",
        )
        .bind(claim.id)
        .bind(lease.as_secs_f64())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(claimed)
}

/// Record a successful rate scrape, including the driver's new opaque state.
pub async fn record_rate_scrape_success(
    executor: impl PgExecutor<'_>,
    project_service_id: i64,
    new_state: &str,
    next_interval: Duration,
    duration: Duration,
) -> Result<()> {
    sqlx::query(
        "UPDATE project_services \
         SET rates_scraped_at = NOW(), rates_stale = FALSE, \
             rates_scrape_error_message = '', consecutive_rate_scrape_errors = 0, \
             rates_scrape_duration_secs = $2, serialized_scrape_state = $3, \
             rates_next_scrape_at = NOW() + make_interval(secs => $4) \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .bind(duration.as_secs_f64())
    .bind(new_state)
    .bind(next_interval.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

/// Record a failed rate scrape. The stored scrape state is left untouched so
/// the next attempt replays the same `prev_state`.
pub async fn record_rate_scrape_error(
    executor: impl PgExecutor<'_>,
    project_service_id: i64,
    message: &str,
    backoff: Duration,
    duration: Duration,
) -> Result<()> {
    sqlx::query(
        "UPDATE project_services \
         SET rates_stale = FALSE, \
             rates_scrape_error_message = $2, \
             consecutive_rate_scrape_errors = consecutive_rate_scrape_errors + 1, \
             rates_scrape_duration_secs = $3, \
             rates_next_scrape_at = NOW() + make_interval(secs => $4) \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .bind(message)
    .bind(duration.as_secs_f64())
    .bind(backoff.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

/// Claim a project-service whose quota needs to be pushed to the backend.
///
/// Eligible rows have a `quota_desynced_at` in the past; failure backoff
/// moves the timestamp into the future, which keeps the row marked but not
/// yet claimable. The claim itself pushes the timestamp by the lease for the
/// same reason as the scrape claims.
pub async fn claim_desynced(
    pool: &PgPool,
    lease: Duration,
) -> Result<Option<ClaimedProjectService>> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, ClaimedProjectService>(&format!(
        "SELECT {CLAIM_COLUMNS} \
         FROM project_services ps \
         JOIN cluster_services cs ON cs.id = ps.service_id \
         JOIN projects p ON p.id = ps.project_id \
         JOIN domains d ON d.id = p.domain_id \
         WHERE ps.quota_desynced_at IS NOT NULL AND ps.quota_desynced_at <= NOW() \
         ORDER BY ps.quota_desynced_at ASC \
         LIMIT 1 \
         FOR UPDATE OF ps SKIP LOCKED"
    ))
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(ref claim) = claimed {
        sqlx::query(
            "UPDATE project_services \
             SET quota_desynced_at = NOW() + make_interval(secs => $2) \
             WHERE id = $1",
        )
        .bind(claim.id)
        .bind(lease.as_secs_f64())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(claimed)
}

/// Clear the desync marker after a successful push.
pub async fn record_sync_success(
    executor: impl PgExecutor<'_>,
    project_service_id: i64,
    duration: Duration,
) -> Result<()> {
    sqlx::query(
        "UPDATE project_services \
         SET quota_desynced_at = NULL, consecutive_sync_errors = 0, \
             quota_sync_error_message = '', quota_sync_duration_secs = $2 \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .bind(duration.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

/// Keep the desync marker but delay the next push attempt by `backoff`.
pub async fn record_sync_failure(
    executor: impl PgExecutor<'_>,
    project_service_id: i64,
    message: &str,
    backoff: Duration,
    duration: Duration,
) -> Result<()> {
    sqlx::query(
        "UPDATE project_services \
         SET quota_desynced_at = NOW() + make_interval(secs => $2), \
             consecutive_sync_errors = consecutive_sync_errors + 1, \
             quota_sync_error_message = $3, quota_sync_duration_secs = $4 \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .bind(backoff.as_secs_f64())
    .bind(message)
    .bind(duration.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}

/// Mark a project-service as desynced now, unless a marker (possibly pushed
/// into the future by sync backoff) already exists.
pub async fn mark_desynced(executor: impl PgExecutor<'_>, project_service_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE project_services SET quota_desynced_at = COALESCE(quota_desynced_at, NOW()) \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Drop the desync marker, e.g. when a scrape observes convergence.
pub async fn clear_desynced(executor: impl PgExecutor<'_>, project_service_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE project_services \
         SET quota_desynced_at = NULL, consecutive_sync_errors = 0, quota_sync_error_message = '' \
         WHERE id = $1",
    )
    .bind(project_service_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Force an immediate re-scrape of every service of one project.
pub async fn mark_stale_for_project(
    executor: impl PgExecutor<'_>,
    project_id: i64,
) -> Result<()> {
    sqlx::query("UPDATE project_services SET stale = TRUE WHERE project_id = $1")
        .bind(project_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Seconds until the next project-service of this type becomes due, if any.
pub async fn next_scrape_due_in(
    executor: impl PgExecutor<'_>,
    service_id: i64,
) -> Result<Option<Duration>> {
    let seconds: Option<f64> = sqlx::query_scalar(
        "SELECT EXTRACT(EPOCH FROM MIN(next_scrape_at) - NOW())::DOUBLE PRECISION \
         FROM project_services WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_one(executor)
    .await?;
    Ok(seconds.map(|s| Duration::from_secs_f64(s.max(0.0))))
}

/// Seconds until the next rate scrape of this type becomes due, if any.
pub async fn next_rate_scrape_due_in(
    executor: impl PgExecutor<'_>,
    service_id: i64,
) -> Result<Option<Duration>> {
    let seconds: Option<f64> = sqlx::query_scalar(
        "SELECT EXTRACT(EPOCH FROM MIN(rates_next_scrape_at) - NOW())::DOUBLE PRECISION \
         FROM project_services WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_one(executor)
    .await?;
    Ok(seconds.map(|s| Duration::from_secs_f64(s.max(0.0))))
}

pub async fn id_for(
    executor: impl PgExecutor<'_>,
    project_id: i64,
    service_id: i64,
) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM project_services WHERE project_id = $1 AND service_id = $2",
    )
    .bind(project_id)
    .bind(service_id)
    .fetch_optional(executor)
    .await?;
    Ok(id)
}

/// The stored `quota_desynced_at` for one row; used by tests and reports.
pub async fn desynced_at(
    executor: impl PgExecutor<'_>,
    project_service_id: i64,
) -> Result<Option<DateTime<Utc>>> {
    let value: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT quota_desynced_at FROM project_services WHERE id = $1")
            .bind(project_service_id)
            .fetch_one(executor)
            .await?;
    Ok(value)
}
