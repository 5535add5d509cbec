//! Mail notification outbox.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgExecutor;

use crate::datamodel::models::MailNotification;
use crate::error::Result;

pub async fn enqueue(
    executor: impl PgExecutor<'_>,
    project_id: i64,
    subject: &str,
    body: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO mail_notifications (project_id, subject, body) VALUES ($1, $2, $3)")
        .bind(project_id)
        .bind(subject)
        .bind(body)
        .execute(executor)
        .await?;
    Ok(())
}

/// Claim the most overdue outbox row, pushing its due timestamp by the lease
/// so concurrent drainers skip it.
pub async fn claim_due(pool: &PgPool, lease: Duration) -> Result<Option<MailNotification>> {
    let mut tx = pool.begin().await?;

    let mail = sqlx::query_as::<_, MailNotification>(
        "SELECT id, project_id, subject, body, next_submission_at, failed_submissions \
         FROM mail_notifications \
         WHERE next_submission_at <= NOW() \
         ORDER BY next_submission_at ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(ref mail) = mail {
        sqlx::query(
            "UPDATE mail_notifications \
             SET next_submission_at = NOW() + make_interval(secs => $2) \
             WHERE id = $1",
        )
        .bind(mail.id)
        .bind(lease.as_secs_f64())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(mail)
}

/// Delete an outbox row after successful submission.
pub async fn delete(executor: impl PgExecutor<'_>, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM mail_notifications WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Record a failed submission and delay the next attempt.
pub async fn record_failure(
    executor: impl PgExecutor<'_>,
    id: i64,
    backoff: Duration,
) -> Result<()> {
    sqlx::query(
        "UPDATE mail_notifications \
         SET failed_submissions = failed_submissions + 1, \
             next_submission_at = NOW() + make_interval(secs => $2) \
         WHERE id = $1",
    )
    .bind(id)
    .bind(backoff.as_secs_f64())
    .execute(executor)
    .await?;
    Ok(())
}
