#[allow(dead_code)]
mod helpers;

use std::time::Duration;

use limes::db;
use sqlx::PgPool;

const LEASE: Duration = Duration::from_secs(300);

// ── claim_due_scrape ────────────────────────────────────────────────

#[sqlx::test]
async fn claim_empty_table_returns_none(pool: PgPool) {
    let service_id = helpers::seed_service(&pool, "compute").await;
    let claim = db::services::claim_due_scrape(&pool, service_id, LEASE)
        .await
        .unwrap();
    assert!(claim.is_none());
}

#[sqlx::test]
async fn claim_returns_identity_fields_and_takes_a_lease(pool: PgPool) {
    let scaffold = helpers::seed_scaffold(&pool, "compute", "cores").await;

    let claim = db::services::claim_due_scrape(&pool, scaffold.service_id, LEASE)
        .await
        .unwrap()
        .expect("row is due");

    assert_eq!(claim.id, scaffold.project_service_id);
    assert_eq!(claim.service_type, "compute");
    assert_eq!(claim.project_uuid, "p1");
    assert_eq!(claim.project_name, "alpha");
    assert_eq!(claim.domain_uuid, "d1");
    assert_eq!(claim.domain_name, "first");

    // The lease pushes the due time; a second claim finds nothing.
    let again = db::services::claim_due_scrape(&pool, scaffold.service_id, LEASE)
        .await
        .unwrap();
    assert!(again.is_none(), "leased row must not be claimable");
}

#[sqlx::test]
async fn claim_prefers_stale_rows_over_older_due_times(pool: PgPool) {
    let service_id = helpers::seed_service(&pool, "compute").await;
    let domain_id = helpers::seed_domain(&pool, "d1", "first").await;
    let p1 = helpers::seed_project(&pool, domain_id, "p1", "alpha").await;
    let p2 = helpers::seed_project(&pool, domain_id, "p2", "beta").await;
    helpers::seed_project_service(&pool, p1, service_id).await;
    let ps2 = helpers::seed_project_service(&pool, p2, service_id).await;

    // p1 is long overdue; p2 is recent but stale.
    sqlx::query("UPDATE project_services SET next_scrape_at = NOW() - INTERVAL '2 hours' WHERE project_id = $1")
        .bind(p1)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE project_services SET stale = TRUE, next_scrape_at = NOW() + INTERVAL '1 hour' WHERE id = $1")
        .bind(ps2)
        .execute(&pool)
        .await
        .unwrap();

    let claim = db::services::claim_due_scrape(&pool, service_id, LEASE)
        .await
        .unwrap()
        .expect("stale row is claimable");
    assert_eq!(claim.id, ps2, "stale rows take priority");

    let (stale,): (bool,) = sqlx::query_as("SELECT stale FROM project_services WHERE id = $1")
        .bind(ps2)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!stale, "the claim consumes the stale flag");
}

#[sqlx::test]
async fn claim_ignores_other_service_types(pool: PgPool) {
    let scaffold = helpers::seed_scaffold(&pool, "compute", "cores").await;
    let other_service = helpers::seed_service(&pool, "storage").await;
    let _ = scaffold;

    let claim = db::services::claim_due_scrape(&pool, other_service, LEASE)
        .await
        .unwrap();
    assert!(claim.is_none());
}

// ── claim_desynced ──────────────────────────────────────────────────

#[sqlx::test]
async fn desynced_claim_requires_past_marker(pool: PgPool) {
    let scaffold = helpers::seed_scaffold(&pool, "compute", "cores").await;

    // No marker: nothing to push.
    assert!(db::services::claim_desynced(&pool, LEASE).await.unwrap().is_none());

    // Marker in the future (sync backoff): still nothing.
    sqlx::query("UPDATE project_services SET quota_desynced_at = NOW() + INTERVAL '1 hour'")
        .execute(&pool)
        .await
        .unwrap();
    assert!(db::services::claim_desynced(&pool, LEASE).await.unwrap().is_none());

    // Marker due now: claimable exactly once per lease.
    sqlx::query("UPDATE project_services SET quota_desynced_at = NOW()")
        .execute(&pool)
        .await
        .unwrap();
    let claim = db::services::claim_desynced(&pool, LEASE).await.unwrap();
    assert_eq!(claim.unwrap().id, scaffold.project_service_id);
    assert!(db::services::claim_desynced(&pool, LEASE).await.unwrap().is_none());
}

// ── record_* bookkeeping ────────────────────────────────────────────

#[sqlx::test]
async fn scrape_error_counter_grows_and_success_resets_it(pool: PgPool) {
    let scaffold = helpers::seed_scaffold(&pool, "compute", "cores").await;
    let id = scaffold.project_service_id;

    for _ in 0..3 {
        db::services::record_scrape_error(
            &pool,
            id,
            "boom",
            Duration::from_secs(60),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }
    let row = helpers::project_service_row(&pool, id).await;
    assert_eq!(row.consecutive_scrape_errors, 3);
    assert_eq!(row.scrape_error_message, "boom");
    assert!(row.checked_at.is_some());
    assert!(row.scraped_at.is_none());

    db::services::record_scrape_success(
        &pool,
        id,
        Duration::from_secs(1800),
        Duration::from_millis(25),
        "metrics-blob",
    )
    .await
    .unwrap();
    let row = helpers::project_service_row(&pool, id).await;
    assert_eq!(row.consecutive_scrape_errors, 0);
    assert_eq!(row.scrape_error_message, "");
    assert_eq!(row.serialized_metrics, "metrics-blob");
    assert!(row.scraped_at.is_some());
}

#[sqlx::test]
async fn mark_desynced_preserves_future_backoff_timestamp(pool: PgPool) {
    let scaffold = helpers::seed_scaffold(&pool, "compute", "cores").await;
    let id = scaffold.project_service_id;

    sqlx::query("UPDATE project_services SET quota_desynced_at = NOW() + INTERVAL '30 minutes'")
        .execute(&pool)
        .await
        .unwrap();
    let before = db::services::desynced_at(&pool, id).await.unwrap().unwrap();

    db::services::mark_desynced(&pool, id).await.unwrap();
    let after = db::services::desynced_at(&pool, id).await.unwrap().unwrap();
    assert_eq!(before, after, "an existing marker is never stomped");

    db::services::clear_desynced(&pool, id).await.unwrap();
    assert!(db::services::desynced_at(&pool, id).await.unwrap().is_none());
}

// ── mail outbox claims ──────────────────────────────────────────────

#[sqlx::test]
async fn mail_claim_and_failure_backoff(pool: PgPool) {
    let scaffold = helpers::seed_scaffold(&pool, "compute", "cores").await;
    db::mail::enqueue(&pool, scaffold.project_id, "subject", "body")
        .await
        .unwrap();

    let mail = db::mail::claim_due(&pool, LEASE).await.unwrap().unwrap();
    assert_eq!(mail.subject, "subject");
    assert_eq!(mail.failed_submissions, 0);

    // Leased: not claimable again.
    assert!(db::mail::claim_due(&pool, LEASE).await.unwrap().is_none());

    db::mail::record_failure(&pool, mail.id, Duration::from_secs(3600))
        .await
        .unwrap();
    let (failed, due_later): (i32, bool) = sqlx::query_as(
        "SELECT failed_submissions, next_submission_at > NOW() FROM mail_notifications WHERE id = $1",
    )
    .bind(mail.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(failed, 1);
    assert!(due_later);

    db::mail::delete(&pool, mail.id).await.unwrap();
    assert_eq!(helpers::count(&pool, "mail_notifications").await, 0);
}
