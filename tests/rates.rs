#[allow(dead_code)]
mod helpers;

use std::collections::BTreeMap;

use helpers::{MockDiscovery, MockQuotaPlugin, build_cluster, collector_config, rate_info};
use limes::collect::rates::RateScrapeWorker;
use limes::metrics::Metrics;
use limes::plugins::RateScrapeResult;
use sqlx::PgPool;

fn rate_result(rates: &[(&str, &str)], state: &str) -> RateScrapeResult {
    RateScrapeResult {
        rates: rates
            .iter()
            .map(|&(name, usage)| (name.to_string(), usage.to_string()))
            .collect(),
        state: state.to_string(),
    }
}

async fn seed_rate_scaffold(pool: &PgPool) -> (helpers::Scaffold, i64) {
    let scaffold = helpers::seed_scaffold(pool, "compute", "cores").await;
    let rate_id = helpers::seed_rate(pool, scaffold.service_id, "firstrate").await;
    sqlx::query("INSERT INTO project_rates (project_id, rate_id) VALUES ($1, $2)")
        .bind(scaffold.project_id)
        .bind(rate_id)
        .execute(pool)
        .await
        .unwrap();
    (scaffold, rate_id)
}

async fn stored_usage(pool: &PgPool, rate_id: i64) -> String {
    let (usage,): (String,) =
        sqlx::query_as("SELECT usage_as_bigint FROM project_rates WHERE rate_id = $1")
            .bind(rate_id)
            .fetch_one(pool)
            .await
            .unwrap();
    usage
}

// ── state round-trip and backend resets ─────────────────────────────

#[sqlx::test]
async fn rate_scrape_round_trips_state_and_stores_reset_value_verbatim(pool: PgPool) {
    let (scaffold, rate_id) = seed_rate_scaffold(&pool).await;

    let plugin = MockQuotaPlugin::new("compute", vec![], vec![rate_info("firstrate")]);
    // t1: counter at 5129, driver records high-water mark in its state.
    plugin.push_rates(rate_result(&[("firstrate", "5129")], r#"{"firstrate":5120}"#));
    // t2: backend was reset; driver reports the lower value and a new state.
    plugin.push_rates(rate_result(&[("firstrate", "1000")], r#"{"firstrate":6120}"#));

    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        helpers::BARE_CLUSTER_YAML,
    );
    let worker = RateScrapeWorker::new(
        pool.clone(),
        cluster,
        plugin.clone(),
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );

    assert!(worker.tick().await.unwrap());
    assert_eq!(stored_usage(&pool, rate_id).await, "5129");

    // Make the row due again for t2.
    sqlx::query("UPDATE project_services SET rates_stale = TRUE")
        .execute(&pool)
        .await
        .unwrap();
    assert!(worker.tick().await.unwrap());

    // The scheduler stores the new value blindly; reset explanation is the
    // driver's business.
    assert_eq!(stored_usage(&pool, rate_id).await, "1000");

    let seen = plugin.seen_prev_states.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec!["".to_string(), r#"{"firstrate":5120}"#.to_string()],
        "first call gets empty state, second call replays the stored blob"
    );

    let row = helpers::project_service_row(&pool, scaffold.project_service_id).await;
    assert_eq!(row.serialized_scrape_state, r#"{"firstrate":6120}"#);
    assert!(row.rates_scraped_at.is_some());
}

// ── partial reports ─────────────────────────────────────────────────

#[sqlx::test]
async fn unreported_rates_keep_their_previous_counter(pool: PgPool) {
    let (scaffold, first_id) = seed_rate_scaffold(&pool).await;
    let second_id = helpers::seed_rate(&pool, scaffold.service_id, "secondrate").await;
    sqlx::query("INSERT INTO project_rates (project_id, rate_id) VALUES ($1, $2)")
        .bind(scaffold.project_id)
        .bind(second_id)
        .execute(&pool)
        .await
        .unwrap();

    let plugin = MockQuotaPlugin::new(
        "compute",
        vec![],
        vec![rate_info("firstrate"), rate_info("secondrate")],
    );
    plugin.push_rates(rate_result(
        &[("firstrate", "7"), ("secondrate", "3")],
        "s1",
    ));
    plugin.push_rates(rate_result(&[("firstrate", "9")], "s2"));

    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        helpers::BARE_CLUSTER_YAML,
    );
    let worker = RateScrapeWorker::new(
        pool.clone(),
        cluster,
        plugin,
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );

    assert!(worker.tick().await.unwrap());
    sqlx::query("UPDATE project_services SET rates_stale = TRUE")
        .execute(&pool)
        .await
        .unwrap();
    assert!(worker.tick().await.unwrap());

    assert_eq!(stored_usage(&pool, first_id).await, "9");
    assert_eq!(
        stored_usage(&pool, second_id).await,
        "3",
        "unreported rate is left unchanged"
    );
}

// ── contract violations ─────────────────────────────────────────────

#[sqlx::test]
async fn undeclared_rate_name_fails_the_scrape(pool: PgPool) {
    let (scaffold, rate_id) = seed_rate_scaffold(&pool).await;

    let plugin = MockQuotaPlugin::new("compute", vec![], vec![rate_info("firstrate")]);
    plugin.push_rates(rate_result(&[("bogusrate", "1")], "s1"));

    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        helpers::BARE_CLUSTER_YAML,
    );
    let worker = RateScrapeWorker::new(
        pool.clone(),
        cluster,
        plugin,
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );
    assert!(worker.tick().await.unwrap());

    let row = helpers::project_service_row(&pool, scaffold.project_service_id).await;
    assert!(row.rates_scrape_error_message.contains("bogusrate"));
    assert_eq!(stored_usage(&pool, rate_id).await, "");
    assert_eq!(
        row.serialized_scrape_state, "",
        "a failed scrape must not advance the stored state"
    );
}

#[sqlx::test]
async fn non_decimal_usage_fails_the_scrape(pool: PgPool) {
    let (scaffold, _) = seed_rate_scaffold(&pool).await;

    let plugin = MockQuotaPlugin::new("compute", vec![], vec![rate_info("firstrate")]);
    let mut rates = BTreeMap::new();
    rates.insert("firstrate".to_string(), "0x2a".to_string());
    plugin.push_rates(RateScrapeResult {
        rates,
        state: "s1".to_string(),
    });

    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        helpers::BARE_CLUSTER_YAML,
    );
    let worker = RateScrapeWorker::new(
        pool.clone(),
        cluster,
        plugin,
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );
    assert!(worker.tick().await.unwrap());

    let row = helpers::project_service_row(&pool, scaffold.project_service_id).await;
    assert!(row.rates_scrape_error_message.contains("non-decimal"));
}
