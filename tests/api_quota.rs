#[allow(dead_code)]
mod helpers;

use helpers::{
    MockDiscovery, MockQuotaPlugin, build_cluster, collector_config, resource_info, scrape_result,
    seed_scaffold,
};
use limes::api::quota::{
    QuotaSetRequest, ResourceQuotaRequest, ServiceQuotaRequest, apply_updates, validate_request,
};
use limes::collect::scrape::QuotaScrapeWorker;
use limes::db;
use limes::metrics::Metrics;
use sqlx::PgPool;

fn request(service: &str, resource: &str, quota: u64) -> QuotaSetRequest {
    QuotaSetRequest {
        services: vec![ServiceQuotaRequest {
            service_type: service.to_string(),
            resources: vec![ResourceQuotaRequest {
                name: resource.to_string(),
                quota,
            }],
        }],
    }
}

async fn scope(pool: &PgPool) -> (limes::datamodel::models::Domain, limes::datamodel::models::Project) {
    let domain = db::reports::domain_by_uuid(pool, "d1").await.unwrap().unwrap();
    let project = db::reports::project_in_domain_by_uuid(pool, domain.id, "p1")
        .await
        .unwrap()
        .unwrap();
    (domain, project)
}

// ── constraint rejection (the 422 contract) ─────────────────────────

#[sqlx::test]
async fn quota_above_domain_constraint_yields_structured_rejection(pool: PgPool) {
    let scaffold = seed_scaffold(&pool, "storage", "capacity").await;
    let plugin = MockQuotaPlugin::new("storage", vec![resource_info("capacity")], vec![]);
    plugin.set_scrape_fallback(scrape_result(&[("capacity", 50, 0)]));

    let constraint_path =
        std::env::temp_dir().join(format!("limes-api-quota-{}.yaml", std::process::id()));
    std::fs::write(
        &constraint_path,
        "projects:\n  first/alpha:\n    storage:\n      capacity: exactly 100 GiB\n",
    )
    .unwrap();
    let yaml = format!(
        "discovery:\n  method: static\nservices: []\nconstraints:\n  - {}\n",
        constraint_path.display()
    );
    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        &yaml,
    );
    std::fs::remove_file(&constraint_path).ok();

    let scraper = QuotaScrapeWorker::new(
        pool.clone(),
        cluster.clone(),
        plugin,
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );
    assert!(scraper.tick().await.unwrap());

    let (domain, project) = scope(&pool).await;
    let (_, issues) = validate_request(
        &pool,
        &cluster,
        &domain,
        &project,
        &request("storage", "capacity", 120),
    )
    .await
    .unwrap();

    assert_eq!(issues.len(), 1);
    let issue = &issues[0];
    assert_eq!(issue.resource_name, "capacity");
    assert_eq!(issue.min_acceptable_quota, Some(100));
    assert_eq!(issue.max_acceptable_quota, Some(100));
    assert_eq!(issue.unit, "GiB");

    // Simulate semantics: the database is untouched.
    let quotas = helpers::project_resource_quotas(&pool, scaffold.project_id).await;
    assert_eq!(quotas[0].1, Some(100), "scrape clamped to the constraint");
}

#[sqlx::test]
async fn admin_maximum_bounds_the_acceptable_range(pool: PgPool) {
    let scaffold = seed_scaffold(&pool, "compute", "cores").await;
    let plugin = MockQuotaPlugin::new("compute", vec![resource_info("cores")], vec![]);
    plugin.set_scrape_fallback(scrape_result(&[("cores", 10, 0)]));

    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        helpers::BARE_CLUSTER_YAML,
    );
    let scraper = QuotaScrapeWorker::new(
        pool.clone(),
        cluster.clone(),
        plugin,
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );
    assert!(scraper.tick().await.unwrap());

    sqlx::query("UPDATE project_resources SET max_quota_from_outside_admin = 25")
        .execute(&pool)
        .await
        .unwrap();

    let (domain, project) = scope(&pool).await;
    let (_, issues) = validate_request(
        &pool,
        &cluster,
        &domain,
        &project,
        &request("compute", "cores", 30),
    )
    .await
    .unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].max_acceptable_quota, Some(25));
}

// ── accepted writes ─────────────────────────────────────────────────

#[sqlx::test]
async fn accepted_write_updates_quota_and_marks_desynced(pool: PgPool) {
    let scaffold = seed_scaffold(&pool, "compute", "cores").await;
    let plugin = MockQuotaPlugin::new("compute", vec![resource_info("cores")], vec![]);
    plugin.set_scrape_fallback(scrape_result(&[("cores", 10, 3)]));

    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        helpers::BARE_CLUSTER_YAML,
    );
    let scraper = QuotaScrapeWorker::new(
        pool.clone(),
        cluster.clone(),
        plugin,
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );
    assert!(scraper.tick().await.unwrap());

    let (domain, project) = scope(&pool).await;
    let (updates, issues) = validate_request(
        &pool,
        &cluster,
        &domain,
        &project,
        &request("compute", "cores", 20),
    )
    .await
    .unwrap();
    assert!(issues.is_empty());
    assert_eq!(updates.len(), 1);

    apply_updates(&pool, &updates).await.unwrap();

    let quotas = helpers::project_resource_quotas(&pool, scaffold.project_id).await;
    assert_eq!(quotas[0].1, Some(20));
    assert_eq!(quotas[0].2, Some(10), "backend untouched until the pusher runs");

    let row = helpers::project_service_row(&pool, scaffold.project_service_id).await;
    assert!(row.quota_desynced_at.is_some());
}

// ── unknown names ───────────────────────────────────────────────────

#[sqlx::test]
async fn unknown_service_and_resource_produce_issues(pool: PgPool) {
    let scaffold = seed_scaffold(&pool, "compute", "cores").await;
    let plugin = MockQuotaPlugin::new("compute", vec![resource_info("cores")], vec![]);
    plugin.set_scrape_fallback(scrape_result(&[("cores", 10, 0)]));

    let cluster = build_cluster(
        MockDiscovery::single_project(),
        vec![plugin.clone()],
        vec![],
        helpers::BARE_CLUSTER_YAML,
    );
    let scraper = QuotaScrapeWorker::new(
        pool.clone(),
        cluster.clone(),
        plugin,
        scaffold.service_id,
        collector_config(),
        Metrics::new().unwrap(),
    );
    assert!(scraper.tick().await.unwrap());

    let (domain, project) = scope(&pool).await;

    let (_, issues) = validate_request(
        &pool,
        &cluster,
        &domain,
        &project,
        &request("network", "floating_ips", 5),
    )
    .await
    .unwrap();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].message.contains("no such service"));

    let (_, issues) = validate_request(
        &pool,
        &cluster,
        &domain,
        &project,
        &request("compute", "gpus", 5),
    )
    .await
    .unwrap();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].message.contains("no such resource"));
}
