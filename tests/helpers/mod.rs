//! Shared fixtures: row factories, mock drivers, and a cluster builder.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use figment::Figment;
use figment::providers::{Format, Yaml};
use sqlx::PgPool;

use limes::cluster::Cluster;
use limes::config::{ClusterConfig, CollectorConfig};
use limes::datamodel::types::{AvailabilityZone, ResourceData, Topology, UsageData};
use limes::error::{DriverError, Result};
use limes::plugins::{
    CapacityPlugin, CapacityScrapeResult, DiscoveredDomain, DiscoveredProject, DiscoveryPlugin,
    PluginRegistry, ProjectRef, QuotaPlugin, RateInfo, RateScrapeResult, ResourceInfo,
    ScrapeResult, ServiceInfo,
};

// ── mock drivers ────────────────────────────────────────────────────

/// Identity backend fed from a mutable in-memory list, so tests can make
/// domains and projects appear and disappear between discovery cycles.
pub struct MockDiscovery {
    pub domains: Mutex<Vec<(DiscoveredDomain, Vec<DiscoveredProject>)>>,
}

impl MockDiscovery {
    pub fn new(domains: Vec<(DiscoveredDomain, Vec<DiscoveredProject>)>) -> Arc<Self> {
        Arc::new(Self {
            domains: Mutex::new(domains),
        })
    }

    pub fn single_project() -> Arc<Self> {
        Self::new(vec![(
            domain("d1", "first"),
            vec![project("p1", "alpha")],
        )])
    }

    pub fn set_domains(&self, domains: Vec<(DiscoveredDomain, Vec<DiscoveredProject>)>) {
        *self.domains.lock().unwrap() = domains;
    }
}

#[async_trait::async_trait]
impl DiscoveryPlugin for MockDiscovery {
    async fn list_domains(&self) -> Result<Vec<DiscoveredDomain>, DriverError> {
        Ok(self
            .domains
            .lock()
            .unwrap()
            .iter()
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn list_projects(
        &self,
        domain: &DiscoveredDomain,
    ) -> Result<Vec<DiscoveredProject>, DriverError> {
        self.domains
            .lock()
            .unwrap()
            .iter()
            .find(|(d, _)| d.uuid == domain.uuid)
            .map(|(_, projects)| projects.clone())
            .ok_or_else(|| DriverError::contract(format!("unknown domain {}", domain.uuid)))
    }
}

pub fn domain(uuid: &str, name: &str) -> DiscoveredDomain {
    DiscoveredDomain {
        uuid: uuid.to_string(),
        name: name.to_string(),
    }
}

pub fn project(uuid: &str, name: &str) -> DiscoveredProject {
    DiscoveredProject {
        uuid: uuid.to_string(),
        name: name.to_string(),
        parent_uuid: String::new(),
    }
}

/// Scriptable quota driver. Responses are popped from a queue; when the
/// queue is empty the fallback answers, and with no fallback the call fails
/// as a transient error.
pub struct MockQuotaPlugin {
    service_type: String,
    resources: Vec<ResourceInfo>,
    rates: Vec<RateInfo>,
    pub scrape_queue: Mutex<VecDeque<Result<ScrapeResult, String>>>,
    pub scrape_fallback: Mutex<Option<ScrapeResult>>,
    pub rate_queue: Mutex<VecDeque<Result<RateScrapeResult, String>>>,
    pub seen_prev_states: Mutex<Vec<String>>,
    pub set_quota_calls: Mutex<Vec<BTreeMap<String, u64>>>,
    pub set_quota_error: Mutex<Option<String>>,
}

impl MockQuotaPlugin {
    pub fn new(service_type: &str, resources: Vec<ResourceInfo>, rates: Vec<RateInfo>) -> Arc<Self> {
        Arc::new(Self {
            service_type: service_type.to_string(),
            resources,
            rates,
            scrape_queue: Mutex::new(VecDeque::new()),
            scrape_fallback: Mutex::new(None),
            rate_queue: Mutex::new(VecDeque::new()),
            seen_prev_states: Mutex::new(Vec::new()),
            set_quota_calls: Mutex::new(Vec::new()),
            set_quota_error: Mutex::new(None),
        })
    }

    pub fn push_scrape(&self, result: ScrapeResult) {
        self.scrape_queue.lock().unwrap().push_back(Ok(result));
    }

    pub fn push_scrape_error(&self, message: &str) {
        self.scrape_queue
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn set_scrape_fallback(&self, result: ScrapeResult) {
        *self.scrape_fallback.lock().unwrap() = Some(result);
    }

    pub fn push_rates(&self, result: RateScrapeResult) {
        self.rate_queue.lock().unwrap().push_back(Ok(result));
    }
}

#[async_trait::async_trait]
impl QuotaPlugin for MockQuotaPlugin {
    fn service_type(&self) -> &str {
        &self.service_type
    }

    fn service_info(&self) -> ServiceInfo {
        ServiceInfo {
            service_type: self.service_type.clone(),
            product_name: "mock".to_string(),
            area: String::new(),
        }
    }

    fn resources(&self) -> &[ResourceInfo] {
        &self.resources
    }

    fn rates(&self) -> &[RateInfo] {
        &self.rates
    }

    async fn scrape(&self, _project: &ProjectRef) -> Result<ScrapeResult, DriverError> {
        if let Some(scripted) = self.scrape_queue.lock().unwrap().pop_front() {
            return scripted.map_err(|msg| DriverError::Transient(anyhow!("{msg}")));
        }
        if let Some(fallback) = self.scrape_fallback.lock().unwrap().clone() {
            return Ok(fallback);
        }
        Err(DriverError::Transient(anyhow!("no scripted scrape response")))
    }

    async fn scrape_rates(
        &self,
        _project: &ProjectRef,
        prev_state: &str,
    ) -> Result<RateScrapeResult, DriverError> {
        self.seen_prev_states
            .lock()
            .unwrap()
            .push(prev_state.to_string());
        match self.rate_queue.lock().unwrap().pop_front() {
            Some(scripted) => scripted.map_err(|msg| DriverError::Transient(anyhow!("{msg}"))),
            None => Ok(RateScrapeResult::default()),
        }
    }

    async fn set_quota(
        &self,
        _project: &ProjectRef,
        quotas: &BTreeMap<String, u64>,
    ) -> Result<(), DriverError> {
        self.set_quota_calls.lock().unwrap().push(quotas.clone());
        match self.set_quota_error.lock().unwrap().as_ref() {
            Some(message) => Err(DriverError::Transient(anyhow!("{}", message))),
            None => Ok(()),
        }
    }
}

/// Capacity driver answering from a fixed result.
pub struct MockCapacityPlugin {
    capacitor_id: String,
    pub result: Mutex<Result<CapacityScrapeResult, String>>,
}

impl MockCapacityPlugin {
    pub fn new(capacitor_id: &str, result: CapacityScrapeResult) -> Arc<Self> {
        Arc::new(Self {
            capacitor_id: capacitor_id.to_string(),
            result: Mutex::new(Ok(result)),
        })
    }
}

#[async_trait::async_trait]
impl CapacityPlugin for MockCapacityPlugin {
    fn capacitor_id(&self) -> &str {
        &self.capacitor_id
    }

    async fn scrape(&self) -> Result<CapacityScrapeResult, DriverError> {
        self.result
            .lock()
            .unwrap()
            .clone()
            .map_err(|msg| DriverError::Transient(anyhow!("{msg}")))
    }
}

// ── cluster construction ────────────────────────────────────────────

/// Minimal cluster config: static discovery, no declared services (the
/// registry is built from mocks, not from this config).
pub const BARE_CLUSTER_YAML: &str = "
discovery:
  method: static
services: []
";

pub fn cluster_config(yaml: &str) -> ClusterConfig {
    Figment::from(Yaml::string(yaml)).extract().unwrap()
}

pub fn build_cluster(
    discovery: Arc<dyn DiscoveryPlugin>,
    quota_plugins: Vec<Arc<dyn QuotaPlugin>>,
    capacity_plugins: Vec<Arc<dyn CapacityPlugin>>,
    cluster_yaml: &str,
) -> Arc<Cluster> {
    let mut builder = PluginRegistry::builder().discovery(discovery).unwrap();
    for plugin in quota_plugins {
        builder = builder.quota_plugin(plugin).unwrap();
    }
    for plugin in capacity_plugins {
        builder = builder.capacity_plugin(plugin).unwrap();
    }
    let registry = Arc::new(builder.build().unwrap());
    Cluster::new("test", &cluster_config(cluster_yaml), registry).unwrap()
}

/// Collector tuning with short leases, handy for claim tests.
pub fn collector_config() -> CollectorConfig {
    CollectorConfig::default()
}

// ── driver data factories ───────────────────────────────────────────

pub fn resource_info(name: &str) -> ResourceInfo {
    ResourceInfo {
        name: name.to_string(),
        unit: String::new(),
        topology: Topology::Flat,
        has_quota: true,
        auto_approve_initial_quota: None,
    }
}

pub fn az_aware_resource_info(name: &str) -> ResourceInfo {
    ResourceInfo {
        topology: Topology::AzAware,
        ..resource_info(name)
    }
}

pub fn rate_info(name: &str) -> RateInfo {
    RateInfo {
        name: name.to_string(),
        unit: String::new(),
        topology: Topology::Flat,
        has_usage: true,
    }
}

/// A scrape result over flat resources: (name, quota, usage) triples.
pub fn scrape_result(resources: &[(&str, i64, u64)]) -> ScrapeResult {
    let mut map = BTreeMap::new();
    for &(name, quota, usage) in resources {
        let mut per_az = BTreeMap::new();
        per_az.insert(
            AvailabilityZone::any(),
            UsageData {
                usage,
                physical_usage: None,
                subresources: Vec::new(),
            },
        );
        map.insert(name.to_string(), ResourceData { quota, per_az });
    }
    ScrapeResult {
        resources: map,
        serialized_metrics: String::new(),
    }
}

// ── row factories ───────────────────────────────────────────────────

pub async fn seed_service(pool: &PgPool, service_type: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO cluster_services (type) VALUES ($1) RETURNING id")
        .bind(service_type)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn seed_resource(pool: &PgPool, service_id: i64, name: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO cluster_resources (service_id, name) VALUES ($1, $2) RETURNING id",
    )
    .bind(service_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn seed_rate(pool: &PgPool, service_id: i64, name: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO cluster_rates (service_id, name) VALUES ($1, $2) RETURNING id")
        .bind(service_id)
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn seed_domain(pool: &PgPool, uuid: &str, name: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO domains (uuid, name) VALUES ($1, $2) RETURNING id")
        .bind(uuid)
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn seed_project(pool: &PgPool, domain_id: i64, uuid: &str, name: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO projects (domain_id, uuid, name) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(domain_id)
    .bind(uuid)
    .bind(name)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn seed_project_service(pool: &PgPool, project_id: i64, service_id: i64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO project_services (project_id, service_id) VALUES ($1, $2) RETURNING id",
    )
    .bind(project_id)
    .bind(service_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn seed_az_resource(pool: &PgPool, resource_id: i64, az: &str, raw_capacity: i64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO cluster_az_resources (resource_id, az, raw_capacity, \
             last_nonzero_raw_capacity) \
         VALUES ($1, $2, $3, CASE WHEN $3 > 0 THEN $3 END) RETURNING id",
    )
    .bind(resource_id)
    .bind(az)
    .bind(raw_capacity)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// A complete scaffold for scraper tests: one service with one flat
/// resource, one domain, one project, one project-service due immediately.
pub struct Scaffold {
    pub service_id: i64,
    pub resource_id: i64,
    pub domain_id: i64,
    pub project_id: i64,
    pub project_service_id: i64,
}

pub async fn seed_scaffold(pool: &PgPool, service_type: &str, resource_name: &str) -> Scaffold {
    let service_id = seed_service(pool, service_type).await;
    let resource_id = seed_resource(pool, service_id, resource_name).await;
    let domain_id = seed_domain(pool, "d1", "first").await;
    let project_id = seed_project(pool, domain_id, "p1", "alpha").await;
    let project_service_id = seed_project_service(pool, project_id, service_id).await;
    Scaffold {
        service_id,
        resource_id,
        domain_id,
        project_id,
        project_service_id,
    }
}

// ── row readers ─────────────────────────────────────────────────────

pub async fn project_service_row(
    pool: &PgPool,
    id: i64,
) -> limes::datamodel::models::ProjectService {
    sqlx::query_as("SELECT * FROM project_services WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn project_resource_quotas(
    pool: &PgPool,
    project_id: i64,
) -> Vec<(String, Option<i64>, Option<i64>)> {
    sqlx::query_as(
        "SELECT cr.name, pr.quota, pr.backend_quota \
         FROM project_resources pr JOIN cluster_resources cr ON cr.id = pr.resource_id \
         WHERE pr.project_id = $1 ORDER BY cr.name",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

pub async fn count(pool: &PgPool, table: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap();
    count
}
