//! Backend driver contracts and the process-wide plugin registry.
//!
//! Three capabilities exist: identity discovery, per-service-type quota
//! drivers, and per-capacitor capacity drivers. Each is registered under a
//! unique identifier and instantiated at most once per process; instances
//! are shared read-only across all collector workers, so any per-project
//! state must live in the serialized blobs persisted with the rows.

pub mod generic;
pub mod static_data;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::datamodel::types::{AvailabilityZone, CapacityData, ResourceData, Topology};
use crate::error::{DriverError, Result};

/// A domain as reported by the identity backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDomain {
    pub uuid: String,
    pub name: String,
}

/// A project as reported by the identity backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredProject {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub parent_uuid: String,
}

/// Everything a quota driver needs to know about the project it is scraping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProjectRef {
    pub uuid: String,
    pub name: String,
    pub domain_uuid: String,
    pub domain_name: String,
}

/// Static description of a quota driver's service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub area: String,
}

/// Declaration of one resource a quota driver accounts for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default = "default_true")]
    pub has_quota: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_initial_quota: Option<u64>,
}

/// Declaration of one rate a quota driver tracks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateInfo {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default = "default_true")]
    pub has_usage: bool,
}

fn default_true() -> bool {
    true
}

/// Result of one quota/usage scrape for one project.
#[derive(Clone, Debug, Default)]
pub struct ScrapeResult {
    pub resources: BTreeMap<String, ResourceData>,
    /// Opaque blob, persisted verbatim and handed back to `collect_metrics`.
    pub serialized_metrics: String,
}

/// Result of one rate scrape for one project.
#[derive(Clone, Debug, Default)]
pub struct RateScrapeResult {
    /// Rate name to usage counter, as a decimal string.
    pub rates: BTreeMap<String, String>,
    /// Opaque state, fed back on the next call so the driver can detect
    /// backend counter resets.
    pub state: String,
}

/// Result of one capacity scrape across all services the capacitor feeds.
#[derive(Clone, Debug, Default)]
pub struct CapacityScrapeResult {
    pub capacities: BTreeMap<String, BTreeMap<String, BTreeMap<AvailabilityZone, CapacityData>>>,
    pub serialized_metrics: String,
}

/// A numeric observation recovered from a serialized-metrics blob.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
}

/// Identity backend: enumerates domains and their projects. Pure read.
#[async_trait::async_trait]
pub trait DiscoveryPlugin: Send + Sync {
    async fn list_domains(&self) -> Result<Vec<DiscoveredDomain>, DriverError>;

    async fn list_projects(
        &self,
        domain: &DiscoveredDomain,
    ) -> Result<Vec<DiscoveredProject>, DriverError>;
}

/// Quota/usage/rate driver for one service type.
///
/// Implementations MUST be idempotent on repeated `scrape` calls, MUST treat
/// `set_quota` with the current backend quota as a no-op, and MUST accept any
/// `prev_state` they previously produced (the empty string means "first call,
/// no history"). They MUST also tolerate concurrent invocations for different
/// projects.
#[async_trait::async_trait]
pub trait QuotaPlugin: Send + Sync {
    fn service_type(&self) -> &str;

    fn service_info(&self) -> ServiceInfo;

    fn resources(&self) -> &[ResourceInfo];

    fn rates(&self) -> &[RateInfo];

    async fn scrape(&self, project: &ProjectRef) -> Result<ScrapeResult, DriverError>;

    async fn scrape_rates(
        &self,
        project: &ProjectRef,
        prev_state: &str,
    ) -> Result<RateScrapeResult, DriverError>;

    async fn set_quota(
        &self,
        project: &ProjectRef,
        quotas: &BTreeMap<String, u64>,
    ) -> Result<(), DriverError>;

    /// Pre-write validation hook for quota edits. Most drivers accept
    /// unconditionally.
    async fn is_quota_acceptable_for_project(
        &self,
        _project: &ProjectRef,
        _quotas: &BTreeMap<String, u64>,
    ) -> Result<(), String> {
        Ok(())
    }

    /// Recover numeric observations from a serialized-metrics blob previously
    /// returned by `scrape`.
    fn collect_metrics(&self, _serialized_metrics: &str) -> Result<Vec<MetricSample>, DriverError> {
        Ok(Vec::new())
    }
}

/// Capacity driver for one capacitor id.
#[async_trait::async_trait]
pub trait CapacityPlugin: Send + Sync {
    fn capacitor_id(&self) -> &str;

    async fn scrape(&self) -> Result<CapacityScrapeResult, DriverError>;
}

/// Process-wide registry of driver instances, built once at startup.
pub struct PluginRegistry {
    discovery: Arc<dyn DiscoveryPlugin>,
    // Insertion order is config order; worker spawn order follows it.
    quota: IndexMap<String, Arc<dyn QuotaPlugin>>,
    capacity: IndexMap<String, Arc<dyn CapacityPlugin>>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// Build the registry from a cluster's configuration, instantiating the
    /// built-in drivers.
    pub fn from_config(cfg: &ClusterConfig) -> Result<Self> {
        let mut builder = Self::builder();

        match cfg.discovery.method.as_str() {
            "static" => {
                builder = builder.discovery(Arc::new(static_data::StaticDiscoveryPlugin::new(
                    cfg.discovery.static_domains.clone(),
                )))?;
            }
            other => bail!("unknown discovery method: {other:?}"),
        }

        for service in &cfg.services {
            match service.driver.as_str() {
                "generic" => {
                    let driver_cfg = service.generic.clone().with_context(|| {
                        format!(
                            "service {:?} uses the generic driver but has no `generic` section",
                            service.service_type
                        )
                    })?;
                    let plugin = generic::GenericQuotaPlugin::new(
                        service.service_type.clone(),
                        service.resources.clone(),
                        service.rates.clone(),
                        driver_cfg,
                    )?;
                    builder = builder.quota_plugin(Arc::new(plugin))?;
                }
                other => bail!(
                    "service {:?} references unknown driver: {other:?}",
                    service.service_type
                ),
            }
        }

        for capacitor in &cfg.capacitors {
            match capacitor.driver.as_str() {
                "static" => {
                    builder =
                        builder.capacity_plugin(Arc::new(static_data::StaticCapacityPlugin::new(
                            capacitor.id.clone(),
                            capacitor.static_values.clone(),
                        )))?;
                }
                other => bail!("capacitor {:?} references unknown driver: {other:?}", capacitor.id),
            }
        }

        builder.build()
    }

    pub fn discovery(&self) -> &Arc<dyn DiscoveryPlugin> {
        &self.discovery
    }

    pub fn quota_plugin(&self, service_type: &str) -> Option<&Arc<dyn QuotaPlugin>> {
        self.quota.get(service_type)
    }

    pub fn quota_plugins(&self) -> impl Iterator<Item = &Arc<dyn QuotaPlugin>> {
        self.quota.values()
    }

    pub fn capacity_plugin(&self, capacitor_id: &str) -> Option<&Arc<dyn CapacityPlugin>> {
        self.capacity.get(capacitor_id)
    }

    pub fn capacity_plugins(&self) -> impl Iterator<Item = &Arc<dyn CapacityPlugin>> {
        self.capacity.values()
    }
}

/// Explicit registration step; duplicate identifiers are startup errors.
#[derive(Default)]
pub struct PluginRegistryBuilder {
    discovery: Option<Arc<dyn DiscoveryPlugin>>,
    quota: IndexMap<String, Arc<dyn QuotaPlugin>>,
    capacity: IndexMap<String, Arc<dyn CapacityPlugin>>,
}

impl PluginRegistryBuilder {
    pub fn discovery(mut self, plugin: Arc<dyn DiscoveryPlugin>) -> Result<Self> {
        if self.discovery.is_some() {
            bail!("a discovery plugin is already registered");
        }
        self.discovery = Some(plugin);
        Ok(self)
    }

    pub fn quota_plugin(mut self, plugin: Arc<dyn QuotaPlugin>) -> Result<Self> {
        let service_type = plugin.service_type().to_string();
        if self.quota.insert(service_type.clone(), plugin).is_some() {
            bail!("duplicate quota plugin for service type {service_type:?}");
        }
        Ok(self)
    }

    pub fn capacity_plugin(mut self, plugin: Arc<dyn CapacityPlugin>) -> Result<Self> {
        let id = plugin.capacitor_id().to_string();
        if self.capacity.insert(id.clone(), plugin).is_some() {
            bail!("duplicate capacity plugin for capacitor id {id:?}");
        }
        Ok(self)
    }

    pub fn build(self) -> Result<PluginRegistry> {
        let discovery = self
            .discovery
            .context("no discovery plugin was registered")?;
        Ok(PluginRegistry {
            discovery,
            quota: self.quota,
            capacity: self.capacity,
        })
    }
}
