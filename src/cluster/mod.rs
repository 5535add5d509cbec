//! In-memory bundle of one cluster's identity, drivers, behaviors and
//! constraints.
//!
//! Built once at startup; everything here is immutable afterwards and shared
//! read-only across all workers.

pub mod behavior;
pub mod constraints;

use std::collections::HashMap;
use std::sync::Arc;

use figment::Figment;
use figment::providers::{Format, Yaml};

use anyhow::Context;

use crate::cluster::behavior::{CompiledBehaviorRule, ResourceBehavior};
use crate::cluster::constraints::{ConstraintFile, QuotaConstraintSet};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::plugins::{PluginRegistry, RateInfo, ResourceInfo};

pub struct Cluster {
    pub id: String,
    pub registry: Arc<PluginRegistry>,
    pub constraints: QuotaConstraintSet,
    /// Cluster-wide bursting multiplier; zero disables bursting.
    pub bursting_max_multiplier: f64,
    behaviors: Vec<CompiledBehaviorRule>,
    resources: HashMap<(String, String), ResourceInfo>,
    rates: HashMap<(String, String), RateInfo>,
    subresources: HashMap<String, Vec<String>>,
    subcapacities: HashMap<String, Vec<String>>,
}

impl Cluster {
    /// Compile the cluster model. All validation failures here are fatal
    /// startup errors.
    pub fn new(id: &str, cfg: &ClusterConfig, registry: Arc<PluginRegistry>) -> Result<Arc<Self>> {
        let behaviors = behavior::compile_rules(&cfg.resource_behavior)?;

        let mut files = Vec::new();
        for path in &cfg.constraints {
            let file: ConstraintFile = Figment::from(Yaml::file(path))
                .extract()
                .with_context(|| format!("failed to load constraint file {}", path.display()))?;
            files.push(file);
        }
        let constraints = QuotaConstraintSet::compile(&files)?;

        let mut resources = HashMap::new();
        let mut rates = HashMap::new();
        for plugin in registry.quota_plugins() {
            let service_type = plugin.service_type().to_string();
            for info in plugin.resources() {
                resources.insert((service_type.clone(), info.name.clone()), info.clone());
            }
            for info in plugin.rates() {
                rates.insert((service_type.clone(), info.name.clone()), info.clone());
            }
        }

        Ok(Arc::new(Self {
            id: id.to_string(),
            registry,
            constraints,
            bursting_max_multiplier: cfg.bursting.max_multiplier,
            behaviors,
            resources,
            rates,
            subresources: cfg.subresources.clone().into_iter().collect(),
            subcapacities: cfg.subcapacities.clone().into_iter().collect(),
        }))
    }

    pub fn has_service(&self, service_type: &str) -> bool {
        self.registry.quota_plugin(service_type).is_some()
    }

    pub fn has_resource(&self, service_type: &str, resource_name: &str) -> bool {
        self.resources
            .contains_key(&(service_type.to_string(), resource_name.to_string()))
    }

    pub fn resource_info(&self, service_type: &str, resource_name: &str) -> Option<&ResourceInfo> {
        self.resources
            .get(&(service_type.to_string(), resource_name.to_string()))
    }

    pub fn rate_info(&self, service_type: &str, rate_name: &str) -> Option<&RateInfo> {
        self.rates
            .get(&(service_type.to_string(), rate_name.to_string()))
    }

    /// The merged behavior for one resource.
    pub fn behavior_for(&self, service_type: &str, resource_name: &str) -> ResourceBehavior {
        behavior::behavior_for(&self.behaviors, &format!("{service_type}/{resource_name}"))
    }

    /// Whether subresource blobs from scrapes of this resource are persisted.
    pub fn subresources_enabled(&self, service_type: &str, resource_name: &str) -> bool {
        self.subresources
            .get(service_type)
            .is_some_and(|names| names.iter().any(|n| n == resource_name))
    }

    /// Whether subcapacity blobs from capacity scrapes of this resource are
    /// persisted.
    pub fn subcapacities_enabled(&self, service_type: &str, resource_name: &str) -> bool {
        self.subcapacities
            .get(service_type)
            .is_some_and(|names| names.iter().any(|n| n == resource_name))
    }
}
