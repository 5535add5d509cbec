//! Config-declared drivers: identity discovery from a static domain list and
//! capacity from fixed values.
//!
//! These exist so small deployments and the `test-*` subcommands can run
//! without any real backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::datamodel::types::{AvailabilityZone, CapacityData};
use crate::error::{DriverError, Result};
use crate::plugins::{
    CapacityPlugin, CapacityScrapeResult, DiscoveredDomain, DiscoveredProject, DiscoveryPlugin,
};

/// One domain plus its projects, as declared in the cluster configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticDomainConfig {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub projects: Vec<DiscoveredProject>,
}

pub struct StaticDiscoveryPlugin {
    domains: Vec<StaticDomainConfig>,
}

impl StaticDiscoveryPlugin {
    pub fn new(domains: Vec<StaticDomainConfig>) -> Self {
        Self { domains }
    }
}

#[async_trait::async_trait]
impl DiscoveryPlugin for StaticDiscoveryPlugin {
    async fn list_domains(&self) -> Result<Vec<DiscoveredDomain>, DriverError> {
        Ok(self
            .domains
            .iter()
            .map(|d| DiscoveredDomain {
                uuid: d.uuid.clone(),
                name: d.name.clone(),
            })
            .collect())
    }

    async fn list_projects(
        &self,
        domain: &DiscoveredDomain,
    ) -> Result<Vec<DiscoveredProject>, DriverError> {
        let domain = self
            .domains
            .iter()
            .find(|d| d.uuid == domain.uuid)
            .ok_or_else(|| DriverError::contract(format!("unknown domain: {}", domain.uuid)))?;
        Ok(domain.projects.clone())
    }
}

/// Capacity values for one (service, resource, az), as declared in config.
///
/// Keyed service type -> resource name -> availability zone. Resources that
/// are not AZ-aware use the synthetic "any" zone.
pub type StaticCapacityValues = BTreeMap<String, BTreeMap<String, BTreeMap<String, CapacityEntry>>>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CapacityEntry {
    pub capacity: u64,
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub subcapacities: Vec<serde_json::Value>,
}

pub struct StaticCapacityPlugin {
    capacitor_id: String,
    values: StaticCapacityValues,
}

impl StaticCapacityPlugin {
    pub fn new(capacitor_id: String, values: StaticCapacityValues) -> Self {
        Self {
            capacitor_id,
            values,
        }
    }
}

#[async_trait::async_trait]
impl CapacityPlugin for StaticCapacityPlugin {
    fn capacitor_id(&self) -> &str {
        &self.capacitor_id
    }

    async fn scrape(&self) -> Result<CapacityScrapeResult, DriverError> {
        let mut capacities = BTreeMap::new();
        for (service_type, resources) in &self.values {
            let mut per_resource = BTreeMap::new();
            for (resource_name, zones) in resources {
                let per_az: BTreeMap<AvailabilityZone, CapacityData> = zones
                    .iter()
                    .map(|(az, entry)| {
                        (
                            AvailabilityZone(az.clone()),
                            CapacityData {
                                capacity: entry.capacity,
                                usage: entry.usage,
                                subcapacities: entry.subcapacities.clone(),
                            },
                        )
                    })
                    .collect();
                per_resource.insert(resource_name.clone(), per_az);
            }
            capacities.insert(service_type.clone(), per_resource);
        }
        Ok(CapacityScrapeResult {
            capacities,
            serialized_metrics: String::new(),
        })
    }
}
