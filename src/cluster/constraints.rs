//! Quota constraint files and the clause grammar.
//!
//! Constraint files bound the quota a domain or project may hold per
//! (service, resource). Clauses are textual: `at least X`, `at most X`,
//! `exactly X`, each with an optional unit, and the domain-only form
//! `at least X more than project constraints`. Multiple comma-separated
//! clauses intersect.

use std::collections::BTreeMap;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::error::Result;

/// Effective bounds for one (scope, service, resource).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaConstraint {
    pub minimum: Option<u64>,
    pub maximum: Option<u64>,
    pub unit: String,
}

impl QuotaConstraint {
    pub fn allows(&self, quota: u64) -> bool {
        self.minimum.is_none_or(|min| quota >= min) && self.maximum.is_none_or(|max| quota <= max)
    }

    pub fn clamp(&self, quota: u64) -> u64 {
        let mut value = quota;
        if let Some(min) = self.minimum {
            value = value.max(min);
        }
        if let Some(max) = self.maximum {
            value = value.min(max);
        }
        value
    }

    fn is_empty(&self) -> bool {
        self.minimum.is_none() && self.maximum.is_none()
    }
}

/// resource name -> clause text
type ResourceClauses = BTreeMap<String, String>;
/// service type -> resources
type ServiceClauses = BTreeMap<String, ResourceClauses>;

/// On-disk shape of one constraint file. Project scopes are keyed
/// "domain-name/project-name".
#[derive(Debug, Default, Deserialize)]
pub struct ConstraintFile {
    #[serde(default)]
    pub domains: BTreeMap<String, ServiceClauses>,
    #[serde(default)]
    pub projects: BTreeMap<String, ServiceClauses>,
}

type ConstraintMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, QuotaConstraint>>>;

/// All compiled constraints for one cluster.
#[derive(Debug, Default)]
pub struct QuotaConstraintSet {
    domains: ConstraintMap,
    /// Keyed "domain-name/project-name".
    projects: ConstraintMap,
}

impl QuotaConstraintSet {
    pub fn for_domain(
        &self,
        domain_name: &str,
        service_type: &str,
        resource_name: &str,
    ) -> Option<&QuotaConstraint> {
        self.domains
            .get(domain_name)?
            .get(service_type)?
            .get(resource_name)
    }

    pub fn for_project(
        &self,
        domain_name: &str,
        project_name: &str,
        service_type: &str,
        resource_name: &str,
    ) -> Option<&QuotaConstraint> {
        self.projects
            .get(&format!("{domain_name}/{project_name}"))?
            .get(service_type)?
            .get(resource_name)
    }

    /// Parse and validate a set of constraint files.
    pub fn compile(files: &[ConstraintFile]) -> Result<Self> {
        let mut parsed_domains: BTreeMap<String, BTreeMap<String, BTreeMap<String, ParsedClauses>>> =
            BTreeMap::new();
        let mut projects: ConstraintMap = BTreeMap::new();

        for file in files {
            for (domain, services) in &file.domains {
                for (service, resources) in services {
                    for (resource, text) in resources {
                        let clauses = ParsedClauses::parse(text).with_context(|| {
                            format!("constraint for domain {domain:?}, {service}/{resource}")
                        })?;
                        parsed_domains
                            .entry(domain.clone())
                            .or_default()
                            .entry(service.clone())
                            .or_default()
                            .entry(resource.clone())
                            .or_default()
                            .merge(clauses)?;
                    }
                }
            }
            for (scope, services) in &file.projects {
                if !scope.contains('/') {
                    bail!("project constraint scope {scope:?} is not of the form domain/project");
                }
                for (service, resources) in services {
                    for (resource, text) in resources {
                        let clauses = ParsedClauses::parse(text).with_context(|| {
                            format!("constraint for project {scope:?}, {service}/{resource}")
                        })?;
                        if clauses.min_plus_projects.is_some() {
                            bail!(
                                "constraint for project {scope:?}, {service}/{resource}: \
                                 \"more than project constraints\" is only allowed at domain scope"
                            );
                        }
                        let constraint = clauses.into_constraint(0)?;
                        if constraint.is_empty() {
                            continue;
                        }
                        projects
                            .entry(scope.clone())
                            .or_default()
                            .entry(service.clone())
                            .or_default()
                            .insert(resource.clone(), constraint);
                    }
                }
            }
        }

        // Resolve domain clauses; "more than project constraints" adds the
        // sum of the domain's per-project minima.
        let mut domains: ConstraintMap = BTreeMap::new();
        for (domain, services) in parsed_domains {
            for (service, resources) in services {
                for (resource, clauses) in resources {
                    let project_minimum_sum =
                        sum_of_project_minima(&projects, &domain, &service, &resource);
                    let constraint = clauses
                        .into_constraint(project_minimum_sum)
                        .with_context(|| {
                            format!("constraint for domain {domain:?}, {service}/{resource}")
                        })?;
                    if constraint.is_empty() {
                        continue;
                    }
                    if let Some(domain_min) = constraint.minimum
                        && project_minimum_sum > domain_min
                    {
                        bail!(
                            "domain {domain:?} guarantees only {domain_min} for \
                             {service}/{resource}, but its project constraints require \
                             {project_minimum_sum}"
                        );
                    }
                    domains
                        .entry(domain.clone())
                        .or_default()
                        .entry(service.clone())
                        .or_default()
                        .insert(resource.clone(), constraint);
                }
            }
        }

        Ok(Self { domains, projects })
    }
}

fn sum_of_project_minima(
    projects: &ConstraintMap,
    domain: &str,
    service: &str,
    resource: &str,
) -> u64 {
    let prefix = format!("{domain}/");
    projects
        .iter()
        .filter(|(scope, _)| scope.starts_with(&prefix))
        .filter_map(|(_, services)| services.get(service)?.get(resource)?.minimum)
        .sum()
}

/// Intermediate parse result for one clause list.
#[derive(Debug, Default)]
struct ParsedClauses {
    minimum: Option<u64>,
    maximum: Option<u64>,
    /// Value of an "at least X more than project constraints" clause.
    min_plus_projects: Option<u64>,
    unit: String,
}

impl ParsedClauses {
    fn parse(text: &str) -> Result<Self> {
        let mut parsed = Self::default();
        for raw_clause in text.split(',') {
            let mut clause = raw_clause.trim();
            if clause.is_empty() {
                bail!("empty clause in constraint {text:?}");
            }

            const RELATIVE_SUFFIX: &str = "more than project constraints";
            let relative = clause.ends_with(RELATIVE_SUFFIX);
            if relative {
                clause = clause[..clause.len() - RELATIVE_SUFFIX.len()].trim_end();
            }

            let (kind, rest) = if let Some(rest) = clause.strip_prefix("at least") {
                ("at least", rest)
            } else if let Some(rest) = clause.strip_prefix("at most") {
                ("at most", rest)
            } else if let Some(rest) = clause.strip_prefix("exactly") {
                ("exactly", rest)
            } else {
                bail!("unparseable clause {raw_clause:?}");
            };
            if relative && kind != "at least" {
                bail!("clause {raw_clause:?}: \"more than project constraints\" requires \"at least\"");
            }

            let rest = rest.trim();
            let (value_str, unit) = match rest.split_once(char::is_whitespace) {
                Some((value, unit)) => (value, unit.trim()),
                None => (rest, ""),
            };
            let value: u64 = value_str
                .parse()
                .with_context(|| format!("unparseable value in clause {raw_clause:?}"))?;

            if !unit.is_empty() {
                if !parsed.unit.is_empty() && parsed.unit != unit {
                    bail!("conflicting units {:?} and {unit:?} in constraint {text:?}", parsed.unit);
                }
                parsed.unit = unit.to_string();
            }

            match (kind, relative) {
                ("at least", true) => {
                    parsed.min_plus_projects =
                        Some(parsed.min_plus_projects.unwrap_or(0).max(value));
                }
                ("at least", false) => {
                    parsed.minimum = Some(parsed.minimum.unwrap_or(0).max(value));
                }
                ("at most", _) => {
                    parsed.maximum = Some(parsed.maximum.map_or(value, |max| max.min(value)));
                }
                ("exactly", _) => {
                    parsed.minimum = Some(parsed.minimum.unwrap_or(0).max(value));
                    parsed.maximum = Some(parsed.maximum.map_or(value, |max| max.min(value)));
                }
                _ => unreachable!(),
            }
        }
        Ok(parsed)
    }

    fn merge(&mut self, other: ParsedClauses) -> Result<()> {
        if !other.unit.is_empty() {
            if !self.unit.is_empty() && self.unit != other.unit {
                bail!("conflicting units {:?} and {:?}", self.unit, other.unit);
            }
            self.unit = other.unit;
        }
        self.minimum = match (self.minimum, other.minimum) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.maximum = match (self.maximum, other.maximum) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.min_plus_projects = match (self.min_plus_projects, other.min_plus_projects) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    fn into_constraint(self, project_minimum_sum: u64) -> Result<QuotaConstraint> {
        let mut minimum = self.minimum;
        if let Some(value) = self.min_plus_projects {
            let resolved = value + project_minimum_sum;
            minimum = Some(minimum.unwrap_or(0).max(resolved));
        }
        if let (Some(min), Some(max)) = (minimum, self.maximum)
            && min > max
        {
            bail!("contradictory bounds: minimum {min} exceeds maximum {max}");
        }
        Ok(QuotaConstraint {
            minimum,
            maximum: self.maximum,
            unit: self.unit,
        })
    }
}
