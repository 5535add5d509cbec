//! Resource behavior rules.
//!
//! Operators attach behavior overrides to resources by regex on the
//! "service/resource" full name. All matching rules merge into one effective
//! behavior; the merge is a deterministic fold in declaration order so that
//! two processes with the same config always agree.

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::datamodel::types::OvercommitFactor;
use crate::error::Result;
use anyhow::Context;

/// One behavior override as written in the cluster configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ResourceBehaviorRule {
    /// Regex matched against the full "service/resource" name. Anchored on
    /// both ends at compile time.
    pub resource: String,
    #[serde(default)]
    pub max_burst_multiplier: Option<f64>,
    #[serde(default)]
    pub overcommit_factor: f64,
    #[serde(default)]
    pub scales_with: String,
    #[serde(default)]
    pub min_nonzero_project_quota: Option<u64>,
    #[serde(default)]
    pub annotations: Map<String, Value>,
}

pub struct CompiledBehaviorRule {
    pattern: Regex,
    rule: ResourceBehaviorRule,
}

/// The effective behavior for one resource after merging all matching rules.
///
/// Merge law, fold over matches in declaration order:
/// max_burst_multiplier takes the minimum (unset never lowers), the
/// overcommit factor takes the last non-zero value, the scaling relation
/// takes the last non-empty value, min_nonzero_project_quota takes the
/// maximum, and annotations union with last-write-wins per key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceBehavior {
    pub max_burst_multiplier: Option<f64>,
    pub overcommit_factor: OvercommitFactor,
    pub scales_with: String,
    pub min_nonzero_project_quota: Option<u64>,
    pub annotations: Map<String, Value>,
}

/// Compile behavior rules; invalid regexes are fatal.
pub fn compile_rules(rules: &[ResourceBehaviorRule]) -> Result<Vec<CompiledBehaviorRule>> {
    rules
        .iter()
        .map(|rule| {
            let pattern = Regex::new(&format!("^(?:{})$", rule.resource))
                .with_context(|| format!("invalid resource_behavior regex: {:?}", rule.resource))?;
            Ok(CompiledBehaviorRule {
                pattern,
                rule: rule.clone(),
            })
        })
        .collect()
}

/// Merge all rules matching `full_name` ("service/resource").
pub fn behavior_for(rules: &[CompiledBehaviorRule], full_name: &str) -> ResourceBehavior {
    let mut merged = ResourceBehavior::default();
    for compiled in rules {
        if !compiled.pattern.is_match(full_name) {
            continue;
        }
        let rule = &compiled.rule;

        merged.max_burst_multiplier = match (merged.max_burst_multiplier, rule.max_burst_multiplier)
        {
            (Some(a), Some(b)) => Some(a.min(b)),
            (acc, new) => acc.or(new),
        };
        if rule.overcommit_factor != 0.0 {
            merged.overcommit_factor = OvercommitFactor(rule.overcommit_factor);
        }
        if !rule.scales_with.is_empty() {
            merged.scales_with = rule.scales_with.clone();
        }
        merged.min_nonzero_project_quota = match (
            merged.min_nonzero_project_quota,
            rule.min_nonzero_project_quota,
        ) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (acc, new) => acc.or(new),
        };
        for (key, value) in &rule.annotations {
            merged.annotations.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(resource: &str) -> ResourceBehaviorRule {
        ResourceBehaviorRule {
            resource: resource.to_string(),
            max_burst_multiplier: None,
            overcommit_factor: 0.0,
            scales_with: String::new(),
            min_nonzero_project_quota: None,
            annotations: Map::new(),
        }
    }

    #[test]
    fn test_no_match_yields_default() {
        let rules = compile_rules(&[rule("compute/cores")]).unwrap();
        let merged = behavior_for(&rules, "storage/capacity");
        assert_eq!(merged, ResourceBehavior::default());
    }

    #[test]
    fn test_patterns_are_anchored() {
        let rules = compile_rules(&[{
            let mut r = rule("compute/cores");
            r.overcommit_factor = 2.0;
            r
        }])
        .unwrap();
        assert_eq!(
            behavior_for(&rules, "compute/cores_reserved"),
            ResourceBehavior::default()
        );
    }

    #[test]
    fn test_burst_multiplier_takes_minimum() {
        let mut a = rule("compute/.*");
        a.max_burst_multiplier = Some(0.5);
        let mut b = rule("compute/cores");
        b.max_burst_multiplier = Some(0.2);
        let c = rule(".*"); // unset does not lower
        let rules = compile_rules(&[a, b, c]).unwrap();

        let merged = behavior_for(&rules, "compute/cores");
        assert_eq!(merged.max_burst_multiplier, Some(0.2));
    }

    #[test]
    fn test_overcommit_takes_last_nonzero() {
        let mut a = rule(".*");
        a.overcommit_factor = 1.5;
        let b = rule("compute/.*"); // zero, does not override
        let mut c = rule("compute/cores");
        c.overcommit_factor = 3.0;
        let rules = compile_rules(&[a, b, c]).unwrap();

        let merged = behavior_for(&rules, "compute/cores");
        assert_eq!(merged.overcommit_factor, OvercommitFactor(3.0));
    }

    #[test]
    fn test_min_nonzero_quota_takes_maximum() {
        let mut a = rule(".*");
        a.min_nonzero_project_quota = Some(10);
        let mut b = rule("compute/cores");
        b.min_nonzero_project_quota = Some(4);
        let rules = compile_rules(&[a, b]).unwrap();

        let merged = behavior_for(&rules, "compute/cores");
        assert_eq!(merged.min_nonzero_project_quota, Some(10));
    }

    #[test]
    fn test_annotations_union_with_last_write_wins() {
        let mut a = rule(".*");
        a.annotations.insert("tier".into(), json!("bronze"));
        a.annotations.insert("team".into(), json!("infra"));
        let mut b = rule("compute/cores");
        b.annotations.insert("tier".into(), json!("gold"));
        let rules = compile_rules(&[a, b]).unwrap();

        let merged = behavior_for(&rules, "compute/cores");
        assert_eq!(merged.annotations.get("tier"), Some(&json!("gold")));
        assert_eq!(merged.annotations.get("team"), Some(&json!("infra")));
    }

    #[test]
    fn test_scaling_takes_last_nonempty() {
        let mut a = rule(".*");
        a.scales_with = "compute/cores".to_string();
        let b = rule("compute/ram");
        let rules = compile_rules(&[a, b]).unwrap();

        let merged = behavior_for(&rules, "compute/ram");
        assert_eq!(merged.scales_with, "compute/cores");
    }

    #[test]
    fn test_invalid_regex_is_fatal() {
        assert!(compile_rules(&[rule("compute/(")]).is_err());
    }
}
