//! Pure quota computation.
//!
//! Everything here is total and side-effect-free so that the scraper, the
//! consistency reconciler and the API validation pipeline agree on the same
//! numbers by construction.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::cluster::behavior::ResourceBehavior;
use crate::cluster::constraints::QuotaConstraint;
use crate::datamodel::types::{AvailabilityZone, Topology, UsageData, sum_usage};

/// Inputs that bound a project-resource's approved quota.
#[derive(Debug)]
pub struct QuotaPolicy<'a> {
    pub constraint: Option<&'a QuotaConstraint>,
    pub behavior: &'a ResourceBehavior,
    pub forbidden: bool,
    pub override_quota: Option<u64>,
    pub max_quota_from_outside_admin: Option<u64>,
    pub max_quota_from_local_admin: Option<u64>,
}

impl<'a> QuotaPolicy<'a> {
    pub fn new(behavior: &'a ResourceBehavior) -> Self {
        Self {
            constraint: None,
            behavior,
            forbidden: false,
            override_quota: None,
            max_quota_from_outside_admin: None,
            max_quota_from_local_admin: None,
        }
    }

    fn admin_maximum(&self) -> Option<u64> {
        match (
            self.max_quota_from_outside_admin,
            self.max_quota_from_local_admin,
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Result of an effective-quota computation, with the condition the caller
/// must log as a structured error.
#[derive(Debug, PartialEq, Eq)]
pub struct EffectiveQuota {
    pub value: u64,
    /// A constraint minimum exceeded an admin-imposed maximum; the minimum
    /// won.
    pub constraint_overrides_admin_max: bool,
}

/// The quota seeded when a resource is scraped for the first time:
/// the config override if set, otherwise the larger of the backend's
/// current quota and the driver-declared auto-approve value, run through the
/// normal policy pipeline.
pub fn initial_quota(
    reported_backend_quota: Option<u64>,
    auto_approve: Option<u64>,
    policy: &QuotaPolicy,
) -> u64 {
    let base = reported_backend_quota
        .unwrap_or(0)
        .max(auto_approve.unwrap_or(0));
    effective_quota(base, policy).value
}

/// Deterministically re-derive the approved quota from the current value and
/// the configured bounds.
///
/// Precedence: forbidden zeroes everything; a config override replaces the
/// current value; constraints clamp; admin maxima cap, except that a
/// constraint minimum above the admin maximum wins; min-nonzero-project-quota
/// raises any positive result to its floor.
pub fn effective_quota(current: u64, policy: &QuotaPolicy) -> EffectiveQuota {
    if policy.forbidden {
        return EffectiveQuota {
            value: 0,
            constraint_overrides_admin_max: false,
        };
    }

    let mut value = policy.override_quota.unwrap_or(current);
    if let Some(constraint) = policy.constraint {
        value = constraint.clamp(value);
    }

    let mut constraint_overrides_admin_max = false;
    if let Some(admin_max) = policy.admin_maximum()
        && value > admin_max
    {
        let constraint_min = policy.constraint.and_then(|c| c.minimum);
        match constraint_min {
            Some(min) if min > admin_max => {
                value = value.max(min);
                constraint_overrides_admin_max = true;
            }
            _ => value = admin_max,
        }
    }

    if let Some(floor) = policy.behavior.min_nonzero_project_quota
        && value > 0
        && value < floor
    {
        value = floor;
    }

    EffectiveQuota {
        value,
        constraint_overrides_admin_max,
    }
}

/// Result of a desired-backend-quota computation.
#[derive(Debug, PartialEq, Eq)]
pub struct DesiredBackendQuota {
    pub value: u64,
    /// The effective burst multiplier was negative and bursting was disabled
    /// for this computation; the caller logs this at error level.
    pub negative_multiplier_rejected: bool,
}

/// The quota that should be set at the backend: overcommit applied to the
/// approved quota, then the bursting headroom.
///
/// The effective multiplier is the cluster-wide one capped by the resource
/// behavior. It is re-checked for negativity on every call; config
/// validation rejects negative values, but a bad value must never lower the
/// backend quota below the approved one.
pub fn desired_backend_quota(
    quota: u64,
    behavior: &ResourceBehavior,
    cluster_burst_multiplier: f64,
) -> DesiredBackendQuota {
    let base = behavior.overcommit_factor.apply_to(quota);

    let mut multiplier = cluster_burst_multiplier;
    if let Some(cap) = behavior.max_burst_multiplier {
        multiplier = multiplier.min(cap);
    }
    let mut negative_multiplier_rejected = false;
    if multiplier < 0.0 {
        negative_multiplier_rejected = true;
        multiplier = 0.0;
    }

    DesiredBackendQuota {
        value: (base as f64 * (1.0 + multiplier)).floor() as u64,
        negative_multiplier_rejected,
    }
}

/// Exponential backoff: `base * factor^attempts`, capped.
pub fn exponential_backoff(base: Duration, factor: f64, attempts: i32, max: Duration) -> Duration {
    let exponent = attempts.clamp(0, 32);
    let scaled = base.as_secs_f64() * factor.max(1.0).powi(exponent);
    Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
}

/// Collapse a driver-reported AZ breakdown according to the resource's
/// declared topology: flat resources fold everything into the synthetic
/// "any" zone (and always have that one row), AZ-aware resources keep the
/// breakdown as reported.
pub fn normalize_per_az(
    topology: Topology,
    per_az: &BTreeMap<AvailabilityZone, UsageData>,
) -> BTreeMap<AvailabilityZone, UsageData> {
    match topology {
        Topology::AzAware => per_az.clone(),
        Topology::Flat => {
            let mut collapsed = BTreeMap::new();
            collapsed.insert(AvailabilityZone::any(), sum_usage(per_az.values()));
            collapsed
        }
    }
}

/// Maximum number of samples retained in a project-AZ-resource's usage
/// history.
const USAGE_HISTORY_LIMIT: usize = 16;

/// Append one usage sample to the stored history, a JSON array of
/// `[timestamp, usage]` pairs bounded to the most recent entries.
pub fn append_usage_history(existing: &Value, at: DateTime<Utc>, usage: u64) -> Value {
    let mut entries: Vec<Value> = existing.as_array().cloned().unwrap_or_default();
    entries.push(json!([at.to_rfc3339(), usage]));
    if entries.len() > USAGE_HISTORY_LIMIT {
        entries.drain(..entries.len() - USAGE_HISTORY_LIMIT);
    }
    Value::Array(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::types::OvercommitFactor;

    fn behavior() -> ResourceBehavior {
        ResourceBehavior::default()
    }

    fn constraint(min: Option<u64>, max: Option<u64>) -> QuotaConstraint {
        QuotaConstraint {
            minimum: min,
            maximum: max,
            unit: String::new(),
        }
    }

    // -- effective_quota tests --

    #[test]
    fn test_forbidden_zeroes_quota() {
        let b = behavior();
        let mut policy = QuotaPolicy::new(&b);
        policy.forbidden = true;
        policy.override_quota = Some(50);
        assert_eq!(effective_quota(10, &policy).value, 0);
    }

    #[test]
    fn test_override_replaces_current() {
        let b = behavior();
        let mut policy = QuotaPolicy::new(&b);
        policy.override_quota = Some(42);
        assert_eq!(effective_quota(10, &policy).value, 42);
    }

    #[test]
    fn test_constraint_clamps_both_ways() {
        let b = behavior();
        let c = constraint(Some(10), Some(50));
        let mut policy = QuotaPolicy::new(&b);
        policy.constraint = Some(&c);
        assert_eq!(effective_quota(5, &policy).value, 10);
        assert_eq!(effective_quota(70, &policy).value, 50);
        assert_eq!(effective_quota(30, &policy).value, 30);
    }

    #[test]
    fn test_admin_maximum_caps() {
        let b = behavior();
        let mut policy = QuotaPolicy::new(&b);
        policy.max_quota_from_outside_admin = Some(20);
        policy.max_quota_from_local_admin = Some(30);
        let result = effective_quota(100, &policy);
        assert_eq!(result.value, 20, "tighter admin maximum wins");
        assert!(!result.constraint_overrides_admin_max);
    }

    #[test]
    fn test_constraint_minimum_beats_admin_maximum() {
        let b = behavior();
        let c = constraint(Some(40), None);
        let mut policy = QuotaPolicy::new(&b);
        policy.constraint = Some(&c);
        policy.max_quota_from_local_admin = Some(25);
        let result = effective_quota(10, &policy);
        assert_eq!(result.value, 40);
        assert!(result.constraint_overrides_admin_max);
    }

    #[test]
    fn test_min_nonzero_floor_applies_only_above_zero() {
        let mut b = behavior();
        b.min_nonzero_project_quota = Some(8);
        let policy = QuotaPolicy::new(&b);
        assert_eq!(effective_quota(3, &policy).value, 8);
        assert_eq!(effective_quota(0, &policy).value, 0);
        assert_eq!(effective_quota(12, &policy).value, 12);
    }

    // -- initial_quota tests --

    #[test]
    fn test_initial_quota_takes_larger_of_backend_and_auto_approve() {
        let b = behavior();
        let policy = QuotaPolicy::new(&b);
        assert_eq!(initial_quota(Some(10), Some(25), &policy), 25);
        assert_eq!(initial_quota(Some(30), Some(25), &policy), 30);
        assert_eq!(initial_quota(None, None, &policy), 0);
    }

    #[test]
    fn test_initial_quota_override_wins_over_auto_approve() {
        let b = behavior();
        let mut policy = QuotaPolicy::new(&b);
        policy.override_quota = Some(5);
        assert_eq!(initial_quota(Some(10), Some(25), &policy), 5);
    }

    #[test]
    fn test_initial_quota_respects_constraints() {
        let b = behavior();
        let c = constraint(Some(20), None);
        let mut policy = QuotaPolicy::new(&b);
        policy.constraint = Some(&c);
        assert_eq!(initial_quota(Some(3), None, &policy), 20);
    }

    // -- desired_backend_quota tests --

    #[test]
    fn test_desired_equals_quota_without_overcommit_or_bursting() {
        let result = desired_backend_quota(10, &behavior(), 0.0);
        assert_eq!(result.value, 10);
        assert!(!result.negative_multiplier_rejected);
    }

    #[test]
    fn test_overcommit_applies_before_bursting() {
        let mut b = behavior();
        b.overcommit_factor = OvercommitFactor(2.0);
        let result = desired_backend_quota(10, &b, 0.5);
        assert_eq!(result.value, 30, "(10 * 2.0) * 1.5");
    }

    #[test]
    fn test_behavior_caps_burst_multiplier() {
        let mut b = behavior();
        b.max_burst_multiplier = Some(0.1);
        let result = desired_backend_quota(100, &b, 0.5);
        assert_eq!(result.value, 110);
    }

    #[test]
    fn test_negative_multiplier_disables_bursting() {
        let mut b = behavior();
        b.max_burst_multiplier = Some(-1.0);
        let result = desired_backend_quota(100, &b, 0.5);
        assert_eq!(result.value, 100);
        assert!(result.negative_multiplier_rejected);
    }

    // -- exponential_backoff tests --

    #[test]
    fn test_backoff_growth_and_cap() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        assert_eq!(exponential_backoff(base, 2.0, 0, max), base);
        assert_eq!(
            exponential_backoff(base, 2.0, 2, max),
            Duration::from_secs(240)
        );
        assert_eq!(exponential_backoff(base, 2.0, 10, max), max);
    }

    #[test]
    fn test_backoff_factor_below_one_is_ignored() {
        let base = Duration::from_secs(60);
        assert_eq!(
            exponential_backoff(base, 0.5, 3, Duration::from_secs(600)),
            base
        );
    }

    // -- normalize_per_az tests --

    #[test]
    fn test_flat_topology_collapses_to_any() {
        let mut per_az = BTreeMap::new();
        per_az.insert(
            AvailabilityZone::from("az-one"),
            UsageData {
                usage: 3,
                physical_usage: Some(2),
                subresources: vec![],
            },
        );
        per_az.insert(
            AvailabilityZone::from("az-two"),
            UsageData {
                usage: 4,
                physical_usage: Some(1),
                subresources: vec![],
            },
        );

        let normalized = normalize_per_az(Topology::Flat, &per_az);
        assert_eq!(normalized.len(), 1);
        let any = normalized.get(&AvailabilityZone::any()).unwrap();
        assert_eq!(any.usage, 7);
        assert_eq!(any.physical_usage, Some(3));
    }

    #[test]
    fn test_flat_topology_always_has_any_row() {
        let normalized = normalize_per_az(Topology::Flat, &BTreeMap::new());
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized.get(&AvailabilityZone::any()).unwrap().usage, 0);
    }

    #[test]
    fn test_az_aware_topology_is_passed_through() {
        let mut per_az = BTreeMap::new();
        per_az.insert(AvailabilityZone::from("az-one"), UsageData::default());
        let normalized = normalize_per_az(Topology::AzAware, &per_az);
        assert_eq!(normalized, per_az);
    }

    // -- append_usage_history tests --

    #[test]
    fn test_usage_history_appends_and_truncates() {
        let mut history = Value::Array(vec![]);
        let t0 = Utc::now();
        for i in 0..20 {
            history = append_usage_history(&history, t0, i);
        }
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), USAGE_HISTORY_LIMIT);
        assert_eq!(entries.last().unwrap()[1], json!(19));
        assert_eq!(entries.first().unwrap()[1], json!(4));
    }

    #[test]
    fn test_usage_history_tolerates_non_array_blob() {
        let history = append_usage_history(&json!({}), Utc::now(), 5);
        assert_eq!(history.as_array().unwrap().len(), 1);
    }
}
