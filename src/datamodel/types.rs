//! Value types shared between drivers, the collector, and the data model.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Availability zone name.
///
/// The synthetic zone [`AvailabilityZone::ANY`] holds data for resources that
/// are not broken down by zone.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AvailabilityZone(pub String);

impl AvailabilityZone {
    pub const ANY: &'static str = "any";

    pub fn any() -> Self {
        Self(Self::ANY.to_string())
    }

    pub fn is_any(&self) -> bool {
        self.0 == Self::ANY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AvailabilityZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AvailabilityZone {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a resource or rate reports one value per cluster or one per AZ.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    #[default]
    Flat,
    AzAware,
}

impl Topology {
    pub fn as_str(self) -> &'static str {
        match self {
            Topology::Flat => "flat",
            Topology::AzAware => "az-aware",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "flat" => Some(Topology::Flat),
            "az-aware" => Some(Topology::AzAware),
            _ => None,
        }
    }
}

/// Multiplier from accounted quota to the quota actually set at the backend.
///
/// A factor of zero means "unset" and behaves like the identity. `apply_to`
/// and `apply_in_reverse` round to nearest, which makes them exact inverses
/// for all factors deployed in practice and all values below 2^32.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OvercommitFactor(pub f64);

impl OvercommitFactor {
    pub fn is_set(self) -> bool {
        self.0 != 0.0
    }

    pub fn apply_to(self, value: u64) -> u64 {
        if self.is_set() {
            (value as f64 * self.0).round() as u64
        } else {
            value
        }
    }

    pub fn apply_in_reverse(self, value: u64) -> u64 {
        if self.is_set() {
            (value as f64 / self.0).round() as u64
        } else {
            value
        }
    }
}

/// Usage observed for one resource in one availability zone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    pub usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subresources: Vec<serde_json::Value>,
}

impl UsageData {
    /// Accumulate `other` into `self`. Associative and commutative;
    /// `physical_usage` is only tracked when every summand tracks it.
    pub fn add(&mut self, other: &UsageData) {
        self.usage += other.usage;
        self.physical_usage = match (self.physical_usage, other.physical_usage) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
        self.subresources.extend(other.subresources.iter().cloned());
    }
}

/// Capacity reported for one resource in one availability zone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityData {
    pub capacity: u64,
    #[serde(default)]
    pub usage: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subcapacities: Vec<serde_json::Value>,
}

impl CapacityData {
    /// Accumulate `other` into `self`. Associative and commutative.
    pub fn add(&mut self, other: &CapacityData) {
        self.capacity += other.capacity;
        self.usage += other.usage;
        self.subcapacities.extend(other.subcapacities.iter().cloned());
    }
}

/// Quota and per-AZ usage reported by a quota driver for one resource.
///
/// A negative quota means the backend grants unlimited use.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    pub quota: i64,
    #[serde(default)]
    pub per_az: BTreeMap<AvailabilityZone, UsageData>,
}

impl ResourceData {
    pub fn total_usage(&self) -> u64 {
        self.per_az.values().map(|u| u.usage).sum()
    }
}

/// Sum usage data over all zones, e.g. to collapse an AZ breakdown into the
/// synthetic "any" zone.
pub fn sum_usage<'a>(values: impl IntoIterator<Item = &'a UsageData>) -> UsageData {
    let mut total = UsageData {
        physical_usage: Some(0),
        ..UsageData::default()
    };
    for value in values {
        total.add(value);
    }
    total
}

/// Sum capacity data over all zones.
pub fn sum_capacity<'a>(values: impl IntoIterator<Item = &'a CapacityData>) -> CapacityData {
    let mut total = CapacityData::default();
    for value in values {
        total.add(value);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overcommit_roundtrip() {
        let factors = [0.0, 1.0, 1.1, 1.2, 1.5, 2.0, 2.5, 3.0, 4.0];
        let samples = [
            0u64,
            1,
            2,
            3,
            9,
            10,
            11,
            99,
            1000,
            12345,
            999_999,
            4_294_967_295,
        ];
        for &f in &factors {
            let factor = OvercommitFactor(f);
            for &x in &samples {
                assert_eq!(
                    factor.apply_in_reverse(factor.apply_to(x)),
                    x,
                    "factor {f} value {x}"
                );
            }
        }
    }

    #[test]
    fn test_overcommit_unset_is_identity() {
        let factor = OvercommitFactor(0.0);
        assert_eq!(factor.apply_to(42), 42);
        assert_eq!(factor.apply_in_reverse(42), 42);
    }

    #[test]
    fn test_usage_add_is_commutative() {
        let a = UsageData {
            usage: 5,
            physical_usage: Some(3),
            subresources: vec![json!({"id": "a"})],
        };
        let b = UsageData {
            usage: 7,
            physical_usage: None,
            subresources: vec![],
        };

        let mut ab = a.clone();
        ab.add(&b);
        let mut ba = b.clone();
        ba.add(&a);

        assert_eq!(ab.usage, ba.usage);
        assert_eq!(ab.physical_usage, ba.physical_usage);
        assert_eq!(ab.physical_usage, None, "mixed tracking collapses to None");
    }

    #[test]
    fn test_usage_add_is_associative() {
        let values = [
            UsageData {
                usage: 1,
                physical_usage: Some(1),
                subresources: vec![],
            },
            UsageData {
                usage: 2,
                physical_usage: Some(2),
                subresources: vec![],
            },
            UsageData {
                usage: 3,
                physical_usage: Some(3),
                subresources: vec![],
            },
        ];

        // (a + b) + c
        let mut left = values[0].clone();
        left.add(&values[1]);
        left.add(&values[2]);

        // a + (b + c)
        let mut bc = values[1].clone();
        bc.add(&values[2]);
        let mut right = values[0].clone();
        right.add(&bc);

        assert_eq!(left, right);
        assert_eq!(left.usage, 6);
        assert_eq!(left.physical_usage, Some(6));
    }

    #[test]
    fn test_capacity_sum() {
        let values = [
            CapacityData {
                capacity: 100,
                usage: 10,
                subcapacities: vec![json!("x")],
            },
            CapacityData {
                capacity: 50,
                usage: 5,
                subcapacities: vec![],
            },
        ];
        let total = sum_capacity(&values);
        assert_eq!(total.capacity, 150);
        assert_eq!(total.usage, 15);
        assert_eq!(total.subcapacities.len(), 1);
    }

    #[test]
    fn test_sum_usage_empty_tracks_physical_zero() {
        let total = sum_usage([]);
        assert_eq!(total.usage, 0);
        assert_eq!(total.physical_usage, Some(0));
    }

    #[test]
    fn test_topology_parse() {
        assert_eq!(Topology::parse("flat"), Some(Topology::Flat));
        assert_eq!(Topology::parse("az-aware"), Some(Topology::AzAware));
        assert_eq!(Topology::parse("bogus"), None);
    }
}
