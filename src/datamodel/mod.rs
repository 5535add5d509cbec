pub mod models;
pub mod types;

pub use models::*;
pub use types::{
    AvailabilityZone, CapacityData, OvercommitFactor, ResourceData, Topology, UsageData,
    sum_capacity, sum_usage,
};
