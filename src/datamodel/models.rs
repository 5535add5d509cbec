//! Row-mapped records for the database schema.
//!
//! The database is the sole owner of all scheduling state and observed facts;
//! these structs are derived views that may be discarded at any time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterService {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub service_type: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub next_scrape_at: DateTime<Utc>,
    pub scrape_error_message: String,
    pub serialized_metrics: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterResource {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub unit: String,
    pub topology: String,
    pub has_capacity: bool,
    pub has_quota: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterAzResource {
    pub id: i64,
    pub resource_id: i64,
    pub az: String,
    pub raw_capacity: i64,
    pub usage: Option<i64>,
    pub last_nonzero_raw_capacity: Option<i64>,
    pub subcapacities: Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterRate {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub unit: String,
    pub topology: String,
    pub has_usage: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Domain {
    pub id: i64,
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub domain_id: i64,
    pub uuid: String,
    pub name: String,
    pub parent_uuid: String,
}

/// Scheduling state for one (project, service) pair.
///
/// `stale` forces the next eligible worker to treat the row as overdue;
/// `quota_desynced_at` is set iff some owned project-resource has a backend
/// quota that differs from the desired one.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectService {
    pub id: i64,
    pub project_id: i64,
    pub service_id: i64,
    pub scraped_at: Option<DateTime<Utc>>,
    pub checked_at: Option<DateTime<Utc>>,
    pub next_scrape_at: DateTime<Utc>,
    pub stale: bool,
    pub consecutive_scrape_errors: i32,
    pub scrape_duration_secs: f64,
    pub scrape_error_message: String,
    pub rates_scraped_at: Option<DateTime<Utc>>,
    pub rates_next_scrape_at: DateTime<Utc>,
    pub rates_stale: bool,
    pub consecutive_rate_scrape_errors: i32,
    pub rates_scrape_duration_secs: f64,
    pub rates_scrape_error_message: String,
    pub serialized_scrape_state: String,
    pub serialized_metrics: String,
    pub quota_desynced_at: Option<DateTime<Utc>>,
    pub consecutive_sync_errors: i32,
    pub quota_sync_error_message: String,
    pub quota_sync_duration_secs: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectResource {
    pub id: i64,
    pub project_id: i64,
    pub resource_id: i64,
    pub quota: Option<i64>,
    pub backend_quota: Option<i64>,
    pub forbidden: bool,
    pub max_quota_from_outside_admin: Option<i64>,
    pub max_quota_from_local_admin: Option<i64>,
    pub override_quota_from_config: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectAzResource {
    pub id: i64,
    pub project_id: i64,
    pub az_resource_id: i64,
    pub quota: Option<i64>,
    pub backend_quota: Option<i64>,
    pub usage: i64,
    pub physical_usage: Option<i64>,
    pub subresources: Value,
    pub historical_usage: Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRate {
    pub id: i64,
    pub project_id: i64,
    pub rate_id: i64,
    pub rate_limit: Option<i64>,
    pub window_ns: Option<i64>,
    /// Decimal string; empty until the first rate scrape reports a value.
    pub usage_as_bigint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "commitment_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommitmentState {
    Planned,
    Pending,
    Active,
    Superseded,
    Expired,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectCommitment {
    pub id: i64,
    pub uuid: String,
    pub project_id: i64,
    pub az_resource_id: i64,
    pub amount: i64,
    pub duration: String,
    pub created_at: DateTime<Utc>,
    pub confirm_by: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub state: CommitmentState,
    pub transfer_status: String,
    pub transfer_token: Option<String>,
    pub creation_context: Value,
    pub supersede_context: Option<Value>,
    pub renew_context: Option<Value>,
    pub notify_on_confirm: bool,
    pub notified_for_expiration: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MailNotification {
    pub id: i64,
    pub project_id: i64,
    pub subject: String,
    pub body: String,
    pub next_submission_at: DateTime<Utc>,
    pub failed_submissions: i32,
}
