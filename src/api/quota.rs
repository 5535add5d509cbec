//! Quota-set write path: PUT and simulate-PUT.
//!
//! The validation pipeline runs constraints, admin maxima and the driver's
//! acceptability hook. A passing PUT updates the approved quota and stamps
//! `quota_desynced_at`; the sync pusher propagates asynchronously.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::api::error::{ApiError, QuotaUpdateIssue};
use crate::cluster::Cluster;
use crate::datamodel::models::{Domain, Project};
use crate::db;
use crate::db::resources::ProjectResourceRow;
use crate::error::Result;
use crate::plugins::ProjectRef;

#[derive(Debug, Deserialize)]
pub struct QuotaSetRequest {
    pub services: Vec<ServiceQuotaRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceQuotaRequest {
    #[serde(rename = "type")]
    pub service_type: String,
    pub resources: Vec<ResourceQuotaRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuotaRequest {
    pub name: String,
    pub quota: u64,
}

#[derive(Debug, Serialize)]
pub struct SimulateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<QuotaUpdateIssue>,
}

/// One approved write: the row to update and its owning project-service.
pub struct PlannedUpdate {
    pub project_resource_id: i64,
    pub project_service_id: i64,
    pub quota: u64,
}

/// Check one requested value against the constraint and admin maxima of its
/// resource. Side-effect-free; the acceptable bounds go into the issue.
pub fn validate_resource_quota(
    cluster: &Cluster,
    domain_name: &str,
    project_name: &str,
    service_type: &str,
    row: &ProjectResourceRow,
    requested: u64,
) -> Option<QuotaUpdateIssue> {
    if row.forbidden {
        return Some(QuotaUpdateIssue {
            service_type: service_type.to_string(),
            resource_name: row.resource_name.clone(),
            message: "resource is forbidden for this project".to_string(),
            min_acceptable_quota: None,
            max_acceptable_quota: Some(0),
            unit: row.unit.clone(),
        });
    }

    let constraint =
        cluster
            .constraints
            .for_project(domain_name, project_name, service_type, &row.resource_name);

    let min_acceptable = constraint.and_then(|c| c.minimum);
    let mut max_acceptable = constraint.and_then(|c| c.maximum);
    for admin_max in [
        row.max_quota_from_outside_admin,
        row.max_quota_from_local_admin,
    ]
    .into_iter()
    .flatten()
    .filter_map(|v| u64::try_from(v).ok())
    {
        max_acceptable = Some(max_acceptable.map_or(admin_max, |max| max.min(admin_max)));
    }

    let too_low = min_acceptable.is_some_and(|min| requested < min);
    let too_high = max_acceptable.is_some_and(|max| requested > max);
    if !too_low && !too_high {
        return None;
    }

    let unit = constraint
        .map(|c| c.unit.clone())
        .filter(|unit| !unit.is_empty())
        .unwrap_or_else(|| row.unit.clone());

    Some(QuotaUpdateIssue {
        service_type: service_type.to_string(),
        resource_name: row.resource_name.clone(),
        message: if too_low {
            format!("requested quota {requested} is below the acceptable range")
        } else {
            format!("requested quota {requested} is above the acceptable range")
        },
        min_acceptable_quota: min_acceptable,
        max_acceptable_quota: max_acceptable,
        unit,
    })
}

/// Run the full pipeline over a request body. Returns the planned updates
/// and every issue found; callers decide whether issues are fatal.
pub async fn validate_request(
    pool: &PgPool,
    cluster: &Cluster,
    domain: &Domain,
    project: &Project,
    request: &QuotaSetRequest,
) -> Result<(Vec<PlannedUpdate>, Vec<QuotaUpdateIssue>), ApiError> {
    let mut updates = Vec::new();
    let mut issues = Vec::new();

    let project_ref = ProjectRef {
        uuid: project.uuid.clone(),
        name: project.name.clone(),
        domain_uuid: domain.uuid.clone(),
        domain_name: domain.name.clone(),
    };

    for service_request in &request.services {
        let service_type = service_request.service_type.as_str();
        let Some(plugin) = cluster.registry.quota_plugin(service_type) else {
            issues.push(QuotaUpdateIssue {
                service_type: service_type.to_string(),
                resource_name: String::new(),
                message: format!("no such service: {service_type:?}"),
                min_acceptable_quota: None,
                max_acceptable_quota: None,
                unit: String::new(),
            });
            continue;
        };

        let service_id = db::cluster::service_id_for_type(pool, service_type)
            .await
            .map_err(ApiError::from)?;
        let project_service_id = db::services::id_for(pool, project.id, service_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found("project is not scraped for this service yet"))?;

        let rows: HashMap<String, ProjectResourceRow> =
            db::resources::resources_for_service(pool, project.id, service_id)
                .await
                .map_err(ApiError::from)?
                .into_iter()
                .map(|row| (row.resource_name.clone(), row))
                .collect();

        let mut requested_map: BTreeMap<String, u64> = BTreeMap::new();
        for resource_request in &service_request.resources {
            let Some(row) = rows.get(&resource_request.name) else {
                issues.push(QuotaUpdateIssue {
                    service_type: service_type.to_string(),
                    resource_name: resource_request.name.clone(),
                    message: format!(
                        "no such resource: {service_type}/{}",
                        resource_request.name
                    ),
                    min_acceptable_quota: None,
                    max_acceptable_quota: None,
                    unit: String::new(),
                });
                continue;
            };

            if let Some(issue) = validate_resource_quota(
                cluster,
                &domain.name,
                &project.name,
                service_type,
                row,
                resource_request.quota,
            ) {
                issues.push(issue);
                continue;
            }

            requested_map.insert(resource_request.name.clone(), resource_request.quota);
            updates.push(PlannedUpdate {
                project_resource_id: row.id,
                project_service_id,
                quota: resource_request.quota,
            });
        }

        if !requested_map.is_empty()
            && let Err(message) = plugin
                .is_quota_acceptable_for_project(&project_ref, &requested_map)
                .await
        {
            for name in requested_map.keys() {
                issues.push(QuotaUpdateIssue {
                    service_type: service_type.to_string(),
                    resource_name: name.clone(),
                    message: message.clone(),
                    min_acceptable_quota: None,
                    max_acceptable_quota: None,
                    unit: rows.get(name).map(|r| r.unit.clone()).unwrap_or_default(),
                });
            }
        }
    }

    Ok((updates, issues))
}

/// Apply approved updates: set the quota and stamp the desync marker, all in
/// one transaction.
pub async fn apply_updates(pool: &PgPool, updates: &[PlannedUpdate]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for update in updates {
        db::resources::update_quota(&mut *tx, update.project_resource_id, update.quota as i64)
            .await?;
    }
    let mut marked = std::collections::HashSet::new();
    for update in updates {
        if marked.insert(update.project_service_id) {
            db::services::mark_desynced(&mut *tx, update.project_service_id).await?;
        }
    }
    tx.commit().await?;
    Ok(())
}
