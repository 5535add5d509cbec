//! Thin REST projection over the database, plus the quota-set write path.

pub mod error;
pub mod quota;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::error::ApiError;
use crate::api::quota::{QuotaSetRequest, SimulateResponse};
use crate::cluster::Cluster;
use crate::config::ApiConfig;
use crate::db;
use crate::error::Result;
use crate::services::Service;

#[derive(Clone)]
pub struct ApiState {
    pub pool: PgPool,
    pub cluster: Arc<Cluster>,
}

pub fn router(state: ApiState, cfg: &ApiConfig) -> Router {
    let origins: Vec<HeaderValue> = cfg
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new().allow_origin(origins);

    Router::new()
        .route("/v1/clusters", get(get_clusters))
        .route("/v1/domains", get(get_domains))
        .route("/v1/domains/{domain_uuid}/projects", get(get_domain_projects))
        .route(
            "/v1/domains/{domain_uuid}/projects/{project_uuid}",
            put(put_project_quota),
        )
        .route(
            "/v1/domains/{domain_uuid}/projects/{project_uuid}/simulate-put",
            post(simulate_put_project_quota),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------- reports ----------

#[derive(Serialize)]
struct ClusterReport {
    id: String,
    services: Vec<ClusterServiceReport>,
}

#[derive(Serialize)]
struct ClusterServiceReport {
    #[serde(rename = "type")]
    service_type: String,
    scraped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    scrape_error_message: String,
    resources: Vec<ClusterResourceOut>,
}

#[derive(Serialize)]
struct ClusterResourceOut {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    unit: String,
    topology: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity_usage: Option<i64>,
}

async fn get_clusters(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ClusterReport>>, ApiError> {
    let rows = db::reports::cluster_report(&state.pool)
        .await
        .map_err(ApiError::from)?;

    let mut services: Vec<ClusterServiceReport> = Vec::new();
    for row in rows {
        if services.last().map(|s| s.service_type.as_str()) != Some(row.service_type.as_str()) {
            services.push(ClusterServiceReport {
                service_type: row.service_type.clone(),
                scraped_at: row.scraped_at,
                scrape_error_message: row.scrape_error_message.clone(),
                resources: Vec::new(),
            });
        }
        let service = services.last_mut().expect("pushed above");
        service.resources.push(ClusterResourceOut {
            name: row.resource_name,
            unit: row.unit,
            topology: row.topology,
            capacity: row.has_capacity.then_some(row.capacity),
            capacity_usage: row.has_capacity.then_some(row.capacity_usage),
        });
    }

    Ok(Json(vec![ClusterReport {
        id: state.cluster.id.clone(),
        services,
    }]))
}

#[derive(Serialize)]
struct DomainOut {
    uuid: String,
    name: String,
}

async fn get_domains(State(state): State<ApiState>) -> Result<Json<Vec<DomainOut>>, ApiError> {
    let domains = db::projects::all_domains(&state.pool)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(
        domains
            .into_iter()
            .map(|d| DomainOut {
                uuid: d.uuid,
                name: d.name,
            })
            .collect(),
    ))
}

#[derive(Serialize)]
struct ProjectReport {
    uuid: String,
    name: String,
    services: Vec<ProjectServiceReport>,
}

#[derive(Serialize)]
struct ProjectServiceReport {
    #[serde(rename = "type")]
    service_type: String,
    scraped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    scrape_error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota_desynced_at: Option<DateTime<Utc>>,
    resources: Vec<ProjectResourceOut>,
}

#[derive(Serialize)]
struct ProjectResourceOut {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend_quota: Option<i64>,
    usage: i64,
}

async fn get_domain_projects(
    State(state): State<ApiState>,
    Path(domain_uuid): Path<String>,
) -> Result<Json<Vec<ProjectReport>>, ApiError> {
    let domain = db::reports::domain_by_uuid(&state.pool, &domain_uuid)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("no such domain: {domain_uuid}")))?;

    let rows = db::reports::project_report(&state.pool, domain.id)
        .await
        .map_err(ApiError::from)?;

    let mut projects: Vec<ProjectReport> = Vec::new();
    for row in rows {
        if projects.last().map(|p| p.uuid.as_str()) != Some(row.project_uuid.as_str()) {
            projects.push(ProjectReport {
                uuid: row.project_uuid.clone(),
                name: row.project_name.clone(),
                services: Vec::new(),
            });
        }
        let project = projects.last_mut().expect("pushed above");

        if project.services.last().map(|s| s.service_type.as_str())
            != Some(row.service_type.as_str())
        {
            project.services.push(ProjectServiceReport {
                service_type: row.service_type.clone(),
                scraped_at: row.scraped_at,
                scrape_error_message: row.scrape_error_message.clone(),
                quota_desynced_at: row.quota_desynced_at,
                resources: Vec::new(),
            });
        }
        let service = project.services.last_mut().expect("pushed above");

        if let Some(name) = row.resource_name {
            service.resources.push(ProjectResourceOut {
                name,
                unit: row.unit.unwrap_or_default(),
                quota: row.quota,
                backend_quota: row.backend_quota,
                usage: row.usage,
            });
        }
    }

    Ok(Json(projects))
}

// ---------- quota writes ----------

async fn lookup_scope(
    state: &ApiState,
    domain_uuid: &str,
    project_uuid: &str,
) -> Result<(crate::datamodel::models::Domain, crate::datamodel::models::Project), ApiError> {
    let domain = db::reports::domain_by_uuid(&state.pool, domain_uuid)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("no such domain: {domain_uuid}")))?;
    let project = db::reports::project_in_domain_by_uuid(&state.pool, domain.id, project_uuid)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("no such project: {project_uuid}")))?;
    Ok((domain, project))
}

async fn put_project_quota(
    State(state): State<ApiState>,
    Path((domain_uuid, project_uuid)): Path<(String, String)>,
    Json(request): Json<QuotaSetRequest>,
) -> Result<StatusCode, ApiError> {
    let (domain, project) = lookup_scope(&state, &domain_uuid, &project_uuid).await?;

    let (updates, issues) =
        quota::validate_request(&state.pool, &state.cluster, &domain, &project, &request).await?;
    if !issues.is_empty() {
        return Err(ApiError::unprocessable(issues));
    }

    quota::apply_updates(&state.pool, &updates)
        .await
        .map_err(ApiError::from)?;
    Ok(StatusCode::ACCEPTED)
}

async fn simulate_put_project_quota(
    State(state): State<ApiState>,
    Path((domain_uuid, project_uuid)): Path<(String, String)>,
    Json(request): Json<QuotaSetRequest>,
) -> Result<Json<SimulateResponse>, ApiError> {
    let (domain, project) = lookup_scope(&state, &domain_uuid, &project_uuid).await?;

    let (_, issues) =
        quota::validate_request(&state.pool, &state.cluster, &domain, &project, &request).await?;
    Ok(Json(SimulateResponse {
        success: issues.is_empty(),
        errors: issues,
    }))
}

// ---------- service wrapper ----------

pub struct ApiService {
    state: ApiState,
    cfg: ApiConfig,
    cancel: CancellationToken,
}

impl ApiService {
    pub fn new(pool: PgPool, cluster: Arc<Cluster>, cfg: ApiConfig) -> Self {
        Self {
            state: ApiState { pool, cluster },
            cfg,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl Service for ApiService {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn run(&mut self) -> Result<()> {
        let router = router(self.state.clone(), &self.cfg);
        let listener = tokio::net::TcpListener::bind(&self.cfg.listen_address).await?;
        info!(address = self.cfg.listen_address, "API listener started");

        let cancel = self.cancel.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}
