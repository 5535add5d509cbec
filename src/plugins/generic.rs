//! Generic HTTP quota driver.
//!
//! Talks to any backend that exposes the small JSON quota protocol below;
//! deployments with bespoke services put an adapter in front of them instead
//! of teaching this process their wire format.
//!
//! - `GET  {base}/v1/projects/{uuid}/quota` -> quota + per-AZ usage report
//! - `POST {base}/v1/projects/{uuid}/rates` with the previous opaque state
//! - `PUT  {base}/v1/projects/{uuid}/quota` with the desired quota map

use std::collections::BTreeMap;

use anyhow::{Context, anyhow};
use http::Extensions;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientWithMiddleware, Middleware, Next};
use serde::{Deserialize, Serialize};

use crate::config::GenericDriverConfig;
use crate::datamodel::types::{AvailabilityZone, ResourceData, UsageData};
use crate::error::{DriverError, Result};
use crate::plugins::{
    MetricSample, ProjectRef, QuotaPlugin, RateInfo, RateScrapeResult, ResourceInfo, ScrapeResult,
    ServiceInfo,
};

/// Logs every backend request with its duration and status at debug level.
struct RequestLogMiddleware;

#[async_trait::async_trait]
impl Middleware for RequestLogMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let method = req.method().clone();
        let url = req.url().clone();
        let started = std::time::Instant::now();
        let result = next.run(req, extensions).await;
        match &result {
            Ok(response) => tracing::debug!(
                %method,
                %url,
                status = response.status().as_u16(),
                elapsed = format!("{:.2?}", started.elapsed()),
                "backend request"
            ),
            Err(e) => tracing::debug!(
                %method,
                %url,
                error = %e,
                elapsed = format!("{:.2?}", started.elapsed()),
                "backend request failed"
            ),
        }
        result
    }
}

pub struct GenericQuotaPlugin {
    service_type: String,
    resources: Vec<ResourceInfo>,
    rates: Vec<RateInfo>,
    client: ClientWithMiddleware,
    base_url: String,
}

impl GenericQuotaPlugin {
    pub fn new(
        service_type: String,
        resources: Vec<ResourceInfo>,
        rates: Vec<RateInfo>,
        cfg: GenericDriverConfig,
    ) -> Result<Self> {
        let base_url = url::Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid base_url for service {service_type:?}"))?;

        let client = Client::builder()
            .user_agent(concat!("limes/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to create HTTP client")?;
        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RequestLogMiddleware)
            .build();

        Ok(Self {
            service_type,
            resources,
            rates,
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn quota_url(&self, project: &ProjectRef) -> String {
        format!("{}/v1/projects/{}/quota", self.base_url, project.uuid)
    }

    fn rates_url(&self, project: &ProjectRef) -> String {
        format!("{}/v1/projects/{}/rates", self.base_url, project.uuid)
    }
}

#[derive(Deserialize)]
struct QuotaReportWire {
    resources: BTreeMap<String, ResourceDataWire>,
    #[serde(default)]
    metrics: String,
}

#[derive(Deserialize)]
struct ResourceDataWire {
    quota: i64,
    #[serde(default)]
    usage: BTreeMap<String, UsageWire>,
}

#[derive(Deserialize)]
struct UsageWire {
    usage: u64,
    #[serde(default)]
    physical_usage: Option<u64>,
    #[serde(default)]
    subresources: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct RateRequestWire<'a> {
    prev_state: &'a str,
}

#[derive(Deserialize)]
struct RateReportWire {
    #[serde(default)]
    rates: BTreeMap<String, String>,
    #[serde(default)]
    state: String,
}

#[derive(Serialize)]
struct SetQuotaWire<'a> {
    quotas: &'a BTreeMap<String, u64>,
}

#[derive(Deserialize)]
struct MetricsBlobWire {
    #[serde(default)]
    samples: BTreeMap<String, f64>,
}

async fn check_status(response: Response) -> Result<Response, DriverError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DriverError::Transient(anyhow!(
        "backend returned {status}: {}",
        body.chars().take(200).collect::<String>()
    )))
}

#[async_trait::async_trait]
impl QuotaPlugin for GenericQuotaPlugin {
    fn service_type(&self) -> &str {
        &self.service_type
    }

    fn service_info(&self) -> ServiceInfo {
        ServiceInfo {
            service_type: self.service_type.clone(),
            product_name: "generic".to_string(),
            area: String::new(),
        }
    }

    fn resources(&self) -> &[ResourceInfo] {
        &self.resources
    }

    fn rates(&self) -> &[RateInfo] {
        &self.rates
    }

    async fn scrape(&self, project: &ProjectRef) -> Result<ScrapeResult, DriverError> {
        let response = self
            .client
            .get(self.quota_url(project))
            .send()
            .await
            .context("quota request failed")?;
        let report: QuotaReportWire = check_status(response)
            .await?
            .json()
            .await
            .context("failed to decode quota report")?;

        let mut resources = BTreeMap::new();
        for (name, wire) in report.resources {
            let per_az = wire
                .usage
                .into_iter()
                .map(|(az, usage)| {
                    (
                        AvailabilityZone(az),
                        UsageData {
                            usage: usage.usage,
                            physical_usage: usage.physical_usage,
                            subresources: usage.subresources,
                        },
                    )
                })
                .collect();
            resources.insert(
                name,
                ResourceData {
                    quota: wire.quota,
                    per_az,
                },
            );
        }

        Ok(ScrapeResult {
            resources,
            serialized_metrics: report.metrics,
        })
    }

    async fn scrape_rates(
        &self,
        project: &ProjectRef,
        prev_state: &str,
    ) -> Result<RateScrapeResult, DriverError> {
        let response = self
            .client
            .post(self.rates_url(project))
            .json(&RateRequestWire { prev_state })
            .send()
            .await
            .context("rate request failed")?;
        let report: RateReportWire = check_status(response)
            .await?
            .json()
            .await
            .context("failed to decode rate report")?;

        Ok(RateScrapeResult {
            rates: report.rates,
            state: report.state,
        })
    }

    /// Rejects quota values below the usage the backend currently reports.
    async fn is_quota_acceptable_for_project(
        &self,
        project: &ProjectRef,
        quotas: &BTreeMap<String, u64>,
    ) -> Result<(), String> {
        let report = self
            .scrape(project)
            .await
            .map_err(|e| format!("cannot check current usage: {e}"))?;
        for (name, &requested) in quotas {
            if let Some(data) = report.resources.get(name) {
                let usage = data.total_usage();
                if requested < usage {
                    return Err(format!(
                        "quota for {name} must stay at or above current usage \
                         ({requested} < {usage})"
                    ));
                }
            }
        }
        Ok(())
    }

    async fn set_quota(
        &self,
        project: &ProjectRef,
        quotas: &BTreeMap<String, u64>,
    ) -> Result<(), DriverError> {
        let response = self
            .client
            .put(self.quota_url(project))
            .json(&SetQuotaWire { quotas })
            .send()
            .await
            .context("set-quota request failed")?;
        check_status(response).await?;
        Ok(())
    }

    fn collect_metrics(&self, serialized_metrics: &str) -> Result<Vec<MetricSample>, DriverError> {
        if serialized_metrics.is_empty() {
            return Ok(Vec::new());
        }
        let blob: MetricsBlobWire = serde_json::from_str(serialized_metrics)
            .map_err(|e| DriverError::contract(format!("malformed metrics blob: {e}")))?;
        Ok(blob
            .samples
            .into_iter()
            .map(|(name, value)| MetricSample { name, value })
            .collect())
    }
}
