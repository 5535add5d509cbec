use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use limes::api::ApiService;
use limes::cli::{Args, Command, TracingFormat, parse_quota_pair};
use limes::cluster::Cluster;
use limes::collect::CollectorService;
use limes::collect::mail::LogMailer;
use limes::config::Config;
use limes::error::Result;
use limes::metrics::Metrics;
use limes::plugins::{PluginRegistry, ProjectRef};
use limes::services::{ServiceManager, ServiceResult};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (config_path, cluster_id) = {
        let (path, cluster) = args.command.scope();
        (path.clone(), cluster.to_string())
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            std::process::exit(1);
        }
    };

    init_tracing(&args.tracing, &config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cluster = cluster_id,
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting limes"
    );

    let exit_code = match run(args.command, &config, &cluster_id).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "fatal error");
            eprintln!("ERROR: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing(format: &TracingFormat, log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,limes={log_level}")));

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match format {
        TracingFormat::Pretty => Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .finish(),
        ),
        TracingFormat::Json => Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .json()
                .with_env_filter(filter)
                .finish(),
        ),
    };
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

async fn connect_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

fn build_cluster(config: &Config, cluster_id: &str) -> Result<Arc<Cluster>> {
    let cluster_cfg = config.cluster(cluster_id)?;
    let registry = Arc::new(PluginRegistry::from_config(cluster_cfg)?);
    Cluster::new(cluster_id, cluster_cfg, registry)
}

async fn run(command: Command, config: &Config, cluster_id: &str) -> Result<i32> {
    match command {
        Command::Collect { .. } => {
            let cluster = build_cluster(config, cluster_id)?;
            let pool = connect_pool(config).await?;
            let metrics = Metrics::new()?;

            let mut manager = ServiceManager::new();
            manager.register(Box::new(CollectorService::new(
                pool,
                cluster,
                config.collector.clone(),
                metrics,
                Arc::new(LogMailer),
            )));
            manager.spawn_all();
            supervise(manager, config.shutdown_timeout).await
        }
        Command::Serve { .. } => {
            let cluster = build_cluster(config, cluster_id)?;
            let pool = connect_pool(config).await?;

            let mut manager = ServiceManager::new();
            manager.register(Box::new(ApiService::new(pool, cluster, config.api.clone())));
            manager.spawn_all();
            supervise(manager, config.shutdown_timeout).await
        }
        Command::TestGetQuota {
            service, project, ..
        } => {
            let cluster = build_cluster(config, cluster_id)?;
            let plugin = cluster
                .registry
                .quota_plugin(&service)
                .ok_or_else(|| anyhow::anyhow!("no such service type: {service:?}"))?;
            let project = find_project(&cluster.registry, &project).await?;
            let result = plugin.scrape(&project).await?;
            print_json(&serde_json::json!({
                "resources": result.resources,
                "serialized_metrics": result.serialized_metrics,
            }))?;
            Ok(0)
        }
        Command::TestGetRates {
            service,
            project,
            prev_state,
            ..
        } => {
            let cluster = build_cluster(config, cluster_id)?;
            let plugin = cluster
                .registry
                .quota_plugin(&service)
                .ok_or_else(|| anyhow::anyhow!("no such service type: {service:?}"))?;
            let project = find_project(&cluster.registry, &project).await?;
            let result = plugin.scrape_rates(&project, &prev_state).await?;
            print_json(&serde_json::json!({
                "rates": result.rates,
                "state": result.state,
            }))?;
            Ok(0)
        }
        Command::TestSetQuota {
            service,
            project,
            quotas,
            ..
        } => {
            let cluster = build_cluster(config, cluster_id)?;
            let plugin = cluster
                .registry
                .quota_plugin(&service)
                .ok_or_else(|| anyhow::anyhow!("no such service type: {service:?}"))?;
            let project = find_project(&cluster.registry, &project).await?;

            let mut targets = std::collections::BTreeMap::new();
            for raw in &quotas {
                let (name, value) = parse_quota_pair(raw)?;
                targets.insert(name, value);
            }
            plugin.set_quota(&project, &targets).await?;
            print_json(&serde_json::json!({"set": targets}))?;
            Ok(0)
        }
        Command::TestScanCapacity { capacitor, .. } => {
            let cluster = build_cluster(config, cluster_id)?;
            let plugin = cluster
                .registry
                .capacity_plugin(&capacitor)
                .ok_or_else(|| anyhow::anyhow!("no such capacitor: {capacitor:?}"))?;
            let result = plugin.scrape().await?;
            print_json(&serde_json::json!({
                "capacities": result.capacities,
                "serialized_metrics": result.serialized_metrics,
            }))?;
            Ok(0)
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn find_project(registry: &PluginRegistry, uuid: &str) -> Result<ProjectRef> {
    let discovery = registry.discovery();
    for domain in discovery.list_domains().await? {
        for project in discovery.list_projects(&domain).await? {
            if project.uuid == uuid {
                return Ok(ProjectRef {
                    uuid: project.uuid,
                    name: project.name,
                    domain_uuid: domain.uuid,
                    domain_name: domain.name,
                });
            }
        }
    }
    anyhow::bail!("project {uuid:?} is not known to the identity backend")
}

/// Run until a service stops or a signal arrives, then shut everything down
/// with the configured timeout.
async fn supervise(mut manager: ServiceManager, shutdown_timeout: Duration) -> Result<i32> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("received ctrl+c, shutting down");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut stream =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");
        stream.recv().await;
        info!("received SIGTERM, shutting down");
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let mut exit_code = 0;

    tokio::select! {
        (name, result) = manager.wait_for_first_exit() => {
            match result {
                ServiceResult::GracefulShutdown => {
                    info!(service = name, "service completed gracefully");
                }
                ServiceResult::NormalCompletion => {
                    warn!(service = name, "service completed unexpectedly");
                    exit_code = 1;
                }
                ServiceResult::Error(e) => {
                    error!(service = name, error = ?e, "service failed");
                    exit_code = 1;
                }
            }
        }
        _ = ctrl_c => {}
        _ = sigterm => {}
    }

    match manager.shutdown(shutdown_timeout).await {
        Ok(elapsed) => {
            info!(elapsed = format!("{elapsed:.2?}"), "graceful shutdown complete");
        }
        Err(pending) => {
            warn!(
                pending_services = ?pending,
                "graceful shutdown elapsed with {} service(s) still running",
                pending.len()
            );
            exit_code = if exit_code == 0 { 2 } else { exit_code };
        }
    }

    info!(exit_code, "shutdown complete");
    Ok(exit_code)
}
