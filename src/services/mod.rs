//! Service lifecycle supervision.
//!
//! Each top-level concern (collector, API server) implements [`Service`];
//! the manager spawns them, waits for the first one to stop, and shuts the
//! rest down with a bounded timeout on a broadcast signal.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;

#[derive(Debug)]
pub enum ServiceResult {
    GracefulShutdown,
    /// The service's run loop returned on its own; that is never expected.
    NormalCompletion,
    Error(anyhow::Error),
}

#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Name used in logs and shutdown reporting.
    fn name(&self) -> &'static str;

    /// Run until failure; a clean return is treated as unexpected.
    async fn run(&mut self) -> Result<()>;

    /// Stop all internal tasks and return once they are done.
    async fn shutdown(&mut self) -> Result<()>;
}

async fn drive_service(
    mut service: Box<dyn Service>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServiceResult {
    let name = service.name();
    info!(service = name, "service started");

    tokio::select! {
        result = service.run() => match result {
            Ok(()) => {
                warn!(service = name, "service completed unexpectedly");
                ServiceResult::NormalCompletion
            }
            Err(e) => {
                error!(service = name, error = ?e, "service failed");
                ServiceResult::Error(e)
            }
        },
        _ = shutdown_rx.recv() => {
            let started = std::time::Instant::now();
            match service.shutdown().await {
                Ok(()) => {
                    info!(
                        service = name,
                        elapsed = format!("{:.2?}", started.elapsed()),
                        "service shutdown complete"
                    );
                    ServiceResult::GracefulShutdown
                }
                Err(e) => {
                    error!(service = name, error = ?e, "service shutdown failed");
                    ServiceResult::Error(e)
                }
            }
        }
    }
}

pub struct ServiceManager {
    registered: Vec<(String, Box<dyn Service>)>,
    running: HashMap<String, JoinHandle<ServiceResult>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registered: Vec::new(),
            running: HashMap::new(),
            shutdown_tx,
        }
    }

    pub fn register(&mut self, service: Box<dyn Service>) {
        self.registered.push((service.name().to_string(), service));
    }

    pub fn spawn_all(&mut self) {
        let names: Vec<_> = self.registered.iter().map(|(name, _)| name.clone()).collect();
        for (name, service) in self.registered.drain(..) {
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.running
                .insert(name, tokio::spawn(drive_service(service, shutdown_rx)));
        }
        info!(services = ?names, "spawned {} services", names.len());
    }

    /// Wait for the first service to stop, for whatever reason.
    pub async fn wait_for_first_exit(&mut self) -> (String, ServiceResult) {
        if self.running.is_empty() {
            return (
                "none".to_string(),
                ServiceResult::Error(anyhow::anyhow!("no services to run")),
            );
        }

        let (names, handles): (Vec<String>, Vec<JoinHandle<ServiceResult>>) =
            self.running.drain().unzip();
        let (result, index, remaining) = futures::future::select_all(handles).await;

        for (name, handle) in names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, n)| n)
            .zip(remaining)
        {
            self.running.insert(name.clone(), handle);
        }

        let name = names[index].clone();
        match result {
            Ok(service_result) => (name, service_result),
            Err(e) => {
                error!(service = name, error = ?e, "service task panicked");
                (name, ServiceResult::Error(anyhow::anyhow!("task panic: {e}")))
            }
        }
    }

    /// Signal every remaining service and wait up to `timeout` for each.
    /// Returns the elapsed time, or the names of the services that did not
    /// finish.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<String>> {
        let names: Vec<_> = self.running.keys().cloned().collect();
        info!(
            services = ?names,
            timeout = format!("{timeout:.2?}"),
            "shutting down {} services",
            names.len()
        );

        let _ = self.shutdown_tx.send(());

        let started = std::time::Instant::now();
        let mut pending = Vec::new();
        for (name, handle) in self.running.drain() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(_)) => debug!(service = name, "service stopped"),
                Ok(Err(e)) => {
                    warn!(service = name, error = ?e, "service panicked during shutdown");
                    pending.push(name);
                }
                Err(_) => {
                    warn!(service = name, "service shutdown timed out");
                    pending.push(name);
                }
            }
        }

        if pending.is_empty() {
            Ok(started.elapsed())
        } else {
            Err(pending)
        }
    }
}
