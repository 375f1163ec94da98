//! Service Framework
//!
//! Background services implement [`Service`]; the [`ServiceManager`] starts
//! them in dependency order and stops them in reverse, so a service is
//! signalled only after everything depending on it has stopped. Each
//! service gets its own shutdown channel and the whole shutdown shares one
//! timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// Long-running background task
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` fires
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Service name for logging and identification
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;

    /// Services that must be running before this one starts
    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Initializing
    Starting,
    /// Running normally
    Running,
    /// Draining in-flight work
    Stopping,
    /// Stopped
    Stopped,
    /// Stopped because of an error
    Failed(String),
}

impl ServiceStatus {
    /// Check if the service is in a healthy state
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Check if the service has stopped (normally or due to failure)
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors that can occur in services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service failed during initialization phase
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    /// Service encountered an error during execution
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// A required dependency is missing, cyclic or not running
    #[error("Dependency not satisfied: {0}")]
    DependencyError(String),

    /// A service with the same name is already registered or running
    #[error("Service already running")]
    AlreadyRunning,

    /// The requested service was not found in the registry
    #[error("Service not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Service Manager
// ============================================================================

/// Configuration for the service manager
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Total time allowed for all services to stop
    pub shutdown_timeout: Duration,

    /// How long to wait for a started service to report Running
    pub startup_wait: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            startup_wait: Duration::from_secs(5),
        }
    }
}

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

/// Starts services in dependency order and stops them in reverse
pub struct ServiceManager {
    config: ServiceConfig,
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    /// Registration order, used to break ties in start order
    order: RwLock<Vec<&'static str>>,
    shutdown_notify: Arc<Notify>,
}

impl ServiceManager {
    /// Create a new service manager
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Register a service with the manager
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRunning);
        }
        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
                shutdown_tx: None,
            },
        );
        self.order.write().push(name);
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Start every registered service, dependencies first
    ///
    /// Each service must reach Running before its dependents start.
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        for name in self.start_order()? {
            self.start_service(name).await?;
        }
        tracing::info!("All services started");
        Ok(())
    }

    async fn start_service(&self, name: &'static str) -> Result<(), ServiceError> {
        let service = {
            let mut services = self.services.write();
            let handle = services
                .get_mut(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
            if handle.task.is_some() {
                return Err(ServiceError::AlreadyRunning);
            }
            let service = Arc::clone(&handle.service);
            let task_service = Arc::clone(&service);
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            handle.shutdown_tx = Some(shutdown_tx);
            handle.task = Some(tokio::spawn(async move { task_service.start(shutdown_rx).await }));
            service
        };

        let deadline = Instant::now() + self.config.startup_wait;
        loop {
            match service.status() {
                ServiceStatus::Running => break,
                ServiceStatus::Failed(reason) => {
                    return Err(ServiceError::InitializationFailed(format!("{}: {}", name, reason)));
                },
                _ if Instant::now() >= deadline => {
                    return Err(ServiceError::DependencyError(format!(
                        "'{}' did not reach running state",
                        name
                    )));
                },
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }

        tracing::debug!(service = name, "Service started");
        Ok(())
    }

    /// Stop every running service, dependents first
    ///
    /// Each service is signalled once the services depending on it have
    /// stopped or run out of time.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Initiating graceful shutdown");
        let mut order = self.start_order().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to registration order for shutdown");
            self.order.read().clone()
        });
        order.reverse();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for name in order {
            let stopping = {
                let mut services = self.services.write();
                services.get_mut(name).and_then(|handle| {
                    let tx = handle.shutdown_tx.take();
                    handle.task.take().map(|task| (task, tx))
                })
            };
            let Some((task, shutdown_tx)) = stopping else {
                continue;
            };
            if let Some(tx) = shutdown_tx {
                let _ = tx.send(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped gracefully"),
                Ok(Ok(Err(e))) => tracing::warn!(service = name, error = %e, "Service stopped with error"),
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service task panicked"),
                Err(_) => tracing::warn!(service = name, "Service shutdown timed out"),
            }
        }

        self.shutdown_notify.notify_waiters();
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Wait until [`ServiceManager::shutdown`] has completed
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_notify.notified().await;
    }

    /// Status of every registered service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Check if all services are healthy
    pub fn is_healthy(&self) -> bool {
        self.services
            .read()
            .values()
            .all(|h| h.service.status().is_healthy())
    }

    /// Registered services ordered so that dependencies come first
    fn start_order(&self) -> Result<Vec<&'static str>, ServiceError> {
        let services = self.services.read();
        let registered = self.order.read();
        let mut ordered = Vec::with_capacity(registered.len());
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();

        fn visit(
            name: &'static str,
            services: &HashMap<&'static str, ServiceHandle>,
            done: &mut HashSet<&'static str>,
            visiting: &mut HashSet<&'static str>,
            ordered: &mut Vec<&'static str>,
        ) -> Result<(), ServiceError> {
            if done.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(ServiceError::DependencyError(format!(
                    "Circular dependency detected at '{}'",
                    name
                )));
            }
            let handle = services.get(name).ok_or_else(|| {
                ServiceError::DependencyError(format!("'{}' is not registered", name))
            })?;
            for dep in handle.service.dependencies() {
                visit(dep, services, done, visiting, ordered)?;
            }
            visiting.remove(name);
            done.insert(name);
            ordered.push(name);
            Ok(())
        }

        for name in registered.iter() {
            visit(*name, &services, &mut done, &mut visiting, &mut ordered)?;
        }
        Ok(ordered)
    }
}
