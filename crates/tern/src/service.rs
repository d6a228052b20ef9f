//! The network service.

use std::sync::Arc;

use tern_common::{TernError, TernResult};
use tern_network::{DriverRegistry, IsolationReport, NetworkConfig};

use crate::config::EngineConfig;
use crate::membership::ContainerLocks;
use crate::resolve::{resolve_container, resolve_network};
use crate::runtime::{CniOrchestrator, Container, ContainerRuntime, NetworkStore};

/// Run blocking driver work (file locks, filter commands) off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> TernResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> TernResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TernError::Internal {
            message: format!("driver task failed: {e}"),
        })?
}

/// Network operations over a container runtime and a CNI layer.
///
/// Operations live next to their helpers: [`create`](NetworkService::create),
/// [`connect`](NetworkService::connect) and [`remove`](NetworkService::remove).
pub struct NetworkService {
    config: EngineConfig,
    store: Arc<dyn NetworkStore>,
    containers: Arc<dyn ContainerRuntime>,
    cni: Arc<dyn CniOrchestrator>,
    drivers: DriverRegistry,
    locks: ContainerLocks,
}

impl std::fmt::Debug for NetworkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkService")
            .field("config", &self.config)
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

impl NetworkService {
    /// Service with the built-in drivers, using the host's filter commands.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn NetworkStore>,
        containers: Arc<dyn ContainerRuntime>,
        cni: Arc<dyn CniOrchestrator>,
    ) -> Self {
        let drivers = DriverRegistry::with_defaults(config.filter_backends());
        Self {
            config,
            store,
            containers,
            cni,
            drivers,
            locks: ContainerLocks::new(),
        }
    }

    /// Replace the driver registry.
    #[must_use]
    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered network drivers.
    #[must_use]
    pub const fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub(crate) fn store(&self) -> &dyn NetworkStore {
        self.store.as_ref()
    }

    pub(crate) fn cni(&self) -> &dyn CniOrchestrator {
        self.cni.as_ref()
    }

    pub(crate) const fn locks(&self) -> &ContainerLocks {
        &self.locks
    }

    /// Resolve a network by name, long ID or unique ID prefix.
    ///
    /// # Errors
    ///
    /// Returns a not-found or ambiguity error.
    pub async fn inspect(&self, query: &str) -> TernResult<NetworkConfig> {
        resolve_network(self.store(), query).await
    }

    /// Resolve a container by name, long ID or unique ID prefix.
    ///
    /// # Errors
    ///
    /// Returns a not-found or ambiguity error.
    pub async fn resolve_container(&self, query: &str) -> TernResult<Arc<dyn Container>> {
        resolve_container(self.containers.as_ref(), query).await
    }

    /// Compare a network's isolation label with its filter rules.
    ///
    /// # Errors
    ///
    /// Returns a resolution error or the error of the rule query.
    pub async fn isolation_status(&self, query: &str) -> TernResult<IsolationReport> {
        self.check_isolation(query, false).await
    }

    /// Like [`NetworkService::isolation_status`], but adds a missing rule or
    /// deletes a stale one.
    ///
    /// # Errors
    ///
    /// Returns a resolution error or the error of the repair.
    pub async fn reconcile_isolation(&self, query: &str) -> TernResult<IsolationReport> {
        self.check_isolation(query, true).await
    }

    async fn check_isolation(&self, query: &str, repair: bool) -> TernResult<IsolationReport> {
        let network = self.inspect(query).await?;
        let Some(driver) = self.drivers.for_network(&network) else {
            return Ok(IsolationReport {
                network: network.name,
                ..IsolationReport::default()
            });
        };

        let report = run_blocking(move || driver.reconcile(&network, repair)).await?;
        if !report.is_consistent() {
            tracing::warn!(
                network = %report.network,
                expected = report.expected,
                families = ?report.inconsistent,
                "Isolation rules disagree with network labels"
            );
        }
        Ok(report)
    }
}
