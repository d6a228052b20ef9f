//! Looking networks and containers up by name or ID prefix.

use std::sync::Arc;

use tern_common::{IdMatcher, Identifiable, ResourceKind, ResultExt, TernResult};
use tern_network::NetworkConfig;

use crate::runtime::{Container, ContainerRuntime, NetworkStore};

/// Resolve a network by exact name, long ID or unique ID prefix.
///
/// # Errors
///
/// Returns a not-found error if nothing matches and an ambiguity error if
/// several networks match.
pub async fn resolve_network(store: &dyn NetworkStore, query: &str) -> TernResult<NetworkConfig> {
    let matcher = IdMatcher::new(query)?;
    let networks = store.list_networks().await.context("list networks")?;
    let network = matcher.resolve_one(ResourceKind::Network, networks)?;

    tracing::debug!(query, network = %network.name, "Network resolved");
    Ok(network)
}

/// A container handle matched by [`IdMatcher`].
struct Candidate(Arc<dyn Container>);

impl Identifiable for Candidate {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn id(&self) -> Option<&str> {
        Some(self.0.id())
    }
}

/// Resolve a container the same way networks are resolved.
///
/// # Errors
///
/// Returns a not-found error if nothing matches and an ambiguity error if
/// several containers match.
pub async fn resolve_container(
    runtime: &dyn ContainerRuntime,
    query: &str,
) -> TernResult<Arc<dyn Container>> {
    let matcher = IdMatcher::new(query)?;
    let containers = runtime
        .list_containers()
        .await
        .context("list containers")?;
    let Candidate(container) = matcher.resolve_one(
        ResourceKind::Container,
        containers.into_iter().map(Candidate),
    )?;

    tracing::debug!(query, container = %container.id(), "Container resolved");
    Ok(container)
}
