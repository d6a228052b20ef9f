//! Container network membership.
//!
//! A container's networks live in two places that are always written
//! together: the `nerdctl/networks` label and the OCI spec annotation of the
//! same key. The `finch/network-index` label counts interfaces handed out
//! (`eth<index>`); it only ever grows.

use std::sync::Arc;

use dashmap::DashMap;
use oci_spec::runtime::Spec;
use tern_common::{ResultExt, TernError, TernResult, labels};
use tern_network::modes::{self, NetworkMode};
use tern_network::NetworkConfig;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::runtime::{Container, Labels};

/// A container's attached networks and interface index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    /// Attached network names, in attach order.
    pub networks: Vec<String>,
    /// Index of the last interface handed out, if recorded.
    pub index: Option<u32>,
}

impl Membership {
    /// Read membership from container labels.
    ///
    /// # Errors
    ///
    /// Returns an error if either label is malformed.
    pub fn from_labels(container_labels: &Labels) -> TernResult<Self> {
        let networks = match container_labels.get(labels::NETWORKS) {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|e| {
                    TernError::invalid_config(format!("label {} is malformed: {e}", labels::NETWORKS))
                })?,
            _ => Vec::new(),
        };

        let index = container_labels
            .get(labels::NETWORK_INDEX)
            .map(|raw| {
                raw.parse::<u32>().map_err(|e| {
                    TernError::invalid_config(format!(
                        "label {} is malformed: {e}",
                        labels::NETWORK_INDEX
                    ))
                })
            })
            .transpose()?;

        Ok(Self { networks, index })
    }

    /// Returns true if the network is attached.
    #[must_use]
    pub fn contains(&self, network: &str) -> bool {
        self.networks.iter().any(|n| n == network)
    }

    /// Index of the most recently attached network's interface.
    ///
    /// Containers created before the index label existed fall back to the
    /// position of the last attached network.
    ///
    /// # Errors
    ///
    /// Returns an error if there is neither an index nor any network.
    pub fn current_index(&self) -> TernResult<u32> {
        if let Some(index) = self.index {
            return Ok(index);
        }
        self.networks
            .len()
            .checked_sub(1)
            .and_then(|last| u32::try_from(last).ok())
            .ok_or_else(|| TernError::invalid_config("container has no network index"))
    }

    /// Membership with `network` appended and the next index assigned.
    ///
    /// # Errors
    ///
    /// Returns an error if the index would overflow.
    pub fn with_network(&self, network: &str) -> TernResult<Self> {
        let mut next = self.clone();
        next.networks.push(network.to_string());
        next.index = Some(match self.index {
            Some(index) => index
                .checked_add(1)
                .ok_or_else(|| TernError::invalid_config("network index overflow"))?,
            None => next.current_index()?,
        });
        Ok(next)
    }

    /// The networks label value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn networks_json(&self) -> TernResult<String> {
        Ok(serde_json::to_string(&self.networks)?)
    }
}

/// Check that a container may be attached to `networks` (existing plus new).
///
/// # Errors
///
/// Returns an invalid-configuration error if a non-CNI network would be combined
/// with others, or if a static MAC address is requested on a network whose
/// plugin cannot set one.
pub fn verify_network_config(
    networks: &[String],
    network: &NetworkConfig,
    container_labels: &Labels,
) -> TernResult<()> {
    let mode = NetworkMode::of_networks(networks)?;
    if mode != NetworkMode::Cni {
        return Err(TernError::invalid_config(format!(
            "cannot attach CNI network {} in {mode:?} mode",
            network.name
        )));
    }

    let mac = container_labels
        .get(labels::MAC_ADDRESS)
        .is_some_and(|mac| !mac.is_empty());
    if mac {
        let plugin = network.primary_plugin_type().unwrap_or_default();
        if !modes::supports_mac_address(plugin) {
            return Err(TernError::invalid_config(format!(
                "network {} of type {plugin:?} does not support a static MAC address",
                network.name
            )));
        }
    }

    Ok(())
}

fn annotation(spec: &Spec, key: &str) -> Option<String> {
    spec.annotations().as_ref()?.get(key).cloned()
}

fn set_annotation(spec: &mut Spec, key: &str, value: Option<String>) {
    let mut annotations = spec.annotations().clone().unwrap_or_default();
    match value {
        Some(value) => {
            annotations.insert(key.to_string(), value);
        }
        None => {
            annotations.remove(key);
        }
    }
    spec.set_annotations((!annotations.is_empty()).then_some(annotations));
}

fn set_label(container_labels: &mut Labels, key: &str, value: Option<String>) {
    match value {
        Some(value) => {
            container_labels.insert(key.to_string(), value);
        }
        None => {
            container_labels.remove(key);
        }
    }
}

/// Pre-attach membership state, restorable with [`MembershipRollback::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "dropping the rollback leaves the membership change in place"]
pub struct MembershipRollback {
    container_id: String,
    network: String,
    networks_label: Option<String>,
    index_label: Option<String>,
    networks_annotation: Option<String>,
}

impl MembershipRollback {
    /// The network whose attachment this undoes.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Put the membership labels and annotation back to their previous values.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be read or updated.
    pub async fn restore(&self, container: &dyn Container) -> TernResult<()> {
        let (mut container_labels, mut spec) =
            futures::try_join!(container.labels(), container.spec())
                .context("read container for rollback")?;

        set_label(&mut container_labels, labels::NETWORKS, self.networks_label.clone());
        set_label(&mut container_labels, labels::NETWORK_INDEX, self.index_label.clone());
        set_annotation(&mut spec, labels::NETWORKS, self.networks_annotation.clone());

        container
            .update(container_labels, spec)
            .await
            .context("restore container network labels")?;

        tracing::info!(
            container = %self.container_id,
            network = %self.network,
            "Network membership rolled back"
        );
        Ok(())
    }
}

/// Record `network` in the container's membership.
///
/// Returns the rollback undoing exactly this change.
///
/// # Errors
///
/// Returns [`TernError::AlreadyConnected`] without touching the container if
/// the network is already attached, a validation error, or the runtime's
/// error if the container cannot be read or updated.
pub async fn add_network_config(
    container: &dyn Container,
    network: &NetworkConfig,
) -> TernResult<MembershipRollback> {
    let (container_labels, mut spec) = futures::try_join!(container.labels(), container.spec())
        .context("read container")?;

    let current = Membership::from_labels(&container_labels)?;
    if current.contains(&network.name) {
        return Err(TernError::AlreadyConnected {
            network: network.name.clone(),
            container: container.id().to_string(),
        });
    }

    let next = current.with_network(&network.name)?;
    verify_network_config(&next.networks, network, &container_labels)?;

    let rollback = MembershipRollback {
        container_id: container.id().to_string(),
        network: network.name.clone(),
        networks_label: container_labels.get(labels::NETWORKS).cloned(),
        index_label: container_labels.get(labels::NETWORK_INDEX).cloned(),
        networks_annotation: annotation(&spec, labels::NETWORKS),
    };

    let networks_json = next.networks_json()?;
    let index = next.current_index()?;
    let mut updated = container_labels;
    set_label(&mut updated, labels::NETWORKS, Some(networks_json.clone()));
    set_label(&mut updated, labels::NETWORK_INDEX, Some(index.to_string()));
    set_annotation(&mut spec, labels::NETWORKS, Some(networks_json));

    container
        .update(updated, spec)
        .await
        .context("update container network labels")?;

    tracing::debug!(
        container = %container.id(),
        network = %network.name,
        index,
        "Network recorded in container membership"
    );
    Ok(rollback)
}

/// Per-container async locks serialising membership changes.
#[derive(Debug, Default)]
pub struct ContainerLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ContainerLocks {
    /// Empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the container's lock.
    ///
    /// The table entry is dropped together with the last guard or waiter.
    pub async fn lock(&self, container_id: &str) -> ContainerLockGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(container_id.to_string()).or_default());
        ContainerLockGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.locks,
            container_id: container_id.to_string(),
        }
    }

    /// Number of containers with a held or awaited lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no container lock is held or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock of one container.
#[derive(Debug)]
pub struct ContainerLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    container_id: String,
}

impl Drop for ContainerLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the mutex, keeping the count above one.
        self.locks
            .remove_if(&self.container_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_network::PluginConfig;

    fn container_labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn network(name: &str, plugin: &str) -> NetworkConfig {
        NetworkConfig::new(name).with_plugin(
            PluginConfig::from_value(&serde_json::json!({"type": plugin})).unwrap(),
        )
    }

    #[test]
    fn fresh_container_has_no_membership() {
        let membership = Membership::from_labels(&Labels::new()).unwrap();
        assert_eq!(membership, Membership::default());
        assert!(membership.current_index().is_err());
    }

    #[test]
    fn index_sequence_from_fresh_container() {
        let a = Membership::default().with_network("a").unwrap();
        assert_eq!(a.index, Some(0));
        let b = a.with_network("b").unwrap();
        assert_eq!(b.index, Some(1));
        let c = b.with_network("c").unwrap();
        assert_eq!(c.index, Some(2));
        assert_eq!(c.networks, vec!["a", "b", "c"]);
    }

    #[test]
    fn index_is_not_reused_after_detach() {
        let membership = Membership {
            networks: vec!["a".to_string(), "c".to_string()],
            index: Some(2),
        };
        assert_eq!(membership.with_network("d").unwrap().index, Some(3));
    }

    #[test]
    fn legacy_container_falls_back_to_position() {
        let membership = Membership::from_labels(&container_labels(&[(
            labels::NETWORKS,
            r#"["bridge","nat1"]"#,
        )]))
        .unwrap();
        assert_eq!(membership.index, None);
        assert_eq!(membership.current_index().unwrap(), 1);
        assert_eq!(membership.with_network("nat2").unwrap().index, Some(2));
    }

    #[test]
    fn malformed_labels_are_invalid() {
        let err = Membership::from_labels(&container_labels(&[(labels::NETWORKS, "bridge")]))
            .unwrap_err();
        assert_eq!(err.kind(), tern_common::ErrorKind::InvalidConfiguration);

        let err = Membership::from_labels(&container_labels(&[(labels::NETWORK_INDEX, "-1")]))
            .unwrap_err();
        assert_eq!(err.kind(), tern_common::ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn networks_json_is_a_string_array() {
        let membership = Membership::default().with_network("nat1").unwrap();
        assert_eq!(membership.networks_json().unwrap(), r#"["nat1"]"#);
    }

    #[test]
    fn cni_networks_verify() {
        let networks = vec!["bridge".to_string(), "nat1".to_string()];
        verify_network_config(&networks, &network("nat1", "bridge"), &Labels::new()).unwrap();
    }

    #[test]
    fn host_network_cannot_be_combined() {
        let networks = vec!["host".to_string(), "nat1".to_string()];
        let err = verify_network_config(&networks, &network("nat1", "bridge"), &Labels::new())
            .unwrap_err();
        assert_eq!(err.kind(), tern_common::ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn mac_address_needs_capable_plugin() {
        let networks = vec!["vlan".to_string()];
        let with_mac = container_labels(&[(labels::MAC_ADDRESS, "02:42:ac:11:00:02")]);

        verify_network_config(&networks, &network("vlan", "macvlan"), &with_mac).unwrap();
        let err =
            verify_network_config(&networks, &network("vlan", "ipvlan"), &with_mac).unwrap_err();
        assert_eq!(err.kind(), tern_common::ErrorKind::InvalidConfiguration);
        assert!(err.to_string().contains("MAC"));

        let empty_mac = container_labels(&[(labels::MAC_ADDRESS, "")]);
        verify_network_config(&networks, &network("vlan", "ipvlan"), &empty_mac).unwrap();
    }

    #[test]
    fn annotation_helpers_round_trip_to_none() {
        let mut spec = Spec::default();
        spec.set_annotations(None);

        set_annotation(&mut spec, labels::NETWORKS, Some("[]".to_string()));
        assert_eq!(annotation(&spec, labels::NETWORKS).as_deref(), Some("[]"));

        set_annotation(&mut spec, labels::NETWORKS, None);
        assert!(spec.annotations().is_none());
    }

    #[tokio::test]
    async fn locks_are_per_container() {
        let locks = ContainerLocks::new();
        let held = locks.lock("c1").await;

        // A different container is not blocked.
        let _other = locks.lock("c2").await;

        let contended = tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock("c1"));
        assert!(contended.await.is_err());

        drop(held);
        let _again = locks.lock("c1").await;
    }

    #[tokio::test]
    async fn released_locks_leave_the_table() {
        let locks = ContainerLocks::new();
        let first = locks.lock("c1").await;
        let second = locks.lock("c2").await;
        assert_eq!(locks.len(), 2);

        drop(first);
        assert_eq!(locks.len(), 1);
        drop(second);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(ContainerLocks::new());
        let held = locks.lock("c1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("c1").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        drop(held);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
