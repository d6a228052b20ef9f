//! Attaching containers to networks.
//!
//! A container with a live network namespace (running or paused task) is
//! attached immediately through CNI. Any other container only has the network
//! recorded in its membership and gets attached when its task starts.

use std::sync::Arc;

use serde_json::Value;
use tern_common::{NetworkPaths, ResultExt, TernError, TernResult, labels};
use tern_network::portmap::{self, PORT_MAPPINGS_CAPABILITY};
use tern_network::NetworkConfig;
use tokio::runtime::Handle;
use tokio::sync::OwnedMutexGuard;

use crate::membership::{Membership, MembershipRollback, add_network_config};
use crate::runtime::{Container, RuntimeConf, Task, TaskStatus};
use crate::service::NetworkService;

/// How a connect request is carried out.
#[derive(Clone)]
pub enum ConnectPath {
    /// Record membership and attach through CNI now.
    AttachNow(Arc<dyn Task>),
    /// Only record membership.
    Defer,
}

impl std::fmt::Debug for ConnectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttachNow(task) => f.debug_tuple("AttachNow").field(&task.pid()).finish(),
            Self::Defer => f.write_str("Defer"),
        }
    }
}

/// Choose the connect path from the container's task.
///
/// # Errors
///
/// Returns [`TernError::InvalidTaskState`] for tasks in `Unknown` or
/// `Pausing` state, or the runtime's error if the task cannot be queried.
pub async fn connect_path(container: &dyn Container) -> TernResult<ConnectPath> {
    let task = match container.task().await {
        Ok(task) => task,
        Err(e) if e.is_not_found() => return Ok(ConnectPath::Defer),
        Err(e) => return Err(e.context("look up task")),
    };

    let status = task.status().await.context("query task status")?;
    match status {
        TaskStatus::Running | TaskStatus::Paused => Ok(ConnectPath::AttachNow(task)),
        TaskStatus::Created | TaskStatus::Stopped => Ok(ConnectPath::Defer),
        TaskStatus::Unknown | TaskStatus::Pausing => Err(TernError::InvalidTaskState {
            container: container.id().to_string(),
            state: status.to_string(),
        }),
    }
}

/// CNI runtime configuration for attaching the container's newest interface.
///
/// # Errors
///
/// Returns an error if the membership or ports labels are malformed.
pub fn runtime_conf(
    paths: &NetworkPaths,
    container_id: &str,
    pid: u32,
    container_labels: &crate::runtime::Labels,
) -> TernResult<RuntimeConf> {
    let index = Membership::from_labels(container_labels)?.current_index()?;

    let mut args = vec![("IgnoreUnknown".to_string(), "1".to_string())];
    for (key, label) in [("IP", labels::IP_ADDRESS), ("MAC", labels::MAC_ADDRESS)] {
        if let Some(value) = container_labels.get(label).filter(|v| !v.is_empty()) {
            args.push((key.to_string(), value.clone()));
        }
    }

    let mut capability_args = std::collections::BTreeMap::new();
    if let Some(raw) = container_labels.get(labels::PORTS) {
        let ports = portmap::parse_ports_label(raw)?;
        if !ports.is_empty() {
            capability_args.insert(PORT_MAPPINGS_CAPABILITY.to_string(), serde_json::to_value(ports)?);
        }
    }

    Ok(RuntimeConf {
        container_id: container_id.to_string(),
        netns: paths.netns(pid),
        if_name: format!("eth{index}"),
        args,
        capability_args,
    })
}

/// Armed rollback of a membership change, run on drop unless disarmed.
///
/// Holds the container lock until the rollback has finished, wherever it runs.
struct RollbackGuard {
    armed: Option<(MembershipRollback, Arc<dyn Container>, OwnedMutexGuard<()>)>,
}

impl RollbackGuard {
    fn new(
        rollback: MembershipRollback,
        container: Arc<dyn Container>,
        lock: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            armed: Some((rollback, container, lock)),
        }
    }

    fn disarm(mut self) {
        self.armed = None;
    }

    async fn run(mut self) {
        if let Some((rollback, container, _lock)) = self.armed.take() {
            restore_or_warn(&rollback, container.as_ref()).await;
        }
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some((rollback, container, lock)) = self.armed.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(network = %rollback.network(), "Connect cancelled, rolling back");
                handle.spawn(async move {
                    let _lock = lock;
                    restore_or_warn(&rollback, container.as_ref()).await;
                });
            }
            Err(_) => tracing::warn!(
                container = %container.id(),
                network = %rollback.network(),
                "Connect cancelled outside a runtime, membership not rolled back"
            ),
        }
    }
}

async fn restore_or_warn(rollback: &MembershipRollback, container: &dyn Container) {
    if let Err(e) = rollback.restore(container).await {
        tracing::warn!(
            container = %container.id(),
            network = %rollback.network(),
            error = %e,
            "Failed to roll back network membership"
        );
    }
}

impl NetworkService {
    /// Connect a container to a network.
    ///
    /// # Errors
    ///
    /// Returns a resolution error, [`TernError::AlreadyConnected`], a task
    /// state error, or the error of the failed step. A failed CNI attach leaves
    /// the membership as it was before the call.
    pub async fn connect(&self, network: &str, container: &str) -> TernResult<()> {
        let (network, container) =
            futures::try_join!(self.inspect(network), self.resolve_container(container))?;
        self.connect_container(&network, container).await
    }

    /// Connect an already resolved container to an already resolved network.
    ///
    /// # Errors
    ///
    /// See [`NetworkService::connect`].
    pub async fn connect_container(
        &self,
        network: &NetworkConfig,
        container: Arc<dyn Container>,
    ) -> TernResult<()> {
        let lock = self.locks().lock(container.id()).await;

        let path = connect_path(container.as_ref()).await?;
        tracing::debug!(container = %container.id(), network = %network.name, ?path, "Connecting");

        let rollback = add_network_config(container.as_ref(), network).await?;
        let ConnectPath::AttachNow(task) = path else {
            tracing::info!(
                container = %container.id(),
                network = %network.name,
                "Network recorded, attach deferred to task start"
            );
            return Ok(());
        };

        let guard = RollbackGuard::new(rollback, Arc::clone(&container), lock);
        match self.connect_network(network, container.as_ref(), task.as_ref()).await {
            Ok(_) => {
                guard.disarm();
                tracing::info!(container = %container.id(), network = %network.name, "Network connected");
                Ok(())
            }
            Err(e) => {
                guard.run().await;
                Err(e)
            }
        }
    }

    /// Attach the container's newest interface through CNI.
    async fn connect_network(
        &self,
        network: &NetworkConfig,
        container: &dyn Container,
        task: &dyn Task,
    ) -> TernResult<Value> {
        let container_labels = container.labels().await.context("read container labels")?;
        let rt = runtime_conf(
            &self.config().paths,
            container.id(),
            task.pid(),
            &container_labels,
        )?;

        tracing::debug!(
            container = %container.id(),
            network = %network.name,
            if_name = %rt.if_name,
            netns = %rt.netns.display(),
            "Adding network list"
        );
        self.cni()
            .add_network_list(network, &rt)
            .await
            .with_context(|| format!("attach network {} to container {}", network.name, container.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Labels;

    fn container_labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn runtime_conf_minimal() {
        let rt = runtime_conf(
            &NetworkPaths::new(),
            "3f2a9c0e11aa",
            4242,
            &container_labels(&[(labels::NETWORKS, r#"["nat1"]"#), (labels::NETWORK_INDEX, "0")]),
        )
        .unwrap();

        assert_eq!(rt.container_id, "3f2a9c0e11aa");
        assert_eq!(rt.netns, std::path::PathBuf::from("/proc/4242/ns/net"));
        assert_eq!(rt.if_name, "eth0");
        assert_eq!(rt.args, vec![("IgnoreUnknown".to_string(), "1".to_string())]);
        assert!(rt.capability_args.is_empty());
    }

    #[test]
    fn runtime_conf_with_static_addresses_and_ports() {
        let rt = runtime_conf(
            &NetworkPaths::new(),
            "c1",
            1,
            &container_labels(&[
                (labels::NETWORKS, r#"["bridge","nat1"]"#),
                (labels::NETWORK_INDEX, "3"),
                (labels::IP_ADDRESS, "10.4.0.12"),
                (labels::MAC_ADDRESS, "02:42:ac:11:00:02"),
                (labels::PORTS, r#"[{"HostPort":8080,"ContainerPort":80,"Protocol":"tcp"}]"#),
            ]),
        )
        .unwrap();

        assert_eq!(rt.if_name, "eth3");
        assert_eq!(rt.arg("IP"), Some("10.4.0.12"));
        assert_eq!(rt.arg("MAC"), Some("02:42:ac:11:00:02"));
        assert_eq!(
            rt.capability_args[PORT_MAPPINGS_CAPABILITY],
            serde_json::json!([{"hostPort": 8080, "containerPort": 80, "protocol": "tcp"}])
        );
    }

    #[test]
    fn empty_labels_add_no_args() {
        let rt = runtime_conf(
            &NetworkPaths::new(),
            "c1",
            1,
            &container_labels(&[
                (labels::NETWORKS, r#"["nat1"]"#),
                (labels::IP_ADDRESS, ""),
                (labels::MAC_ADDRESS, ""),
                (labels::PORTS, ""),
            ]),
        )
        .unwrap();

        assert_eq!(rt.if_name, "eth0");
        assert_eq!(rt.args.len(), 1);
        assert!(rt.capability_args.is_empty());
    }
}
