//! Collaborators the engine drives.
//!
//! The engine never owns containers, tasks or network definitions. It reaches
//! them through these traits, which the embedding daemon implements on top of
//! its container runtime and CNI library.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use oci_spec::runtime::Spec;
use serde_json::Value;
use tern_common::TernResult;
use tern_network::{CreateOptions, NetworkConfig};

/// Container labels.
pub type Labels = BTreeMap<String, String>;

/// Status of a container's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The runtime could not tell.
    Unknown,
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Being paused.
    Pausing,
    /// Exited.
    Stopped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Pausing => write!(f, "pausing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A container's running process.
#[async_trait]
pub trait Task: Send + Sync {
    /// Current status, queried from the runtime.
    async fn status(&self) -> TernResult<TaskStatus>;

    /// Process ID of the task's init process.
    fn pid(&self) -> u32;
}

/// A container known to the runtime.
#[async_trait]
pub trait Container: Send + Sync {
    /// Full container ID.
    fn id(&self) -> &str;

    /// Container name.
    fn name(&self) -> &str;

    /// Current labels.
    async fn labels(&self) -> TernResult<Labels>;

    /// Current OCI runtime spec.
    async fn spec(&self) -> TernResult<Spec>;

    /// Replace labels and spec in one update.
    async fn update(&self, labels: Labels, spec: Spec) -> TernResult<()>;

    /// The container's task.
    ///
    /// Returns a not-found error when no task exists yet.
    async fn task(&self) -> TernResult<Arc<dyn Task>>;
}

/// Source of container handles.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every container in the namespace.
    async fn list_containers(&self) -> TernResult<Vec<Arc<dyn Container>>>;
}

/// Persistent network definitions.
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Every network, predefined ones included.
    async fn list_networks(&self) -> TernResult<Vec<NetworkConfig>>;

    /// Create a network.
    ///
    /// Returns [`tern_common::TernError::UnsupportedDriver`] when no plugin
    /// implements the requested driver.
    async fn create_network(&self, options: &CreateOptions) -> TernResult<Option<NetworkConfig>>;

    /// Delete a network definition.
    async fn remove_network(&self, network: &NetworkConfig) -> TernResult<()>;

    /// Network name to the containers using it.
    async fn used_network_info(&self) -> TernResult<HashMap<String, Vec<String>>>;
}

/// CNI runtime configuration of one attachment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConf {
    /// Container ID.
    pub container_id: String,
    /// Network namespace path.
    pub netns: PathBuf,
    /// Interface name inside the container.
    pub if_name: String,
    /// `CNI_ARGS` key/value pairs, in order.
    pub args: Vec<(String, String)>,
    /// Capability arguments by capability name.
    pub capability_args: BTreeMap<String, Value>,
}

impl RuntimeConf {
    /// Value of a `CNI_ARGS` key.
    #[must_use]
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Runs CNI plugin chains.
#[async_trait]
pub trait CniOrchestrator: Send + Sync {
    /// Run the network's plugin chain in ADD mode. Returns the CNI result.
    async fn add_network_list(&self, network: &NetworkConfig, rt: &RuntimeConf)
    -> TernResult<Value>;
}
