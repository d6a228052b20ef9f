//! In-memory runtime, network store and CNI layer for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use oci_spec::runtime::Spec;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tern::runtime::{
    CniOrchestrator, Container, ContainerRuntime, Labels, NetworkStore, RuntimeConf, Task,
    TaskStatus,
};
use tern::{EngineConfig, NetworkService};
use tern_common::{NetworkPaths, TernError, TernResult, labels};
use tern_network::iptables::{DEFAULT_ISOLATION_CHAIN, FILTER_TABLE, IpFamily, IsolationRule};
use tern_network::network::{CONFLIST_ID_KEY, CONFLIST_LABELS_KEY};
use tern_network::testing::MemoryFilter;
use tern_network::{CreateOptions, DriverRegistry, FilterBackends, NetworkConfig, PluginConfig};

/// Full network ID derived from a name.
pub fn network_id(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Name of the predefined network.
pub const DEFAULT_NETWORK: &str = "bridge";

/// Host bridge of the predefined network.
pub const DEFAULT_BRIDGE: &str = "nerdctl0";

/// Network store writing conflists into a directory.
pub struct FakeStore {
    paths: NetworkPaths,
    networks: Mutex<Vec<NetworkConfig>>,
    used: Mutex<HashMap<String, Vec<String>>>,
    created: Mutex<Vec<CreateOptions>>,
    drop_ids: AtomicBool,
}

impl FakeStore {
    pub fn new(paths: NetworkPaths) -> Self {
        let bridge = NetworkConfig::new(DEFAULT_NETWORK)
            .with_id(network_id(DEFAULT_NETWORK))
            .with_plugin(
                PluginConfig::from_value(&json!({"type": "bridge", "bridge": DEFAULT_BRIDGE}))
                    .unwrap(),
            );
        Self {
            paths,
            networks: Mutex::new(vec![bridge]),
            used: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            drop_ids: AtomicBool::new(false),
        }
    }

    /// Add a network as-is.
    pub fn insert(&self, network: NetworkConfig) {
        self.networks.lock().push(network);
    }

    /// Record that containers use a network.
    pub fn set_used(&self, network: &str, containers: &[&str]) {
        self.used.lock().insert(
            network.to_string(),
            containers.iter().map(|c| (*c).to_string()).collect(),
        );
    }

    /// Make created networks come back without an ID.
    pub fn drop_ids(&self) {
        self.drop_ids.store(true, Ordering::SeqCst);
    }

    /// Options of every create call.
    pub fn created(&self) -> Vec<CreateOptions> {
        self.created.lock().clone()
    }

    pub fn get(&self, name: &str) -> Option<NetworkConfig> {
        self.networks.lock().iter().find(|n| n.name == name).cloned()
    }

    fn conflist(options: &CreateOptions, id: &str) -> TernResult<Value> {
        let subnet = options
            .subnet
            .clone()
            .unwrap_or_else(|| "10.4.0.0/24".to_string());
        let mut ranges = vec![json!([{"subnet": subnet}])];
        if options.ipv6 {
            ranges.push(json!([{"subnet": "fd00:4::/64"}]));
        }

        let plugin = match options.driver.as_str() {
            "bridge" => json!({
                "type": "bridge",
                "bridge": format!("br-{}", &id[..12]),
                "isGateway": true,
                "ipMasq": true,
                "ipam": {"type": "host-local", "ranges": ranges}
            }),
            "macvlan" => json!({"type": "macvlan", "master": "eth0"}),
            driver => {
                return Err(TernError::UnsupportedDriver {
                    driver: driver.to_string(),
                });
            }
        };

        Ok(json!({
            "cniVersion": "1.0.0",
            "name": options.name,
            CONFLIST_ID_KEY: id,
            CONFLIST_LABELS_KEY: options.labels,
            "plugins": [plugin, {"type": "firewall"}, {"type": "tuning"}]
        }))
    }
}

#[async_trait]
impl NetworkStore for FakeStore {
    async fn list_networks(&self) -> TernResult<Vec<NetworkConfig>> {
        Ok(self.networks.lock().clone())
    }

    async fn create_network(&self, options: &CreateOptions) -> TernResult<Option<NetworkConfig>> {
        self.created.lock().push(options.clone());

        let id = network_id(&options.name);
        let doc = Self::conflist(options, &id)?;
        let path = self.paths.conflist(&options.name);
        std::fs::write(&path, serde_json::to_string_pretty(&doc)?)?;

        let mut network = NetworkConfig::load(&path)?;
        self.networks.lock().push(network.clone());
        if self.drop_ids.load(Ordering::SeqCst) {
            network.id = None;
        }
        Ok(Some(network))
    }

    async fn remove_network(&self, network: &NetworkConfig) -> TernResult<()> {
        if let Some(path) = &network.config_file {
            std::fs::remove_file(path)?;
        }
        self.networks.lock().retain(|n| n.name != network.name);
        Ok(())
    }

    async fn used_network_info(&self) -> TernResult<HashMap<String, Vec<String>>> {
        Ok(self.used.lock().clone())
    }
}

pub struct FakeTask {
    status: Mutex<TaskStatus>,
    pid: u32,
}

#[async_trait]
impl Task for FakeTask {
    async fn status(&self) -> TernResult<TaskStatus> {
        Ok(*self.status.lock())
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

/// Container whose labels and spec live in memory.
pub struct FakeContainer {
    id: String,
    name: String,
    state: Mutex<(Labels, Spec)>,
    task: Mutex<Option<Arc<FakeTask>>>,
    updates: AtomicUsize,
}

impl FakeContainer {
    pub fn labels_now(&self) -> Labels {
        self.state.lock().0.clone()
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .1
            .annotations()
            .as_ref()
            .and_then(|a| a.get(key).cloned())
    }

    pub fn networks(&self) -> Vec<String> {
        self.labels_now()
            .get(labels::NETWORKS)
            .map(|raw| serde_json::from_str(raw).unwrap())
            .unwrap_or_default()
    }

    pub fn set_label(&self, key: &str, value: &str) {
        self.state.lock().0.insert(key.to_string(), value.to_string());
    }

    pub fn set_status(&self, status: TaskStatus) {
        if let Some(task) = self.task.lock().as_ref() {
            *task.status.lock() = status;
        }
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn labels(&self) -> TernResult<Labels> {
        let labels = self.state.lock().0.clone();
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;
        Ok(labels)
    }

    async fn spec(&self) -> TernResult<Spec> {
        Ok(self.state.lock().1.clone())
    }

    async fn update(&self, labels: Labels, spec: Spec) -> TernResult<()> {
        tokio::task::yield_now().await;
        *self.state.lock() = (labels, spec);
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn task(&self) -> TernResult<Arc<dyn Task>> {
        match self.task.lock().as_ref() {
            Some(task) => Ok(Arc::clone(task) as Arc<dyn Task>),
            None => Err(TernError::TaskNotFound {
                id: self.id.clone(),
            }),
        }
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<Arc<FakeContainer>>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> TernResult<Vec<Arc<dyn Container>>> {
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn Container>)
            .collect())
    }
}

/// CNI layer recording every ADD.
#[derive(Default)]
pub struct FakeCni {
    calls: Mutex<Vec<(String, RuntimeConf)>>,
    fail: AtomicBool,
    hang: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeCni {
    pub fn calls(&self) -> Vec<(String, RuntimeConf)> {
        self.calls.lock().clone()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Never return from ADD.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl CniOrchestrator for FakeCni {
    async fn add_network_list(&self, network: &NetworkConfig, rt: &RuntimeConf) -> TernResult<Value> {
        self.calls.lock().push((network.name.clone(), rt.clone()));

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TernError::external("CNI ADD", "plugin bridge exited with status 1"));
        }

        Ok(json!({"cniVersion": "1.0.0", "interfaces": [{"name": rt.if_name}]}))
    }
}

/// A service wired to in-memory collaborators.
pub struct Harness {
    pub service: NetworkService,
    pub store: Arc<FakeStore>,
    pub runtime: Arc<FakeRuntime>,
    pub cni: Arc<FakeCni>,
    pub v4: Arc<MemoryFilter>,
    pub v6: Arc<MemoryFilter>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default()
            .with_cni_config_dir(dir.path())
            .with_proc_root("/proc");

        let store = Arc::new(FakeStore::new(config.paths.clone()));
        let runtime = Arc::new(FakeRuntime::default());
        let cni = Arc::new(FakeCni::default());
        let v4 = Arc::new(MemoryFilter::new(IpFamily::V4));
        let v6 = Arc::new(MemoryFilter::new(IpFamily::V6));

        let drivers = DriverRegistry::with_defaults(FilterBackends::new(
            DEFAULT_ISOLATION_CHAIN,
            v4.clone(),
            v6.clone(),
        ));
        let service = NetworkService::new(config, store.clone(), runtime.clone(), cni.clone())
            .with_drivers(drivers);

        Self {
            service,
            store,
            runtime,
            cni,
            v4,
            v6,
            _dir: dir,
        }
    }

    /// Add a container; `status` of `None` means it has no task.
    pub fn add_container(&self, id: &str, name: &str, status: Option<TaskStatus>) -> Arc<FakeContainer> {
        let mut container_labels = BTreeMap::new();
        container_labels.insert(labels::NAME.to_string(), name.to_string());

        let mut spec = Spec::default();
        spec.set_annotations(None);

        let container = Arc::new(FakeContainer {
            id: id.to_string(),
            name: name.to_string(),
            state: Mutex::new((container_labels, spec)),
            task: Mutex::new(status.map(|status| {
                Arc::new(FakeTask {
                    status: Mutex::new(status),
                    pid: 4242,
                })
            })),
            updates: AtomicUsize::new(0),
        });
        self.runtime.containers.lock().push(Arc::clone(&container));
        container
    }

    /// Returns true if the DROP rule for `bridge` is in the family's chain.
    pub fn has_drop_rule(filter: &MemoryFilter, bridge: &str) -> bool {
        filter
            .rules(FILTER_TABLE, DEFAULT_ISOLATION_CHAIN)
            .contains(&IsolationRule::new(bridge).tokens())
    }

    /// Every ICC DROP rule's bridge in a family.
    pub fn drop_rule_bridges(filter: &MemoryFilter) -> HashSet<String> {
        filter
            .rules(FILTER_TABLE, DEFAULT_ISOLATION_CHAIN)
            .into_iter()
            .filter(|rule| rule.last().is_some_and(|t| t == "DROP"))
            .map(|rule| rule[1].clone())
            .collect()
    }
}

/// Bridge interface name the store assigns to a network.
pub fn default_bridge_name(network: &str) -> String {
    format!("br-{}", &network_id(network)[..12])
}
