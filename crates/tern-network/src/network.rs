//! CNI network definitions as seen by the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tern_common::{Identifiable, TernError, TernResult};

/// Conflist key holding the network ID.
pub const CONFLIST_ID_KEY: &str = "nerdctlID";

/// Conflist key holding the network labels.
pub const CONFLIST_LABELS_KEY: &str = "nerdctlLabels";

/// One entry of a network's plugin chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    /// The plugin `type` (e.g. `bridge`, `portmap`).
    pub plugin_type: String,
    /// Raw JSON of the plugin entry.
    pub bytes: Vec<u8>,
}

impl PluginConfig {
    /// Build a plugin entry from its JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry has no string `type`.
    pub fn from_value(value: &Value) -> TernResult<Self> {
        let plugin_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TernError::invalid_config("plugin entry has no type"))?;

        Ok(Self {
            plugin_type: plugin_type.to_string(),
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Read a string field of the plugin entry.
    #[must_use]
    pub fn string_field(&self, key: &str) -> Option<String> {
        let value: Value = serde_json::from_slice(&self.bytes).ok()?;
        value.get(key)?.as_str().map(str::to_string)
    }

    /// Returns true if the plugin's IPAM section allocates from an IPv6 subnet.
    ///
    /// Looks at both `ipam.subnet` and the `ipam.ranges` range sets.
    #[must_use]
    pub fn has_ipv6_subnet(&self) -> bool {
        let Ok(value) = serde_json::from_slice::<Value>(&self.bytes) else {
            return false;
        };
        let Some(ipam) = value.get("ipam") else {
            return false;
        };

        let is_v6 = |subnet: Option<&Value>| {
            subnet
                .and_then(Value::as_str)
                .is_some_and(|s| s.contains(':'))
        };
        if is_v6(ipam.get("subnet")) {
            return true;
        }

        ipam.get("ranges")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_array)
            .flatten()
            .any(|range| is_v6(range.get("subnet")))
    }
}

/// A CNI network definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Unique, user-facing name.
    pub name: String,
    /// Opaque ID; networks created before IDs existed have none.
    pub id: Option<String>,
    /// Ordered plugin chain.
    pub plugins: Vec<PluginConfig>,
    /// Backing conflist, absent for pre-defined networks.
    pub config_file: Option<PathBuf>,
    /// Network labels.
    pub labels: BTreeMap<String, String>,
}

impl NetworkConfig {
    /// Create a network definition without a backing file.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            plugins: Vec::new(),
            config_file: None,
            labels: BTreeMap::new(),
        }
    }

    /// Set the network ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Append a plugin to the chain.
    #[must_use]
    pub fn with_plugin(mut self, plugin: PluginConfig) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Set the backing conflist.
    #[must_use]
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Load a network from a conflist file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid conflist.
    pub fn load(path: &Path) -> TernResult<Self> {
        let data = std::fs::read(path)?;
        let doc: Value = serde_json::from_slice(&data)?;
        Self::from_conflist(&doc, Some(path))
    }

    /// Build a network from a parsed conflist document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document has no name or a malformed plugin list.
    pub fn from_conflist(doc: &Value, path: Option<&Path>) -> TernResult<Self> {
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TernError::invalid_config("conflist has no name"))?;

        let plugins = doc
            .get("plugins")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                TernError::invalid_config(format!("conflist for {name} has no plugins array"))
            })?
            .iter()
            .map(PluginConfig::from_value)
            .collect::<TernResult<Vec<_>>>()?;

        let labels = doc
            .get(CONFLIST_LABELS_KEY)
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            id: doc
                .get(CONFLIST_ID_KEY)
                .and_then(Value::as_str)
                .map(str::to_string),
            plugins,
            config_file: path.map(Path::to_path_buf),
            labels,
        })
    }

    /// Pre-defined networks have no backing file and are never removable.
    #[must_use]
    pub fn is_predefined(&self) -> bool {
        self.config_file.is_none()
    }

    /// Returns true if any plugin hands out IPv6 addresses.
    #[must_use]
    pub fn ipv6_enabled(&self) -> bool {
        self.plugins.iter().any(PluginConfig::has_ipv6_subnet)
    }

    /// Type of the first plugin in the chain.
    #[must_use]
    pub fn primary_plugin_type(&self) -> Option<&str> {
        self.plugins.first().map(|p| p.plugin_type.as_str())
    }

    /// The single plugin of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain has zero or several plugins of that type.
    pub fn plugin(&self, plugin_type: &str) -> TernResult<&PluginConfig> {
        let mut found = self.plugins.iter().filter(|p| p.plugin_type == plugin_type);
        match (found.next(), found.next()) {
            (Some(plugin), None) => Ok(plugin),
            (None, _) => Err(TernError::invalid_config(format!(
                "network {} has no {plugin_type} plugin",
                self.name
            ))),
            (Some(_), Some(_)) => Err(TernError::invalid_config(format!(
                "network {} has multiple {plugin_type} plugins",
                self.name
            ))),
        }
    }
}

impl Identifiable for NetworkConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}
