//! Editing the bridge plugin of an on-disk CNI conflist.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tern_common::{ResultExt, TernError, TernResult};

use crate::lock::with_dir_lock;

/// Plugin type of the bridge plugin.
pub const BRIDGE_PLUGIN: &str = "bridge";

/// Field of the bridge plugin naming the host bridge interface.
pub const BRIDGE_FIELD: &str = "bridge";

const DEFAULT_INDENT: &str = "  ";

/// A parsed conflist, re-serialised with its original layout.
#[derive(Debug, Clone)]
pub struct Conflist {
    path: PathBuf,
    doc: Value,
    indent: String,
    trailing_newline: bool,
}

impl Conflist {
    /// Read and parse a conflist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not JSON.
    pub fn load(path: &Path) -> TernResult<Self> {
        let data = fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&data)
            .map_err(TernError::from)
            .with_context(|| format!("parse conflist {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            doc,
            indent: detect_indent(&data),
            trailing_newline: data.ends_with('\n'),
        })
    }

    /// The parsed document.
    #[must_use]
    pub fn document(&self) -> &Value {
        &self.doc
    }

    /// The single bridge plugin entry.
    ///
    /// # Errors
    ///
    /// Returns an error if `plugins` is malformed or does not contain exactly
    /// one bridge plugin.
    pub fn bridge_plugin(&self) -> TernResult<&Map<String, Value>> {
        let index = self.bridge_index()?;
        self.doc["plugins"][index]
            .as_object()
            .ok_or_else(|| self.invalid("bridge plugin is not an object"))
    }

    /// The host bridge interface name.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge plugin is missing or has no name.
    pub fn bridge_name(&self) -> TernResult<String> {
        self.bridge_plugin()?
            .get(BRIDGE_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.invalid("bridge plugin has no bridge name"))
    }

    /// Override the host bridge interface name.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge plugin is missing.
    pub fn set_bridge_name(&mut self, name: &str) -> TernResult<()> {
        let index = self.bridge_index()?;
        let plugin = self.doc["plugins"][index]
            .as_object_mut()
            .ok_or_else(|| TernError::invalid_config("bridge plugin is not an object"))?;
        plugin.insert(BRIDGE_FIELD.to_string(), Value::String(name.to_string()));
        Ok(())
    }

    /// Serialise with the indentation of the original file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn render(&self) -> TernResult<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(self.indent.as_bytes());
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.doc.serialize(&mut ser)?;
        if self.trailing_newline {
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Write the document back, keeping the file's permission bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> TernResult<()> {
        let permissions = fs::metadata(&self.path)?.permissions();
        fs::write(&self.path, self.render()?)?;
        fs::set_permissions(&self.path, permissions)?;

        tracing::debug!(path = %self.path.display(), "Conflist written");
        Ok(())
    }

    fn bridge_index(&self) -> TernResult<usize> {
        let plugins = self
            .doc
            .get("plugins")
            .and_then(Value::as_array)
            .ok_or_else(|| self.invalid("malformed plugins array"))?;

        let mut found = None;
        for (index, plugin) in plugins.iter().enumerate() {
            let plugin_type = plugin
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| self.invalid("malformed plugins array"))?;
            if plugin_type != BRIDGE_PLUGIN {
                continue;
            }
            if found.is_some() {
                return Err(self.invalid("multiple bridge plugins found"));
            }
            found = Some(index);
        }

        found.ok_or_else(|| self.invalid("no bridge plugin found"))
    }

    fn invalid(&self, message: &str) -> TernError {
        TernError::invalid_config(format!("{}: {message}", self.path.display()))
    }
}

/// Leading whitespace of the first indented line, or two spaces.
fn detect_indent(data: &str) -> String {
    data.lines()
        .skip(1)
        .map(|line| {
            line.chars()
                .take_while(|c| *c == ' ' || *c == '\t')
                .collect::<String>()
        })
        .find(|indent| !indent.is_empty())
        .unwrap_or_else(|| DEFAULT_INDENT.to_string())
}

fn lock_dir(path: &Path) -> TernResult<&Path> {
    path.parent().ok_or_else(|| TernError::InvalidArgument {
        message: format!("conflist path {} has no parent directory", path.display()),
    })
}

/// Read the bridge name of a conflist under the directory lock.
///
/// # Errors
///
/// Returns an error if the lock, the read, or the lookup fails.
pub fn read_bridge_name(path: &Path) -> TernResult<String> {
    with_dir_lock(lock_dir(path)?, || Conflist::load(path)?.bridge_name())
}

/// Rewrite the bridge name of a conflist under the directory lock.
///
/// # Errors
///
/// Returns an error if the lock, the read, the lookup or the write fails.
pub fn write_bridge_name(path: &Path, name: &str) -> TernResult<()> {
    with_dir_lock(lock_dir(path)?, || {
        let mut conflist = Conflist::load(path)?;
        conflist.set_bridge_name(name)?;
        conflist.save()
    })?;

    tracing::info!(path = %path.display(), bridge = name, "Bridge name overridden");
    Ok(())
}
