//! Inter-container isolation rules.
//!
//! Bridges with ICC disabled get a DROP rule in a dedicated chain of the
//! `filter` table, jumped to from the top of `FORWARD`:
//!
//! ```text
//! FORWARD:              -j FINCH-ISOLATE-CHAIN   (position 1)
//! FINCH-ISOLATE-CHAIN:  -i br-a -o br-a -j DROP
//!                       -i br-b -o br-b -j DROP
//!                       -j RETURN
//! ```
//!
//! The chain is shared by every network on the host. All mutations go through
//! the `*_unique` / `*_if_exists` primitives so concurrent callers converge.

use std::fmt;
use std::process::{Command, Output};
use std::sync::Arc;

use tern_common::{TernError, TernResult};
use thiserror::Error;

/// Table holding the isolation chain.
pub const FILTER_TABLE: &str = "filter";

/// Built-in chain the isolation chain is jumped to from.
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Default name of the isolation chain.
pub const DEFAULT_ISOLATION_CHAIN: &str = "FINCH-ISOLATE-CHAIN";

/// Protocol family of a filter backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    /// IPv4 (`iptables`).
    V4,
    /// IPv6 (`ip6tables`).
    V6,
}

impl IpFamily {
    /// Default command for this family.
    #[must_use]
    pub const fn binary(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// Errors reported by a filter backend.
#[derive(Error, Debug)]
pub enum FilterError {
    /// The chain was created by someone else in the meantime.
    #[error("chain {chain} already exists in table {table}")]
    ChainExists {
        /// Table name.
        table: String,
        /// Chain name.
        chain: String,
    },

    /// The filter command could not be started.
    #[error("failed to execute {binary}: {source}")]
    Spawn {
        /// The command.
        binary: String,
        /// Why it could not run.
        #[source]
        source: std::io::Error,
    },

    /// The filter command exited unsuccessfully.
    #[error("{binary} {args} exited with status {status}: {stderr}")]
    Command {
        /// The command.
        binary: String,
        /// Its arguments, space separated.
        args: String,
        /// Exit status (-1 when killed by a signal).
        status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

impl From<FilterError> for TernError {
    fn from(err: FilterError) -> Self {
        TernError::external("iptables", err)
    }
}

/// Chain and rule primitives of a packet filter, for one protocol family.
///
/// Rules are passed as argument tokens, e.g. `["-i", "br0", "-j", "DROP"]`.
pub trait FilterBackend: Send + Sync + fmt::Debug {
    /// Protocol family this backend manages.
    fn family(&self) -> IpFamily;

    /// Returns true if the chain exists.
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FilterError>;

    /// Create a chain. Fails with [`FilterError::ChainExists`] if it already exists.
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FilterError>;

    /// Delete an empty, unreferenced chain.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError>;

    /// Returns true if the rule exists in the chain.
    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FilterError>;

    /// Insert the rule at `position` (1-based) unless it already exists.
    fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), FilterError>;

    /// Append the rule unless it already exists.
    fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FilterError>;

    /// Delete the rule if it exists.
    fn delete_if_exists(&self, table: &str, chain: &str, rule: &[String])
    -> Result<(), FilterError>;
}

/// [`FilterBackend`] running the `iptables`/`ip6tables` commands.
#[derive(Debug, Clone)]
pub struct IptablesCommand {
    family: IpFamily,
    binary: String,
}

impl IptablesCommand {
    /// Backend for a protocol family, using the default command name.
    #[must_use]
    pub fn new(family: IpFamily) -> Self {
        Self {
            family,
            binary: family.binary().to_string(),
        }
    }

    /// Use a different command (e.g. `iptables-legacy`).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Run the command, waiting for the xtables lock.
    fn run(&self, args: &[&str]) -> Result<Output, FilterError> {
        tracing::trace!(binary = %self.binary, ?args, "Running filter command");

        Command::new(&self.binary)
            .arg("-w")
            .args(args)
            .output()
            .map_err(|source| FilterError::Spawn {
                binary: self.binary.clone(),
                source,
            })
    }

    fn failure(&self, args: &[&str], output: &Output) -> FilterError {
        FilterError::Command {
            binary: self.binary.clone(),
            args: args.join(" "),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    fn run_checked(&self, args: &[&str]) -> Result<(), FilterError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(self.failure(args, &output));
        }
        Ok(())
    }

    /// Run a query where exit status 1 means "no".
    fn run_query(&self, args: &[&str]) -> Result<bool, FilterError> {
        let output = self.run(args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failure(args, &output)),
        }
    }
}

fn with_rule<'a>(head: &[&'a str], rule: &'a [String]) -> Vec<&'a str> {
    head.iter()
        .copied()
        .chain(rule.iter().map(String::as_str))
        .collect()
}

impl FilterBackend for IptablesCommand {
    fn family(&self) -> IpFamily {
        self.family
    }

    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FilterError> {
        self.run_query(&["-t", table, "-n", "-L", chain])
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let args = ["-t", table, "-N", chain];
        let output = self.run(&args)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code() == Some(1) && stderr.contains("Chain already exists") {
            return Err(FilterError::ChainExists {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        Err(self.failure(&args, &output))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        self.run_checked(&["-t", table, "-X", chain])
    }

    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FilterError> {
        self.run_query(&with_rule(&["-t", table, "-C", chain], rule))
    }

    fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), FilterError> {
        if self.exists(table, chain, rule)? {
            return Ok(());
        }
        let position = position.to_string();
        self.run_checked(&with_rule(
            &["-t", table, "-I", chain, position.as_str()],
            rule,
        ))
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FilterError> {
        if self.exists(table, chain, rule)? {
            return Ok(());
        }
        self.run_checked(&with_rule(&["-t", table, "-A", chain], rule))
    }

    fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FilterError> {
        if !self.exists(table, chain, rule)? {
            return Ok(());
        }
        self.run_checked(&with_rule(&["-t", table, "-D", chain], rule))
    }
}

/// DROP rule blocking traffic between two ports of the same bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationRule {
    bridge: String,
}

impl IsolationRule {
    /// Rule for a bridge interface.
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
        }
    }

    /// The bridge interface name.
    #[must_use]
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Rule tokens.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        tokens(&["-i", &self.bridge, "-o", &self.bridge, "-j", "DROP"])
    }
}

fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}

/// The isolation chain across every protocol family in scope.
///
/// A failure in any family fails the whole operation.
#[derive(Debug, Clone)]
pub struct IsolationRules {
    chain: String,
    backends: Vec<Arc<dyn FilterBackend>>,
}

impl IsolationRules {
    /// Isolation rules for a chain over the given backends.
    pub fn new(chain: impl Into<String>, backends: Vec<Arc<dyn FilterBackend>>) -> Self {
        Self {
            chain: chain.into(),
            backends,
        }
    }

    /// Families in scope.
    #[must_use]
    pub fn families(&self) -> Vec<IpFamily> {
        self.backends.iter().map(|b| b.family()).collect()
    }

    /// Ensure the chain is set up and insert the rule in every family.
    ///
    /// # Errors
    ///
    /// Returns an error if any family fails.
    pub fn add_rule(&self, rule: &IsolationRule) -> TernResult<()> {
        for backend in &self.backends {
            self.add_rule_for(backend.as_ref(), rule)
                .map_err(|e| {
                    TernError::from(e).context(format!(
                        "add {} isolation rule for bridge {}",
                        backend.family(),
                        rule.bridge()
                    ))
                })?;
        }

        tracing::info!(bridge = %rule.bridge(), chain = %self.chain, "Isolation rule added");
        Ok(())
    }

    /// Delete the rule from every family. Missing rules are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if any family fails.
    pub fn del_rule(&self, rule: &IsolationRule) -> TernResult<()> {
        for backend in &self.backends {
            backend
                .delete_if_exists(FILTER_TABLE, &self.chain, &rule.tokens())
                .map_err(|e| {
                    TernError::from(e).context(format!(
                        "delete {} isolation rule for bridge {}",
                        backend.family(),
                        rule.bridge()
                    ))
                })?;
        }

        tracing::debug!(bridge = %rule.bridge(), chain = %self.chain, "Isolation rule removed");
        Ok(())
    }

    /// Families in scope where the rule is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if any backend query fails.
    pub fn missing_families(&self, rule: &IsolationRule) -> TernResult<Vec<IpFamily>> {
        let mut missing = Vec::new();
        for backend in &self.backends {
            let present = backend.chain_exists(FILTER_TABLE, &self.chain)?
                && backend.exists(FILTER_TABLE, &self.chain, &rule.tokens())?;
            if !present {
                missing.push(backend.family());
            }
        }
        Ok(missing)
    }

    fn add_rule_for(&self, backend: &dyn FilterBackend, rule: &IsolationRule) -> Result<(), FilterError> {
        if let Err(e) = self.ensure_chain(backend) {
            self.cleanup_chain(backend);
            return Err(e);
        }

        let jump = tokens(&["-j", &self.chain]);
        if let Err(e) = backend.insert_unique(FILTER_TABLE, FORWARD_CHAIN, 1, &jump) {
            self.cleanup_chain(backend);
            return Err(e);
        }

        backend.append_unique(FILTER_TABLE, &self.chain, &tokens(&["-j", "RETURN"]))?;

        let drop_rule = rule.tokens();
        if let Err(e) = backend.insert_unique(FILTER_TABLE, &self.chain, 1, &drop_rule) {
            if let Err(cleanup) = backend.delete_if_exists(FILTER_TABLE, &self.chain, &drop_rule) {
                tracing::warn!(error = %cleanup, bridge = %rule.bridge(), "Failed to remove partial isolation rule");
            }
            return Err(e);
        }

        Ok(())
    }

    fn ensure_chain(&self, backend: &dyn FilterBackend) -> Result<(), FilterError> {
        if backend.chain_exists(FILTER_TABLE, &self.chain)? {
            return Ok(());
        }

        match backend.new_chain(FILTER_TABLE, &self.chain) {
            Ok(()) => {
                tracing::debug!(chain = %self.chain, family = %backend.family(), "Isolation chain created");
                Ok(())
            }
            // Someone else created it between the check and the create.
            Err(FilterError::ChainExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn cleanup_chain(&self, backend: &dyn FilterBackend) {
        if let Err(e) = backend.delete_chain(FILTER_TABLE, &self.chain) {
            tracing::warn!(error = %e, chain = %self.chain, family = %backend.family(), "Failed to clean up isolation chain");
        }
    }
}

/// One filter backend per protocol family.
#[derive(Debug, Clone)]
pub struct FilterBackends {
    chain: String,
    ipv4: Arc<dyn FilterBackend>,
    ipv6: Arc<dyn FilterBackend>,
}

impl FilterBackends {
    /// Backends with an explicit isolation chain name.
    pub fn new(
        chain: impl Into<String>,
        ipv4: Arc<dyn FilterBackend>,
        ipv6: Arc<dyn FilterBackend>,
    ) -> Self {
        Self {
            chain: chain.into(),
            ipv4,
            ipv6,
        }
    }

    /// Backends running the host's `iptables` and `ip6tables` commands.
    pub fn system(chain: impl Into<String>) -> Self {
        Self::new(
            chain,
            Arc::new(IptablesCommand::new(IpFamily::V4)),
            Arc::new(IptablesCommand::new(IpFamily::V6)),
        )
    }

    /// The isolation chain name.
    #[must_use]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Isolation rules for a network: IPv4 always, IPv6 when enabled.
    #[must_use]
    pub fn scope(&self, ipv6: bool) -> IsolationRules {
        let mut backends = vec![Arc::clone(&self.ipv4)];
        if ipv6 {
            backends.push(Arc::clone(&self.ipv6));
        }
        IsolationRules::new(self.chain.clone(), backends)
    }
}
