//! In-memory filter backend for tests.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;

use crate::iptables::{FORWARD_CHAIN, FilterBackend, FilterError, IpFamily};

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    /// `chain_exists`
    ChainExists,
    /// `new_chain`
    NewChain,
    /// `delete_chain`
    DeleteChain,
    /// `insert_unique`
    InsertUnique,
    /// `append_unique`
    AppendUnique,
    /// `delete_if_exists`
    DeleteIfExists,
}

#[derive(Debug, Default)]
struct State {
    chains: BTreeMap<(String, String), Vec<Vec<String>>>,
    failures: HashSet<(FilterOp, String)>,
    hidden: Option<(String, String)>,
}

/// A [`FilterBackend`] keeping chains and rules in memory.
///
/// Starts with an empty `FORWARD` chain in the `filter` table.
#[derive(Debug)]
pub struct MemoryFilter {
    family: IpFamily,
    state: Mutex<State>,
}

impl MemoryFilter {
    /// Empty backend for a family.
    #[must_use]
    pub fn new(family: IpFamily) -> Self {
        let mut state = State::default();
        state
            .chains
            .insert(("filter".to_string(), FORWARD_CHAIN.to_string()), Vec::new());
        Self {
            family,
            state: Mutex::new(state),
        }
    }

    /// Make every `op` on `chain` fail.
    pub fn fail_on(&self, op: FilterOp, chain: &str) {
        self.state.lock().failures.insert((op, chain.to_string()));
    }

    /// Create a chain while the next `chain_exists` still reports it missing,
    /// as if another process created it concurrently.
    pub fn create_chain_behind_our_back(&self, table: &str, chain: &str) {
        let mut state = self.state.lock();
        let key = (table.to_string(), chain.to_string());
        state.chains.entry(key.clone()).or_default();
        state.hidden = Some(key);
    }

    /// Rules of a chain, in order.
    #[must_use]
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns true if the chain exists.
    #[must_use]
    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .chains
            .contains_key(&(table.to_string(), chain.to_string()))
    }

    /// Remove a rule directly, bypassing failure injection.
    pub fn remove_rule(&self, table: &str, chain: &str, rule: &[String]) {
        if let Some(rules) = self
            .state
            .lock()
            .chains
            .get_mut(&(table.to_string(), chain.to_string()))
        {
            rules.retain(|r| r != rule);
        }
    }

    fn check(state: &State, op: FilterOp, chain: &str) -> Result<(), FilterError> {
        if state.failures.contains(&(op, chain.to_string())) {
            return Err(FilterError::Backend(format!("injected {op:?} failure on {chain}")));
        }
        Ok(())
    }

    fn chain_mut<'a>(
        state: &'a mut State,
        table: &str,
        chain: &str,
    ) -> Result<&'a mut Vec<Vec<String>>, FilterError> {
        state
            .chains
            .get_mut(&(table.to_string(), chain.to_string()))
            .ok_or_else(|| FilterError::Backend(format!("no chain {chain} in table {table}")))
    }
}

impl FilterBackend for MemoryFilter {
    fn family(&self) -> IpFamily {
        self.family
    }

    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FilterError> {
        let mut state = self.state.lock();
        Self::check(&state, FilterOp::ChainExists, chain)?;

        let key = (table.to_string(), chain.to_string());
        if state.hidden.as_ref() == Some(&key) {
            state.hidden = None;
            return Ok(false);
        }
        Ok(state.chains.contains_key(&key))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        Self::check(&state, FilterOp::NewChain, chain)?;

        let key = (table.to_string(), chain.to_string());
        if state.chains.contains_key(&key) {
            return Err(FilterError::ChainExists {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        state.chains.insert(key, Vec::new());
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        Self::check(&state, FilterOp::DeleteChain, chain)?;

        let key = (table.to_string(), chain.to_string());
        if state.chains.get(&key).is_some_and(|rules| !rules.is_empty()) {
            return Err(FilterError::Backend(format!("chain {chain} is not empty")));
        }
        state.chains.remove(&key);
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FilterError> {
        let state = self.state.lock();
        Ok(state
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }

    fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        Self::check(&state, FilterOp::InsertUnique, chain)?;

        let rules = Self::chain_mut(&mut state, table, chain)?;
        if rules.iter().any(|r| r == rule) {
            return Ok(());
        }
        let index = usize::try_from(position.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .min(rules.len());
        rules.insert(index, rule.to_vec());
        Ok(())
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        Self::check(&state, FilterOp::AppendUnique, chain)?;

        let rules = Self::chain_mut(&mut state, table, chain)?;
        if !rules.iter().any(|r| r == rule) {
            rules.push(rule.to_vec());
        }
        Ok(())
    }

    fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        Self::check(&state, FilterOp::DeleteIfExists, chain)?;

        if let Some(rules) = state.chains.get_mut(&(table.to_string(), chain.to_string())) {
            rules.retain(|r| r != rule);
        }
        Ok(())
    }
}
