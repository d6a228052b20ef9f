//! Removing networks.

use tern_common::{ResultExt, TernError, TernResult};

use crate::service::{NetworkService, run_blocking};

impl NetworkService {
    /// Remove a network.
    ///
    /// The network's driver cleans up first; if that fails the network is kept
    /// so the removal can be retried.
    ///
    /// # Errors
    ///
    /// Returns a resolution error, [`TernError::NetworkInUse`] or
    /// [`TernError::PredefinedNetwork`], or the error of the failed step.
    pub async fn remove(&self, query: &str) -> TernResult<()> {
        let network = self.inspect(query).await?;

        let used = self
            .store()
            .used_network_info()
            .await
            .context("list network users")?;
        if let Some(container) = used.get(&network.name).and_then(|users| users.first()) {
            return Err(TernError::NetworkInUse {
                network: network.name,
                container: container.clone(),
            });
        }

        if network.is_predefined() {
            return Err(TernError::PredefinedNetwork {
                network: network.name,
            });
        }

        if let Some(driver) = self.drivers().for_network(&network) {
            let target = network.clone();
            run_blocking(move || driver.handle_remove(&target))
                .await
                .with_context(|| format!("clean up network {}", network.name))?;
        }

        self.store()
            .remove_network(&network)
            .await
            .with_context(|| format!("remove network {}", network.name))?;

        tracing::info!(network = %network.name, "Network removed");
        Ok(())
    }
}
