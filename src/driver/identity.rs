//! Identity service implementation.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::types::{PluginCapability, PluginInfo};

use super::ZfssaDriver;

#[async_trait]
impl CsiIdentity for ZfssaDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    /// Ready iff the appliance answers a service listing with the configured
    /// credentials. An unresponsive appliance typically gets the driver
    /// restarted.
    #[instrument(skip(self))]
    async fn probe(&self) -> Result<bool, CsiError> {
        let token = self.login(&std::collections::HashMap::new())?;
        match self.client.get_services(&token).await {
            Ok(services) => {
                debug!(count = services.len(), "appliance services visible");
                Ok(true)
            }
            Err(e) => Err(CsiError::FailedPrecondition(format!(
                "appliance is not responding: {e}"
            ))),
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::OnlineVolumeExpansion,
        ])
    }
}
