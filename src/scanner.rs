use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{error::DiscoveryError, transport::Transport, types::DeviceHandle};

/// Single-pass discovery of a named sensor
pub struct Scanner<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> Scanner<T> {
    /// Create a scanner over a transport
    pub const fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Scan once for `target_name`
    ///
    /// Returns the first peer whose advertised name equals `target_name`
    /// exactly. No retry is attempted; the caller decides whether to scan
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotFound`] with every named peer seen, in
    /// first-seen order, when the target did not advertise during the scan,
    /// or [`DiscoveryError::Transport`] if the scan could not run.
    pub async fn scan(
        &self,
        target_name: &str,
        timeout: Duration,
    ) -> Result<DeviceHandle, DiscoveryError> {
        info!("Searching for device '{target_name}'");

        let peers = self.transport.discover(timeout).await?;

        if let Some(peer) = peers
            .iter()
            .find(|peer| peer.name.as_deref() == Some(target_name))
        {
            info!("Device found: {target_name} - {}", peer.address);
            return Ok(DeviceHandle::new(target_name, peer.address.clone()));
        }

        let candidates: Vec<(String, String)> = peers
            .into_iter()
            .filter_map(|peer| peer.name.map(|name| (name, peer.address)))
            .collect();

        warn!(
            "Device '{target_name}' not found; {} named peer(s) seen",
            candidates.len()
        );
        Err(DiscoveryError::NotFound { candidates })
    }
}
