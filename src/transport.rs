use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// A peer observed during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Advertised local name, if the peer sent one
    pub name: Option<String>,
    /// Transport-level address
    pub address: String,
}

/// A characteristic exposed by a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic identifier
    pub uuid: Uuid,
    /// Supported operations
    pub properties: CharPropFlags,
}

/// A GATT service exposed by a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service identifier
    pub uuid: Uuid,
    /// Characteristics of the service
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Look up a characteristic by identifier
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Entry point into a wireless stack
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection type produced by [`Transport::connect`]
    type Link: Link;

    /// Run one bounded scan and report every peer seen, in first-seen order
    async fn discover(&self, timeout: Duration) -> Result<Vec<Peer>, TransportError>;

    /// Open a connection to a previously discovered peer
    async fn connect(&self, address: &str) -> Result<Self::Link, TransportError>;
}

/// An open connection to a peer
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Resolve the peer's service table
    async fn services(&self) -> Result<Vec<ServiceInfo>, TransportError>;

    /// Enable notifications on a characteristic
    ///
    /// Payloads are pushed into the returned channel as they arrive. The
    /// sender side never waits, so a slow consumer cannot stall delivery.
    /// The channel closes once the subscription ends.
    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, TransportError>;

    /// Write to a characteristic
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    /// Whether the link is still up
    async fn is_connected(&self) -> bool;

    /// Disable notifications on a characteristic
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Release the connection
    async fn disconnect(&self) -> Result<(), TransportError>;
}
