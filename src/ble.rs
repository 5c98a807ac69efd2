use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::TransportError,
    transport::{CharacteristicInfo, Link, Peer, ServiceInfo, Transport},
};

/// Upper bound on establishing a connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// `btleplug` backed transport using the first Bluetooth adapter
pub struct BleTransport {
    #[allow(dead_code)]
    manager: Manager,
    adapter: Adapter,
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BleTransport {
    /// Open the host's Bluetooth stack
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoAdapter`] if no Bluetooth adapter is present,
    /// or [`TransportError::Ble`] if the stack cannot be initialized.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        if let Ok(info) = adapter.adapter_info().await {
            debug!("Using adapter {info}");
        }

        Ok(Self {
            manager,
            adapter,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    async fn describe(&self, id: &PeripheralId) -> Option<(Peer, Peripheral)> {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                warn!("Peripheral vanished before it could be queried: {e}");
                return None;
            }
        };

        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            Ok(None) => None,
            Err(e) => {
                warn!("Could not query peripheral properties: {e}");
                None
            }
        };

        let peer = Peer {
            name,
            address: peripheral.address().to_string(),
        };
        Some((peer, peripheral))
    }
}

#[async_trait]
impl Transport for BleTransport {
    type Link = BleLink;

    async fn discover(&self, scan_timeout: Duration) -> Result<Vec<Peer>, TransportError> {
        info!("Starting {:.1}s scan", scan_timeout.as_secs_f64());

        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let mut order: Vec<PeripheralId> = Vec::new();
        let deadline = tokio::time::sleep(scan_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id)) => {
                        if !order.contains(&id) {
                            order.push(id);
                        }
                    }
                    Some(_) => {}
                    None => {
                        (&mut deadline).await;
                        break;
                    }
                },
            }
        }

        self.adapter.stop_scan().await?;

        // Peripherals the adapter already knew about never raise DeviceDiscovered
        for peripheral in self.adapter.peripherals().await? {
            let id = peripheral.id();
            if !order.contains(&id) {
                order.push(id);
            }
        }

        let mut peers = Vec::with_capacity(order.len());
        let mut cache = self.peripherals.lock().await;
        for id in &order {
            if let Some((peer, peripheral)) = self.describe(id).await {
                cache.insert(peer.address.clone(), peripheral);
                peers.push(peer);
            }
        }

        info!("Scan completed. Found {} peer(s)", peers.len());
        Ok(peers)
    }

    async fn connect(&self, address: &str) -> Result<BleLink, TransportError> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(address.to_string()))?;

        info!("Connecting to {address}");
        timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| {
                TransportError::Other(format!(
                    "connection timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })??;

        Ok(BleLink {
            peripheral,
            forwarder: Mutex::new(None),
        })
    }
}

/// Active connection to a peripheral
pub struct BleLink {
    peripheral: Peripheral,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BleLink {
    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::UnknownCharacteristic(uuid))
    }

    async fn stop_forwarding(&self) {
        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Link for BleLink {
    async fn services(&self) -> Result<Vec<ServiceInfo>, TransportError> {
        self.peripheral.discover_services().await?;

        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        properties: c.properties,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, TransportError> {
        let target = self.find_characteristic(characteristic)?;

        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(forward_notifications(notifications, characteristic, sender));

        if let Some(previous) = self.forwarder.lock().await.replace(handle) {
            previous.abort();
        }

        Ok(receiver)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let target = self.find_characteristic(characteristic)?;
        debug!("Writing {} byte(s) to {characteristic}", data.len());
        self.peripheral
            .write(&target, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let result = match self.find_characteristic(characteristic) {
            Ok(target) => self.peripheral.unsubscribe(&target).await.map_err(TransportError::from),
            Err(e) => Err(e),
        };
        self.stop_forwarding().await;
        result
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_forwarding().await;
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Push values notified on `characteristic` into `sender` until either side
/// closes
///
/// The peripheral multiplexes every subscribed characteristic onto one
/// stream, so values for other characteristics are skipped.
async fn forward_notifications<S>(
    mut notifications: S,
    characteristic: Uuid,
    sender: mpsc::UnboundedSender<Bytes>,
) where
    S: Stream<Item = ValueNotification> + Unpin,
{
    while let Some(data) = notifications.next().await {
        if data.uuid == characteristic && sender.send(Bytes::from(data.value)).is_err() {
            break;
        }
    }
    debug!("Notification stream for {characteristic} ended");
}
