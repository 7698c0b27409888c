//! Native BLE transport built on btleplug.
//!
//! btleplug exposes blocking-style async calls; this module turns each of
//! them into a fire-and-report command whose outcome is sent as a
//! [`TransportEvent`] on an unbounded channel.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{CharacteristicHandle, Transport, TransportEvent};
use crate::error::{Error, Result};

/// Receiving half of the transport's event channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Peripherals seen by the adapter, keyed by identifier.
type PeripheralRegistry = Arc<RwLock<HashMap<String, Peripheral>>>;

/// [`Transport`] backed by the system Bluetooth adapter.
pub struct BtleplugTransport {
    /// The BLE adapter in use.
    adapter: Adapter,
    /// Every peripheral reported by the adapter.
    peripherals: PeripheralRegistry,
    /// Identifiers already reported during the current scan.
    reported: Arc<Mutex<HashSet<String>>>,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Identifiers with a disconnect we asked for.
    requested_disconnects: Arc<Mutex<HashSet<String>>>,
    /// Channel for transport events.
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Handle to the adapter event task.
    event_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// Returns the transport and the receiver its events are delivered on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no usable adapter.
    pub async fn new() -> Result<(Self, TransportEvents)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Create a transport on a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<(Self, TransportEvents)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let peripherals: PeripheralRegistry = Arc::new(RwLock::new(HashMap::new()));
        let reported = Arc::new(Mutex::new(HashSet::new()));
        let is_scanning = Arc::new(RwLock::new(false));
        let requested_disconnects = Arc::new(Mutex::new(HashSet::new()));

        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;

        let handle = {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            let reported = reported.clone();
            let is_scanning = is_scanning.clone();
            let requested_disconnects = requested_disconnects.clone();
            let event_tx = event_tx.clone();

            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            if !*is_scanning.read() {
                                continue;
                            }
                            Self::process_peripheral(
                                &adapter,
                                id,
                                &peripherals,
                                &reported,
                                &event_tx,
                            )
                            .await;
                        }
                        CentralEvent::DeviceConnected(id) => {
                            debug!("Device connected: {:?}", id);
                        }
                        CentralEvent::DeviceDisconnected(id) => {
                            let event = disconnect_event(&requested_disconnects, id.to_string());
                            debug!("Device disconnected: {:?}", event);
                            let _ = event_tx.send(event);
                        }
                        _ => {}
                    }
                }

                debug!("Adapter event loop ended");
            })
        };

        Ok((
            Self {
                adapter,
                peripherals,
                reported,
                is_scanning,
                requested_disconnects,
                event_tx,
                event_handle: Some(handle),
            },
            event_rx,
        ))
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Report a peripheral the first time it is seen during a scan.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &PeripheralRegistry,
        reported: &Arc<Mutex<HashSet<String>>>,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let identifier = id.to_string();
        if reported.lock().contains(&identifier) {
            return;
        }

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        trace!(
            "Provisioning peripheral seen: {} name={:?} rssi={:?}",
            identifier,
            properties.local_name,
            properties.rssi
        );

        peripherals.write().insert(identifier.clone(), peripheral);
        reported.lock().insert(identifier.clone());

        let _ = event_tx.send(TransportEvent::DeviceDiscovered {
            identifier,
            name: properties.local_name,
        });
    }

    fn peripheral(&self, identifier: &str) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice {
                identifier: identifier.to_string(),
            })
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn start_scan(&self, service: Uuid) -> Result<()> {
        info!("Starting BLE scan for service {}", service);

        self.reported.lock().clear();
        *self.is_scanning.write() = true;

        let filter = ScanFilter {
            services: vec![service],
        };
        if let Err(e) = self.adapter.start_scan(filter).await {
            *self.is_scanning.write() = false;
            return Err(Error::Bluetooth(e));
        }

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, identifier: &str) -> Result<()> {
        let peripheral = self.peripheral(identifier)?;
        self.requested_disconnects.lock().remove(identifier);

        let identifier = identifier.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            debug!("Connecting to {}", identifier);
            let event = match peripheral.connect().await {
                Ok(()) => {
                    info!("Connected to {}", identifier);
                    TransportEvent::Connected { identifier }
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", identifier, e);
                    TransportEvent::ConnectFailed {
                        identifier,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = event_tx.send(event);
        });

        Ok(())
    }

    async fn disconnect(&self, identifier: &str) -> Result<()> {
        let peripheral = self.peripheral(identifier)?;
        self.requested_disconnects
            .lock()
            .insert(identifier.to_string());

        let identifier = identifier.to_string();
        let requested_disconnects = self.requested_disconnects.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {}: {}", identifier, e);
                requested_disconnects.lock().remove(&identifier);
            }
        });

        Ok(())
    }

    async fn discover_services(&self, identifier: &str, uuids: &[Uuid]) -> Result<()> {
        let peripheral = self.peripheral(identifier)?;
        let wanted = uuids.to_vec();
        let identifier = identifier.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            // btleplug discovers every service and characteristic in one pass.
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let services: Vec<Uuid> = peripheral
                        .services()
                        .iter()
                        .map(|s| s.uuid)
                        .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
                        .collect();
                    debug!("Discovered services on {}: {:?}", identifier, services);
                    TransportEvent::ServicesDiscovered {
                        identifier,
                        services,
                    }
                }
                Err(e) => {
                    error!("Service discovery on {} failed: {}", identifier, e);
                    TransportEvent::OperationFailed {
                        identifier,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = event_tx.send(event);
        });

        Ok(())
    }

    async fn discover_characteristics(
        &self,
        identifier: &str,
        service: Uuid,
        uuids: &[Uuid],
    ) -> Result<()> {
        let peripheral = self.peripheral(identifier)?;

        let characteristics: Vec<CharacteristicHandle> = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter())
            .filter(|c| uuids.is_empty() || uuids.contains(&c.uuid))
            .map(|c| CharacteristicHandle::new(c.service_uuid, c.uuid))
            .collect();

        debug!(
            "Found {} characteristics in service {} on {}",
            characteristics.len(),
            service,
            identifier
        );

        let _ = self.event_tx.send(TransportEvent::CharacteristicsDiscovered {
            identifier: identifier.to_string(),
            service,
            characteristics,
        });

        Ok(())
    }

    async fn write_characteristic(
        &self,
        identifier: &str,
        characteristic: CharacteristicHandle,
        data: &[u8],
        confirmed: bool,
    ) -> Result<()> {
        let peripheral = self.peripheral(identifier)?;

        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or_else(|| {
                Error::transport(format!(
                    "characteristic {} not discovered on {}",
                    characteristic.uuid, identifier
                ))
            })?;

        let write_type = if confirmed {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        let data = data.to_vec();
        let identifier = identifier.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let success = match peripheral.write(&target, &data, write_type).await {
                Ok(()) => {
                    trace!(
                        "Wrote {} bytes to characteristic {}",
                        data.len(),
                        characteristic.uuid
                    );
                    true
                }
                Err(e) => {
                    error!(
                        "Write to characteristic {} failed: {}",
                        characteristic.uuid, e
                    );
                    false
                }
            };
            let _ = event_tx.send(TransportEvent::WriteCompleted {
                identifier,
                characteristic,
                success,
            });
        });

        Ok(())
    }
}

/// Build the disconnect event for `identifier`, consuming any pending
/// disconnect request for it.
fn disconnect_event(requested: &Mutex<HashSet<String>>, identifier: String) -> TransportEvent {
    let was_requested = requested.lock().remove(&identifier);
    TransportEvent::Disconnected {
        identifier,
        was_requested,
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
        if let Some(handle) = self.event_handle.take() {
            handle.abort();
        }
    }
}
