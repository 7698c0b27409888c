//! Shared test transport and helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;
use wifi_provision_ble::{
    CharacteristicHandle, Error, ProvisioningSession, Result, SessionConfig, SessionEvent,
    Transport, TransportEvent, PASSWORD_CHARACTERISTIC_UUID, PROVISIONING_SERVICE_UUID,
    SSID_CHARACTERISTIC_UUID,
};

/// A command the session issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Uuid),
    StopScan,
    Connect(String),
    Disconnect(String),
    DiscoverServices(String, Vec<Uuid>),
    DiscoverCharacteristics(String, Uuid, Vec<Uuid>),
    Write {
        identifier: String,
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        confirmed: bool,
    },
}

/// Transport that records every command and can refuse chosen ones.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    refuse: Mutex<HashSet<&'static str>>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Characteristic UUIDs written, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Write {
                    characteristic,
                    data,
                    ..
                } => Some((characteristic.uuid, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Make the named command return an error from now on.
    pub fn refuse(&self, command: &'static str) {
        self.refuse.lock().insert(command);
    }

    fn record(&self, command: &'static str, call: Call) -> Result<()> {
        self.calls.lock().push(call);
        if self.refuse.lock().contains(command) {
            return Err(Error::transport(format!("{} refused", command)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start_scan(&self, service: Uuid) -> Result<()> {
        self.record("start_scan", Call::StartScan(service))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record("stop_scan", Call::StopScan)
    }

    async fn connect(&self, identifier: &str) -> Result<()> {
        self.record("connect", Call::Connect(identifier.to_string()))
    }

    async fn disconnect(&self, identifier: &str) -> Result<()> {
        self.record("disconnect", Call::Disconnect(identifier.to_string()))
    }

    async fn discover_services(&self, identifier: &str, uuids: &[Uuid]) -> Result<()> {
        self.record(
            "discover_services",
            Call::DiscoverServices(identifier.to_string(), uuids.to_vec()),
        )
    }

    async fn discover_characteristics(
        &self,
        identifier: &str,
        service: Uuid,
        uuids: &[Uuid],
    ) -> Result<()> {
        self.record(
            "discover_characteristics",
            Call::DiscoverCharacteristics(identifier.to_string(), service, uuids.to_vec()),
        )
    }

    async fn write_characteristic(
        &self,
        identifier: &str,
        characteristic: CharacteristicHandle,
        data: &[u8],
        confirmed: bool,
    ) -> Result<()> {
        self.record(
            "write_characteristic",
            Call::Write {
                identifier: identifier.to_string(),
                characteristic,
                data: data.to_vec(),
                confirmed,
            },
        )
    }
}

/// Session with the watchdog disabled.
pub fn session() -> (ProvisioningSession, Arc<RecordingTransport>) {
    session_with(SessionConfig::default().with_operation_timeout(None))
}

pub fn session_with(config: SessionConfig) -> (ProvisioningSession, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let session = ProvisioningSession::new(transport.clone(), config);
    (session, transport)
}

pub fn ssid_handle() -> CharacteristicHandle {
    CharacteristicHandle::new(PROVISIONING_SERVICE_UUID, SSID_CHARACTERISTIC_UUID)
}

pub fn password_handle() -> CharacteristicHandle {
    CharacteristicHandle::new(PROVISIONING_SERVICE_UUID, PASSWORD_CHARACTERISTIC_UUID)
}

pub fn discovered(identifier: &str, name: Option<&str>) -> TransportEvent {
    TransportEvent::DeviceDiscovered {
        identifier: identifier.to_string(),
        name: name.map(str::to_string),
    }
}

pub fn connected(identifier: &str) -> TransportEvent {
    TransportEvent::Connected {
        identifier: identifier.to_string(),
    }
}

pub fn services(identifier: &str, services: Vec<Uuid>) -> TransportEvent {
    TransportEvent::ServicesDiscovered {
        identifier: identifier.to_string(),
        services,
    }
}

pub fn characteristics(
    identifier: &str,
    characteristics: Vec<CharacteristicHandle>,
) -> TransportEvent {
    TransportEvent::CharacteristicsDiscovered {
        identifier: identifier.to_string(),
        service: PROVISIONING_SERVICE_UUID,
        characteristics,
    }
}

pub fn write_done(
    identifier: &str,
    characteristic: CharacteristicHandle,
    success: bool,
) -> TransportEvent {
    TransportEvent::WriteCompleted {
        identifier: identifier.to_string(),
        characteristic,
        success,
    }
}

pub fn disconnected(identifier: &str, was_requested: bool) -> TransportEvent {
    TransportEvent::Disconnected {
        identifier: identifier.to_string(),
        was_requested,
    }
}

/// Drive a fresh session to `Ready` with "dev1"/"Kitchen".
pub async fn drive_to_ready(session: &ProvisioningSession) {
    session.start().await.unwrap();
    session.handle_event(discovered("dev1", Some("Kitchen"))).await;
    session.select_device("dev1").await.unwrap();
    session.handle_event(connected("dev1")).await;
    session
        .handle_event(services("dev1", vec![PROVISIONING_SERVICE_UUID]))
        .await;
    session
        .handle_event(characteristics(
            "dev1",
            vec![ssid_handle(), password_handle()],
        ))
        .await;
}

/// Everything currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
