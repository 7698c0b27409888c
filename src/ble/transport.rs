//! The seam between the provisioning session and a BLE stack.
//!
//! A [`Transport`] only *issues* commands. Every command that has a result
//! reports it later as a [`TransportEvent`], delivered to
//! [`ProvisioningSession::handle_event`](crate::ProvisioningSession::handle_event)
//! from whatever task or thread the stack calls back on.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Opaque reference to a GATT characteristic on a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Service the characteristic belongs to.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

impl CharacteristicHandle {
    /// Create a new handle.
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

/// Callback from the BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peripheral matching the scan filter was seen.
    DeviceDiscovered {
        /// Transport identifier of the peripheral.
        identifier: String,
        /// Advertised local name.
        name: Option<String>,
    },
    /// A connection attempt completed.
    Connected {
        /// Transport identifier of the peripheral.
        identifier: String,
    },
    /// A connection attempt failed.
    ConnectFailed {
        /// Transport identifier of the peripheral.
        identifier: String,
        /// Description of the failure.
        reason: String,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Transport identifier of the peripheral.
        identifier: String,
        /// UUIDs of the services found.
        services: Vec<Uuid>,
    },
    /// Characteristic discovery completed for one service.
    CharacteristicsDiscovered {
        /// Transport identifier of the peripheral.
        identifier: String,
        /// Service whose characteristics were discovered.
        service: Uuid,
        /// Characteristics found.
        characteristics: Vec<CharacteristicHandle>,
    },
    /// A confirmed write completed.
    WriteCompleted {
        /// Transport identifier of the peripheral.
        identifier: String,
        /// The characteristic that was written.
        characteristic: CharacteristicHandle,
        /// Whether the peripheral acknowledged the write.
        success: bool,
    },
    /// The link to a peripheral went down.
    Disconnected {
        /// Transport identifier of the peripheral.
        identifier: String,
        /// Whether the disconnect was asked for with [`Transport::disconnect`].
        was_requested: bool,
    },
    /// An outstanding discovery or write failed without a specific callback.
    OperationFailed {
        /// Transport identifier of the peripheral.
        identifier: String,
        /// Description of the failure.
        reason: String,
    },
}

impl TransportEvent {
    /// Identifier of the peripheral the event is about.
    pub fn identifier(&self) -> &str {
        match self {
            Self::DeviceDiscovered { identifier, .. }
            | Self::Connected { identifier }
            | Self::ConnectFailed { identifier, .. }
            | Self::ServicesDiscovered { identifier, .. }
            | Self::CharacteristicsDiscovered { identifier, .. }
            | Self::WriteCompleted { identifier, .. }
            | Self::Disconnected { identifier, .. }
            | Self::OperationFailed { identifier, .. } => identifier,
        }
    }
}

/// Commands the session issues to a BLE central.
///
/// Implementations must return promptly and must not deliver events
/// synchronously from inside these calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning for peripherals advertising `service`.
    async fn start_scan(&self, service: Uuid) -> Result<()>;

    /// Stop an active scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peripheral.
    async fn connect(&self, identifier: &str) -> Result<()>;

    /// Disconnect from, or cancel a pending connection to, a peripheral.
    async fn disconnect(&self, identifier: &str) -> Result<()>;

    /// Discover services, restricted to `uuids` when non-empty.
    async fn discover_services(&self, identifier: &str, uuids: &[Uuid]) -> Result<()>;

    /// Discover the characteristics of `service`, restricted to `uuids` when non-empty.
    async fn discover_characteristics(
        &self,
        identifier: &str,
        service: Uuid,
        uuids: &[Uuid],
    ) -> Result<()>;

    /// Write `data` to a characteristic.
    async fn write_characteristic(
        &self,
        identifier: &str,
        characteristic: CharacteristicHandle,
        data: &[u8],
        confirmed: bool,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_identifier() {
        let event = TransportEvent::WriteCompleted {
            identifier: "dev1".to_string(),
            characteristic: CharacteristicHandle::new(Uuid::nil(), Uuid::nil()),
            success: true,
        };
        assert_eq!(event.identifier(), "dev1");

        let event = TransportEvent::Disconnected {
            identifier: "dev2".to_string(),
            was_requested: false,
        };
        assert_eq!(event.identifier(), "dev2");
    }
}
