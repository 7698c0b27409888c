// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # wifi-provision-ble
//!
//! Controller-side Wi-Fi provisioning over Bluetooth Low Energy.
//!
//! A headless peripheral advertises a provisioning GATT service with two
//! writable characteristics, one for the SSID and one for the password.
//! This crate scans for that service, connects to the device the user picks,
//! resolves both characteristics and writes the credentials, SSID first.
//!
//! ## Features
//!
//! - **Explicit state machine**: `Idle → Scanning → Connecting → Discovering →
//!   Ready → Writing → Succeeded`, with `Failed` on any error
//! - **Event stream**: device discoveries, state changes and the final
//!   outcome, delivered in order
//! - **Stale callback protection**: late callbacks after a reset or from
//!   another peripheral are ignored
//! - **Watchdog**: configurable per-operation timeout for stacks that drop
//!   requests silently
//! - **Pluggable transport**: btleplug out of the box, or any [`Transport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wifi_provision_ble::{
//!     BtleplugTransport, ProvisioningSession, Result, SessionConfig, SessionState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (transport, events) = BtleplugTransport::new().await?;
//!     let session = ProvisioningSession::new(Arc::new(transport), SessionConfig::default());
//!     let _pump = session.spawn_event_pump(events);
//!
//!     session.start().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     let device = session.discovered_devices().into_iter().next();
//!     if let Some(device) = device {
//!         session.select_device(&device.identifier).await?;
//!
//!         // Wait for service and characteristic discovery.
//!         while session.current_state() != SessionState::Ready {
//!             if session.current_state() == SessionState::Failed {
//!                 break;
//!             }
//!             tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!         }
//!
//!         session.send_credentials("MyWifi", "secret123").await?;
//!         session.wait_for_outcome().await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod session;
pub mod state;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use session::{CallbackHandle, ProvisioningSession, SessionEvent};
pub use state::{Failure, Operation, SessionState};

pub use ble::{
    BtleplugTransport, CharacteristicHandle, ServiceDescriptor, Transport, TransportEvent,
    TransportEvents, DEFAULT_PERIPHERAL_NAME, PASSWORD_CHARACTERISTIC_UUID,
    PROVISIONING_SERVICE_UUID, SSID_CHARACTERISTIC_UUID,
};
pub use data::{CredentialField, Device, WifiCredentials};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_public_exports() {
        let transport = std::sync::Arc::new(ble::transport::MockTransport::new());
        let session = ProvisioningSession::new(transport, SessionConfig::default());

        assert_eq!(session.current_state(), SessionState::Idle);
        assert!(session.discovered_devices().is_empty());
        assert!(matches!(
            session.wait_for_outcome().await,
            Err(Error::InvalidState {
                state: SessionState::Idle,
                ..
            })
        ));

        let descriptor = ServiceDescriptor::default();
        assert_eq!(descriptor.service, PROVISIONING_SERVICE_UUID);
        assert_eq!(
            descriptor.characteristic(CredentialField::Ssid),
            SSID_CHARACTERISTIC_UUID
        );
        assert_eq!(
            descriptor.characteristic(CredentialField::Password),
            PASSWORD_CHARACTERISTIC_UUID
        );
    }
}
