//! BLE Service and Characteristic UUIDs.
//!
//! These values are shared with the peripheral firmware and must match it
//! bit-for-bit.

use uuid::Uuid;

use crate::data::CredentialField;

/// Wi-Fi provisioning service UUID.
pub const PROVISIONING_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xa0a8e453_562a_49a3_a2e4_29a8e88b0e9b);
/// SSID characteristic UUID (Write).
pub const SSID_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xb1b0ac35_a253_4258_a5a5_a2a6a928b03b);
/// Password characteristic UUID (Write).
pub const PASSWORD_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xc2c1bd48_b363_4369_b2b9_b3b8b5b6b4b3);

/// Local name advertised by the reference Raspberry Pi peripheral.
pub const DEFAULT_PERIPHERAL_NAME: &str = "PiZero-WiFi-Setup";

/// The GATT layout of a provisioning peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    /// Service advertised by the peripheral and used as the scan filter.
    pub service: Uuid,
    /// Characteristic receiving the SSID.
    pub ssid: Uuid,
    /// Characteristic receiving the password.
    pub password: Uuid,
}

impl ServiceDescriptor {
    /// The standard Wi-Fi provisioning service.
    pub const WIFI_PROVISIONING: ServiceDescriptor = ServiceDescriptor {
        service: PROVISIONING_SERVICE_UUID,
        ssid: SSID_CHARACTERISTIC_UUID,
        password: PASSWORD_CHARACTERISTIC_UUID,
    };

    /// UUID of the characteristic for `field`.
    pub fn characteristic(&self, field: CredentialField) -> Uuid {
        match field {
            CredentialField::Ssid => self.ssid,
            CredentialField::Password => self.password,
        }
    }

    /// Both characteristic UUIDs, in write order.
    pub fn characteristics(&self) -> [Uuid; 2] {
        [self.ssid, self.password]
    }
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self::WIFI_PROVISIONING
    }
}
