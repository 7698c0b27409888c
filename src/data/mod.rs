//! Data structures exchanged with the session.
//!
//! This module contains the discovered-device record and the Wi-Fi
//! credentials written to the peripheral.

pub mod credentials;
pub mod device;

pub use credentials::{CredentialField, WifiCredentials};
pub use device::Device;
