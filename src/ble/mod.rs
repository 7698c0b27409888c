//! BLE communication module.
//!
//! The session talks to a BLE stack only through the [`Transport`] trait.
//! [`BtleplugTransport`] is the native implementation; tests and embedders
//! can provide their own.

pub mod central;
pub mod transport;
pub mod uuids;

pub use central::{BtleplugTransport, TransportEvents};
pub use transport::{CharacteristicHandle, Transport, TransportEvent};
pub use uuids::*;
