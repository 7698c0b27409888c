//! Error types for the wifi-provision-ble crate.

use thiserror::Error;

use crate::data::CredentialField;
use crate::state::{Failure, SessionState};

/// The main error type for this crate.
///
/// These are the errors returned directly from session operations. Failures
/// of the provisioning flow itself (connection, discovery, writes) are
/// recorded as a [`Failure`] on the session and only surface here through
/// [`Error::Provisioning`].
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The operation is not allowed in the session's current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was requested.
        operation: &'static str,
        /// The state the session was in.
        state: SessionState,
    },

    /// The identifier does not belong to any discovered device.
    #[error("Unknown device: {identifier}")]
    UnknownDevice {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// A credential value was rejected before anything was written.
    #[error("Invalid {field}: {reason}")]
    InvalidInput {
        /// The credential that failed validation.
        field: CredentialField,
        /// Why it was rejected.
        reason: String,
    },

    /// The transport refused to issue a command.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the rejection.
        reason: String,
    },

    /// Provisioning ended in a terminal failure.
    #[error("Provisioning failed: {0}")]
    Provisioning(#[from] Failure),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::Transport`] from anything printable.
    pub fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            reason: reason.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = Error::InvalidState {
            operation: "send credentials",
            state: SessionState::Scanning,
        };
        assert_eq!(err.to_string(), "Cannot send credentials while Scanning");
    }

    #[test]
    fn test_provisioning_from_failure() {
        let err: Error = Failure::WriteFailed(CredentialField::Password).into();
        assert!(matches!(
            err,
            Error::Provisioning(Failure::WriteFailed(CredentialField::Password))
        ));
        assert_eq!(
            err.to_string(),
            "Provisioning failed: Write to Password characteristic failed"
        );
    }
}
