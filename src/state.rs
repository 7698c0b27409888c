//! Session states and terminal failure records.

use thiserror::Error;

use crate::data::CredentialField;

/// Where a provisioning session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Scanning for peripherals advertising the provisioning service.
    Scanning,
    /// Waiting for the selected peripheral to connect.
    Connecting,
    /// Discovering the provisioning service and its characteristics.
    Discovering,
    /// Both credential characteristics resolved; ready to send.
    Ready,
    /// Writing credentials.
    Writing,
    /// Both credentials were written and confirmed.
    Succeeded,
    /// Provisioning failed; see the session's last failure.
    Failed,
}

impl SessionState {
    /// Check if the session has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Check if a target device is selected in this state.
    pub fn has_target(&self) -> bool {
        !matches!(self, Self::Idle | Self::Scanning)
    }

    /// Check if the credential characteristics are resolved in this state.
    pub fn has_characteristics(&self) -> bool {
        matches!(self, Self::Ready | Self::Writing | Self::Succeeded)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Writing => write!(f, "Writing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A transport operation the session is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation {
    /// Connecting to the target.
    Connect,
    /// Discovering the provisioning service.
    DiscoverServices,
    /// Discovering the credential characteristics.
    DiscoverCharacteristics,
    /// Writing one credential.
    Write(CredentialField),
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::DiscoverCharacteristics => write!(f, "characteristic discovery"),
            Self::Write(field) => write!(f, "{} write", field),
        }
    }
}

/// Why a session ended in [`SessionState::Failed`].
///
/// None of these are retried by the session. Call
/// [`reset`](crate::ProvisioningSession::reset) and start again to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Failure {
    /// The peripheral could not be connected.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description reported by the transport.
        reason: String,
    },

    /// The peripheral does not expose the provisioning service.
    #[error("Provisioning service not found")]
    ServiceNotFound,

    /// A credential characteristic is missing from the provisioning service.
    #[error("{0} characteristic not found")]
    CharacteristicNotFound(CredentialField),

    /// The peripheral rejected a credential write.
    #[error("Write to {0} characteristic failed")]
    WriteFailed(CredentialField),

    /// The peripheral disconnected unexpectedly.
    #[error("Peripheral disconnected")]
    Disconnected,

    /// No callback arrived for an operation within the configured timeout.
    #[error("Timed out waiting for {0}")]
    Timeout(Operation),
}
