//! Wi-Fi credentials and their validation.
//!
//! Credentials are sent as raw UTF-8 bytes with no framing, length prefix,
//! or checksum, so the only checks possible are done here before any write
//! is attempted.

use crate::error::{Error, Result};

/// One of the two credential characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CredentialField {
    /// Network name.
    Ssid,
    /// Network passphrase.
    Password,
}

impl CredentialField {
    /// Fields in the order they are written.
    pub const WRITE_ORDER: [CredentialField; 2] = [Self::Ssid, Self::Password];
}

impl std::fmt::Display for CredentialField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssid => write!(f, "SSID"),
            Self::Password => write!(f, "Password"),
        }
    }
}

/// Credentials for the network the peripheral should join.
///
/// The `Debug` output never includes the password.
#[derive(Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    ssid: String,
    password: String,
}

impl WifiCredentials {
    /// Create credentials without validating them.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// The network name.
    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// The passphrase. Empty for open networks.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// The bytes written to the characteristic for `field`.
    pub fn payload(&self, field: CredentialField) -> &[u8] {
        match field {
            CredentialField::Ssid => self.ssid.as_bytes(),
            CredentialField::Password => self.password.as_bytes(),
        }
    }

    /// Check the credentials against the transport's write limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the SSID is empty or either
    /// encoded value is longer than `max_write_len` bytes.
    pub fn validate(&self, max_write_len: usize) -> Result<()> {
        if self.ssid.is_empty() {
            return Err(Error::InvalidInput {
                field: CredentialField::Ssid,
                reason: "must not be empty".to_string(),
            });
        }

        for field in CredentialField::WRITE_ORDER {
            let len = self.payload(field).len();
            if len > max_write_len {
                return Err(Error::InvalidInput {
                    field,
                    reason: format!(
                        "encodes to {} bytes, maximum write is {} bytes",
                        len, max_write_len
                    ),
                });
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}
