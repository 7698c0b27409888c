//! Session configuration.

use std::time::Duration;

use crate::ble::uuids::ServiceDescriptor;

/// Tunables for a [`ProvisioningSession`](crate::ProvisioningSession).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wifi_provision_ble::SessionConfig;
///
/// let config = SessionConfig::default()
///     .with_max_write_len(185)
///     .with_operation_timeout(Some(Duration::from_secs(5)));
/// assert_eq!(config.max_write_len, 185);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// GATT layout to scan for and write to.
    pub descriptor: ServiceDescriptor,

    /// Largest credential payload, in bytes, a single write may carry.
    pub max_write_len: usize,

    /// How long to wait for each transport callback before failing with
    /// [`Failure::Timeout`](crate::Failure::Timeout). `None` waits forever.
    pub operation_timeout: Option<Duration>,

    /// Capacity of the session event channel.
    pub event_capacity: usize,
}

impl SessionConfig {
    /// Default maximum write payload (the ATT attribute value limit).
    pub const DEFAULT_MAX_WRITE_LEN: usize = 512;

    /// Default per-operation timeout (10 seconds).
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default event channel capacity.
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;

    /// Use a different GATT layout.
    pub fn with_descriptor(mut self, descriptor: ServiceDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Set the maximum write payload.
    pub fn with_max_write_len(mut self, max_write_len: usize) -> Self {
        self.max_write_len = max_write_len;
        self
    }

    /// Set or disable the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the event channel capacity. Zero is raised to one.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            descriptor: ServiceDescriptor::WIFI_PROVISIONING,
            max_write_len: Self::DEFAULT_MAX_WRITE_LEN,
            operation_timeout: Some(Self::DEFAULT_OPERATION_TIMEOUT),
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}
