//! Discovered peripheral records.

/// A peripheral seen while scanning for the provisioning service.
///
/// Devices are created from the first discovery callback for an identifier
/// and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    /// Opaque handle assigned by the transport.
    ///
    /// Unique per peripheral for the lifetime of the process, not
    /// necessarily across OS restarts.
    pub identifier: String,

    /// Advertised local name, if the peripheral sent one.
    pub display_name: Option<String>,
}

impl Device {
    /// Create a new device record.
    pub fn new(identifier: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name,
        }
    }

    /// Name to show a user, falling back to `"Unknown Device"`.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unknown Device")
    }

    /// Check whether the name or identifier contains `pattern`.
    pub fn matches(&self, pattern: &str) -> bool {
        self.identifier.contains(pattern)
            || self
                .display_name
                .as_deref()
                .map(|n| n.contains(pattern))
                .unwrap_or(false)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label(), self.identifier)
    }
}
