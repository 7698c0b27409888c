//! The provisioning state machine.
//!
//! A [`ProvisioningSession`] drives one peripheral through
//! scan → connect → service discovery → characteristic discovery →
//! SSID write → password write. Every state mutation happens behind a
//! single async mutex, so API calls and transport callbacks never interleave
//! a transition. Each transport request is stamped with the session epoch
//! and a sequence number; callbacks and watchdogs that do not match the
//! outstanding stamp are discarded.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{CharacteristicHandle, Transport, TransportEvent};
use crate::config::SessionConfig;
use crate::data::{CredentialField, Device, WifiCredentials};
use crate::error::{Error, Result};
use crate::state::{Failure, Operation, SessionState};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// High-level event for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new peripheral was discovered while scanning.
    DeviceFound(Device),
    /// The session moved to a new state.
    StatusChanged(SessionState),
    /// Both credentials were written and acknowledged.
    ProvisioningSucceeded,
    /// The session failed.
    ProvisioningFailed(Failure),
}

/// Both credential characteristics, resolved on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResolvedCharacteristics {
    ssid: CharacteristicHandle,
    password: CharacteristicHandle,
}

impl ResolvedCharacteristics {
    fn handle(&self, field: CredentialField) -> CharacteristicHandle {
        match field {
            CredentialField::Ssid => self.ssid,
            CredentialField::Password => self.password,
        }
    }
}

/// Stamp identifying one outstanding transport request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    epoch: u64,
    sequence: u64,
    operation: Operation,
}

struct SessionInner {
    state: SessionState,
    discovered: Vec<Device>,
    target: Option<Device>,
    resolved: Option<ResolvedCharacteristics>,
    last_failure: Option<Failure>,
    /// Bumped by every reset.
    epoch: u64,
    sequence: u64,
    pending: Option<Ticket>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
    /// Held only between the SSID and password writes.
    credentials: Option<WifiCredentials>,
    /// Whether the transport reported the target connected.
    link_up: bool,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            discovered: Vec::new(),
            target: None,
            resolved: None,
            last_failure: None,
            epoch: 0,
            sequence: 0,
            pending: None,
            watchdog: None,
            credentials: None,
            link_up: false,
        }
    }

    fn target_id(&self) -> Option<&str> {
        self.target.as_ref().map(|d| d.identifier.as_str())
    }

    /// Drop the outstanding request and its watchdog.
    fn clear_pending(&mut self) {
        self.pending = None;
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

/// Map a failed step onto the failure it causes.
fn failure_for(operation: Operation, reason: String) -> Failure {
    match operation {
        Operation::Connect => Failure::ConnectFailed { reason },
        Operation::DiscoverServices => Failure::ServiceNotFound,
        Operation::DiscoverCharacteristics => {
            Failure::CharacteristicNotFound(CredentialField::Ssid)
        }
        Operation::Write(field) => Failure::WriteFailed(field),
    }
}

/// Controller-side Wi-Fi provisioning session.
///
/// Cloning is cheap; clones share the same session.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wifi_provision_ble::{BtleplugTransport, ProvisioningSession, Result, SessionConfig};
///
/// # async fn run() -> Result<()> {
/// let (transport, events) = BtleplugTransport::new().await?;
/// let session = ProvisioningSession::new(Arc::new(transport), SessionConfig::default());
/// let _pump = session.spawn_event_pump(events);
///
/// session.start().await?;
/// tokio::time::sleep(std::time::Duration::from_secs(5)).await;
///
/// if let Some(device) = session.discovered_devices().first() {
///     session.select_device(&device.identifier).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProvisioningSession {
    transport: Arc<dyn Transport>,
    config: Arc<SessionConfig>,
    inner: Arc<RwLock<SessionInner>>,
    /// Serializes transitions, including the transport calls they issue.
    serial: Arc<tokio::sync::Mutex<()>>,
    event_tx: broadcast::Sender<SessionEvent>,
    callback_counter: Arc<AtomicU64>,
}

impl ProvisioningSession {
    /// Create an idle session on top of `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            transport,
            config: Arc::new(config),
            inner: Arc::new(RwLock::new(SessionInner::new())),
            serial: Arc::new(tokio::sync::Mutex::new(())),
            event_tx,
            callback_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    // === Accessors ===

    /// Get the current state.
    pub fn current_state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Devices discovered since the last scan started, in first-seen order.
    pub fn discovered_devices(&self) -> Vec<Device> {
        self.inner.read().discovered.clone()
    }

    /// Why the session failed, if it did.
    pub fn last_failure(&self) -> Option<Failure> {
        self.inner.read().last_failure.clone()
    }

    /// The device selected for provisioning.
    pub fn target(&self) -> Option<Device> {
        self.inner.read().target.clone()
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // === Events ===

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for session events.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event callback lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Forward transport callbacks from `events` into the session.
    pub fn spawn_event_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let session = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_event(event).await;
            }
            debug!("Transport event pump stopped");
        })
    }

    /// Wait until the session succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provisioning`] with the failure if the session
    /// fails, or [`Error::InvalidState`] if it is (or is reset to) `Idle`.
    pub async fn wait_for_outcome(&self) -> Result<()> {
        let mut rx = self.subscribe();

        loop {
            {
                let inner = self.inner.read();
                match inner.state {
                    SessionState::Succeeded => return Ok(()),
                    SessionState::Failed => {
                        return Err(inner
                            .last_failure
                            .clone()
                            .map(Error::Provisioning)
                            .unwrap_or_else(|| {
                                Error::Internal("failed without a failure record".to_string())
                            }));
                    }
                    SessionState::Idle => {
                        return Err(Error::InvalidState {
                            operation: "wait for outcome",
                            state: SessionState::Idle,
                        });
                    }
                    _ => {}
                }
            }

            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Internal("session event channel closed".to_string()));
                }
            }
        }
    }

    // === Operations ===

    /// Start scanning for provisioning peripherals.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is `Idle`, or the
    /// transport's error if it cannot start scanning. The session stays
    /// `Idle` on error.
    pub async fn start(&self) -> Result<()> {
        let _serial = self.serial.lock().await;

        {
            let inner = self.inner.read();
            if inner.state != SessionState::Idle {
                return Err(Error::InvalidState {
                    operation: "start scanning",
                    state: inner.state,
                });
            }
        }

        self.transport
            .start_scan(self.config.descriptor.service)
            .await?;

        let mut inner = self.inner.write();
        inner.discovered.clear();
        self.set_state(&mut inner, SessionState::Scanning);

        Ok(())
    }

    /// Restart the scan, forgetting every device discovered so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is `Scanning`.
    pub async fn rescan(&self) -> Result<()> {
        let _serial = self.serial.lock().await;

        {
            let mut inner = self.inner.write();
            if inner.state != SessionState::Scanning {
                return Err(Error::InvalidState {
                    operation: "rescan",
                    state: inner.state,
                });
            }
            inner.discovered.clear();
        }

        info!("Restarting scan");

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan before rescanning: {}", e);
        }

        if let Err(e) = self
            .transport
            .start_scan(self.config.descriptor.service)
            .await
        {
            let mut inner = self.inner.write();
            self.set_state(&mut inner, SessionState::Idle);
            return Err(e);
        }

        Ok(())
    }

    /// Stop scanning and connect to a discovered device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDevice`] if `identifier` was not discovered,
    /// or [`Error::InvalidState`] unless the session is `Scanning`.
    pub async fn select_device(&self, identifier: &str) -> Result<()> {
        let _serial = self.serial.lock().await;

        let device = {
            let inner = self.inner.read();
            let device = inner
                .discovered
                .iter()
                .find(|d| d.identifier == identifier)
                .cloned()
                .ok_or_else(|| Error::UnknownDevice {
                    identifier: identifier.to_string(),
                })?;

            if inner.state != SessionState::Scanning {
                return Err(Error::InvalidState {
                    operation: "select a device",
                    state: inner.state,
                });
            }

            device
        };

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let ticket = {
            let mut inner = self.inner.write();
            inner.target = Some(device.clone());
            inner.link_up = false;
            self.set_state(&mut inner, SessionState::Connecting);
            self.begin(&mut inner, Operation::Connect)
        };

        info!("Connecting to {}", device);

        if let Err(e) = self.transport.connect(&device.identifier).await {
            self.reject(ticket, e);
        }

        Ok(())
    }

    /// Write Wi-Fi credentials to the target.
    ///
    /// The SSID is written first; the password is only written once the SSID
    /// write is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the SSID is empty or either value
    /// is longer than [`SessionConfig::max_write_len`] bytes, or
    /// [`Error::InvalidState`] unless the session is `Ready`. Nothing is sent
    /// to the transport in either case.
    pub async fn send_credentials(&self, ssid: &str, password: &str) -> Result<()> {
        let credentials = WifiCredentials::new(ssid, password);
        credentials.validate(self.config.max_write_len)?;

        let _serial = self.serial.lock().await;

        let (ticket, identifier, handle, payload) = {
            let mut inner = self.inner.write();
            if inner.state != SessionState::Ready {
                return Err(Error::InvalidState {
                    operation: "send credentials",
                    state: inner.state,
                });
            }

            let (identifier, resolved) = match (inner.target_id(), inner.resolved) {
                (Some(identifier), Some(resolved)) => (identifier.to_string(), resolved),
                _ => {
                    return Err(Error::Internal(
                        "ready without resolved characteristics".to_string(),
                    ))
                }
            };

            let payload = credentials.payload(CredentialField::Ssid).to_vec();
            inner.credentials = Some(credentials);
            self.set_state(&mut inner, SessionState::Writing);
            let ticket = self.begin(&mut inner, Operation::Write(CredentialField::Ssid));

            (ticket, identifier, resolved.ssid, payload)
        };

        self.issue_write(ticket, &identifier, handle, payload).await;

        Ok(())
    }

    /// Return to `Idle` from any state.
    ///
    /// Stops an active scan and discards every outstanding request so that
    /// late callbacks are ignored. If a device was selected, it is
    /// disconnected even after a failure, since an abandoned connection
    /// attempt may still have completed.
    pub async fn reset(&self) {
        let _serial = self.serial.lock().await;

        let (was_scanning, disconnect) = {
            let mut inner = self.inner.write();
            inner.clear_pending();
            inner.epoch += 1;

            let was_scanning = inner.state == SessionState::Scanning;
            // A connect abandoned by a timeout or failure may still complete.
            let disconnect = if inner.link_up || inner.state.has_target() {
                inner.target_id().map(str::to_string)
            } else {
                None
            };

            inner.discovered.clear();
            inner.target = None;
            inner.resolved = None;
            inner.last_failure = None;
            inner.credentials = None;
            inner.link_up = false;

            debug!("Session reset, epoch {}", inner.epoch);
            self.set_state(&mut inner, SessionState::Idle);

            (was_scanning, disconnect)
        };

        if was_scanning {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan during reset: {}", e);
            }
        }

        if let Some(identifier) = disconnect {
            if let Err(e) = self.transport.disconnect(&identifier).await {
                warn!("Failed to disconnect from {} during reset: {}", identifier, e);
            }
        }
    }

    // === Transport callbacks ===

    /// Apply a transport callback.
    ///
    /// Callbacks that do not match the outstanding request, the current
    /// target, or the current state are ignored.
    pub async fn handle_event(&self, event: TransportEvent) {
        let _serial = self.serial.lock().await;

        trace!("Transport event: {:?}", event);

        match event {
            TransportEvent::DeviceDiscovered { identifier, name } => {
                self.on_device_discovered(identifier, name);
            }
            TransportEvent::Connected { identifier } => {
                self.on_connected(&identifier).await;
            }
            TransportEvent::ConnectFailed { identifier, reason } => {
                let mut inner = self.inner.write();
                if self.expect(&inner, &identifier, Operation::Connect) {
                    self.fail(&mut inner, Failure::ConnectFailed { reason });
                }
            }
            TransportEvent::ServicesDiscovered {
                identifier,
                services,
            } => {
                self.on_services_discovered(&identifier, &services).await;
            }
            TransportEvent::CharacteristicsDiscovered {
                identifier,
                service,
                characteristics,
            } => {
                self.on_characteristics_discovered(&identifier, service, &characteristics);
            }
            TransportEvent::WriteCompleted {
                identifier,
                characteristic,
                success,
            } => {
                self.on_write_completed(&identifier, characteristic, success)
                    .await;
            }
            TransportEvent::Disconnected {
                identifier,
                was_requested,
            } => {
                self.on_disconnected(&identifier, was_requested);
            }
            TransportEvent::OperationFailed { identifier, reason } => {
                let mut inner = self.inner.write();
                let pending = match inner.pending {
                    Some(ticket) if inner.target_id() == Some(identifier.as_str()) => ticket,
                    _ => {
                        debug!("Discarding stale failure from {}: {}", identifier, reason);
                        return;
                    }
                };
                warn!("{} failed: {}", pending.operation, reason);
                self.fail(&mut inner, failure_for(pending.operation, reason));
            }
        }
    }

    fn on_device_discovered(&self, identifier: String, name: Option<String>) {
        let mut inner = self.inner.write();

        if inner.state != SessionState::Scanning {
            debug!("Ignoring discovery of {} while {}", identifier, inner.state);
            return;
        }

        if inner.discovered.iter().any(|d| d.identifier == identifier) {
            trace!("Already discovered {}", identifier);
            return;
        }

        let device = Device::new(identifier, name);
        info!("Discovered {}", device);

        inner.discovered.push(device.clone());
        self.emit(SessionEvent::DeviceFound(device));
    }

    async fn on_connected(&self, identifier: &str) {
        let service = self.config.descriptor.service;

        let ticket = {
            let mut inner = self.inner.write();
            if inner.target_id() == Some(identifier) {
                inner.link_up = true;
            }
            if !self.expect(&inner, identifier, Operation::Connect) {
                return;
            }

            info!("Connected to {}, discovering services", identifier);
            self.set_state(&mut inner, SessionState::Discovering);
            self.begin(&mut inner, Operation::DiscoverServices)
        };

        if let Err(e) = self.transport.discover_services(identifier, &[service]).await {
            self.reject(ticket, e);
        }
    }

    async fn on_services_discovered(&self, identifier: &str, services: &[Uuid]) {
        let descriptor = self.config.descriptor;

        let ticket = {
            let mut inner = self.inner.write();
            if !self.expect(&inner, identifier, Operation::DiscoverServices) {
                return;
            }

            if !services.contains(&descriptor.service) {
                self.fail(&mut inner, Failure::ServiceNotFound);
                return;
            }

            debug!("Provisioning service found on {}", identifier);
            self.begin(&mut inner, Operation::DiscoverCharacteristics)
        };

        if let Err(e) = self
            .transport
            .discover_characteristics(identifier, descriptor.service, &descriptor.characteristics())
            .await
        {
            self.reject(ticket, e);
        }
    }

    fn on_characteristics_discovered(
        &self,
        identifier: &str,
        service: Uuid,
        characteristics: &[CharacteristicHandle],
    ) {
        let descriptor = self.config.descriptor;
        let mut inner = self.inner.write();

        if !self.expect(&inner, identifier, Operation::DiscoverCharacteristics) {
            return;
        }

        if service != descriptor.service {
            debug!("Ignoring characteristics of unrelated service {}", service);
            return;
        }

        let find = |field: CredentialField| {
            let uuid = descriptor.characteristic(field);
            characteristics.iter().copied().find(|c| c.uuid == uuid)
        };

        let resolved = match (find(CredentialField::Ssid), find(CredentialField::Password)) {
            (Some(ssid), Some(password)) => ResolvedCharacteristics { ssid, password },
            (None, _) => {
                self.fail(
                    &mut inner,
                    Failure::CharacteristicNotFound(CredentialField::Ssid),
                );
                return;
            }
            (_, None) => {
                self.fail(
                    &mut inner,
                    Failure::CharacteristicNotFound(CredentialField::Password),
                );
                return;
            }
        };

        inner.clear_pending();
        inner.resolved = Some(resolved);
        info!("{} is ready for credentials", identifier);
        self.set_state(&mut inner, SessionState::Ready);
    }

    async fn on_write_completed(
        &self,
        identifier: &str,
        characteristic: CharacteristicHandle,
        success: bool,
    ) {
        let next = {
            let mut inner = self.inner.write();

            let field = match inner.pending {
                Some(Ticket {
                    operation: Operation::Write(field),
                    ..
                }) => field,
                _ => {
                    debug!("Discarding stale write completion from {}", identifier);
                    return;
                }
            };

            let matches = inner.target_id() == Some(identifier)
                && inner.resolved.map(|r| r.handle(field)) == Some(characteristic);
            if !matches {
                debug!(
                    "Discarding write completion for {} on {}",
                    characteristic.uuid, identifier
                );
                return;
            }

            if !success {
                self.fail(&mut inner, Failure::WriteFailed(field));
                return;
            }

            debug!("{} write acknowledged", field);

            match field {
                CredentialField::Ssid => {
                    let payload = inner
                        .credentials
                        .as_ref()
                        .map(|c| c.payload(CredentialField::Password).to_vec())
                        .unwrap_or_default();
                    let handle = inner.resolved.map(|r| r.password);
                    let ticket = self.begin(&mut inner, Operation::Write(CredentialField::Password));
                    handle.map(|handle| (ticket, handle, payload))
                }
                CredentialField::Password => {
                    inner.clear_pending();
                    inner.credentials = None;
                    info!("Provisioned {}", identifier);
                    self.set_state(&mut inner, SessionState::Succeeded);
                    self.emit(SessionEvent::ProvisioningSucceeded);
                    None
                }
            }
        };

        if let Some((ticket, handle, payload)) = next {
            self.issue_write(ticket, identifier, handle, payload).await;
        }
    }

    fn on_disconnected(&self, identifier: &str, was_requested: bool) {
        let mut inner = self.inner.write();

        if inner.target_id() != Some(identifier) {
            debug!("Ignoring disconnect of {}", identifier);
            return;
        }

        inner.link_up = false;

        if was_requested {
            debug!("Requested disconnect of {} completed", identifier);
            return;
        }

        if inner.state.is_terminal() {
            debug!("{} disconnected while {}", identifier, inner.state);
            return;
        }

        warn!("{} disconnected unexpectedly", identifier);
        self.fail(&mut inner, Failure::Disconnected);
    }

    // === Internal ===

    /// Check that a callback answers the outstanding request.
    fn expect(&self, inner: &SessionInner, identifier: &str, operation: Operation) -> bool {
        let matches = inner.target_id() == Some(identifier)
            && inner.pending.map(|t| t.operation) == Some(operation);

        if !matches {
            debug!(
                "Discarding stale {} callback from {} (pending: {:?})",
                operation,
                identifier,
                inner.pending.map(|t| t.operation)
            );
        }

        matches
    }

    /// Record a new outstanding request and arm its watchdog.
    fn begin(&self, inner: &mut SessionInner, operation: Operation) -> Ticket {
        inner.clear_pending();
        inner.sequence += 1;

        let ticket = Ticket {
            epoch: inner.epoch,
            sequence: inner.sequence,
            operation,
        };
        inner.pending = Some(ticket);

        if let Some(timeout) = self.config.operation_timeout {
            let session = self.clone();
            inner.watchdog = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                session.expire(ticket).await;
            }));
        }

        ticket
    }

    /// Fail the session if `ticket` is still outstanding after its timeout.
    async fn expire(&self, ticket: Ticket) {
        let _serial = self.serial.lock().await;
        let mut inner = self.inner.write();

        if inner.pending != Some(ticket) {
            return;
        }

        // This task is the watchdog; detach rather than abort it.
        inner.watchdog = None;
        warn!(
            "Timed out waiting for {} (epoch {}, request {})",
            ticket.operation, ticket.epoch, ticket.sequence
        );
        self.fail(&mut inner, Failure::Timeout(ticket.operation));
    }

    /// Fail the session because the transport refused the request for `ticket`.
    fn reject(&self, ticket: Ticket, error: Error) {
        let mut inner = self.inner.write();

        if inner.pending != Some(ticket) {
            return;
        }

        warn!("Transport refused {}: {}", ticket.operation, error);
        self.fail(&mut inner, failure_for(ticket.operation, error.to_string()));
    }

    async fn issue_write(
        &self,
        ticket: Ticket,
        identifier: &str,
        handle: CharacteristicHandle,
        payload: Vec<u8>,
    ) {
        debug!(
            "Writing {} bytes for {} to {}",
            payload.len(),
            ticket.operation,
            identifier
        );

        if let Err(e) = self
            .transport
            .write_characteristic(identifier, handle, &payload, true)
            .await
        {
            self.reject(ticket, e);
        }
    }

    fn fail(&self, inner: &mut SessionInner, failure: Failure) {
        warn!("Provisioning failed: {}", failure);

        inner.clear_pending();
        inner.resolved = None;
        inner.credentials = None;
        inner.last_failure = Some(failure.clone());

        self.set_state(inner, SessionState::Failed);
        self.emit(SessionEvent::ProvisioningFailed(failure));
    }

    /// Update the state and emit an event if it changed.
    fn set_state(&self, inner: &mut SessionInner, new_state: SessionState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }

        debug_assert_eq!(new_state.has_target(), inner.target.is_some());
        debug_assert!(!new_state.has_characteristics() || inner.resolved.is_some());

        inner.state = new_state;
        info!("Session state changed: {} -> {}", old_state, new_state);
        self.emit(SessionEvent::StatusChanged(new_state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for ProvisioningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ProvisioningSession")
            .field("state", &inner.state)
            .field("discovered", &inner.discovered.len())
            .field("target", &inner.target)
            .field("last_failure", &inner.last_failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::MockTransport;
    use crate::ble::uuids::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn session_with(mock: MockTransport, config: SessionConfig) -> ProvisioningSession {
        ProvisioningSession::new(Arc::new(mock), config)
    }

    fn ssid_handle() -> CharacteristicHandle {
        CharacteristicHandle::new(PROVISIONING_SERVICE_UUID, SSID_CHARACTERISTIC_UUID)
    }

    fn password_handle() -> CharacteristicHandle {
        CharacteristicHandle::new(PROVISIONING_SERVICE_UUID, PASSWORD_CHARACTERISTIC_UUID)
    }

    async fn discover(session: &ProvisioningSession, identifier: &str) {
        session
            .handle_event(TransportEvent::DeviceDiscovered {
                identifier: identifier.to_string(),
                name: None,
            })
            .await;
    }

    async fn drive_to_ready(session: &ProvisioningSession) {
        session.start().await.unwrap();
        discover(session, "dev1").await;
        session.select_device("dev1").await.unwrap();
        session
            .handle_event(TransportEvent::Connected {
                identifier: "dev1".to_string(),
            })
            .await;
        session
            .handle_event(TransportEvent::ServicesDiscovered {
                identifier: "dev1".to_string(),
                services: vec![PROVISIONING_SERVICE_UUID],
            })
            .await;
        session
            .handle_event(TransportEvent::CharacteristicsDiscovered {
                identifier: "dev1".to_string(),
                service: PROVISIONING_SERVICE_UUID,
                characteristics: vec![ssid_handle(), password_handle()],
            })
            .await;
    }

    fn permissive_mock() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect_start_scan().returning(|_| Ok(()));
        mock.expect_stop_scan().returning(|| Ok(()));
        mock.expect_connect().returning(|_| Ok(()));
        mock.expect_disconnect().returning(|_| Ok(()));
        mock.expect_discover_services().returning(|_, _| Ok(()));
        mock.expect_discover_characteristics()
            .returning(|_, _, _| Ok(()));
        mock
    }

    #[tokio::test]
    async fn test_start_rejected_by_transport_stays_idle() {
        let mut mock = MockTransport::new();
        mock.expect_start_scan()
            .times(1)
            .returning(|_| Err(Error::BluetoothUnavailable));

        let session = session_with(mock, SessionConfig::default());
        let err = session.start().await.unwrap_err();

        assert!(matches!(err, Error::BluetoothUnavailable));
        assert_eq!(session.current_state(), SessionState::Idle);
        assert_eq!(session.last_failure(), None);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let mut mock = MockTransport::new();
        mock.expect_start_scan().times(1).returning(|_| Ok(()));

        let session = session_with(mock, SessionConfig::default());
        session.start().await.unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: SessionState::Scanning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_rejected_fails_session() {
        let mut mock = MockTransport::new();
        mock.expect_start_scan().returning(|_| Ok(()));
        mock.expect_stop_scan().returning(|| Ok(()));
        mock.expect_connect()
            .times(1)
            .returning(|_| Err(Error::transport("radio busy")));

        let session = session_with(mock, SessionConfig::default());
        session.start().await.unwrap();
        discover(&session, "dev1").await;
        session.select_device("dev1").await.unwrap();

        assert_eq!(session.current_state(), SessionState::Failed);
        assert_eq!(
            session.last_failure(),
            Some(Failure::ConnectFailed {
                reason: "Transport error: radio busy".to_string()
            })
        );
        assert_eq!(session.target().map(|d| d.identifier), Some("dev1".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_ssid_write_never_writes_password() {
        let mut mock = permissive_mock();
        mock.expect_write_characteristic()
            .times(1)
            .returning(|_, _, _, _| Err(Error::transport("not connected")));

        let session = session_with(mock, SessionConfig::default());
        drive_to_ready(&session).await;
        assert_eq!(session.current_state(), SessionState::Ready);

        session.send_credentials("MyWifi", "secret123").await.unwrap();

        assert_eq!(session.current_state(), SessionState::Failed);
        assert_eq!(
            session.last_failure(),
            Some(Failure::WriteFailed(CredentialField::Ssid))
        );
    }

    #[tokio::test]
    async fn test_send_credentials_before_ready() {
        let mut mock = MockTransport::new();
        mock.expect_write_characteristic().times(0);

        let session = session_with(mock, SessionConfig::default());
        let err = session.send_credentials("MyWifi", "pw").await.unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidState {
                state: SessionState::Idle,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_watchdog_times_out() {
        let config =
            SessionConfig::default().with_operation_timeout(Some(Duration::from_millis(50)));
        let session = session_with(permissive_mock(), config);
        let mut rx = session.subscribe();

        session.start().await.unwrap();
        discover(&session, "dev1").await;
        session.select_device("dev1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(session.current_state(), SessionState::Failed);
        assert_eq!(
            session.last_failure(),
            Some(Failure::Timeout(Operation::Connect))
        );

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(SessionEvent::ProvisioningFailed(Failure::Timeout(
                Operation::Connect
            )))
        );
    }

    #[tokio::test]
    async fn test_watchdog_cancelled_once_ready() {
        let config =
            SessionConfig::default().with_operation_timeout(Some(Duration::from_millis(50)));
        let session = session_with(permissive_mock(), config);

        drive_to_ready(&session).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(session.current_state(), SessionState::Ready);
        assert_eq!(session.last_failure(), None);
    }

    #[tokio::test]
    async fn test_operation_failed_maps_to_pending_step() {
        let session = session_with(permissive_mock(), SessionConfig::default());

        session.start().await.unwrap();
        discover(&session, "dev1").await;
        session.select_device("dev1").await.unwrap();
        session
            .handle_event(TransportEvent::Connected {
                identifier: "dev1".to_string(),
            })
            .await;
        session
            .handle_event(TransportEvent::OperationFailed {
                identifier: "dev1".to_string(),
                reason: "GATT error".to_string(),
            })
            .await;

        assert_eq!(session.last_failure(), Some(Failure::ServiceNotFound));
    }

    #[tokio::test]
    async fn test_callback_handle_receives_events() {
        let mut mock = MockTransport::new();
        mock.expect_start_scan().returning(|_| Ok(()));

        let session = session_with(mock, SessionConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = session.on_event(move |event| {
            let _ = tx.send(event);
        });

        session.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(SessionEvent::StatusChanged(SessionState::Scanning))
        );

        handle.unregister();
    }

    #[test]
    fn test_failure_for_operation() {
        assert_eq!(
            failure_for(Operation::Write(CredentialField::Password), String::new()),
            Failure::WriteFailed(CredentialField::Password)
        );
        assert_eq!(
            failure_for(Operation::DiscoverCharacteristics, String::new()),
            Failure::CharacteristicNotFound(CredentialField::Ssid)
        );
    }
}
