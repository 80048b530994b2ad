//! Device session registry
//!
//! One [`DeviceSession`] per device identifier. Device work only happens
//! through a [`SessionLease`], which holds the session's exclusive gate for
//! as long as it lives. Waiters on the gate are served in arrival order.
//!
//! A device that lets `max_attempts` consecutive calls run into their
//! deadline is treated as unreachable, the same as one whose transport
//! failures persist through every retry.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::bridge::{
    AppInfo, BridgeAdapter, BridgeError, BridgeResult, CaptureFrame, DeviceEntry, DeviceInfo,
    ForegroundApp, LogBuffer, PackageFilter, ScreenSize, ShellOutput, TransferReport,
};
use crate::config::DeviceConfig;
use crate::error::{DroidError, DroidResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Busy,
}

/// What to do with a request for a device that is already executing one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait in line
    #[default]
    Queue,
    /// Fail with `DeviceBusy`
    Reject,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub device: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    pub pending_command: bool,
    pub queued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct SessionStatus {
    state: ConnectionState,
    /// Listed as ready by the last enumeration
    present: bool,
    bridge_state: Option<String>,
    model: Option<String>,
    product: Option<String>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct DeviceSession {
    id: String,
    status: Mutex<SessionStatus>,
    gate: Arc<tokio::sync::Mutex<()>>,
    queued: AtomicUsize,
    /// Consecutive calls that hit their deadline
    timeouts: AtomicU32,
}

impl DeviceSession {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: Mutex::new(SessionStatus {
                state: ConnectionState::Connected,
                present: true,
                bridge_state: None,
                model: None,
                product: None,
                last_success: None,
                last_error: None,
            }),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            queued: AtomicUsize::new(0),
            timeouts: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            device: self.id.clone(),
            state: status.state,
            bridge_state: status.bridge_state.clone(),
            model: status.model.clone(),
            product: status.product.clone(),
            last_success: status.last_success,
            pending_command: status.state == ConnectionState::Busy,
            queued: self.queued.load(Ordering::SeqCst),
            last_error: status.last_error.clone(),
        }
    }

    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, status: &mut SessionStatus, next: ConnectionState) {
        if status.state != next {
            debug!(device = %self.id, from = ?status.state, to = ?next, "session state");
            status.state = next;
        }
    }

    /// Apply one enumeration entry; an in-flight command keeps `Busy`
    fn observe(&self, entry: &DeviceEntry) {
        let mut status = self.status();
        status.present = entry.is_ready();
        status.bridge_state = Some(entry.state.clone());
        if entry.model.is_some() {
            status.model = entry.model.clone();
        }
        if entry.product.is_some() {
            status.product = entry.product.clone();
        }
        if status.state != ConnectionState::Busy {
            let next = if entry.is_ready() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            self.transition(&mut status, next);
        }
    }

    fn mark_absent(&self) {
        let mut status = self.status();
        status.present = false;
        status.bridge_state = None;
        if status.state == ConnectionState::Connected {
            self.transition(&mut status, ConnectionState::Disconnected);
        }
    }

    fn begin(&self) {
        let mut status = self.status();
        self.transition(&mut status, ConnectionState::Busy);
    }

    fn finish(&self, unreachable: bool) {
        let mut status = self.status();
        let next = if unreachable || !status.present {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        };
        self.transition(&mut status, next);
    }

    /// Turn the `limit`-th timeout in a row into `Unreachable`; any answer resets the streak
    fn escalate<T>(&self, result: BridgeResult<T>, limit: u32) -> BridgeResult<T> {
        match result {
            Err(BridgeError::Timeout { command, timeout }) => {
                let streak = self.timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                if streak < limit.max(1) {
                    return Err(BridgeError::Timeout { command, timeout });
                }
                self.timeouts.store(0, Ordering::SeqCst);
                warn!(device = %self.id, streak, "device stopped answering");
                Err(BridgeError::Unreachable {
                    attempts: streak,
                    reason: format!(
                        "{} consecutive calls got no answer within {:?}, last: adb {}",
                        streak, timeout, command
                    ),
                })
            }
            other => {
                self.timeouts.store(0, Ordering::SeqCst);
                other
            }
        }
    }

    fn record<T>(&self, result: &BridgeResult<T>) {
        let mut status = self.status();
        match result {
            Ok(_) => {
                status.last_success = Some(Utc::now());
                status.present = true;
            }
            Err(e) => status.last_error = Some(e.to_string()),
        }
    }
}

/// Counts a waiter on a session gate for as long as it waits
struct QueueTicket<'a>(&'a AtomicUsize);

impl<'a> QueueTicket<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive access to one device
///
/// The session is `Busy` while the lease lives. Dropping it, on any path,
/// releases the device to the next waiter; a `DeviceUnreachable` failure
/// observed through the lease leaves the session `Disconnected`.
pub struct SessionLease {
    session: Arc<DeviceSession>,
    bridge: BridgeAdapter,
    unreachable: AtomicBool,
    _gate: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn device(&self) -> &str {
        self.session.id()
    }

    fn track<T>(&self, result: BridgeResult<T>) -> BridgeResult<T> {
        let result = self
            .session
            .escalate(result, self.bridge.policy().max_attempts);
        self.session.record(&result);
        if let Err(e) = &result {
            if e.is_unreachable() {
                self.unreachable.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    pub async fn shell(&self, command: &str) -> BridgeResult<ShellOutput> {
        self.track(self.bridge.shell(self.device(), command).await)
    }

    pub async fn shell_args(&self, words: &[&str]) -> BridgeResult<ShellOutput> {
        self.track(self.bridge.shell_args(self.device(), words).await)
    }

    pub async fn capture_screen(&self) -> BridgeResult<CaptureFrame> {
        self.track(self.bridge.capture_screen(self.device()).await)
    }

    pub async fn push_file(&self, local: &Path, remote: &str) -> BridgeResult<TransferReport> {
        self.track(self.bridge.push_file(self.device(), local, remote).await)
    }

    pub async fn pull_file(&self, remote: &str, local: &Path) -> BridgeResult<TransferReport> {
        self.track(self.bridge.pull_file(self.device(), remote, local).await)
    }

    pub async fn query(&self, words: &[&str]) -> BridgeResult<ShellOutput> {
        self.track(self.bridge.query(self.device(), words).await)
    }

    pub async fn screen_size(&self) -> BridgeResult<ScreenSize> {
        self.track(self.bridge.screen_size(self.device()).await)
    }

    pub async fn device_info(&self) -> BridgeResult<DeviceInfo> {
        self.track(self.bridge.device_info(self.device()).await)
    }

    pub async fn list_packages(&self, filter: PackageFilter) -> BridgeResult<Vec<AppInfo>> {
        self.track(self.bridge.list_packages(self.device(), filter).await)
    }

    pub async fn package_installed(&self, package: &str) -> BridgeResult<bool> {
        self.track(self.bridge.package_installed(self.device(), package).await)
    }

    pub async fn foreground_app(&self) -> BridgeResult<ForegroundApp> {
        self.track(self.bridge.foreground_app(self.device()).await)
    }

    pub async fn logcat(
        &self,
        buffer: LogBuffer,
        lines: u32,
        filter: Option<&str>,
    ) -> BridgeResult<Vec<String>> {
        self.track(self.bridge.logcat(self.device(), buffer, lines, filter).await)
    }

    async fn disconnect_transport(&self) -> BridgeResult<()> {
        self.track(self.bridge.disconnect(self.device()).await)
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.finish(*self.unreachable.get_mut());
    }
}

pub struct DeviceRegistry {
    bridge: BridgeAdapter,
    sessions: RwLock<BTreeMap<String, Arc<DeviceSession>>>,
    busy_policy: BusyPolicy,
    fixed_device: Option<String>,
}

impl DeviceRegistry {
    pub fn new(bridge: BridgeAdapter, busy_policy: BusyPolicy, fixed_device: Option<String>) -> Self {
        Self {
            bridge,
            sessions: RwLock::new(BTreeMap::new()),
            busy_policy,
            fixed_device,
        }
    }

    pub fn from_config(bridge: BridgeAdapter, config: &DeviceConfig) -> Self {
        Self::new(bridge, config.busy_policy, config.fixed_device.clone())
    }

    pub fn bridge(&self) -> &BridgeAdapter {
        &self.bridge
    }

    /// Enumerate devices and reconcile sessions, in identifier order
    ///
    /// Sessions of devices that vanished are kept as `Disconnected`.
    pub async fn list(&self) -> DroidResult<Vec<SessionSnapshot>> {
        let entries = self.bridge.enumerate_devices().await?;
        let mut sessions = self.sessions.write().await;

        let mut seen = HashSet::new();
        for entry in &entries {
            let session = sessions.entry(entry.serial.clone()).or_insert_with(|| {
                info!(device = %entry.serial, state = %entry.state, "new device session");
                Arc::new(DeviceSession::new(&entry.serial))
            });
            session.observe(entry);
            seen.insert(entry.serial.as_str());
        }

        for (id, session) in sessions.iter() {
            if !seen.contains(id.as_str()) {
                session.mark_absent();
            }
        }

        Ok(sessions.values().map(|s| s.snapshot()).collect())
    }

    pub async fn snapshot(&self, device: &str) -> Option<SessionSnapshot> {
        self.find(device).await.map(|s| s.snapshot())
    }

    /// Resolve the target session of a request
    ///
    /// Without an identifier the configured fixed device is used, else the
    /// single connected session. A miss re-enumerates once before failing.
    pub async fn acquire(&self, device: Option<&str>) -> DroidResult<Arc<DeviceSession>> {
        match device.or(self.fixed_device.as_deref()) {
            Some(id) => self.acquire_named(id).await,
            None => self.acquire_sole().await,
        }
    }

    async fn acquire_named(&self, id: &str) -> DroidResult<Arc<DeviceSession>> {
        if let Some(session) = self.find(id).await {
            if session.state() != ConnectionState::Disconnected {
                return Ok(session);
            }
        }

        debug!(device = id, "no ready session, re-enumerating");
        self.list().await?;

        match self.find(id).await {
            Some(session) if session.state() != ConnectionState::Disconnected => Ok(session),
            _ => Err(DroidError::DeviceNotFound(id.to_string())),
        }
    }

    async fn acquire_sole(&self) -> DroidResult<Arc<DeviceSession>> {
        let mut candidates = self.connected().await;
        if candidates.is_empty() {
            debug!("no connected session, re-enumerating");
            self.list().await?;
            candidates = self.connected().await;
        }

        match candidates.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(DroidError::AmbiguousDevice(
                "no connected device; attach one or pass a device identifier".into(),
            )),
            many => Err(DroidError::AmbiguousDevice(format!(
                "{} devices connected ({}); pass a device identifier",
                many.len(),
                many.iter().map(|s| s.id()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    async fn find(&self, id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn connected(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state() != ConnectionState::Disconnected)
            .cloned()
            .collect()
    }

    /// Take exclusive access to a session according to the busy policy
    ///
    /// Fails if, by the time the gate is free, the session was removed or
    /// its device became unreachable.
    pub async fn lease(&self, session: &Arc<DeviceSession>) -> DroidResult<SessionLease> {
        self.enter(session, true).await
    }

    async fn enter(&self, session: &Arc<DeviceSession>, reachable: bool) -> DroidResult<SessionLease> {
        let guard = match self.busy_policy {
            BusyPolicy::Reject => session
                .gate
                .clone()
                .try_lock_owned()
                .map_err(|_| DroidError::DeviceBusy(session.id.clone()))?,
            BusyPolicy::Queue => {
                let _ticket = QueueTicket::new(&session.queued);
                session.gate.clone().lock_owned().await
            }
        };

        match self.find(&session.id).await {
            Some(current) if Arc::ptr_eq(&current, session) => {}
            _ => return Err(DroidError::DeviceNotFound(session.id.clone())),
        }
        if reachable && session.state() == ConnectionState::Disconnected {
            let reason = session
                .status()
                .last_error
                .clone()
                .unwrap_or_else(|| "device left the bridge".into());
            debug!(device = %session.id, %reason, "session lost its device while waiting");
            return Err(DroidError::Unreachable {
                device: session.id.clone(),
                reason,
            });
        }

        session.begin();
        Ok(SessionLease {
            session: session.clone(),
            bridge: self.bridge.clone(),
            unreachable: AtomicBool::new(false),
            _gate: guard,
        })
    }

    /// `adb connect` a network device and register its session
    pub async fn connect(&self, address: &str) -> DroidResult<SessionSnapshot> {
        let message = self.bridge.connect(address).await?;
        info!(address, %message, "network device connected");

        if let Err(e) = self.list().await {
            warn!(address, error = %e, "enumeration after connect failed");
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(DeviceSession::new(address)));
        Ok(session.snapshot())
    }

    /// Wait for the device to be idle, then forget its session
    ///
    /// Network devices are also disconnected from adb.
    pub async fn disconnect(&self, device: &str) -> DroidResult<()> {
        let session = self
            .find(device)
            .await
            .ok_or_else(|| DroidError::DeviceNotFound(device.to_string()))?;

        let lease = self.enter(&session, false).await?;
        if lease.device().contains(':') {
            lease.disconnect_transport().await?;
        }
        self.sessions.write().await.remove(lease.device());
        drop(lease);

        info!(device, "session removed");
        Ok(())
    }
}
