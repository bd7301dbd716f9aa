//! System-event coordinator.
//!
//! The host pushes lifecycle signals (screen off, suspend, ...) through a
//! [`SystemEventSender`]. Signals that revoke communication are turned into a
//! single broadcast: every outstanding wait is cancelled first, then every
//! acquired device is force-released. Each release runs in its own task under
//! a timeout, so one stuck or panicking device never holds up the others.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cardlink_core::{DeviceHandle, Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceTable};
use crate::lock;

const SIGNAL_CAPACITY: usize = 16;

/// Host lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    ScreenOff,
    ScreenOn,
    Suspend,
    Resume,
    Doze,
    RadioOff,
}

impl SystemEvent {
    /// Whether the signal forces every device to be released.
    pub fn revokes_communication(&self) -> bool {
        matches!(
            self,
            SystemEvent::ScreenOff
                | SystemEvent::Suspend
                | SystemEvent::Doze
                | SystemEvent::RadioOff
        )
    }
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemEvent::ScreenOff => "screen off",
            SystemEvent::ScreenOn => "screen on",
            SystemEvent::Suspend => "suspend",
            SystemEvent::Resume => "resume",
            SystemEvent::Doze => "doze",
            SystemEvent::RadioOff => "radio off",
        };
        write!(f, "{}", name)
    }
}

/// Where the host delivers lifecycle signals.
#[derive(Debug, Clone)]
pub struct SystemEventSender {
    tx: broadcast::Sender<SystemEvent>,
}

impl SystemEventSender {
    /// Deliver a signal. Returns `false` if no coordinator is listening.
    pub fn notify(&self, event: SystemEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Outcome of a forced release of all devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: Vec<DeviceHandle>,
    /// Devices whose release failed or timed out.
    pub failed: Vec<DeviceHandle>,
    pub panicked: usize,
}

impl ReleaseReport {
    pub fn total(&self) -> usize {
        self.released.len() + self.failed.len() + self.panicked
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.panicked == 0
    }
}

impl fmt::Display for ReleaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} released, {} failed, {} panicked",
            self.released.len(),
            self.failed.len(),
            self.panicked
        )
    }
}

/// How a release task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskTermination {
    Success,
    Error,
    Cancelled,
    Panic,
}

fn classify_task_result(
    result: &std::result::Result<Result<()>, tokio::task::JoinError>,
) -> TaskTermination {
    match result {
        Ok(Ok(())) => TaskTermination::Success,
        Ok(Err(_)) => TaskTermination::Error,
        Err(e) if e.is_cancelled() => TaskTermination::Cancelled,
        Err(_) => TaskTermination::Panic,
    }
}

#[derive(Debug)]
struct CoordinatorInner {
    devices: Arc<DeviceTable>,
    signals: broadcast::Sender<SystemEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    dispatching: AtomicBool,
    release_timeout: Duration,
}

/// Clears the dispatch flag when a broadcast finishes.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CoordinatorInner {
    async fn dispatch(&self, event: SystemEvent) -> ReleaseReport {
        if !event.revokes_communication() {
            debug!("Ignoring system event: {}", event);
            return ReleaseReport::default();
        }

        if self.dispatching.swap(true, Ordering::AcqRel) {
            debug!("Release already in progress, ignoring {}", event);
            return ReleaseReport::default();
        }
        let _guard = DispatchGuard(&self.dispatching);

        info!("System event {}: releasing all devices", event);
        self.release_all(&event.to_string()).await
    }

    async fn release_all(&self, reason: &str) -> ReleaseReport {
        let devices: Vec<Device> = lock(&self.devices).values().cloned().collect();
        let mut report = ReleaseReport::default();
        if devices.is_empty() {
            return report;
        }

        // Cancel every wait before the first release starts.
        for device in &devices {
            device.revoke(reason);
        }

        let mut tasks = JoinSet::new();
        let mut handles = std::collections::HashMap::new();
        for device in devices {
            let handle = device.handle();
            let timeout = self.release_timeout;
            // A timed-out release keeps running on its own task.
            let task = tasks.spawn(async move {
                match tokio::time::timeout(timeout, device.release()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!(
                        "release of {} took longer than {:?}",
                        handle, timeout
                    ))),
                }
            });
            handles.insert(task.id(), handle);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, Ok(result)),
                Err(e) => (e.id(), Err(e)),
            };
            let handle = handles.remove(&id);

            match (classify_task_result(&result), handle) {
                (TaskTermination::Success, Some(handle)) => report.released.push(handle),
                (TaskTermination::Error, Some(handle)) => {
                    if let Ok(Err(e)) = &result {
                        warn!("Forced release of {} failed: {}", handle, e);
                    }
                    report.failed.push(handle);
                }
                (TaskTermination::Panic | TaskTermination::Cancelled, handle) => {
                    error!("Release task for {:?} did not complete", handle);
                    report.panicked += 1;
                }
                (_, None) => warn!("Release task {} finished untracked", id),
            }
        }

        info!("Forced release ({}): {}", reason, report);
        report
    }
}

async fn run_listener(
    inner: Weak<CoordinatorInner>,
    mut signals: broadcast::Receiver<SystemEvent>,
) {
    loop {
        let event = match signals.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("System event listener lagged by {} signals", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(event).await;
    }
    debug!("System event listener stopped");
}

/// Turns host lifecycle signals into forced releases of all devices.
#[derive(Debug, Clone)]
pub struct SystemEventCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SystemEventCoordinator {
    pub(crate) fn new(devices: Arc<DeviceTable>, release_timeout: Duration) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                devices,
                signals,
                listener: Mutex::new(None),
                dispatching: AtomicBool::new(false),
                release_timeout,
            }),
        }
    }

    /// Sender the host uses to deliver signals.
    pub fn sender(&self) -> SystemEventSender {
        SystemEventSender {
            tx: self.inner.signals.clone(),
        }
    }

    /// Start listening for signals. Idempotent.
    ///
    /// Signals sent after this returns are always seen.
    pub fn register(&self) {
        let mut listener = lock(&self.inner.listener);
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let signals = self.inner.signals.subscribe();
        *listener = Some(tokio::spawn(run_listener(
            Arc::downgrade(&self.inner),
            signals,
        )));
        debug!("System event coordinator registered");
    }

    /// Stop listening. Idempotent.
    pub fn unregister(&self) {
        if let Some(task) = lock(&self.inner.listener).take() {
            task.abort();
            debug!("System event coordinator unregistered");
        }
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.inner.listener)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Handle a signal directly, bypassing the listener.
    ///
    /// Informational signals are ignored. A broadcast that starts while
    /// another is running is dropped; the running one releases everything.
    pub async fn dispatch(&self, event: SystemEvent) -> ReleaseReport {
        self.inner.dispatch(event).await
    }

    /// Force-release every acquired device.
    pub(crate) async fn release_all(&self, reason: &str) -> ReleaseReport {
        self.inner.release_all(reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SystemEvent::ScreenOff, true)]
    #[case(SystemEvent::Suspend, true)]
    #[case(SystemEvent::Doze, true)]
    #[case(SystemEvent::RadioOff, true)]
    #[case(SystemEvent::ScreenOn, false)]
    #[case(SystemEvent::Resume, false)]
    fn test_revoking_events(#[case] event: SystemEvent, #[case] revokes: bool) {
        assert_eq!(event.revokes_communication(), revokes);
    }

    #[test]
    fn test_event_serde_names() {
        let json = serde_json::to_string(&SystemEvent::RadioOff).unwrap();
        assert_eq!(json, "\"radio_off\"");
    }

    #[test]
    fn test_report_counts() {
        let report = ReleaseReport {
            released: vec![DeviceHandle::from_raw(1)],
            failed: vec![DeviceHandle::from_raw(2)],
            panicked: 1,
        };
        assert_eq!(report.total(), 3);
        assert!(!report.is_clean());
        assert_eq!(report.to_string(), "1 released, 1 failed, 1 panicked");
        assert!(ReleaseReport::default().is_clean());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let coordinator =
            SystemEventCoordinator::new(Arc::new(Mutex::default()), Duration::from_secs(1));
        assert!(!coordinator.is_registered());

        coordinator.register();
        coordinator.register();
        assert!(coordinator.is_registered());

        coordinator.unregister();
        coordinator.unregister();
        assert!(!coordinator.is_registered());
    }

    #[tokio::test]
    async fn test_dispatch_with_no_devices() {
        let coordinator =
            SystemEventCoordinator::new(Arc::new(Mutex::default()), Duration::from_secs(1));
        assert_eq!(
            coordinator.dispatch(SystemEvent::Suspend).await,
            ReleaseReport::default()
        );
        assert!(!coordinator.sender().notify(SystemEvent::ScreenOff));
    }
}
