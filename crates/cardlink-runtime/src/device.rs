//! Acquired devices.
//!
//! A [`Device`] is a reader or antenna in reader mode. It tracks whether a
//! card is in its field, lets one caller at a time block until a card shows
//! up, and opens at most one [`CardSession`] at a time.
//!
//! # Presence
//!
//! The transport pushes presence signals into a per-device pump task. The
//! pump updates the device's `watch` presence state first and emits
//! `CARD_FOUND` / `CARD_LOST` second, so anyone woken by an event already
//! sees the new state. Sessions and waiters subscribe to the same `watch`.
//!
//! # Locking
//!
//! Two layers: an async gate serializes session creation and release, and a
//! short synchronous section guards the flags (released, waiting, sessions)
//! so the non-blocking probes never wait on I/O.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cardlink_core::{
    CardHandle, DeviceHandle, DeviceInfo, Error, EventKind, EventPayload, Result,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::events::EventBus;
use crate::lock;
use crate::registry::Registry;
use crate::session::CardSession;
use crate::state::{DeviceState, StateTracker, StateTransition};
use crate::transport::{AnyTransport, LinkId, PresenceSignal, Transport};

/// Devices tracked by a platform, shared with each device for unregistration.
pub(crate) type DeviceTable = Mutex<Registry<DeviceHandle, Device>>;

/// Last known presence of a card in the field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Presence {
    pub present: bool,

    /// Bumped on every arrival, so a session can tell its card from a new one.
    pub epoch: u64,
}

/// Everything a device needs at construction.
pub(crate) struct DeviceSetup {
    pub info: DeviceInfo,
    pub transport: Arc<AnyTransport>,
    pub events: EventBus,
    pub cancel: CancellationToken,
    pub table: Weak<DeviceTable>,
    pub signals: mpsc::Receiver<PresenceSignal>,
    pub max_chained_responses: usize,
}

#[derive(Debug)]
struct DeviceFlags {
    released: bool,
    /// Being released by the platform or a system event.
    revoked: bool,
    reader_lost: bool,
    waiting: bool,
    sessions: Registry<CardHandle, CardSession>,
    pump: Option<JoinHandle<()>>,
    tracker: StateTracker,
}

#[derive(Debug)]
pub(crate) struct DeviceCore {
    handle: DeviceHandle,
    info: DeviceInfo,
    transport: Arc<AnyTransport>,
    events: EventBus,
    presence: watch::Sender<Presence>,
    flags: Mutex<DeviceFlags>,
    gate: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    table: Weak<DeviceTable>,
    max_chained_responses: usize,
}

impl DeviceCore {
    pub(crate) fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub(crate) fn transport(&self) -> Arc<AnyTransport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn subscribe_presence(&self) -> watch::Receiver<Presence> {
        self.presence.subscribe()
    }

    pub(crate) fn max_chained_responses(&self) -> usize {
        self.max_chained_responses
    }

    /// Recompute the lifecycle state from the flags and record it.
    fn refresh(&self, flags: &mut DeviceFlags) {
        let present = self.presence.borrow().present;
        let state = if flags.released {
            DeviceState::Released
        } else if !flags.sessions.is_empty() {
            DeviceState::SessionActive
        } else if flags.waiting {
            DeviceState::Waiting
        } else if present {
            DeviceState::CardPresent
        } else {
            DeviceState::Acquired
        };

        if flags.tracker.observe(state) {
            debug!("{} is now {}", self.handle, state);
        }
    }

    fn ensure_live(&self) -> Result<()> {
        let flags = lock(&self.flags);
        if flags.released || flags.revoked {
            return Err(self.released_error());
        }
        Ok(())
    }

    fn released_error(&self) -> Error {
        Error::platform(format!("{} has been released", self.handle))
    }

    fn apply_signal(&self, signal: PresenceSignal) {
        match signal {
            PresenceSignal::CardArrived => {
                self.card_arrived();
            }
            PresenceSignal::CardDeparted => {
                self.card_lost("card left the field", None);
            }
            PresenceSignal::ReaderLost => {
                warn!("Reader behind {} went away", self.handle);
                lock(&self.flags).reader_lost = true;
                self.card_lost("reader lost", None);
            }
        }
    }

    /// Mark a card present. Returns `true` if presence changed.
    fn card_arrived(&self) -> bool {
        if lock(&self.flags).released {
            return false;
        }

        let changed = self.presence.send_if_modified(|presence| {
            if presence.present {
                return false;
            }
            presence.present = true;
            presence.epoch += 1;
            true
        });

        if changed {
            self.refresh(&mut lock(&self.flags));
            self.events
                .notify(EventKind::CardFound, self.handle, self.info.id.as_str());
            info!("Card found on {}", self.handle);
        }
        changed
    }

    /// Mark the field empty and emit `CARD_LOST` if it was not already.
    pub(crate) fn card_lost(&self, reason: &str, card: Option<CardHandle>) -> bool {
        self.mark_lost(reason, card, None)
    }

    /// A session found its card gone. Ignored if a newer card already
    /// replaced the one the session was opened to.
    pub(crate) fn session_lost(&self, card: CardHandle, epoch: u64, reason: &str) -> bool {
        self.mark_lost(reason, Some(card), Some(epoch))
    }

    fn mark_lost(&self, reason: &str, card: Option<CardHandle>, epoch: Option<u64>) -> bool {
        if lock(&self.flags).released {
            return false;
        }

        let changed = self.presence.send_if_modified(|presence| {
            if epoch.is_some_and(|epoch| epoch != presence.epoch) {
                return false;
            }
            std::mem::replace(&mut presence.present, false)
        });

        if changed {
            self.refresh(&mut lock(&self.flags));
            let mut event = EventPayload::new(EventKind::CardLost, self.handle, reason);
            if let Some(card) = card {
                event = event.with_card(card);
            }
            self.events.emit(event);
            info!("Card lost on {}: {}", self.handle, reason);
        }
        changed
    }

    /// A session released itself.
    pub(crate) fn session_closed(&self, card: CardHandle) {
        let mut flags = lock(&self.flags);
        if flags.sessions.remove(card).is_some() {
            self.refresh(&mut flags);
        }
    }

    /// Fail all further calls and cancel an outstanding wait. The caller
    /// follows up with [`Device::release`].
    fn revoke(&self, reason: &str) {
        {
            let mut flags = lock(&self.flags);
            if flags.released || flags.revoked {
                return;
            }
            flags.revoked = true;
        }
        self.cancel.cancel();
        debug!("{} revoked: {}", self.handle, reason);
    }

    async fn close_link(&self, link: LinkId) {
        if let Err(failure) = self.transport.disconnect(link).await {
            warn!("Failed to close {} on {}: {}", link, self.handle, failure);
        }
    }
}

/// Clears the waiting flag when a wait ends, however it ends.
struct WaitRegistration<'a> {
    core: &'a DeviceCore,
}

impl<'a> WaitRegistration<'a> {
    fn register(core: &'a DeviceCore) -> Result<Self> {
        let mut flags = lock(&core.flags);
        if flags.released || flags.revoked {
            return Err(core.released_error());
        }
        if flags.waiting {
            return Err(Error::platform(format!(
                "a wait is already outstanding on {}",
                core.handle
            )));
        }
        flags.waiting = true;
        core.refresh(&mut flags);
        Ok(Self { core })
    }
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        let mut flags = lock(&self.core.flags);
        flags.waiting = false;
        self.core.refresh(&mut flags);
    }
}

async fn run_presence_pump(core: Weak<DeviceCore>, mut signals: mpsc::Receiver<PresenceSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(core) = core.upgrade() else {
            break;
        };
        trace!("{} presence signal {:?}", core.handle, signal);
        core.apply_signal(signal);
    }
    trace!("Presence pump stopped");
}

/// An acquired reader or antenna.
///
/// Cheap to clone; clones refer to the same device.
#[derive(Debug, Clone)]
pub struct Device {
    core: Arc<DeviceCore>,
}

impl Device {
    /// Build the device, announce it and start its presence pump.
    ///
    /// Reader mode must already be active on the transport.
    pub(crate) fn spawn(handle: DeviceHandle, setup: DeviceSetup) -> Self {
        let DeviceSetup {
            info,
            transport,
            events,
            cancel,
            table,
            signals,
            max_chained_responses,
        } = setup;

        let (presence, _) = watch::channel(Presence::default());
        let core = Arc::new(DeviceCore {
            handle,
            info,
            transport,
            events,
            presence,
            flags: Mutex::new(DeviceFlags {
                released: false,
                revoked: false,
                reader_lost: false,
                waiting: false,
                sessions: Registry::new(),
                pump: None,
                tracker: StateTracker::new(),
            }),
            gate: tokio::sync::Mutex::new(()),
            cancel,
            table,
            max_chained_responses,
        });

        core.events
            .notify(EventKind::ReaderModeEnabled, handle, core.info.id.as_str());
        core.events
            .notify(EventKind::DeviceAcquired, handle, core.info.display_name());

        {
            let mut flags = lock(&core.flags);
            core.refresh(&mut flags);
            flags.pump = Some(tokio::spawn(run_presence_pump(
                Arc::downgrade(&core),
                signals,
            )));
        }

        Self { core }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.core.handle
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.core.info
    }

    pub fn state(&self) -> DeviceState {
        lock(&self.core.flags).tracker.current()
    }

    /// Recent lifecycle transitions, oldest first.
    pub fn state_history(&self) -> Vec<StateTransition> {
        lock(&self.core.flags).tracker.history()
    }

    /// Whether the device can still be used.
    ///
    /// `false` once released (or being released by a system event) and after
    /// the reader itself went away. Never fails.
    pub fn is_device_available(&self) -> bool {
        let flags = lock(&self.core.flags);
        !(flags.released || flags.revoked || flags.reader_lost)
    }

    /// Last known presence of a card in the field. Does not touch the transport.
    ///
    /// # Errors
    ///
    /// `PLATFORM_ERROR` after release.
    pub fn is_card_present(&self) -> Result<bool> {
        self.core.ensure_live()?;
        Ok(self.core.presence.borrow().present)
    }

    /// Ask the transport whether a card is in the field and update the
    /// presence state (and events) to match.
    ///
    /// # Errors
    ///
    /// `PLATFORM_ERROR` after release, or the mapped transport failure.
    pub async fn probe_presence(&self) -> Result<bool> {
        self.core.ensure_live()?;
        let present = self
            .core
            .transport
            .probe_presence(&self.core.info.id)
            .await?;

        if present {
            self.core.card_arrived();
        } else {
            self.core.card_lost("no card found by probe", None);
        }
        Ok(present)
    }

    /// Block until a card is in the field.
    ///
    /// Returns immediately if one already is.
    ///
    /// # Errors
    ///
    /// - `INVALID_PARAMETER` for a negative timeout.
    /// - `TIMEOUT` immediately for a zero timeout, when `timeout_ms` elapses
    ///   (the device stays acquired), or when a system event cancels the wait
    ///   (the device is being released and must be re-acquired).
    /// - `PLATFORM_ERROR` if another wait is outstanding or after release.
    pub async fn wait_for_card_presence(&self, timeout_ms: i64) -> Result<()> {
        let core = &*self.core;
        core.ensure_live()?;

        if timeout_ms < 0 {
            return Err(Error::invalid_parameter(format!(
                "timeout must not be negative, got {timeout_ms}"
            )));
        }
        if timeout_ms == 0 {
            core.events
                .notify(EventKind::WaitTimeout, core.handle, "zero timeout");
            return Err(Error::timeout(format!(
                "zero timeout on {}",
                core.handle
            )));
        }

        let _registration = WaitRegistration::register(core)?;
        let mut presence = core.presence.subscribe();
        let timeout = Duration::from_millis(timeout_ms as u64);
        debug!("Waiting up to {} ms for a card on {}", timeout_ms, core.handle);

        tokio::select! {
            biased;

            _ = core.cancel.cancelled() => {
                debug!("Wait on {} cancelled", core.handle);
                Err(Error::timeout(format!("wait on {} cancelled by release", core.handle)))
            }

            arrived = async { presence.wait_for(|p| p.present).await.map(|_| ()) } => {
                arrived.map_err(|_| Error::platform(format!("presence of {} is gone", core.handle)))
            }

            _ = tokio::time::sleep(timeout) => {
                core.events.notify(
                    EventKind::WaitTimeout,
                    core.handle,
                    format!("{timeout_ms} ms"),
                );
                Err(Error::timeout(format!(
                    "no card on {} within {} ms",
                    core.handle, timeout_ms
                )))
            }
        }
    }

    /// Open a session to the card in the field.
    ///
    /// The link is verified alive before the session is handed out.
    ///
    /// # Errors
    ///
    /// - `ALREADY_CONNECTED` while another session of this device is open.
    /// - `CARD_NOT_PRESENT` if no card is in the field.
    /// - `PLATFORM_ERROR` if the link cannot be established or the card
    ///   vanished meanwhile (the device is marked "no card" and `CARD_LOST`
    ///   emitted), or after release.
    pub async fn start_session(&self) -> Result<CardSession> {
        let core = &self.core;
        let _gate = core.gate.lock().await;
        core.ensure_live()?;

        if let Some(active) = self.active_session() {
            return Err(Error::already_connected(format!(
                "{} already has {} open",
                core.handle,
                active.handle()
            )));
        }

        let presence = *core.presence.borrow();
        if !presence.present {
            return Err(Error::card_not_present(format!(
                "no card on {}",
                core.info.display_name()
            )));
        }

        let link = match core.transport.connect(&core.info.id).await {
            Ok(link) => link,
            Err(failure) => {
                core.card_lost(&format!("connect failed: {failure}"), None);
                return Err(Error::platform(format!(
                    "could not connect to the card on {}: {failure}",
                    core.handle
                )));
            }
        };

        let alive = matches!(core.transport.probe_link(link.link).await, Ok(true));
        let same_card = {
            let now = *core.presence.borrow();
            now.present && now.epoch == presence.epoch
        };
        if !alive || !same_card {
            core.close_link(link.link).await;
            core.card_lost("card vanished while connecting", None);
            return Err(Error::platform(format!(
                "card on {} vanished while connecting",
                core.handle
            )));
        }

        if let Err(error) = core.ensure_live() {
            core.close_link(link.link).await;
            return Err(error);
        }

        let session = {
            let mut flags = lock(&core.flags);
            let (_, session) = flags
                .sessions
                .insert_with(|card| CardSession::new(card, core, link, presence.epoch));
            let session = session.clone();
            core.refresh(&mut flags);
            session
        };

        core.events.emit(
            EventPayload::new(EventKind::SessionStarted, core.handle, core.info.id.as_str())
                .with_card(session.handle()),
        );
        info!("{} opened on {}", session.handle(), core.handle);
        Ok(session)
    }

    /// The open session with this handle.
    ///
    /// # Errors
    ///
    /// `NOT_CONNECTED` if the handle was released or never belonged to this device.
    pub fn session(&self, card: CardHandle) -> Result<CardSession> {
        lock(&self.core.flags)
            .sessions
            .get(card)
            .cloned()
            .ok_or_else(|| {
                Error::not_connected(format!("{card} is not open on {}", self.core.handle))
            })
    }

    /// The open session, if any.
    pub fn active_session(&self) -> Option<CardSession> {
        lock(&self.core.flags).sessions.values().next().cloned()
    }

    /// Release the device.
    ///
    /// Cancels an outstanding wait, releases open sessions, turns reader mode
    /// off and unregisters from the platform. Failures along the way are
    /// logged, not returned. Idempotent.
    ///
    /// The teardown runs on its own task, so dropping the returned future
    /// (for example under a timeout) does not leave the device half released.
    pub async fn release(&self) -> Result<()> {
        self.core.cancel.cancel();
        let core = Arc::clone(&self.core);
        tokio::spawn(Self::teardown(core)).await.map_err(|e| {
            Error::platform(format!("release of {} did not complete: {e}", self.core.handle))
        })?
    }

    async fn teardown(core: Arc<DeviceCore>) -> Result<()> {
        let core = &*core;
        let _gate = core.gate.lock().await;

        let (sessions, pump) = {
            let mut flags = lock(&core.flags);
            if flags.released {
                trace!("{} already released", core.handle);
                return Ok(());
            }
            flags.released = true;
            let sessions = flags.sessions.drain();
            core.refresh(&mut flags);
            (sessions, flags.pump.take())
        };

        for (card, session) in sessions {
            if let Err(error) = session.release().await {
                warn!("Failed to release {} on {}: {}", card, core.handle, error);
            }
        }

        if let Some(pump) = pump {
            pump.abort();
        }

        if let Err(failure) = core.transport.deactivate(&core.info.id).await {
            warn!(
                "Failed to turn reader mode off on {}: {}",
                core.handle, failure
            );
        }
        core.presence
            .send_if_modified(|presence| std::mem::replace(&mut presence.present, false));

        if let Some(table) = core.table.upgrade() {
            lock(&table).remove(core.handle);
        }

        core.events
            .notify(EventKind::ReaderModeDisabled, core.handle, core.info.id.as_str());
        core.events
            .notify(EventKind::DeviceReleased, core.handle, core.info.display_name());
        info!("Released {} ({})", core.handle, core.info.id);
        Ok(())
    }

    /// Mark the device as going away and cancel its wait, ahead of a release.
    pub(crate) fn revoke(&self, reason: &str) {
        self.core.revoke(reason);
    }
}
