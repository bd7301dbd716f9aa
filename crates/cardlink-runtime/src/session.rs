//! Card sessions.
//!
//! A [`CardSession`] owns one open link to the card in a device's field. All
//! traffic on the link (transmit, reset, release) is serialized by a
//! per-session async mutex, so two callers can never interleave bytes on the
//! wire, and a release waits for any in-flight exchange to finish.
//!
//! Before every exchange the session re-validates that the card it was opened
//! to is still there. When it is not, the session marks itself lost, flips
//! the owning device to "no card" and emits `CARD_LOST` before returning the
//! error; every later call on the session fails fast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cardlink_apdu::{CommandApdu, ResponseApdu};
use cardlink_core::{CardHandle, DeviceHandle, Error, EventKind, EventPayload, Result};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, trace, warn};

use crate::device::{DeviceCore, Presence};
use crate::events::EventBus;
use crate::transport::{AnyTransport, LinkId, LinkInfo, Transport, map_transport_failure};

/// An open communication session with one card.
///
/// Cheap to clone; clones share the same link.
#[derive(Debug, Clone)]
pub struct CardSession {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    handle: CardHandle,
    device: DeviceHandle,
    core: Weak<DeviceCore>,
    transport: Arc<AnyTransport>,
    events: EventBus,
    presence: watch::Receiver<Presence>,
    /// Presence epoch of the card this session was opened to.
    epoch: u64,
    max_chained: usize,
    /// `None` once the link is closed.
    link: Mutex<Option<LinkInfo>>,
    lost: AtomicBool,
    released: AtomicBool,
}

impl CardSession {
    pub(crate) fn new(
        handle: CardHandle,
        core: &Arc<DeviceCore>,
        link: LinkInfo,
        epoch: u64,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                handle,
                device: core.handle(),
                core: Arc::downgrade(core),
                transport: core.transport(),
                events: core.events().clone(),
                presence: core.subscribe_presence(),
                epoch,
                max_chained: core.max_chained_responses(),
                link: Mutex::new(Some(link)),
                lost: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> CardHandle {
        self.inner.handle
    }

    pub fn device_handle(&self) -> DeviceHandle {
        self.inner.device
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Whether this session has observed that its card is gone.
    pub fn is_card_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    /// Answer-to-reset bytes of the card.
    ///
    /// Historical bytes when the transport reported them, else the higher
    /// layer response, else an empty vector. Never synthesized.
    ///
    /// # Errors
    ///
    /// `PLATFORM_ERROR` if the session is released, lost its card, or the
    /// link is not connected.
    pub async fn get_atr(&self) -> Result<Vec<u8>> {
        let slot = self.inner.link.lock().await;
        self.usable_link(&slot)?;
        match &*slot {
            Some(info) => Ok(info.atr()),
            None => Ok(Vec::new()),
        }
    }

    /// Send one command and return the parsed response.
    ///
    /// # Errors
    ///
    /// - `PLATFORM_ERROR` if the session is unusable or the card was found
    ///   missing before sending (the device is marked "no card" first).
    /// - `TRANSMISSION_ERROR` if the exchange itself failed, including the
    ///   card being pulled mid-exchange.
    /// - `PROTOCOL_ERROR` if the response is shorter than a status word.
    pub async fn transmit(&self, command: &CommandApdu) -> Result<ResponseApdu> {
        let slot = self.inner.link.lock().await;
        let link = self.usable_link(&slot)?;
        self.exchange_locked(link, command).await
    }

    /// Decode `bytes` as a command APDU and transmit it.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMETER` if `bytes` is not a well-formed command, otherwise
    /// as [`transmit`](Self::transmit).
    pub async fn transmit_raw(&self, bytes: &[u8]) -> Result<ResponseApdu> {
        let command = CommandApdu::decode(bytes).map_err(|e| {
            Error::invalid_parameter(format!(
                "malformed command {}: {e}",
                hex::encode_upper(bytes)
            ))
        })?;
        self.transmit(&command).await
    }

    /// Transmit and follow the card's length hints.
    ///
    /// `61xx` is answered with GET RESPONSE and the data concatenated; `6Cxx`
    /// re-issues the command with the Le the card asked for. The link stays
    /// locked for the whole chain.
    ///
    /// # Errors
    ///
    /// `RESOURCE_LIMIT` when the card keeps asking for more rounds than
    /// [`PlatformConfig::max_chained_responses`](crate::PlatformConfig::max_chained_responses)
    /// allows, otherwise as [`transmit`](Self::transmit).
    pub async fn transmit_chained(&self, command: &CommandApdu) -> Result<ResponseApdu> {
        let slot = self.inner.link.lock().await;
        let link = self.usable_link(&slot)?;

        let channel_cla = command.cla() & 0x03;
        let mut current = command.clone();
        let mut response = self.exchange_locked(link, &current).await?;
        let mut data = Vec::new();
        let mut rounds = 0;

        loop {
            let sw = response.status_word();
            let next = if let Some(le) = sw.correct_le() {
                current.with_le(le)?
            } else if let Some(remaining) = sw.bytes_remaining() {
                data.extend_from_slice(response.data());
                CommandApdu::get_response(channel_cla, (remaining % 256) as u8)
            } else {
                data.extend_from_slice(response.data());
                return Ok(ResponseApdu::new(data, sw));
            };

            if rounds == self.inner.max_chained {
                return Err(Error::resource_limit(format!(
                    "{}: card asked for more than {} chained responses",
                    self.inner.handle, self.inner.max_chained
                )));
            }
            rounds += 1;

            trace!("{} chaining round {} ({})", self.inner.handle, rounds, sw);
            response = self.exchange_locked(link, &next).await?;
            current = next;
        }
    }

    /// Reset the card and re-establish the link to it.
    ///
    /// # Errors
    ///
    /// `CARD_NOT_PRESENT` if the card is gone before or after the reset,
    /// `PLATFORM_ERROR` if the session is already unusable.
    pub async fn reset(&self) -> Result<()> {
        let mut slot = self.inner.link.lock().await;
        let link = self.usable_link(&slot)?;

        if let Err(reason) = self.revalidate(link).await {
            self.observe_loss(&reason);
            return Err(self.card_gone(&reason));
        }

        let info = match self.inner.transport.reconnect(link).await {
            Ok(info) => info,
            Err(failure) if failure.is_card_loss() => {
                let reason = failure.to_string();
                self.observe_loss(&reason);
                return Err(self.card_gone(&reason));
            }
            Err(failure) => return Err(map_transport_failure(failure)),
        };

        let relinked = info.link;
        *slot = Some(info);

        if let Err(reason) = self.revalidate(relinked).await {
            self.observe_loss(&reason);
            return Err(self.card_gone(&reason));
        }

        self.emit(EventKind::SessionReset, "card reset");
        info!("{} reset on {}", self.inner.handle, self.inner.device);
        Ok(())
    }

    /// Close the link and detach from the device.
    ///
    /// Waits for an in-flight exchange to finish. Idempotent: later calls
    /// return `Ok(())` without touching the transport again.
    pub async fn release(&self) -> Result<()> {
        let mut slot = self.inner.link.lock().await;
        if self.inner.released.swap(true, Ordering::AcqRel) {
            trace!("{} already released", self.inner.handle);
            return Ok(());
        }

        if let Some(info) = slot.take()
            && let Err(failure) = self.inner.transport.disconnect(info.link).await
        {
            warn!(
                "Failed to close {} for {}: {}",
                info.link, self.inner.handle, failure
            );
        }
        drop(slot);

        if let Some(core) = self.inner.core.upgrade() {
            core.session_closed(self.inner.handle);
        }

        debug!("{} released", self.inner.handle);
        Ok(())
    }

    fn usable_link(&self, slot: &Option<LinkInfo>) -> Result<LinkId> {
        if self.is_released() {
            return Err(Error::platform(format!(
                "{} has been released",
                self.inner.handle
            )));
        }
        if self.is_card_lost() {
            return Err(Error::platform(format!(
                "card behind {} was lost",
                self.inner.handle
            )));
        }
        slot.as_ref().map(|info| info.link).ok_or_else(|| {
            Error::platform(format!("{} is not connected", self.inner.handle))
        })
    }

    /// Send on a link whose lock the caller holds.
    async fn exchange_locked(&self, link: LinkId, command: &CommandApdu) -> Result<ResponseApdu> {
        if let Err(reason) = self.revalidate(link).await {
            self.observe_loss(&reason);
            self.emit(EventKind::TransmitFailed, reason.as_str());
            return Err(Error::platform(format!(
                "{}: {reason}",
                self.inner.handle
            )));
        }

        let bytes = command.encode();
        debug!("{} >> {}", self.inner.handle, hex::encode_upper(&bytes));
        self.emit(EventKind::TransmitSent, hex::encode_upper(&bytes[..4]));

        match self.inner.transport.exchange(link, &bytes).await {
            Ok(raw) => {
                debug!("{} << {}", self.inner.handle, hex::encode_upper(&raw));
                ResponseApdu::decode(&raw).map_err(|e| {
                    self.emit(EventKind::TransmitFailed, e.to_string());
                    Error::from(e)
                })
            }
            Err(failure) => {
                if failure.is_card_loss() {
                    self.observe_loss(&failure.to_string());
                }
                self.emit(EventKind::TransmitFailed, failure.to_string());
                Err(map_transport_failure(failure))
            }
        }
    }

    /// Check the card this session was opened to is still reachable.
    async fn revalidate(&self, link: LinkId) -> std::result::Result<(), String> {
        let presence = *self.inner.presence.borrow();
        if !presence.present {
            return Err("card left the field".to_string());
        }
        if presence.epoch != self.inner.epoch {
            return Err("a different card is in the field".to_string());
        }

        match self.inner.transport.probe_link(link).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("card no longer answers on the link".to_string()),
            Err(failure) => Err(format!("link probe failed: {failure}")),
        }
    }

    fn observe_loss(&self, reason: &str) {
        if self.inner.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("{} lost its card: {}", self.inner.handle, reason);
        if let Some(core) = self.inner.core.upgrade() {
            core.session_lost(self.inner.handle, self.inner.epoch, reason);
        }
    }

    fn card_gone(&self, reason: &str) -> Error {
        Error::card_not_present(format!("{}: {reason}", self.inner.handle))
    }

    fn emit(&self, kind: EventKind, details: impl Into<String>) {
        self.inner.events.emit(
            EventPayload::new(kind, self.inner.device, details).with_card(self.inner.handle),
        );
    }
}
