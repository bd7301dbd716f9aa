//! PC/SC transport.
//!
//! Talks to readers through the platform card service (pcsclite on Linux and
//! macOS, WinSCard on Windows). PC/SC calls block, so every call runs on the
//! blocking pool. Presence is tracked by one monitor thread per activated
//! reader, looping on `SCardGetStatusChange` with its own context so it can
//! be cancelled without disturbing open links.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cardlink_core::{D2cProtocol, DeviceInfo, P2dProtocol};
use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, info, trace, warn};

use super::{
    FailureCode, LinkId, LinkInfo, PresenceSink, Transport, TransportFailure, TransportResult,
};
use crate::config::PlatformConfig;
use crate::lock;

/// Maps a PC/SC error to the transport failure vocabulary.
fn failure(error: pcsc::Error, context: &str) -> TransportFailure {
    let code = match error {
        pcsc::Error::NoService | pcsc::Error::ServiceStopped => FailureCode::ServiceUnavailable,
        pcsc::Error::NoReadersAvailable => FailureCode::NoReaders,
        pcsc::Error::UnknownReader => FailureCode::UnknownReader,
        pcsc::Error::ReaderUnavailable => FailureCode::ReaderUnavailable,
        pcsc::Error::SharingViolation => FailureCode::ReaderBusy,
        pcsc::Error::NoSmartcard => FailureCode::NoCard,
        pcsc::Error::RemovedCard | pcsc::Error::ResetCard => FailureCode::CardRemoved,
        pcsc::Error::UnresponsiveCard | pcsc::Error::UnpoweredCard => {
            FailureCode::CardUnresponsive
        }
        pcsc::Error::CommError => FailureCode::CommunicationError,
        pcsc::Error::Timeout => FailureCode::Timeout,
        pcsc::Error::Cancelled => FailureCode::Cancelled,
        pcsc::Error::InvalidParameter | pcsc::Error::InvalidValue => {
            FailureCode::InvalidParameter
        }
        pcsc::Error::InsufficientBuffer => FailureCode::InsufficientBuffer,
        pcsc::Error::ProtoMismatch => FailureCode::ProtocolMismatch,
        pcsc::Error::UnsupportedFeature | pcsc::Error::UnsupportedCard => {
            FailureCode::Unsupported
        }
        _ => FailureCode::Unknown,
    };
    TransportFailure::new(code, format!("{context}: {error}")).with_raw(error.into_raw() as i64)
}

/// Errors [`PcscTransport::describe_error`] can name.
const KNOWN_ERRORS: &[pcsc::Error] = &[
    pcsc::Error::NoService,
    pcsc::Error::ServiceStopped,
    pcsc::Error::NoReadersAvailable,
    pcsc::Error::UnknownReader,
    pcsc::Error::ReaderUnavailable,
    pcsc::Error::SharingViolation,
    pcsc::Error::NoSmartcard,
    pcsc::Error::RemovedCard,
    pcsc::Error::ResetCard,
    pcsc::Error::UnresponsiveCard,
    pcsc::Error::UnpoweredCard,
    pcsc::Error::CommError,
    pcsc::Error::Timeout,
    pcsc::Error::Cancelled,
    pcsc::Error::InvalidParameter,
    pcsc::Error::InsufficientBuffer,
    pcsc::Error::ProtoMismatch,
    pcsc::Error::UnsupportedFeature,
];

fn reader_name(device_id: &str) -> TransportResult<CString> {
    CString::new(device_id).map_err(|_| {
        TransportFailure::new(
            FailureCode::InvalidParameter,
            format!("reader name {device_id:?} contains a NUL byte"),
        )
    })
}

async fn blocking<T, F>(operation: &'static str, f: F) -> TransportResult<T>
where
    F: FnOnce() -> TransportResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        TransportFailure::new(FailureCode::Unknown, format!("{operation} task failed: {e}"))
    })?
}

struct Monitor {
    stop: Arc<AtomicBool>,
    context: Context,
}

/// Transport over the platform PC/SC service.
pub struct PcscTransport {
    context: Context,
    poll_interval: Duration,
    links: Arc<Mutex<HashMap<LinkId, Arc<Mutex<Card>>>>>,
    next_link: AtomicU64,
    monitors: Mutex<HashMap<String, Monitor>>,
}

impl fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTransport")
            .field("poll_interval", &self.poll_interval)
            .field("links", &lock(&self.links).len())
            .field("monitors", &lock(&self.monitors).len())
            .finish()
    }
}

impl PcscTransport {
    /// Connect to the PC/SC service in user scope.
    ///
    /// `poll_interval` bounds how long a monitor thread blocks before it
    /// re-checks whether it was stopped.
    pub fn establish(poll_interval: Duration) -> TransportResult<Self> {
        let context =
            Context::establish(Scope::User).map_err(|e| failure(e, "establish context"))?;
        info!("PC/SC context established");
        Ok(Self {
            context,
            poll_interval,
            links: Arc::new(Mutex::new(HashMap::new())),
            next_link: AtomicU64::new(1),
            monitors: Mutex::new(HashMap::new()),
        })
    }

    /// Connect using the poll interval from `config`.
    pub fn from_config(config: &PlatformConfig) -> TransportResult<Self> {
        Self::establish(config.pcsc_poll_interval())
    }

    fn card(&self, link: LinkId) -> TransportResult<Arc<Mutex<Card>>> {
        lock(&self.links).get(&link).cloned().ok_or_else(|| {
            TransportFailure::new(FailureCode::InvalidParameter, format!("{link} is not open"))
        })
    }

    fn link_info(link: LinkId, card: &Card) -> TransportResult<LinkInfo> {
        let status = card.status2_owned().map_err(|e| failure(e, "read card status"))?;
        Ok(LinkInfo::new(link).with_historical_bytes(status.atr().to_vec()))
    }
}

fn run_monitor(
    context: Context,
    name: CString,
    sink: PresenceSink,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    let label = name.to_string_lossy().into_owned();
    let mut states = [ReaderState::new(name, State::UNAWARE)];
    let mut present = false;

    while !stop.load(Ordering::Acquire) && !sink.is_closed() {
        match context.get_status_change(poll, &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => break,
            Err(pcsc::Error::UnknownReader | pcsc::Error::ReaderUnavailable) => {
                sink.reader_lost();
                break;
            }
            Err(e) => {
                warn!("Status monitor for {} stopped: {}", label, e);
                sink.reader_lost();
                break;
            }
        }

        let state = states[0].event_state();
        trace!("{} state {:?}", label, state);
        if state.intersects(State::UNKNOWN | State::UNAVAILABLE) {
            sink.reader_lost();
            break;
        }

        let now_present = state.contains(State::PRESENT) && !state.contains(State::MUTE);
        if now_present != present {
            present = now_present;
            if present {
                sink.card_arrived();
            } else {
                sink.card_departed();
            }
        }
        states[0].sync_current_state();
    }
    debug!("Status monitor for {} exited", label);
}

impl Transport for PcscTransport {
    async fn enumerate(&self) -> TransportResult<Vec<DeviceInfo>> {
        let context = self.context.clone();
        let readers = blocking("enumerate", move || match context.list_readers_owned() {
            Ok(readers) => Ok(readers),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(failure(e, "list readers")),
        })
        .await?;

        Ok(readers
            .into_iter()
            .map(|name| {
                let name = name.to_string_lossy().into_owned();
                DeviceInfo::contact_reader(name.clone())
                    .with_protocols(D2cProtocol::Iso7816, P2dProtocol::Usb)
                    .with_friendly_name(name)
            })
            .collect())
    }

    async fn activate(&self, device_id: &str, sink: PresenceSink) -> TransportResult<()> {
        let name = reader_name(device_id)?;
        let mut monitors = lock(&self.monitors);
        if monitors.contains_key(device_id) {
            return Err(TransportFailure::new(
                FailureCode::ReaderBusy,
                format!("{device_id} is already monitored"),
            ));
        }

        let context =
            Context::establish(Scope::User).map_err(|e| failure(e, "establish monitor context"))?;
        let stop = Arc::new(AtomicBool::new(false));
        let poll = self.poll_interval;
        let thread_context = context.clone();
        let thread_stop = Arc::clone(&stop);

        thread::Builder::new()
            .name(format!("pcsc-monitor-{device_id}"))
            .spawn(move || run_monitor(thread_context, name, sink, thread_stop, poll))
            .map_err(|e| {
                TransportFailure::new(FailureCode::Unknown, format!("spawn monitor: {e}"))
            })?;

        monitors.insert(device_id.to_string(), Monitor { stop, context });
        debug!("Monitoring {}", device_id);
        Ok(())
    }

    async fn deactivate(&self, device_id: &str) -> TransportResult<()> {
        if let Some(monitor) = lock(&self.monitors).remove(device_id) {
            monitor.stop.store(true, Ordering::Release);
            if let Err(e) = monitor.context.cancel() {
                warn!("Failed to cancel monitor for {}: {}", device_id, e);
            }
            debug!("Stopped monitoring {}", device_id);
        }
        Ok(())
    }

    async fn probe_presence(&self, device_id: &str) -> TransportResult<bool> {
        let name = reader_name(device_id)?;
        let context = self.context.clone();
        blocking("probe presence", move || {
            let mut states = [ReaderState::new(name, State::UNAWARE)];
            context
                .get_status_change(Duration::ZERO, &mut states)
                .map_err(|e| failure(e, "read reader status"))?;
            Ok(states[0].event_state().contains(State::PRESENT))
        })
        .await
    }

    async fn connect(&self, device_id: &str) -> TransportResult<LinkInfo> {
        let name = reader_name(device_id)?;
        let context = self.context.clone();
        let link = LinkId::from_raw(self.next_link.fetch_add(1, Ordering::Relaxed));

        let (card, info) = blocking("connect", move || {
            let card = context
                .connect(&name, ShareMode::Shared, Protocols::ANY)
                .map_err(|e| failure(e, "connect"))?;
            let info = Self::link_info(link, &card)?;
            Ok((card, info))
        })
        .await?;

        lock(&self.links).insert(link, Arc::new(Mutex::new(card)));
        debug!("Connected {} on {}", link, device_id);
        Ok(info)
    }

    async fn probe_link(&self, link: LinkId) -> TransportResult<bool> {
        let card = self.card(link)?;
        blocking("probe link", move || match lock(&card).status2_owned() {
            Ok(_) => Ok(true),
            Err(pcsc::Error::RemovedCard | pcsc::Error::ResetCard | pcsc::Error::NoSmartcard) => {
                Ok(false)
            }
            Err(e) => Err(failure(e, "read card status")),
        })
        .await
    }

    async fn exchange(&self, link: LinkId, command: &[u8]) -> TransportResult<Vec<u8>> {
        let card = self.card(link)?;
        let command = command.to_vec();
        blocking("exchange", move || {
            let mut buffer = vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
            let response = lock(&card)
                .transmit(&command, &mut buffer)
                .map_err(|e| failure(e, "transmit"))?
                .to_vec();
            Ok(response)
        })
        .await
    }

    async fn reconnect(&self, link: LinkId) -> TransportResult<LinkInfo> {
        let card = self.card(link)?;
        blocking("reconnect", move || {
            let mut card = lock(&card);
            card.reconnect(ShareMode::Shared, Protocols::ANY, Disposition::ResetCard)
                .map_err(|e| failure(e, "reconnect"))?;
            Self::link_info(link, &card)
        })
        .await
    }

    async fn disconnect(&self, link: LinkId) -> TransportResult<()> {
        let Some(card) = lock(&self.links).remove(&link) else {
            return Err(TransportFailure::new(
                FailureCode::InvalidParameter,
                format!("{link} is not open"),
            ));
        };

        let Ok(card) = Arc::try_unwrap(card) else {
            // Still borrowed by an in-flight call; dropping the last Arc disconnects.
            return Ok(());
        };
        let card = card.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());

        blocking("disconnect", move || {
            card.disconnect(Disposition::LeaveCard)
                .map_err(|(_, e)| failure(e, "disconnect"))
        })
        .await
    }

    fn describe_error(&self, code: i64) -> String {
        KNOWN_ERRORS
            .iter()
            .find(|error| error.into_raw() as i64 == code)
            .map(|error| error.to_string())
            .unwrap_or_else(|| format!("unknown PC/SC error {code:#x}"))
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        for (_, monitor) in lock(&self.monitors).drain() {
            monitor.stop.store(true, Ordering::Release);
            let _ = monitor.context.cancel();
        }
    }
}
