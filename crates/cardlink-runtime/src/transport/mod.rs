//! Reader transports.
//!
//! A [`Transport`] is the boundary to whatever actually talks to readers: the
//! platform PC/SC service, an integrated NFC controller, or the in-process
//! [`MockTransport`](crate::mock::MockTransport). The runtime only ever sees
//! byte-level operations and [`TransportFailure`]s; every failure crosses into
//! the public error model through [`map_transport_failure`] and nowhere else.
//!
//! Transports report card arrival and removal asynchronously by pushing
//! [`PresenceSignal`]s into the [`PresenceSink`] handed to them on
//! [`Transport::activate`]. The sink is non-blocking so it can be fed from
//! driver threads as well as tasks.
//!
//! Native `async fn` in traits is not object safe, so transports are
//! dispatched through the [`AnyTransport`] enum.

#![allow(async_fn_in_trait)]

#[cfg(feature = "hardware-pcsc")]
pub mod pcsc;

use std::fmt;

use cardlink_core::{DeviceInfo, Error, ErrorKind};
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::mock::MockTransport;

/// Transport-level failure category.
///
/// Vendor codes (PC/SC `SCARD_*`, NFC controller status) are folded into
/// these before they leave the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FailureCode {
    /// The reader service is not running or stopped.
    ServiceUnavailable,
    /// The service reports no readers at all.
    NoReaders,
    /// The reader name is not known to the service.
    UnknownReader,
    /// The reader exists but cannot be used right now.
    ReaderUnavailable,
    /// Another client holds the reader exclusively.
    ReaderBusy,
    /// No card in the field.
    NoCard,
    /// The card left the field or was reset under the link.
    CardRemoved,
    /// The card is present but does not answer.
    CardUnresponsive,
    /// Framing or line error between reader and card.
    CommunicationError,
    Timeout,
    Cancelled,
    InvalidParameter,
    InsufficientBuffer,
    /// Reader and card could not agree on a protocol.
    ProtocolMismatch,
    Unsupported,
    /// Anything the transport could not classify.
    Unknown,
}

impl FailureCode {
    /// Whether the failure means the card is no longer reachable.
    pub fn is_card_loss(&self) -> bool {
        matches!(self, FailureCode::NoCard | FailureCode::CardRemoved)
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureCode::ServiceUnavailable => "reader service unavailable",
            FailureCode::NoReaders => "no readers available",
            FailureCode::UnknownReader => "unknown reader",
            FailureCode::ReaderUnavailable => "reader unavailable",
            FailureCode::ReaderBusy => "reader in use by another client",
            FailureCode::NoCard => "no card in the field",
            FailureCode::CardRemoved => "card removed",
            FailureCode::CardUnresponsive => "card unresponsive",
            FailureCode::CommunicationError => "communication error",
            FailureCode::Timeout => "timed out",
            FailureCode::Cancelled => "cancelled",
            FailureCode::InvalidParameter => "invalid parameter",
            FailureCode::InsufficientBuffer => "insufficient buffer",
            FailureCode::ProtocolMismatch => "protocol mismatch",
            FailureCode::Unsupported => "unsupported",
            FailureCode::Unknown => "unknown transport failure",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A failed transport operation.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{code}: {message}")]
pub struct TransportFailure {
    pub code: FailureCode,

    /// Vendor code, when the transport has one.
    pub raw: Option<i64>,

    pub message: String,
}

impl TransportFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            raw: None,
            message: message.into(),
        }
    }

    pub fn with_raw(mut self, raw: i64) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn is_card_loss(&self) -> bool {
        self.code.is_card_loss()
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportFailure>;

/// The error kind a transport failure surfaces as.
///
/// Unrecognised failures surface as `PLATFORM_ERROR`.
pub fn failure_kind(code: FailureCode) -> ErrorKind {
    match code {
        FailureCode::NoReaders => ErrorKind::NoReaders,
        FailureCode::ReaderUnavailable | FailureCode::ReaderBusy => ErrorKind::ReaderError,
        FailureCode::UnknownReader | FailureCode::InvalidParameter => ErrorKind::InvalidParameter,
        FailureCode::NoCard => ErrorKind::CardNotPresent,
        FailureCode::CardRemoved
        | FailureCode::CardUnresponsive
        | FailureCode::CommunicationError => ErrorKind::TransmissionError,
        FailureCode::Timeout | FailureCode::Cancelled => ErrorKind::Timeout,
        FailureCode::InsufficientBuffer => ErrorKind::ResourceLimit,
        FailureCode::ProtocolMismatch => ErrorKind::ProtocolError,
        FailureCode::Unsupported => ErrorKind::UnsupportedOperation,
        FailureCode::ServiceUnavailable | FailureCode::Unknown => ErrorKind::PlatformError,
    }
}

/// Translate a transport failure into the public error model.
pub fn map_transport_failure(failure: TransportFailure) -> Error {
    let kind = failure_kind(failure.code);
    match failure.raw {
        Some(raw) => Error::new(kind, format!("{failure} (code {raw:#x})")),
        None => Error::new(kind, failure.to_string()),
    }
}

impl From<TransportFailure> for Error {
    fn from(failure: TransportFailure) -> Self {
        map_transport_failure(failure)
    }
}

/// Identifier of an open card link, issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// What a transport learned while opening a card link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub link: LinkId,

    /// Historical bytes (or the full ATR for contact readers).
    pub historical_bytes: Option<Vec<u8>>,

    /// Higher-layer response from the activation sequence (ISO 14443-4 ATS/ATTRIB).
    pub higher_layer_response: Option<Vec<u8>>,
}

impl LinkInfo {
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            historical_bytes: None,
            higher_layer_response: None,
        }
    }

    pub fn with_historical_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.historical_bytes = Some(bytes.into());
        self
    }

    pub fn with_higher_layer_response(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.higher_layer_response = Some(bytes.into());
        self
    }

    /// The bytes reported by `get_atr`: historical bytes if the transport
    /// supplied any, else the higher-layer response, else nothing.
    pub fn atr(&self) -> Vec<u8> {
        self.historical_bytes
            .as_ref()
            .or(self.higher_layer_response.as_ref())
            .cloned()
            .unwrap_or_default()
    }
}

/// Asynchronous presence notification from a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    /// A card entered the field.
    CardArrived,
    /// The card left the field.
    CardDeparted,
    /// The reader itself went away (unplugged, radio off, service stopped).
    ReaderLost,
}

/// Where a transport pushes [`PresenceSignal`]s for one activated device.
#[derive(Debug, Clone)]
pub struct PresenceSink {
    tx: mpsc::Sender<PresenceSignal>,
}

impl PresenceSink {
    /// Create a sink and the receiver the device listens on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PresenceSignal>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Push a signal without blocking.
    ///
    /// Returns `false` if the device is gone or the buffer is full; a full
    /// buffer drops the signal.
    pub fn signal(&self, signal: PresenceSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                warn!("Presence buffer full, dropping {:?}", signal);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn card_arrived(&self) -> bool {
        self.signal(PresenceSignal::CardArrived)
    }

    pub fn card_departed(&self) -> bool {
        self.signal(PresenceSignal::CardDeparted)
    }

    pub fn reader_lost(&self) -> bool {
        self.signal(PresenceSignal::ReaderLost)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Byte-level access to readers and cards.
///
/// Device ids are the [`DeviceInfo::id`]s returned by
/// [`enumerate`](Self::enumerate). Implementations must be safe to call from
/// several tasks at once; the runtime serializes per-link operations itself.
pub trait Transport: Send + Sync {
    /// List the readers/antennas currently available.
    async fn enumerate(&self) -> TransportResult<Vec<DeviceInfo>>;

    /// Turn on reader mode for `device_id` and start reporting presence to `sink`.
    ///
    /// If a card is already in the field the transport reports it through
    /// the sink right away.
    async fn activate(&self, device_id: &str, sink: PresenceSink) -> TransportResult<()>;

    /// Stop presence reporting and turn reader mode off.
    async fn deactivate(&self, device_id: &str) -> TransportResult<()>;

    /// Poll whether a card is in the field right now.
    async fn probe_presence(&self, device_id: &str) -> TransportResult<bool>;

    /// Open a link to the card in the field.
    async fn connect(&self, device_id: &str) -> TransportResult<LinkInfo>;

    /// Whether the link still reaches the same card.
    async fn probe_link(&self, link: LinkId) -> TransportResult<bool>;

    /// Send one command, return the raw response bytes.
    async fn exchange(&self, link: LinkId, command: &[u8]) -> TransportResult<Vec<u8>>;

    /// Reset the card under an open link and re-establish it.
    async fn reconnect(&self, link: LinkId) -> TransportResult<LinkInfo>;

    /// Close the link. Closing an unknown link is an error.
    async fn disconnect(&self, link: LinkId) -> TransportResult<()>;

    /// Human-readable text for a vendor error code.
    fn describe_error(&self, code: i64) -> String;
}

/// Enum wrapper for transport dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyTransport {
    /// In-process simulated readers.
    Mock(MockTransport),

    /// Platform PC/SC service.
    #[cfg(feature = "hardware-pcsc")]
    Pcsc(pcsc::PcscTransport),
}

impl AnyTransport {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AnyTransport::Mock(_) => "mock",
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(_) => "pcsc",
        }
    }
}

impl From<MockTransport> for AnyTransport {
    fn from(transport: MockTransport) -> Self {
        AnyTransport::Mock(transport)
    }
}

#[cfg(feature = "hardware-pcsc")]
impl From<pcsc::PcscTransport> for AnyTransport {
    fn from(transport: pcsc::PcscTransport) -> Self {
        AnyTransport::Pcsc(transport)
    }
}

impl Transport for AnyTransport {
    async fn enumerate(&self) -> TransportResult<Vec<DeviceInfo>> {
        match self {
            AnyTransport::Mock(t) => t.enumerate().await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.enumerate().await,
        }
    }

    async fn activate(&self, device_id: &str, sink: PresenceSink) -> TransportResult<()> {
        match self {
            AnyTransport::Mock(t) => t.activate(device_id, sink).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.activate(device_id, sink).await,
        }
    }

    async fn deactivate(&self, device_id: &str) -> TransportResult<()> {
        match self {
            AnyTransport::Mock(t) => t.deactivate(device_id).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.deactivate(device_id).await,
        }
    }

    async fn probe_presence(&self, device_id: &str) -> TransportResult<bool> {
        match self {
            AnyTransport::Mock(t) => t.probe_presence(device_id).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.probe_presence(device_id).await,
        }
    }

    async fn connect(&self, device_id: &str) -> TransportResult<LinkInfo> {
        match self {
            AnyTransport::Mock(t) => t.connect(device_id).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.connect(device_id).await,
        }
    }

    async fn probe_link(&self, link: LinkId) -> TransportResult<bool> {
        match self {
            AnyTransport::Mock(t) => t.probe_link(link).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.probe_link(link).await,
        }
    }

    async fn exchange(&self, link: LinkId, command: &[u8]) -> TransportResult<Vec<u8>> {
        match self {
            AnyTransport::Mock(t) => t.exchange(link, command).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.exchange(link, command).await,
        }
    }

    async fn reconnect(&self, link: LinkId) -> TransportResult<LinkInfo> {
        match self {
            AnyTransport::Mock(t) => t.reconnect(link).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.reconnect(link).await,
        }
    }

    async fn disconnect(&self, link: LinkId) -> TransportResult<()> {
        match self {
            AnyTransport::Mock(t) => t.disconnect(link).await,
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.disconnect(link).await,
        }
    }

    fn describe_error(&self, code: i64) -> String {
        match self {
            AnyTransport::Mock(t) => t.describe_error(code),
            #[cfg(feature = "hardware-pcsc")]
            AnyTransport::Pcsc(t) => t.describe_error(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FailureCode::NoReaders, ErrorKind::NoReaders)]
    #[case(FailureCode::ReaderBusy, ErrorKind::ReaderError)]
    #[case(FailureCode::UnknownReader, ErrorKind::InvalidParameter)]
    #[case(FailureCode::NoCard, ErrorKind::CardNotPresent)]
    #[case(FailureCode::CardRemoved, ErrorKind::TransmissionError)]
    #[case(FailureCode::CommunicationError, ErrorKind::TransmissionError)]
    #[case(FailureCode::Cancelled, ErrorKind::Timeout)]
    #[case(FailureCode::InsufficientBuffer, ErrorKind::ResourceLimit)]
    #[case(FailureCode::ProtocolMismatch, ErrorKind::ProtocolError)]
    #[case(FailureCode::Unsupported, ErrorKind::UnsupportedOperation)]
    #[case(FailureCode::ServiceUnavailable, ErrorKind::PlatformError)]
    #[case(FailureCode::Unknown, ErrorKind::PlatformError)]
    fn test_failure_mapping(#[case] code: FailureCode, #[case] kind: ErrorKind) {
        let error = map_transport_failure(TransportFailure::new(code, "boom"));
        assert_eq!(error.kind(), kind);
        assert!(error.message().contains("boom"));
    }

    #[test]
    fn test_mapping_keeps_raw_code() {
        let failure = TransportFailure::new(FailureCode::Unknown, "vendor").with_raw(0x8010_0069);
        let error: Error = failure.into();
        assert!(error.is(ErrorKind::PlatformError));
        assert!(error.message().contains("0x80100069"));
    }

    #[test]
    fn test_card_loss_codes() {
        assert!(FailureCode::NoCard.is_card_loss());
        assert!(FailureCode::CardRemoved.is_card_loss());
        assert!(!FailureCode::CardUnresponsive.is_card_loss());
        assert!(!FailureCode::Timeout.is_card_loss());
    }

    #[test]
    fn test_link_info_atr_preference() {
        let link = LinkId::from_raw(1);
        let both = LinkInfo::new(link)
            .with_historical_bytes(vec![0x80, 0x73])
            .with_higher_layer_response(vec![0x01]);
        assert_eq!(both.atr(), vec![0x80, 0x73]);

        let hlr_only = LinkInfo::new(link).with_higher_layer_response(vec![0x01]);
        assert_eq!(hlr_only.atr(), vec![0x01]);

        assert!(LinkInfo::new(link).atr().is_empty());
    }

    #[test]
    fn test_presence_sink_drops_when_full() {
        let (sink, mut rx) = PresenceSink::channel(1);
        assert!(sink.card_arrived());
        assert!(!sink.card_departed());
        assert_eq!(rx.try_recv().unwrap(), PresenceSignal::CardArrived);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_presence_sink_closed() {
        let (sink, rx) = PresenceSink::channel(4);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.reader_lost());
    }
}
