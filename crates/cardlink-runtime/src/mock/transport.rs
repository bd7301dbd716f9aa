//! Mock reader transport for testing and development.
//!
//! [`MockTransport`] simulates any number of readers in process. The paired
//! [`MockTransportHandle`] drives it from the test side: plug readers in and
//! out, insert and remove cards, script card responses, slow down exchanges
//! and inject failures. Both halves share one state table, so changes made
//! through the handle are visible to the transport immediately.
//!
//! ```
//! use cardlink_core::DeviceInfo;
//! use cardlink_runtime::mock::{MockCard, MockTransport};
//!
//! let (transport, handle) = MockTransport::new();
//! handle.add_reader(DeviceInfo::contact_reader("Mock Reader 0"));
//! handle.insert_card("Mock Reader 0", MockCard::new().with_historical_bytes(vec![0x80, 0x31]));
//! assert!(handle.has_card("Mock Reader 0"));
//! # drop(transport);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cardlink_core::DeviceInfo;
use tracing::{debug, trace};

use crate::lock;
use crate::transport::{
    FailureCode, LinkId, LinkInfo, PresenceSignal, PresenceSink, Transport, TransportFailure,
    TransportResult,
};

/// Responses of a simulated card.
///
/// Commands are matched on their exact encoded bytes. Unscripted commands
/// get `9000` for SELECT (INS `A4`) and `6D00` otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCard {
    historical_bytes: Option<Vec<u8>>,
    higher_layer_response: Option<Vec<u8>>,
    responses: HashMap<Vec<u8>, Vec<u8>>,
}

impl MockCard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_historical_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.historical_bytes = Some(bytes.into());
        self
    }

    pub fn with_higher_layer_response(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.higher_layer_response = Some(bytes.into());
        self
    }

    /// Answer `command` with `response` (data followed by SW1 SW2).
    pub fn with_response(
        mut self,
        command: impl Into<Vec<u8>>,
        response: impl Into<Vec<u8>>,
    ) -> Self {
        self.responses.insert(command.into(), response.into());
        self
    }

    fn respond(&self, command: &[u8]) -> Vec<u8> {
        if let Some(response) = self.responses.get(command) {
            return response.clone();
        }

        match command.get(1) {
            Some(0xA4) => vec![0x90, 0x00],
            _ => vec![0x6D, 0x00],
        }
    }

    fn link_info(&self, link: LinkId) -> LinkInfo {
        LinkInfo {
            link,
            historical_bytes: self.historical_bytes.clone(),
            higher_layer_response: self.higher_layer_response.clone(),
        }
    }
}

/// Transport operations a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Enumerate,
    Activate,
    Deactivate,
    Connect,
    Exchange,
    Reconnect,
    Disconnect,
}

/// One entry of the exchange log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeRecord {
    /// An exchange began on `link` with `command`.
    Started { link: LinkId, command: Vec<u8> },
    /// The exchange that last started on `link` finished.
    Finished { link: LinkId, ok: bool },
}

#[derive(Debug)]
struct InsertedCard {
    card: MockCard,
    /// Bumped on every insertion so links to an earlier card go stale.
    serial: u64,
}

#[derive(Debug)]
struct MockReader {
    info: DeviceInfo,
    card: Option<InsertedCard>,
    sink: Option<PresenceSink>,
}

impl MockReader {
    fn notify(&self, signal: PresenceSignal) {
        if let Some(sink) = &self.sink {
            sink.signal(signal);
        }
    }
}

#[derive(Debug, Clone)]
struct MockLink {
    reader: String,
    serial: u64,
}

#[derive(Debug, Default)]
struct MockState {
    readers: BTreeMap<String, MockReader>,
    links: HashMap<LinkId, MockLink>,
    next_link: u64,
    next_serial: u64,
    exchange_delay: Duration,
    failures: HashMap<MockOperation, FailureCode>,
    exchange_log: Vec<ExchangeRecord>,
    connects: usize,
    disconnects: usize,
    resets: usize,
}

impl MockState {
    fn injected(&self, op: MockOperation) -> TransportResult<()> {
        match self.failures.get(&op) {
            Some(code) => Err(TransportFailure::new(
                *code,
                format!("injected failure on {op:?}"),
            )),
            None => Ok(()),
        }
    }

    fn reader(&self, id: &str) -> TransportResult<&MockReader> {
        self.readers
            .get(id)
            .ok_or_else(|| {
                TransportFailure::new(FailureCode::UnknownReader, format!("no reader named {id:?}"))
            })
    }

    fn link(&self, link: LinkId) -> TransportResult<&MockLink> {
        self.links
            .get(&link)
            .ok_or_else(|| {
                TransportFailure::new(FailureCode::InvalidParameter, format!("unknown {link}"))
            })
    }

    /// The card behind `link`, if it is still the one the link was opened to.
    fn linked_card(&self, link: LinkId) -> TransportResult<&MockCard> {
        let entry = self.link(link)?;
        self.readers
            .get(&entry.reader)
            .and_then(|reader| reader.card.as_ref())
            .filter(|inserted| inserted.serial == entry.serial)
            .map(|inserted| &inserted.card)
            .ok_or_else(|| {
                TransportFailure::new(FailureCode::CardRemoved, format!("card behind {link} is gone"))
            })
    }
}

/// Simulated reader transport.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a transport with no readers and the handle that controls it.
    pub fn new() -> (Self, MockTransportHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockTransportHandle { state },
        )
    }

    /// Create a transport with one contact reader named `reader_id`.
    pub fn with_reader(reader_id: &str) -> (Self, MockTransportHandle) {
        let (transport, handle) = Self::new();
        handle.add_reader(DeviceInfo::contact_reader(reader_id).with_friendly_name("Mock Reader"));
        (transport, handle)
    }
}

impl Transport for MockTransport {
    async fn enumerate(&self) -> TransportResult<Vec<DeviceInfo>> {
        let state = lock(&self.state);
        state.injected(MockOperation::Enumerate)?;
        Ok(state.readers.values().map(|r| r.info.clone()).collect())
    }

    async fn activate(&self, device_id: &str, sink: PresenceSink) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.injected(MockOperation::Activate)?;

        let Some(reader) = state.readers.get_mut(device_id) else {
            return Err(TransportFailure::new(
                FailureCode::UnknownReader,
                format!("no reader named {device_id:?}"),
            ));
        };
        if reader.sink.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(TransportFailure::new(
                FailureCode::ReaderBusy,
                format!("{device_id} already in reader mode"),
            ));
        }

        if reader.card.is_some() {
            sink.card_arrived();
        }
        reader.sink = Some(sink);
        debug!("Mock reader {} activated", device_id);
        Ok(())
    }

    async fn deactivate(&self, device_id: &str) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.injected(MockOperation::Deactivate)?;
        if let Some(reader) = state.readers.get_mut(device_id) {
            reader.sink = None;
        }
        debug!("Mock reader {} deactivated", device_id);
        Ok(())
    }

    async fn probe_presence(&self, device_id: &str) -> TransportResult<bool> {
        let state = lock(&self.state);
        Ok(state.reader(device_id)?.card.is_some())
    }

    async fn connect(&self, device_id: &str) -> TransportResult<LinkInfo> {
        let mut state = lock(&self.state);
        state.injected(MockOperation::Connect)?;

        let link = LinkId::from_raw(state.next_link + 1);
        let (serial, info) = match state.reader(device_id)?.card.as_ref() {
            Some(inserted) => (inserted.serial, inserted.card.link_info(link)),
            None => {
                return Err(TransportFailure::new(
                    FailureCode::NoCard,
                    format!("no card on {device_id}"),
                ));
            }
        };

        state.next_link += 1;
        state.links.insert(
            link,
            MockLink {
                reader: device_id.to_string(),
                serial,
            },
        );
        state.connects += 1;

        debug!("Mock {} opened on {}", link, device_id);
        Ok(info)
    }

    async fn probe_link(&self, link: LinkId) -> TransportResult<bool> {
        let state = lock(&self.state);
        state.link(link)?;
        Ok(state.linked_card(link).is_ok())
    }

    async fn exchange(&self, link: LinkId, command: &[u8]) -> TransportResult<Vec<u8>> {
        let delay = {
            let mut state = lock(&self.state);
            state.linked_card(link)?;
            state.injected(MockOperation::Exchange)?;
            state.exchange_log.push(ExchangeRecord::Started {
                link,
                command: command.to_vec(),
            });
            state.exchange_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let result = state.linked_card(link).map(|card| card.respond(command));
        state.exchange_log.push(ExchangeRecord::Finished {
            link,
            ok: result.is_ok(),
        });

        if let Ok(response) = &result {
            trace!(
                "Mock {} >> {} << {}",
                link,
                hex::encode_upper(command),
                hex::encode_upper(response)
            );
        }
        result
    }

    async fn reconnect(&self, link: LinkId) -> TransportResult<LinkInfo> {
        let mut state = lock(&self.state);
        state.injected(MockOperation::Reconnect)?;
        let info = state.linked_card(link)?.link_info(link);
        state.resets += 1;
        Ok(info)
    }

    async fn disconnect(&self, link: LinkId) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.injected(MockOperation::Disconnect)?;
        state.link(link)?;
        state.links.remove(&link);
        state.disconnects += 1;
        debug!("Mock {} closed", link);
        Ok(())
    }

    fn describe_error(&self, code: i64) -> String {
        format!("mock transport error {code}")
    }
}

/// Test-side control of a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransportHandle {
    /// Plug in a reader. Replaces any reader with the same id.
    pub fn add_reader(&self, info: DeviceInfo) {
        let mut state = lock(&self.state);
        state.readers.insert(
            info.id.clone(),
            MockReader {
                info,
                card: None,
                sink: None,
            },
        );
    }

    /// Unplug a reader. An activated device sees its card leave and the reader go.
    pub fn remove_reader(&self, reader_id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(reader) = state.readers.remove(reader_id) else {
            return false;
        };
        if reader.card.is_some() {
            reader.notify(PresenceSignal::CardDeparted);
        }
        reader.notify(PresenceSignal::ReaderLost);
        true
    }

    /// Put a card in the field, replacing any card already there.
    pub fn insert_card(&self, reader_id: &str, card: MockCard) -> bool {
        let mut state = lock(&self.state);
        state.next_serial += 1;
        let serial = state.next_serial;

        let Some(reader) = state.readers.get_mut(reader_id) else {
            return false;
        };
        if reader.card.is_some() {
            reader.notify(PresenceSignal::CardDeparted);
        }
        reader.card = Some(InsertedCard { card, serial });
        reader.notify(PresenceSignal::CardArrived);
        true
    }

    /// Take the card out of the field.
    pub fn remove_card(&self, reader_id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(reader) = state.readers.get_mut(reader_id) else {
            return false;
        };
        if reader.card.take().is_none() {
            return false;
        }
        reader.notify(PresenceSignal::CardDeparted);
        true
    }

    pub fn has_card(&self, reader_id: &str) -> bool {
        lock(&self.state)
            .readers
            .get(reader_id)
            .is_some_and(|r| r.card.is_some())
    }

    /// Whether a device currently has reader mode on for `reader_id`.
    pub fn is_active(&self, reader_id: &str) -> bool {
        lock(&self.state)
            .readers
            .get(reader_id)
            .is_some_and(|r| r.sink.as_ref().is_some_and(|s| !s.is_closed()))
    }

    /// Make every exchange take at least `delay`.
    pub fn set_exchange_delay(&self, delay: Duration) {
        lock(&self.state).exchange_delay = delay;
    }

    /// Fail every call to `op` with `code` until cleared.
    pub fn fail(&self, op: MockOperation, code: FailureCode) {
        lock(&self.state).failures.insert(op, code);
    }

    pub fn clear_failure(&self, op: MockOperation) {
        lock(&self.state).failures.remove(&op);
    }

    pub fn exchange_log(&self) -> Vec<ExchangeRecord> {
        lock(&self.state).exchange_log.clone()
    }

    /// Commands that reached a card, in order.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        lock(&self.state)
            .exchange_log
            .iter()
            .filter_map(|record| match record {
                ExchangeRecord::Started { command, .. } => Some(command.clone()),
                ExchangeRecord::Finished { .. } => None,
            })
            .collect()
    }

    pub fn open_links(&self) -> usize {
        lock(&self.state).links.len()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn reset_count(&self) -> usize {
        lock(&self.state).resets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PresenceSignal;

    const READER: &str = "Mock Reader 0";

    fn setup() -> (MockTransport, MockTransportHandle) {
        MockTransport::with_reader(READER)
    }

    #[tokio::test]
    async fn test_enumerate() {
        let (transport, handle) = setup();
        handle.add_reader(DeviceInfo::integrated_nfc("nfc0"));

        let readers = transport.enumerate().await.unwrap();
        let ids: Vec<_> = readers.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![READER, "nfc0"]);
    }

    #[tokio::test]
    async fn test_activate_reports_existing_card() {
        let (transport, handle) = setup();
        handle.insert_card(READER, MockCard::new());

        let (sink, mut rx) = PresenceSink::channel(4);
        transport.activate(READER, sink).await.unwrap();

        assert_eq!(rx.recv().await, Some(PresenceSignal::CardArrived));
        assert!(handle.is_active(READER));
    }

    #[tokio::test]
    async fn test_activate_twice_is_busy() {
        let (transport, _handle) = setup();
        let (sink, _rx) = PresenceSink::channel(4);
        transport.activate(READER, sink.clone()).await.unwrap();

        let err = transport.activate(READER, sink).await.unwrap_err();
        assert_eq!(err.code, FailureCode::ReaderBusy);
    }

    #[tokio::test]
    async fn test_activate_unknown_reader() {
        let (transport, _handle) = setup();
        let (sink, _rx) = PresenceSink::channel(4);
        let err = transport.activate("nope", sink).await.unwrap_err();
        assert_eq!(err.code, FailureCode::UnknownReader);
    }

    #[tokio::test]
    async fn test_insert_and_remove_signal() {
        let (transport, handle) = setup();
        let (sink, mut rx) = PresenceSink::channel(4);
        transport.activate(READER, sink).await.unwrap();

        assert!(handle.insert_card(READER, MockCard::new()));
        assert!(handle.remove_card(READER));
        assert!(!handle.remove_card(READER));

        assert_eq!(rx.recv().await, Some(PresenceSignal::CardArrived));
        assert_eq!(rx.recv().await, Some(PresenceSignal::CardDeparted));
    }

    #[tokio::test]
    async fn test_default_responses() {
        let (transport, handle) = setup();
        handle.insert_card(READER, MockCard::new());
        let link = transport.connect(READER).await.unwrap().link;

        let select = transport
            .exchange(link, &[0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00])
            .await
            .unwrap();
        assert_eq!(select, vec![0x90, 0x00]);

        let other = transport.exchange(link, &[0x00, 0xB0, 0x00, 0x00]).await.unwrap();
        assert_eq!(other, vec![0x6D, 0x00]);
    }

    #[tokio::test]
    async fn test_scripted_response() {
        let (transport, handle) = setup();
        let card = MockCard::new()
            .with_response(vec![0x80, 0xCA, 0x9F, 0x7F, 0x00], vec![0x01, 0x02, 0x90, 0x00]);
        handle.insert_card(READER, card);
        let link = transport.connect(READER).await.unwrap().link;

        let response = transport
            .exchange(link, &[0x80, 0xCA, 0x9F, 0x7F, 0x00])
            .await
            .unwrap();
        assert_eq!(response, vec![0x01, 0x02, 0x90, 0x00]);
        assert_eq!(handle.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_card() {
        let (transport, _handle) = setup();
        let err = transport.connect(READER).await.unwrap_err();
        assert_eq!(err.code, FailureCode::NoCard);
    }

    #[tokio::test]
    async fn test_link_goes_stale_on_card_swap() {
        let (transport, handle) = setup();
        handle.insert_card(READER, MockCard::new());
        let link = transport.connect(READER).await.unwrap().link;
        assert!(transport.probe_link(link).await.unwrap());

        handle.insert_card(READER, MockCard::new());
        assert!(!transport.probe_link(link).await.unwrap());

        let err = transport.exchange(link, &[0x00, 0xA4, 0x04, 0x00]).await.unwrap_err();
        assert_eq!(err.code, FailureCode::CardRemoved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_during_delayed_exchange() {
        let (transport, handle) = setup();
        handle.insert_card(READER, MockCard::new());
        handle.set_exchange_delay(Duration::from_millis(100));
        let link = transport.connect(READER).await.unwrap().link;

        let exchange = transport.exchange(link, &[0x00, 0xA4, 0x04, 0x00]);
        let remove = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.remove_card(READER);
        };
        let (result, ()) = tokio::join!(exchange, remove);

        assert_eq!(result.unwrap_err().code, FailureCode::CardRemoved);
        assert_eq!(
            handle.exchange_log().last(),
            Some(&ExchangeRecord::Finished { link, ok: false })
        );
    }

    #[tokio::test]
    async fn test_disconnect_twice_fails() {
        let (transport, handle) = setup();
        handle.insert_card(READER, MockCard::new());
        let link = transport.connect(READER).await.unwrap().link;

        transport.disconnect(link).await.unwrap();
        assert!(transport.disconnect(link).await.is_err());
        assert_eq!(handle.disconnect_count(), 1);
        assert_eq!(handle.open_links(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (transport, handle) = setup();
        handle.fail(MockOperation::Enumerate, FailureCode::ServiceUnavailable);
        assert_eq!(
            transport.enumerate().await.unwrap_err().code,
            FailureCode::ServiceUnavailable
        );

        handle.clear_failure(MockOperation::Enumerate);
        assert!(transport.enumerate().await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_reader_signals_loss() {
        let (transport, handle) = setup();
        handle.insert_card(READER, MockCard::new());
        let (sink, mut rx) = PresenceSink::channel(8);
        transport.activate(READER, sink).await.unwrap();

        assert!(handle.remove_reader(READER));
        assert_eq!(rx.recv().await, Some(PresenceSignal::CardArrived));
        assert_eq!(rx.recv().await, Some(PresenceSignal::CardDeparted));
        assert_eq!(rx.recv().await, Some(PresenceSignal::ReaderLost));
        assert!(transport.enumerate().await.unwrap().is_empty());
    }
}
