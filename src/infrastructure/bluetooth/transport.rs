//! BLE transport
//!
//! Supervises one [`BleLink`]: connection state machine, serialized frame
//! writes split into packets, and inbound frame reassembly. Complete frames
//! and link loss are reported to a single registered [`FrameHandler`].

use crate::domain::models::{ConnectionState, DisconnectReason};
use crate::error::{ConnectError, SendError};
use crate::infrastructure::bluetooth::link::{BleLink, DiscoveryFilter, LinkEvent};
use crate::protocol::cobs;
use crate::protocol::frame::{FrameAssembler, Message};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Packet size used until the hub reports its own
pub const DEFAULT_PACKET_SIZE: usize = 20;

/// Receives everything the transport decodes
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, message: Message);

    fn on_disconnected(&self, reason: DisconnectReason);

    fn on_state_changed(&self, _state: ConnectionState) {}
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Extra attempts after a `LinkFailed` connect
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            connect_retry_delay: Duration::from_millis(1000),
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

/// State shared with the reader task
struct Shared {
    state: watch::Sender<ConnectionState>,
    handler: Mutex<Option<Arc<dyn FrameHandler>>>,
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn FrameHandler>> {
        self.handler.lock().ok().and_then(|h| h.clone())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state: {} -> {}", previous, state);
            if let Some(handler) = self.handler() {
                handler.on_state_changed(state);
            }
        }
    }

    /// Move `from -> to` only if the current state is `from`
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Connection state: {} -> {}", from, to);
            if let Some(handler) = self.handler() {
                handler.on_state_changed(to);
            }
        }
        changed
    }
}

pub struct Transport {
    link: Arc<dyn BleLink>,
    config: TransportConfig,
    shared: Arc<Shared>,
    write_lock: tokio::sync::Mutex<()>,
    packet_size: AtomicUsize,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(link: Arc<dyn BleLink>, config: TransportConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let packet_size = AtomicUsize::new(config.packet_size.max(1));
        Self {
            link,
            config,
            shared: Arc::new(Shared {
                state,
                handler: Mutex::new(None),
            }),
            write_lock: tokio::sync::Mutex::new(()),
            packet_size,
            reader: Mutex::new(None),
        }
    }

    /// Register the handler for inbound frames, replacing any previous one
    pub fn on_frame(&self, handler: Arc<dyn FrameHandler>) {
        if let Ok(mut slot) = self.shared.handler.lock() {
            *slot = Some(handler);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size.load(Ordering::Relaxed)
    }

    /// Maximum bytes per characteristic write, as reported by the hub
    pub fn set_packet_size(&self, size: usize) {
        if size > 0 {
            debug!("Packet size set to {}", size);
            self.packet_size.store(size, Ordering::Relaxed);
        }
    }

    pub async fn connect(&self, filter: &DiscoveryFilter) -> Result<(), ConnectError> {
        if !self
            .shared
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(ConnectError::AlreadyConnected);
        }

        info!("Connecting to hub...");
        let mut attempt = 0;
        let events = loop {
            attempt += 1;
            match self.link.connect(filter).await {
                Ok(events) => break events,
                Err(ConnectError::LinkFailed(reason)) if attempt <= self.config.connect_retries => {
                    warn!(
                        "Connect attempt {} failed: {}. Retrying in {:?}...",
                        attempt, reason, self.config.connect_retry_delay
                    );
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
                Err(e) => {
                    error!("Connect failed: {}", e);
                    self.shared.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        };

        self.packet_size
            .store(self.config.packet_size.max(1), Ordering::Relaxed);
        self.shared.set_state(ConnectionState::Connected);
        info!("Connected to hub");

        let reader = tokio::spawn(read_loop(events, self.link.clone(), self.shared.clone()));
        if let Ok(mut slot) = self.reader.lock() {
            if let Some(old) = slot.replace(reader) {
                old.abort();
            }
        }
        Ok(())
    }

    /// Write one envelope. Exactly one frame is on the wire at a time.
    pub async fn send(&self, envelope: &[u8]) -> Result<(), SendError> {
        if self.state() != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }

        let _guard = self.write_lock.lock().await;
        if self.state() != ConnectionState::Connected {
            return Err(SendError::LinkLost);
        }

        let frame = cobs::pack(envelope);
        trace!("Sending frame: {:02X?}", frame);
        for packet in frame.chunks(self.packet_size()) {
            if let Err(e) = self.link.write(packet).await {
                warn!("Write failed: {}", e);
                return Err(if self.state() == ConnectionState::Connected {
                    e
                } else {
                    SendError::LinkLost
                });
            }
        }
        Ok(())
    }

    /// Tear down the link. Does nothing unless connected.
    pub async fn disconnect(&self) {
        if !self
            .shared
            .transition(ConnectionState::Connected, ConnectionState::Disconnecting)
        {
            return;
        }

        info!("Disconnecting from hub...");
        if let Some(reader) = self.reader.lock().ok().and_then(|mut slot| slot.take()) {
            reader.abort();
        }

        // Wait for an in-flight frame to finish
        let _guard = self.write_lock.lock().await;
        self.link.disconnect().await;

        if let Some(handler) = self.shared.handler() {
            handler.on_disconnected(DisconnectReason::Requested);
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Disconnected");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().ok().and_then(|slot| slot.take()) {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    link: Arc<dyn BleLink>,
    shared: Arc<Shared>,
) {
    let mut assembler = FrameAssembler::new();

    while let Some(event) = events.recv().await {
        let bytes = match event {
            LinkEvent::Data(bytes) => bytes,
            LinkEvent::Disconnected => break,
        };
        trace!("Received packet: {:02X?}", bytes);

        for frame in assembler.push(&bytes) {
            match frame {
                Ok(message) => {
                    if let Some(handler) = shared.handler() {
                        handler.on_frame(message);
                    }
                }
                Err(e) => warn!("Discarding inbound frame: {}", e),
            }
        }
    }

    assembler.reset();
    if shared.transition(ConnectionState::Connected, ConnectionState::Error) {
        warn!("Link to hub lost");
        // Backends hold their session until told otherwise
        link.disconnect().await;
        if let Some(handler) = shared.handler() {
            handler.on_disconnected(DisconnectReason::LinkLost);
        }
        shared.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockLink;
    use crate::protocol::frame::{encode, encode_for_wire};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Message>>,
        disconnects: Mutex<Vec<DisconnectReason>>,
        states: Mutex<Vec<ConnectionState>>,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&self, message: Message) {
            self.frames.lock().unwrap().push(message);
        }

        fn on_disconnected(&self, reason: DisconnectReason) {
            self.disconnects.lock().unwrap().push(reason);
        }

        fn on_state_changed(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn setup(config: TransportConfig) -> (Arc<MockLink>, Transport, Arc<Recorder>) {
        let link = Arc::new(MockLink::new());
        let transport = Transport::new(link.clone(), config);
        let recorder = Arc::new(Recorder::default());
        transport.on_frame(recorder.clone());
        (link, transport, recorder)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (_link, transport, _) = setup(TransportConfig::default());
        assert_eq!(transport.send(&[1, 2, 3]).await, Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_frame_is_split_into_packets() {
        let (link, transport, _) = setup(TransportConfig {
            packet_size: 8,
            ..Default::default()
        });
        transport.connect(&DiscoveryFilter::default()).await.unwrap();

        let envelope = encode(&Message::request(1, vec![0x55; 30]));
        transport.send(&envelope).await.unwrap();

        let packets = link.written();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= 8));
        assert_eq!(packets.concat(), cobs::pack(&envelope));
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_handler() {
        let (link, transport, recorder) = setup(TransportConfig::default());
        transport.connect(&DiscoveryFilter::default()).await.unwrap();

        let message = Message::response(4, vec![0x47, 0x00]);
        let wire = encode_for_wire(&message);
        let (a, b) = wire.split_at(3);
        link.inject(&[0x99, 0x98, cobs::DELIMITER]);
        link.inject(a);
        link.inject(b);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*recorder.frames.lock().unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_link_loss_reports_and_resets_state() {
        let (link, transport, recorder) = setup(TransportConfig::default());
        transport.connect(&DiscoveryFilter::default()).await.unwrap();
        let mut state = transport.subscribe_state();

        link.drop_link();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        assert_eq!(*recorder.disconnects.lock().unwrap(), vec![DisconnectReason::LinkLost]);
        let states = recorder.states.lock().unwrap().clone();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Error,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(transport.send(&[1]).await, Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_reconnect_after_link_loss() {
        let (link, transport, recorder) = setup(TransportConfig::default());
        transport.connect(&DiscoveryFilter::default()).await.unwrap();
        let mut state = transport.subscribe_state();

        link.drop_link();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(link.disconnect_calls(), 1);
        assert!(!link.is_connected());

        transport.connect(&DiscoveryFilter::default()).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        transport.send(&[1, 2, 3]).await.unwrap();
        assert_eq!(*recorder.disconnects.lock().unwrap(), vec![DisconnectReason::LinkLost]);
    }

    /// Yields before every packet so concurrent writers get a chance to interleave
    struct YieldingLink(MockLink);

    #[async_trait]
    impl BleLink for YieldingLink {
        async fn connect(
            &self,
            filter: &DiscoveryFilter,
        ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, ConnectError> {
            self.0.connect(filter).await
        }

        async fn write(&self, packet: &[u8]) -> Result<(), SendError> {
            tokio::task::yield_now().await;
            self.0.write(packet).await
        }

        async fn disconnect(&self) {
            self.0.disconnect().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let link = Arc::new(YieldingLink(MockLink::new()));
        let transport = Transport::new(
            link.clone(),
            TransportConfig {
                packet_size: 4,
                ..Default::default()
            },
        );
        transport.connect(&DiscoveryFilter::default()).await.unwrap();

        let a = encode(&Message::request(1, vec![0xAA; 24]));
        let b = encode(&Message::request(2, vec![0xBB; 24]));
        let (ra, rb) = tokio::join!(transport.send(&a), transport.send(&b));
        ra.unwrap();
        rb.unwrap();

        let mut expected = cobs::pack(&a);
        expected.extend(cobs::pack(&b));
        assert_eq!(link.0.written().concat(), expected);
    }

    #[tokio::test]
    async fn test_requested_disconnect_is_idempotent() {
        let (link, transport, recorder) = setup(TransportConfig::default());
        transport.connect(&DiscoveryFilter::default()).await.unwrap();

        transport.disconnect().await;
        transport.disconnect().await;

        assert!(!link.is_connected());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(*recorder.disconnects.lock().unwrap(), vec![DisconnectReason::Requested]);
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let (_link, transport, _) = setup(TransportConfig::default());
        transport.connect(&DiscoveryFilter::default()).await.unwrap();
        assert_eq!(
            transport.connect(&DiscoveryFilter::default()).await,
            Err(ConnectError::AlreadyConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failures_are_retried() {
        let (link, transport, _) = setup(TransportConfig {
            connect_retries: 2,
            ..Default::default()
        });
        link.fail_next_connects([
            ConnectError::LinkFailed("busy".into()),
            ConnectError::LinkFailed("busy".into()),
        ]);

        transport.connect(&DiscoveryFilter::default()).await.unwrap();
        assert_eq!(link.connect_attempts(), 3);
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let (link, transport, _) = setup(TransportConfig::default());
        link.fail_next_connects([ConnectError::NotFound]);

        assert_eq!(
            transport.connect(&DiscoveryFilter::default()).await,
            Err(ConnectError::NotFound)
        );
        assert_eq!(link.connect_attempts(), 1);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
