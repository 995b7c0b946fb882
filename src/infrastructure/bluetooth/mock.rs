//! In-memory link for tests and simulations.
//!
//! Every written packet is recorded and can optionally be answered by a
//! responder closure, which lets a test script a hub without radio hardware.
//! Like the radio backends, the session is only released by
//! [`BleLink::disconnect`], even after the link drops.

use crate::error::{ConnectError, SendError};
use crate::infrastructure::bluetooth::link::{BleLink, DiscoveryFilter, LinkEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Produces the inbound packets to deliver in reply to one written packet
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    /// Held from a successful connect until `disconnect`
    session: bool,
    inbound: Option<mpsc::UnboundedSender<LinkEvent>>,
    written: Vec<Vec<u8>>,
    connect_failures: VecDeque<ConnectError>,
    connect_attempts: u32,
    disconnect_calls: u32,
    responder: Option<Responder>,
}

#[derive(Default)]
pub struct MockLink {
    state: Mutex<MockState>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next connection attempts with these errors, in order
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = ConnectError>) {
        self.lock().connect_failures.extend(errors);
    }

    pub fn set_responder(&self, responder: Responder) {
        self.lock().responder = Some(responder);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.lock().disconnect_calls
    }

    /// Whether a session is held, whether or not the link is still up
    pub fn is_connected(&self) -> bool {
        self.lock().session
    }

    /// Packets written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().written)
    }

    /// Deliver bytes as if the hub had notified them
    pub fn inject(&self, bytes: &[u8]) -> bool {
        match &self.lock().inbound {
            Some(tx) => tx.send(LinkEvent::Data(bytes.to_vec())).is_ok(),
            None => false,
        }
    }

    /// Simulate the hub going out of range. The event stream ends but the
    /// session stays held until `disconnect`.
    pub fn drop_link(&self) {
        if let Some(tx) = self.lock().inbound.take() {
            let _ = tx.send(LinkEvent::Disconnected);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A test that panicked while holding the lock already failed
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BleLink for MockLink {
    async fn connect(
        &self,
        _filter: &DiscoveryFilter,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, ConnectError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        if state.session {
            return Err(ConnectError::AlreadyConnected);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.session = true;
        state.inbound = Some(tx);
        Ok(rx)
    }

    async fn write(&self, packet: &[u8]) -> Result<(), SendError> {
        let mut state = self.lock();
        if !state.session {
            return Err(SendError::NotConnected);
        }
        let Some(inbound) = state.inbound.clone() else {
            return Err(SendError::LinkLost);
        };
        state.written.push(packet.to_vec());

        if let Some(responder) = state.responder.as_mut() {
            for reply in responder(packet) {
                let _ = inbound.send(LinkEvent::Data(reply));
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        state.session = false;
        state.inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_write_and_inject() {
        let link = MockLink::new();
        assert_eq!(link.write(&[1]).await, Err(SendError::NotConnected));

        let mut rx = link.connect(&DiscoveryFilter::default()).await.unwrap();
        link.write(&[1, 2]).await.unwrap();
        assert_eq!(link.written(), vec![vec![1, 2]]);

        assert!(link.inject(&[9]));
        assert_eq!(rx.recv().await, Some(LinkEvent::Data(vec![9])));

        link.drop_link();
        assert_eq!(rx.recv().await, Some(LinkEvent::Disconnected));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_session_held_until_disconnect() {
        let link = MockLink::new();
        let _rx = link.connect(&DiscoveryFilter::default()).await.unwrap();

        link.drop_link();
        assert!(link.is_connected());
        assert_eq!(link.write(&[1]).await, Err(SendError::LinkLost));
        assert_eq!(
            link.connect(&DiscoveryFilter::default()).await.unwrap_err(),
            ConnectError::AlreadyConnected
        );

        link.disconnect().await;
        assert!(!link.is_connected());
        assert_eq!(link.disconnect_calls(), 1);
        assert!(link.connect(&DiscoveryFilter::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let link = MockLink::new();
        link.fail_next_connects([ConnectError::NotFound]);
        assert_eq!(
            link.connect(&DiscoveryFilter::default()).await.unwrap_err(),
            ConnectError::NotFound
        );
        assert!(link.connect(&DiscoveryFilter::default()).await.is_ok());
        assert_eq!(link.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_responder_replies() {
        let link = MockLink::new();
        link.set_responder(Box::new(|packet| vec![packet.iter().rev().copied().collect()]));
        let mut rx = link.connect(&DiscoveryFilter::default()).await.unwrap();
        link.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Data(vec![3, 2, 1])));
    }
}
