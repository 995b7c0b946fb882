//! Request/response correlation
//!
//! Every request gets a 16-bit id that is not currently in flight. The
//! waiting caller holds a [`PendingResponse`]; the entry leaves the table
//! when the response arrives, the wait times out, the request is cancelled,
//! the handle is dropped, or the link goes down.

use crate::error::RequestError;
use crate::infrastructure::bluetooth::transport::Transport;
use crate::protocol::frame::{self, Message, NOTIFICATION_ID};
use crate::protocol::messages::{HubRequest, HubResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type Resolver = oneshot::Sender<Result<Message, RequestError>>;

struct PendingRequest {
    ticket: u64,
    sent_at: Instant,
    resolver: Resolver,
}

#[derive(Default)]
struct PendingTable {
    next_id: u16,
    next_ticket: u64,
    entries: HashMap<u16, PendingRequest>,
}

impl PendingTable {
    /// Next id after the last one handed out that is free, skipping the
    /// notification id
    fn allocate(&mut self) -> Result<u16, RequestError> {
        for _ in 0..=u16::MAX as u32 {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != NOTIFICATION_ID && !self.entries.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(RequestError::IdsExhausted)
    }
}

fn lock(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one in-flight request. Dropping it abandons the request.
pub struct PendingResponse {
    id: u16,
    ticket: u64,
    receiver: oneshot::Receiver<Result<Message, RequestError>>,
    table: Arc<Mutex<PendingTable>>,
}

impl PendingResponse {
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Wait for the response. No retry is attempted on timeout.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message, RequestError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => {
                debug!("Request {} timed out after {:?}", self.id, timeout);
                Err(RequestError::Timeout { id: self.id })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        if table
            .entries
            .get(&self.id)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            table.entries.remove(&self.id);
            trace!("Request {} abandoned", self.id);
        }
    }
}

pub struct RequestCorrelator {
    transport: Arc<Transport>,
    table: Arc<Mutex<PendingTable>>,
}

impl RequestCorrelator {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            table: Arc::new(Mutex::new(PendingTable::default())),
        }
    }

    /// Register a request and send it
    pub async fn begin(&self, payload: Vec<u8>) -> Result<PendingResponse, RequestError> {
        let (resolver, receiver) = oneshot::channel();
        let pending = {
            let mut table = lock(&self.table);
            let id = table.allocate()?;
            let ticket = table.next_ticket;
            table.next_ticket += 1;
            table.entries.insert(
                id,
                PendingRequest {
                    ticket,
                    sent_at: Instant::now(),
                    resolver,
                },
            );
            PendingResponse {
                id,
                ticket,
                receiver,
                table: self.table.clone(),
            }
        };

        let envelope = frame::encode(&Message::request(pending.id, payload));
        trace!("Request {}: {:02X?}", pending.id, envelope);
        // On failure the handle drops and removes the entry
        self.transport.send(&envelope).await?;
        Ok(pending)
    }

    pub async fn send_request(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, RequestError> {
        self.begin(payload).await?.wait(timeout).await
    }

    /// Send a typed request and check the response answers it
    pub async fn request(
        &self,
        request: &HubRequest,
        timeout: Duration,
    ) -> Result<HubResponse, RequestError> {
        debug!("Sending {}", request.name());
        let message = self.send_request(request.serialize(), timeout).await?;
        let response = HubResponse::deserialize(&message.payload)?;
        if !response.answers(request) {
            return Err(RequestError::UnexpectedResponse {
                expected: request.expected_response(),
                received: response.name(),
            });
        }
        Ok(response)
    }

    /// Resolve the request a response belongs to
    pub fn on_response(&self, message: Message) -> Result<(), RequestError> {
        let entry = lock(&self.table).entries.remove(&message.id);
        match entry {
            Some(entry) => {
                debug!(
                    "Response {} after {:?}",
                    message.id,
                    entry.sent_at.elapsed()
                );
                let _ = entry.resolver.send(Ok(message));
                Ok(())
            }
            None => {
                warn!("Dropping response with unknown id {}", message.id);
                Err(RequestError::UnknownResponseId(message.id))
            }
        }
    }

    /// Resolve a pending request with `Cancelled`
    pub fn cancel(&self, id: u16) -> bool {
        let entry = lock(&self.table).entries.remove(&id);
        match entry {
            Some(entry) => {
                debug!("Request {} cancelled", id);
                let _ = entry.resolver.send(Err(RequestError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request, used on link loss
    pub fn fail_all(&self, error: RequestError) {
        let entries: Vec<_> = lock(&self.table).entries.drain().collect();
        if !entries.is_empty() {
            debug!("Failing {} pending requests: {}", entries.len(), error);
        }
        for (_, entry) in entries {
            let _ = entry.resolver.send(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.table).entries.len()
    }
}

/// Anything that can carry a typed request to the hub
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(
        &self,
        request: &HubRequest,
        timeout: Duration,
    ) -> Result<HubResponse, RequestError>;
}

#[async_trait]
impl Requester for RequestCorrelator {
    async fn request(
        &self,
        request: &HubRequest,
        timeout: Duration,
    ) -> Result<HubResponse, RequestError> {
        RequestCorrelator::request(self, request, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::infrastructure::bluetooth::link::DiscoveryFilter;
    use crate::infrastructure::bluetooth::mock::MockLink;
    use crate::infrastructure::bluetooth::transport::TransportConfig;
    use crate::protocol::messages::ResponseStatus;
    use crate::protocol::FrameAssembler;

    async fn connected() -> (Arc<MockLink>, RequestCorrelator) {
        let link = Arc::new(MockLink::new());
        let transport = Arc::new(Transport::new(link.clone(), TransportConfig::default()));
        transport.connect(&DiscoveryFilter::default()).await.unwrap();
        (link, RequestCorrelator::new(transport))
    }

    fn sent_messages(link: &MockLink) -> Vec<Message> {
        FrameAssembler::new()
            .push(&link.take_written().concat())
            .into_iter()
            .map(|m| m.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_out_of_order_responses_resolve_their_callers() {
        let (link, correlator) = connected().await;
        let first = correlator.begin(vec![0x00]).await.unwrap();
        let second = correlator.begin(vec![0x46, 0x01]).await.unwrap();
        assert_ne!(first.id(), second.id());

        let sent = sent_messages(&link);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].payload, vec![0x46, 0x01]);

        correlator
            .on_response(Message::response(second.id(), vec![0x47, 0x00]))
            .unwrap();
        correlator
            .on_response(Message::response(first.id(), vec![0x01]))
            .unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(first.wait(timeout).await.unwrap().payload, vec![0x01]);
        assert_eq!(second.wait(timeout).await.unwrap().payload, vec![0x47, 0x00]);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let (_link, correlator) = connected().await;
        let pending = correlator.begin(vec![0x00]).await.unwrap();

        let stray = pending.id().wrapping_add(100);
        assert_eq!(
            correlator.on_response(Message::response(stray, vec![0x01])),
            Err(RequestError::UnknownResponseId(stray))
        );
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_the_id() {
        let (_link, correlator) = connected().await;
        let pending = correlator.begin(vec![0x00]).await.unwrap();
        let id = pending.id();

        let result = pending.wait(Duration::from_millis(500)).await;
        assert_eq!(result, Err(RequestError::Timeout { id }));
        assert_eq!(correlator.pending_count(), 0);

        // A late response now takes the unknown-id path
        assert!(correlator.on_response(Message::response(id, vec![0x01])).is_err());
    }

    #[tokio::test]
    async fn test_dropping_the_handle_cancels() {
        let (_link, correlator) = connected().await;
        let pending = correlator.begin(vec![0x00]).await.unwrap();
        let id = pending.id();
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.on_response(Message::response(id, vec![0x01])).is_err());
    }

    #[tokio::test]
    async fn test_cancel_resolves_waiter() {
        let (_link, correlator) = connected().await;
        let pending = correlator.begin(vec![0x00]).await.unwrap();
        assert!(correlator.cancel(pending.id()));
        assert!(!correlator.cancel(pending.id()));
        assert_eq!(
            pending.wait(Duration::from_secs(1)).await,
            Err(RequestError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything() {
        let (_link, correlator) = connected().await;
        let a = correlator.begin(vec![0x00]).await.unwrap();
        let b = correlator.begin(vec![0x00]).await.unwrap();

        correlator.fail_all(RequestError::LinkLost);

        assert_eq!(a.wait(Duration::from_secs(1)).await, Err(RequestError::LinkLost));
        assert_eq!(b.wait(Duration::from_secs(1)).await, Err(RequestError::LinkLost));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_leaves_no_entry() {
        let link = Arc::new(MockLink::new());
        let transport = Arc::new(Transport::new(link, TransportConfig::default()));
        let correlator = RequestCorrelator::new(transport);

        let err = correlator.begin(vec![0x00]).await.err();
        assert_eq!(err, Some(RequestError::Send(SendError::NotConnected)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_typed_request_checks_shape() {
        let (link, correlator) = connected().await;
        let correlator = Arc::new(correlator);

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .request(&HubRequest::ClearSlot { slot: 0 }, Duration::from_secs(1))
                    .await
            })
        };
        while link.written().is_empty() {
            tokio::task::yield_now().await;
        }

        let sent = sent_messages(&link);
        correlator
            .on_response(Message::response(
                sent[0].id,
                HubResponse::ProgramFlow(ResponseStatus::Ack).serialize(),
            ))
            .unwrap();

        assert_eq!(
            task.await.unwrap(),
            Err(RequestError::UnexpectedResponse {
                expected: "ClearSlotResponse",
                received: "ProgramFlowResponse",
            })
        );
    }

    #[test]
    fn test_id_allocation_wraps_and_skips() {
        let mut table = PendingTable {
            next_id: 0xFFFE,
            ..Default::default()
        };
        assert_eq!(table.allocate().unwrap(), 0xFFFE);
        // 0xFFFF is the notification id
        assert_eq!(table.allocate().unwrap(), 0x0000);

        let (resolver, _receiver) = oneshot::channel();
        table.entries.insert(
            1,
            PendingRequest {
                ticket: 0,
                sent_at: Instant::now(),
                resolver,
            },
        );
        assert_eq!(table.allocate().unwrap(), 2);
    }

    #[test]
    fn test_ids_exhausted() {
        let mut table = PendingTable::default();
        let mut receivers = Vec::new();
        for id in 0..NOTIFICATION_ID {
            let (resolver, receiver) = oneshot::channel();
            receivers.push(receiver);
            table.entries.insert(
                id,
                PendingRequest {
                    ticket: id as u64,
                    sent_at: Instant::now(),
                    resolver,
                },
            );
        }
        assert_eq!(table.allocate(), Err(RequestError::IdsExhausted));
    }
}
