use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::error::DatagramError;
use crate::resend_tracker::DeliveryFailure;
use crate::stream_id::SequenceNumber;

/// A complete message as it is handed to the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: SocketAddr,
    pub sequence_number: SequenceNumber,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatagramEvent {
    MessageArrived(ReceivedMessage),
    DeliveryFailed(DeliveryFailure),
}

/// Application callback for messages that could not be delivered. This is a report, nothing
///  is re-sent after the callback.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryFailureListener: Send + Sync + 'static {
    async fn on_delivery_failed(&self, failure: DeliveryFailure);
}


pub struct DatagramEventNotifier {
    sender: broadcast::Sender<DatagramEvent>,
}
impl DatagramEventNotifier {
    pub fn new(capacity: usize) -> DatagramEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        DatagramEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatagramEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: DatagramEvent) {
        trace!("event: {:?}", event);
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}


struct InboxInner {
    /// pending receive requests, oldest first
    waiting: VecDeque<oneshot::Sender<ReceivedMessage>>,
    /// messages that arrived while nobody was waiting, oldest first
    buffered: VecDeque<ReceivedMessage>,
}

/// Hands each received message to exactly one receive call: the oldest pending one, or - if
///  nobody is waiting - the next one to come along.
pub struct Inbox {
    capacity: usize,
    inner: Mutex<InboxInner>,
}

impl Inbox {
    pub fn new(capacity: usize) -> Inbox {
        Inbox {
            capacity,
            inner: Mutex::new(InboxInner {
                waiting: VecDeque::new(),
                buffered: VecDeque::new(),
            }),
        }
    }

    pub async fn num_buffered(&self) -> usize {
        self.inner.lock().await.buffered.len()
    }

    pub async fn deliver(&self, mut message: ReceivedMessage) {
        let mut inner = self.inner.lock().await;

        while let Some(waiting) = inner.waiting.pop_front() {
            match waiting.send(message) {
                Ok(()) => return,
                // the receive request timed out in the meantime
                Err(returned) => message = returned,
            }
        }

        if inner.buffered.len() == self.capacity {
            if let Some(dropped) = inner.buffered.pop_front() {
                warn!("inbox is full - discarding message #{} from {:?}", dropped.sequence_number, dropped.sender);
            }
        }
        debug!("nobody is waiting for message #{} from {:?}, buffering it", message.sequence_number, message.sender);
        inner.buffered.push_back(message);
    }

    pub async fn num_waiting(&self) -> usize {
        self.inner.lock().await.waiting.len()
    }

    /// Waits for the next message, with an optional timeout.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<ReceivedMessage, DatagramError> {
        let receiver = {
            let mut inner = self.inner.lock().await;
            if let Some(message) = inner.buffered.pop_front() {
                return Ok(message);
            }

            // requests whose caller timed out or dropped the future
            inner.waiting.retain(|s| !s.is_closed());

            let (sender, receiver) = oneshot::channel();
            inner.waiting.push_back(sender);
            receiver
        };

        let result = await_message(receiver, timeout).await;
        if let Err(DatagramError::Timeout(_)) = &result {
            self.inner.lock().await
                .waiting.retain(|s| !s.is_closed());
        }
        result
    }
}

async fn await_message(mut receiver: oneshot::Receiver<ReceivedMessage>, timeout: Option<Duration>) -> Result<ReceivedMessage, DatagramError> {
    let Some(timeout) = timeout else {
        return receiver.await
            .map_err(|_| DatagramError::Closed);
    };

    match tokio::time::timeout(timeout, &mut receiver).await {
        Ok(result) => result.map_err(|_| DatagramError::Closed),
        Err(_) => {
            // closing prevents fulfilment from here on, but a message may have been
            //  handed over just before that
            receiver.close();
            receiver.try_recv()
                .map_err(|_| DatagramError::Timeout(timeout))
        }
    }
}
