//! Connection-aware delivery front door.
//!
//! While disconnected, [`Outbox::send`] only queues. Once the session reports
//! it is live, the queue is drained in FIFO order through the same path as
//! live traffic. Failed deliveries are requeued with an attempt counter and
//! moved to a bounded dead-letter list once they reach `max_attempts`.
//!
//! Locking: the queue and state sit behind `parking_lot` mutexes that are
//! never held across an await. Deliveries are serialized by an async mutex so
//! chunk sequences from different messages never interleave.

use super::publisher::{DocumentPublisher, PublishOutcome};
use super::queue::{DeadLetter, DeliveryQueue, PendingDelivery};
use super::transport::{LarkSession, LarkTransport};
use super::DeliveryError;
use crate::config::{DeliveryConfig, DocumentConfig};
use crate::util::char_len;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// How a message is delivered, chosen from its character count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPlan {
    /// One text message.
    Direct,
    /// Drive document plus link; degrades to chunked text on failure.
    Document,
}

impl DeliveryPlan {
    pub fn select(text: &str, threshold: usize) -> Self {
        if char_len(text) <= threshold {
            Self::Direct
        } else {
            Self::Document
        }
    }
}

/// Result of one [`Outbox::send`]. Sending never returns an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// Disconnected; held until the next drain.
    Queued,
    Sent,
    Published(PublishOutcome),
    /// The attempt failed and the message is back in the queue.
    Requeued { attempts: u32 },
    /// The attempt failed and the message ran out of attempts.
    DeadLettered,
}

pub struct Outbox {
    transport: Arc<dyn LarkTransport>,
    publisher: DocumentPublisher,
    threshold: usize,
    max_attempts: u32,
    state: Mutex<ConnectionState>,
    queue: Mutex<DeliveryQueue>,
    delivering: tokio::sync::Mutex<()>,
    draining: tokio::sync::Mutex<()>,
}

impl Outbox {
    pub fn new(
        transport: Arc<dyn LarkTransport>,
        delivery: &DeliveryConfig,
        documents: &DocumentConfig,
    ) -> Self {
        Self {
            publisher: DocumentPublisher::new(Arc::clone(&transport), delivery, documents),
            transport,
            threshold: delivery.document_threshold,
            max_attempts: delivery.max_attempts.max(1),
            state: Mutex::new(ConnectionState::Disconnected),
            queue: Mutex::new(DeliveryQueue::new(delivery.dead_letter_capacity)),
            delivering: tokio::sync::Mutex::new(()),
            draining: tokio::sync::Mutex::new(()),
        }
    }

    pub fn publisher(&self) -> &DocumentPublisher {
        &self.publisher
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn queued(&self) -> Vec<PendingDelivery> {
        self.queue.lock().snapshot()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.lock().dead_letters()
    }

    /// Deliver `text` to `chat_id`, or queue it while disconnected.
    pub async fn send(&self, chat_id: &str, text: &str) -> SendStatus {
        if !self.is_connected() {
            let queue_size = {
                let mut queue = self.queue.lock();
                queue.push(PendingDelivery::new(chat_id, text));
                queue.len()
            };
            tracing::info!(chat_id, queue_size, "Disconnected, message queued");
            return SendStatus::Queued;
        }

        self.attempt(PendingDelivery::new(chat_id, text)).await
    }

    /// Open the session, wait until it reports live, then drain the queue.
    ///
    /// Returns the session's liveness receiver so callers can hand it to
    /// [`Outbox::follow_session`].
    pub async fn connect(&self, session: &dyn LarkSession) -> anyhow::Result<watch::Receiver<bool>> {
        let mut live = session.open().await.context("opening long connection")?;
        live.wait_for(|up| *up)
            .await
            .map(|_| ())
            .context("long connection closed before it became ready")?;

        self.mark_connected();
        self.drain().await;
        Ok(live)
    }

    /// Stop delivering immediately. In-flight sends are left alone.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            tracing::info!("Outbox disconnected");
        }
    }

    /// Drain the queue if connected. Returns one status per attempted delivery.
    pub async fn flush(&self) -> Vec<SendStatus> {
        if !self.is_connected() {
            return Vec::new();
        }
        self.drain().await
    }

    /// Mirror later liveness changes of a session: `false` disconnects,
    /// `true` reconnects and drains. Ends (disconnected) when the session
    /// drops its sender.
    pub fn follow_session(self: Arc<Self>, mut live: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while live.changed().await.is_ok() {
                let up = *live.borrow_and_update();
                if up {
                    if !self.is_connected() {
                        self.mark_connected();
                        self.drain().await;
                    }
                } else {
                    self.disconnect();
                }
            }
            self.disconnect();
        })
    }

    /// Attempt every delivery queued when the drain starts, oldest first.
    /// Items requeued during the drain wait for the next one. Cancelling the
    /// drain mid-send returns the in-flight item to the head of the queue,
    /// so it may be delivered twice but is never lost.
    async fn drain(&self) -> Vec<SendStatus> {
        let _draining = self.draining.lock().await;
        let pending = self.queue_len();
        if pending == 0 {
            return Vec::new();
        }
        tracing::info!(queue_size = pending, "Flushing outgoing message queue");

        let mut statuses = Vec::with_capacity(pending);
        for _ in 0..pending {
            if !self.is_connected() {
                tracing::info!(
                    queue_size = self.queue_len(),
                    "Connection lost during flush, keeping the rest queued"
                );
                break;
            }
            let Some(delivery) = self.queue.lock().pop() else {
                break;
            };
            let in_flight = InFlight::new(&self.queue, &delivery);
            let result = self.deliver_serialized(&delivery).await;
            in_flight.settled();
            statuses.push(self.settle(delivery, result));
        }
        statuses
    }

    fn mark_connected(&self) {
        *self.state.lock() = ConnectionState::Connected;
        tracing::info!(queue_size = self.queue_len(), "Outbox connected");
    }

    async fn attempt(&self, delivery: PendingDelivery) -> SendStatus {
        let result = self.deliver_serialized(&delivery).await;
        self.settle(delivery, result)
    }

    async fn deliver_serialized(&self, delivery: &PendingDelivery) -> Result<SendStatus, DeliveryError> {
        let _delivering = self.delivering.lock().await;
        self.deliver(&delivery.chat_id, &delivery.text).await
    }

    fn settle(&self, delivery: PendingDelivery, result: Result<SendStatus, DeliveryError>) -> SendStatus {
        match result {
            Ok(status) => status,
            Err(err) => self.record_failure(delivery, &err),
        }
    }

    async fn deliver(&self, chat_id: &str, text: &str) -> Result<SendStatus, DeliveryError> {
        match DeliveryPlan::select(text, self.threshold) {
            DeliveryPlan::Direct => {
                self.transport
                    .send_text(chat_id, text)
                    .await
                    .map_err(DeliveryError::Transport)?;
                tracing::info!(chat_id, length = char_len(text), "Message sent");
                Ok(SendStatus::Sent)
            }
            DeliveryPlan::Document => self
                .publisher
                .publish(chat_id, text)
                .await
                .map(SendStatus::Published),
        }
    }

    fn record_failure(&self, mut delivery: PendingDelivery, err: &DeliveryError) -> SendStatus {
        delivery.attempts += 1;
        let attempt = delivery.attempts;
        let chat_id = delivery.chat_id.clone();

        if attempt >= self.max_attempts {
            let evicted = self.queue.lock().bury(DeadLetter {
                delivery,
                reason: err.to_string(),
            });
            tracing::error!(%chat_id, attempt, "Giving up on message: {err}");
            if let Some(old) = evicted {
                tracing::warn!(chat_id = %old.delivery.chat_id, "Dead-letter list full, dropped oldest entry");
            }
            return SendStatus::DeadLettered;
        }

        let queue_size = {
            let mut queue = self.queue.lock();
            queue.push(delivery);
            queue.len()
        };
        tracing::warn!(%chat_id, attempt, queue_size, "Failed to send, message queued: {err}");
        SendStatus::Requeued { attempts: attempt }
    }
}

/// Copy of a delivery popped for a drain attempt. If the drain is cancelled
/// before the attempt settles, the copy goes back to the head of the queue
/// with its attempt count unchanged.
struct InFlight<'a> {
    queue: &'a Mutex<DeliveryQueue>,
    restore: Option<PendingDelivery>,
}

impl<'a> InFlight<'a> {
    fn new(queue: &'a Mutex<DeliveryQueue>, delivery: &PendingDelivery) -> Self {
        Self {
            queue,
            restore: Some(delivery.clone()),
        }
    }

    fn settled(mut self) {
        self.restore = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(delivery) = self.restore.take() {
            tracing::warn!(
                chat_id = %delivery.chat_id,
                "Flush cancelled mid-delivery, message returned to the queue"
            );
            self.queue.lock().push_front(delivery);
        }
    }
}
