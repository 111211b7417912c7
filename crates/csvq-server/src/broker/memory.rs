//! In-process broker
//!
//! Queues are unbounded channels living inside the process. A broker built with
//! [`InMemoryBroker::recording`] also logs every publish and settlement so tests can assert on
//! them, and it can be told to fail a given publish call. The `memory://` broker keeps no log.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{Acker, BrokerChannel, BrokerError, BrokerResult, Delivery, DeliveryStream};

/// URL scheme that selects this broker
pub const SCHEME: &str = "memory://";

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, requeue: bool },
}

struct Message {
    delivery_tag: u64,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Option<mpsc::UnboundedReceiver<Message>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    published: HashMap<String, Vec<Vec<u8>>>,
    settlements: Vec<Settlement>,
    recording: bool,
    next_tag: u64,
    publish_calls: usize,
    fail_publish_on: Option<usize>,
}

impl State {
    fn settle(&mut self, settlement: Settlement) {
        if self.recording {
            self.settlements.push(settlement);
        }
    }

    fn enqueue(&mut self, queue: &str, payload: Vec<u8>, redelivered: bool) {
        self.next_tag += 1;
        let message = Message {
            delivery_tag: self.next_tag,
            payload,
            redelivered,
        };

        match self.queues.get(queue) {
            Some(q) => {
                if q.sender.send(message).is_err() {
                    tracing::debug!(queue, "Queue receiver dropped, message discarded");
                }
            },
            // Like the AMQP default exchange, unroutable messages are dropped.
            None => tracing::debug!(queue, "No such queue, message discarded"),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that logs publishes and settlements.
    pub fn recording() -> Self {
        Self::with_state(State {
            recording: true,
            ..State::default()
        })
    }

    /// A recording broker whose `attempt`-th publish call (counting from 1) fails.
    pub fn failing_publish_on(attempt: usize) -> Self {
        Self::with_state(State {
            recording: true,
            fail_publish_on: Some(attempt),
            ..State::default()
        })
    }

    fn with_state(state: State) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Payloads accepted for `queue`, in publish order. Empty unless recording.
    pub async fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .published
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn settlements(&self) -> Vec<Settlement> {
        self.state.lock().await.settlements.clone()
    }

    /// Remove `queue`, ending its delivery stream once drained.
    pub async fn delete_queue(&self, queue: &str) {
        self.state.lock().await.queues.remove(queue);
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            Queue {
                sender,
                receiver: Some(receiver),
            }
        });
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        state.publish_calls += 1;

        if state.fail_publish_on == Some(state.publish_calls) {
            return Err(BrokerError::Unavailable(format!(
                "publish {} rejected",
                state.publish_calls
            )));
        }

        if state.recording {
            state
                .published
                .entry(queue.to_string())
                .or_default()
                .push(payload.to_vec());
        }
        state.enqueue(queue, payload.to_vec(), false);

        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        let receiver = {
            let mut state = self.state.lock().await;
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            entry
                .receiver
                .take()
                .ok_or_else(|| BrokerError::AlreadyConsuming(queue.to_string()))?
        };

        let state = Arc::clone(&self.state);
        let queue = queue.to_string();

        let deliveries = futures::stream::unfold(receiver, move |mut receiver| {
            let state = Arc::clone(&state);
            let queue = queue.clone();
            async move {
                let message = receiver.recv().await?;
                let acker = MemoryAcker {
                    state,
                    queue,
                    delivery_tag: message.delivery_tag,
                    payload: message.payload.clone(),
                };
                let delivery = Delivery::new(
                    message.delivery_tag,
                    message.payload,
                    message.redelivered,
                    acker,
                );
                Some((Ok(delivery), receiver))
            }
        });

        Ok(deliveries.boxed())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    queue: String,
    delivery_tag: u64,
    payload: Vec<u8>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.state.lock().await.settle(Settlement::Ack {
            delivery_tag: self.delivery_tag,
        });
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        state.settle(Settlement::Nack {
            delivery_tag: self.delivery_tag,
            requeue,
        });
        if requeue {
            state.enqueue(&self.queue, self.payload.clone(), true);
        }
        Ok(())
    }
}
