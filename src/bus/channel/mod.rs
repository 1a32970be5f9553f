//! In-memory channel-based broker for standalone mode.
//!
//! Emulates direct and fanout exchanges, named queues and bindings inside a
//! single process using tokio mpsc channels. Ideal for local development and
//! testing without external dependencies.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{Broker, BusError, ExchangeKind, MessageStream, QueueOptions, Result};

struct QueueState {
    options: QueueOptions,
    /// Distinguishes a re-declared queue from the one a stale consumer guard refers to.
    epoch: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    /// Taken by the first consumer.
    receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    /// Bindings keyed by exchange name.
    bindings: HashMap<String, Vec<Binding>>,
    next_epoch: u64,
    /// Explicit `delete_queue` calls per queue name.
    delete_calls: HashMap<String, usize>,
    published: usize,
}

impl State {
    fn remove_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        for bindings in self.bindings.values_mut() {
            bindings.retain(|b| b.queue != name);
        }
        removed
    }
}

/// In-process broker.
///
/// Cloning is cheap and every clone shares the same exchanges and queues.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    state: Arc<Mutex<State>>,
}

impl ChannelBroker {
    /// Create an empty broker with no exchanges or queues.
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self::default()
    }

    /// Names of all live queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of `delete_queue` calls issued for `queue` so far.
    pub fn delete_calls(&self, queue: &str) -> usize {
        self.state
            .lock()
            .delete_calls
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    /// Number of bindings currently attached to `queue`.
    pub fn binding_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .bindings
            .values()
            .flat_map(|b| b.iter())
            .filter(|b| b.queue == queue)
            .count()
    }

    /// Total messages accepted by `publish` across all exchanges.
    pub fn published_count(&self) -> usize {
        self.state.lock().published
    }
}

/// Consumer stream that auto-deletes its queue when dropped, mirroring the
/// broker-side auto-delete of a queue whose last consumer went away.
struct ConsumerStream {
    inner: UnboundedReceiverStream<Vec<u8>>,
    state: Arc<Mutex<State>>,
    queue: String,
    epoch: u64,
}

impl Stream for ConsumerStream {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx).map(|item| item.map(Ok))
    }
}

impl Drop for ConsumerStream {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let auto_delete = state
            .queues
            .get(&self.queue)
            .is_some_and(|q| q.epoch == self.epoch && q.options.auto_delete);
        if auto_delete {
            state.remove_queue(&self.queue);
            debug!(queue = %self.queue, "Auto-deleted queue after last consumer left");
        }
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.state.lock();
        match state.exchanges.get(name).copied() {
            Some(existing) if existing != kind => Err(BusError::Declare(format!(
                "exchange {} already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                state.bindings.entry(name.to_string()).or_default();
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.queues.get(name) {
            if existing.options != options {
                return Err(BusError::Declare(format!(
                    "queue {} already declared with different options",
                    name
                )));
            }
            return Ok(());
        }

        let epoch = state.next_epoch;
        state.next_epoch += 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.queues.insert(
            name.to_string(),
            QueueState {
                options,
                epoch,
                sender,
                receiver: Some(receiver),
            },
        );
        debug!(queue = %name, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BusError::QueueNotFound(queue.to_string()));
        }
        let bindings = state
            .bindings
            .get_mut(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;

        let already_bound = bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !already_bound {
            bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let mut state = self.state.lock();
        let bindings = state
            .bindings
            .get_mut(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;
        bindings.retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        *state.delete_calls.entry(name.to_string()).or_default() += 1;
        // Dropping the sender ends the consumer stream.
        if state.remove_queue(name) {
            debug!(queue = %name, "Deleted queue");
        }
        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().queues.contains_key(name))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;

        let targets: Vec<String> = state
            .bindings
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default();

        for queue in &targets {
            if let Some(q) = state.queues.get(queue) {
                // Receiver side only closes when the consumer stream was
                // dropped without auto-delete; the message is lost like an
                // unacked delivery on a dead consumer.
                let _ = q.sender.send(payload.to_vec());
            }
        }
        state.published += 1;

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            delivered_to = targets.len(),
            "Published message via channel"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<MessageStream> {
        let mut state = self.state.lock();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;
        let receiver = entry
            .receiver
            .take()
            .ok_or_else(|| BusError::Consume(format!("queue {} already has a consumer", queue)))?;
        let epoch = entry.epoch;

        Ok(ConsumerStream {
            inner: UnboundedReceiverStream::new(receiver),
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
            epoch,
        }
        .boxed())
    }
}
