//! In-process broker family.
//!
//! A process-wide bus keyed by address, with real fan-out and queue
//! semantics but no sockets. Lets a configuration exercise the full
//! endpoint lifecycle without an external broker.

use super::{routing_key_matches, BrokerTransport, DeliveryHandler, Destination, InboundMessage};
use crate::config::BrokerEndpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

static BUSES: Lazy<DashMap<String, Arc<MemoryBus>>> = Lazy::new(DashMap::new);

/// Fetch or create the bus at an address. Transports on the same
/// host/port/vhost triple share a bus.
pub fn bus(address: &str) -> Arc<MemoryBus> {
    BUSES
        .entry(address.to_string())
        .or_insert_with(|| Arc::new(MemoryBus::default()))
        .clone()
}

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    binding: Option<String>,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct DestinationState {
    subscribers: Vec<Subscriber>,
    cursor: usize,
}

/// One in-process broker instance.
#[derive(Default)]
pub struct MemoryBus {
    destinations: Mutex<HashMap<Destination, DestinationState>>,
    next_id: AtomicU64,
}

impl MemoryBus {
    /// Subscribe to a destination. Topic subscribers may carry a binding
    /// pattern; queue subscribers compete round-robin.
    pub async fn subscribe(
        &self,
        destination: Destination,
        binding: Option<String>,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<InboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut destinations = self.destinations.lock().await;
        destinations
            .entry(destination)
            .or_default()
            .subscribers
            .push(Subscriber { id, binding, sender });
        (id, receiver)
    }

    pub async fn unsubscribe(&self, destination: &Destination, id: SubscriberId) {
        let mut destinations = self.destinations.lock().await;
        if let Some(state) = destinations.get_mut(destination) {
            state.subscribers.retain(|subscriber| subscriber.id != id);
        }
    }

    /// Deliver a message: topics fan out to every subscriber whose binding
    /// matches the routing key, queues hand it to one subscriber in turn.
    /// Returns the number of subscribers reached.
    pub async fn publish(&self, destination: &Destination, message: InboundMessage) -> usize {
        let mut destinations = self.destinations.lock().await;
        let state = match destinations.get_mut(destination) {
            Some(state) => state,
            None => return 0,
        };
        state
            .subscribers
            .retain(|subscriber| !subscriber.sender.is_closed());
        match destination {
            Destination::Topic(_) => {
                let mut reached = 0;
                for subscriber in &state.subscribers {
                    let matches = subscriber
                        .binding
                        .as_deref()
                        .map(|pattern| routing_key_matches(pattern, &message.routing_key))
                        .unwrap_or(true);
                    if matches && subscriber.sender.send(message.clone()).is_ok() {
                        reached += 1;
                    }
                }
                reached
            }
            Destination::Queue(_) => {
                if state.subscribers.is_empty() {
                    return 0;
                }
                let index = state.cursor % state.subscribers.len();
                state.cursor = state.cursor.wrapping_add(1);
                if state.subscribers[index].sender.send(message).is_ok() {
                    1
                } else {
                    0
                }
            }
        }
    }
}

struct ConsumerHandle {
    id: SubscriberId,
    task: JoinHandle<()>,
}

/// Transport over the in-process bus.
pub struct MemoryTransport {
    config: BrokerEndpoint,
    destination: Destination,
    address: String,
    connected: AtomicBool,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl MemoryTransport {
    pub fn new(config: BrokerEndpoint) -> Self {
        let destination = Destination::derive(&config);
        let address = format!("{}:{}/{}", config.host, config.port, config.virtual_host);
        Self {
            config,
            destination,
            address,
            connected: AtomicBool::new(false),
            consumer: Mutex::new(None),
        }
    }

    fn bus(&self) -> Arc<MemoryBus> {
        bus(&self.address)
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.bus();
        self.connected.store(true, Ordering::SeqCst);
        debug!(
            address = %self.address,
            destination = ?self.destination,
            "memory transport connected"
        );
        Ok(())
    }

    async fn start_consuming(&self, handler: DeliveryHandler) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let binding = self.config.binding_pattern.clone();
        let (id, mut receiver) = self.bus().subscribe(self.destination.clone(), binding).await;
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let Err(error) = handler(message).await {
                    warn!(%error, "delivery handler failed");
                }
            }
        });
        let mut consumer = self.consumer.lock().await;
        *consumer = Some(ConsumerHandle { id, task });
        Ok(())
    }

    async fn publish(&self, body: &str, routing_key: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let message = InboundMessage {
            body: body.to_string(),
            routing_key: routing_key.to_string(),
            correlation_id: None,
            reply_to: None,
            headers: self.config.message_headers.clone(),
        };
        let reached = self.bus().publish(&self.destination, message).await;
        debug!(destination = ?self.destination, reached, "published");
        Ok(())
    }

    async fn send_reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        let destination = match Destination::parse(reply_to) {
            Some(destination) => destination,
            None => {
                warn!("reply requested without a reply-to address, skipping");
                return Ok(());
            }
        };
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let message = InboundMessage {
            body: body.to_string(),
            routing_key: String::new(),
            correlation_id: (!correlation_id.is_empty()).then(|| correlation_id.to_string()),
            reply_to: None,
            headers: HashMap::new(),
        };
        self.bus().publish(&destination, message).await;
        Ok(())
    }

    async fn close(&self) {
        let mut consumer = self.consumer.lock().await;
        if let Some(handle) = consumer.take() {
            self.bus().unsubscribe(&self.destination, handle.id).await;
            handle.task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
