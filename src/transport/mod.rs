//! Broker transport abstraction.
//!
//! One adapter per broker family, all behind the same lifecycle contract:
//! connect, start consuming, publish, reply, close, liveness. Adapters are
//! created by [`make_transport`] from an endpoint's broker settings and are
//! owned by the orchestrator entry for that endpoint.

pub mod amqp;
pub mod memory;
pub mod mq;
pub mod stomp;

use crate::config::{BrokerEndpoint, BrokerFamily, ExchangeKind};
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;
pub use mq::MqTransport;
pub use stomp::StompTransport;

/// A message delivered by a transport to its consumer callback.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Message body, decoded as text
    pub body: String,
    /// Routing key the message was published with, empty when none
    pub routing_key: String,
    /// Correlation id linking the message to a reply
    pub correlation_id: Option<String>,
    /// Scheme-prefixed reply address
    pub reply_to: Option<String>,
    /// Application headers
    pub headers: HashMap<String, String>,
}

/// Future returned by a delivery handler.
pub type DeliveryFuture = futures_util::future::BoxFuture<'static, anyhow::Result<()>>;

/// Callback invoked once per inbound message on a transport-owned task.
///
/// Handler failures are caught and logged by the transport; one bad
/// message never stops delivery of the next.
pub type DeliveryHandler = Arc<dyn Fn(InboundMessage) -> DeliveryFuture + Send + Sync>;

/// Lifecycle contract implemented by every broker family.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open the connection and a single session/channel, and establish the
    /// destination derived from the endpoint settings bound at creation.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Register the delivery callback and begin consuming.
    async fn start_consuming(&self, handler: DeliveryHandler) -> Result<(), TransportError>;

    /// Publish to the exchange/destination established at connect time.
    /// An empty routing key means none (broadcast or default binding).
    async fn publish(&self, body: &str, routing_key: &str) -> Result<(), TransportError>;

    /// Send a correlated reply to a scheme-prefixed address. An empty
    /// address is a no-op with a warning, not an error.
    async fn send_reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: &str,
    ) -> Result<(), TransportError>;

    /// Best-effort ordered teardown: consumer, then producer, then
    /// session, then connection. Each step is guarded; logs, never raises.
    async fn close(&self);

    /// Cheap non-blocking liveness check.
    fn is_connected(&self) -> bool;
}

/// Create the adapter for an endpoint's configured broker family.
pub fn make_transport(config: &BrokerEndpoint) -> Arc<dyn BrokerTransport> {
    match config.family {
        BrokerFamily::Amqp => Arc::new(AmqpTransport::new(config.clone())),
        BrokerFamily::Stomp => Arc::new(StompTransport::new(config.clone())),
        BrokerFamily::Mq => Arc::new(MqTransport::new(config.clone())),
        BrokerFamily::Memory => Arc::new(MemoryTransport::new(config.clone())),
    }
}

/// A queue-like or topic-like destination.
///
/// Serves both as the derived publish/consume target of an endpoint and as
/// the parsed form of a reply-to address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    /// Derive the destination from endpoint settings: a fanout exchange
    /// broadcasts on a topic named after the exchange; every other kind is
    /// a queue, preferring the explicit queue name over the exchange name.
    pub fn derive(config: &BrokerEndpoint) -> Self {
        match config.exchange_kind {
            ExchangeKind::Fanout => Destination::Topic(config.exchange.clone()),
            _ => Destination::Queue(
                config
                    .queue
                    .clone()
                    .unwrap_or_else(|| config.exchange.clone()),
            ),
        }
    }

    /// Queue-manager dialect: resolve the name first (queue over
    /// exchange), then let the kind decide topic or queue.
    pub fn derive_mq(config: &BrokerEndpoint) -> Self {
        let name = config
            .queue
            .clone()
            .unwrap_or_else(|| config.exchange.clone());
        match config.exchange_kind {
            ExchangeKind::Fanout => Destination::Topic(name),
            _ => Destination::Queue(name),
        }
    }

    /// Parse a reply-to address: `topic://name`, `queue://name`, or a bare
    /// name (implicitly a queue). Returns None for an empty address.
    pub fn parse(reply_to: &str) -> Option<Self> {
        if reply_to.is_empty() {
            return None;
        }
        if let Some(name) = reply_to.strip_prefix("topic://") {
            Some(Destination::Topic(name.to_string()))
        } else if let Some(name) = reply_to.strip_prefix("queue://") {
            Some(Destination::Queue(name.to_string()))
        } else {
            Some(Destination::Queue(reply_to.to_string()))
        }
    }

    /// Bare destination name.
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    /// Scheme-prefixed form, the inverse of [`Destination::parse`].
    pub fn to_address(&self) -> String {
        match self {
            Destination::Queue(name) => format!("queue://{}", name),
            Destination::Topic(name) => format!("topic://{}", name),
        }
    }
}

/// Derive the routing-key selector for pattern-routed consumption.
///
/// Only topic exchanges with a binding pattern get a selector; absence
/// means all messages for the destination. `#` and `*` both fold to the
/// SQL-LIKE `%` wildcard since the selector language cannot express the
/// multi- versus single-segment distinction.
pub fn selector_for(config: &BrokerEndpoint) -> Option<String> {
    if config.exchange_kind != ExchangeKind::Topic {
        return None;
    }
    let pattern = config.binding_pattern.as_deref()?;
    Some(format!(
        "routing_key LIKE '{}'",
        pattern.replace('#', "%").replace('*', "%")
    ))
}

/// Native AMQP binding match: `#` spans zero or more dot-separated
/// segments, `*` exactly one. Used by the in-process broker, which is not
/// limited to a selector language.
pub fn routing_key_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|i| segments_match(rest, &key[i..])),
        Some((&"*", rest)) => !key.is_empty() && segments_match(rest, &key[1..]),
        Some((&lit, rest)) => key.first() == Some(&lit) && segments_match(rest, &key[1..]),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::broker_endpoint;
    use super::*;

    #[test]
    fn test_parse_reply_address() {
        assert_eq!(
            Destination::parse("queue://replies"),
            Some(Destination::Queue("replies".to_string()))
        );
        assert_eq!(
            Destination::parse("topic://alerts"),
            Some(Destination::Topic("alerts".to_string()))
        );
        assert_eq!(
            Destination::parse("bare-name"),
            Some(Destination::Queue("bare-name".to_string()))
        );
        assert_eq!(Destination::parse(""), None);
    }

    #[test]
    fn test_address_round_trip() {
        let dest = Destination::Topic("alerts".to_string());
        assert_eq!(dest.to_address(), "topic://alerts");
        assert_eq!(Destination::parse(&dest.to_address()), Some(dest));
    }

    #[test]
    fn test_derive_fanout_is_topic() {
        let mut config = broker_endpoint("events");
        config.exchange_kind = ExchangeKind::Fanout;
        config.queue = Some("ignored".to_string());
        assert_eq!(
            Destination::derive(&config),
            Destination::Topic("events".to_string())
        );
    }

    #[test]
    fn test_derive_prefers_queue_name() {
        let mut config = broker_endpoint("orders");
        config.queue = Some("orders-sim".to_string());
        assert_eq!(
            Destination::derive(&config),
            Destination::Queue("orders-sim".to_string())
        );

        config.queue = None;
        assert_eq!(
            Destination::derive(&config),
            Destination::Queue("orders".to_string())
        );
    }

    #[test]
    fn test_derive_mq_resolves_name_first() {
        let mut config = broker_endpoint("events");
        config.exchange_kind = ExchangeKind::Fanout;
        config.queue = Some("events-q".to_string());
        // The queue-manager dialect names the topic after the resolved
        // name, not the exchange.
        assert_eq!(
            Destination::derive_mq(&config),
            Destination::Topic("events-q".to_string())
        );
    }

    #[test]
    fn test_selector_translation_is_lossy() {
        let mut config = broker_endpoint("orders");
        config.exchange_kind = ExchangeKind::Topic;

        config.binding_pattern = Some("orders.#".to_string());
        let multi = selector_for(&config).unwrap();
        config.binding_pattern = Some("orders.*".to_string());
        let single = selector_for(&config).unwrap();

        assert_eq!(multi, "routing_key LIKE 'orders.%'");
        assert_eq!(multi, single);
    }

    #[test]
    fn test_selector_requires_topic_kind_and_pattern() {
        let mut config = broker_endpoint("orders");
        config.binding_pattern = Some("orders.#".to_string());
        assert_eq!(selector_for(&config), None);

        config.exchange_kind = ExchangeKind::Topic;
        config.binding_pattern = None;
        assert_eq!(selector_for(&config), None);
    }

    #[test]
    fn test_routing_key_wildcards() {
        assert!(routing_key_matches("orders.#", "orders.created"));
        assert!(routing_key_matches("orders.#", "orders.created.eu"));
        assert!(routing_key_matches("orders.#", "orders"));
        assert!(!routing_key_matches("orders.#", "invoices.created"));

        assert!(routing_key_matches("orders.*", "orders.created"));
        assert!(!routing_key_matches("orders.*", "orders.created.eu"));
        assert!(!routing_key_matches("orders.*", "orders"));

        assert!(routing_key_matches("#", "anything.at.all"));
        assert!(routing_key_matches("orders.created", "orders.created"));
        assert!(!routing_key_matches("orders.created", "orders.updated"));
    }
}
