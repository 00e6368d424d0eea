//! Queue-manager transport.
//!
//! Same wire protocol as the plain STOMP family, different dialect: the
//! virtual host names the queue manager, destinations resolve the name
//! before the kind, sends are persistent, and bare reply addresses are
//! normalized to the queue scheme before parsing.

use super::stomp::{destination_path, Frame, StompSession};
use super::{selector_for, BrokerTransport, DeliveryHandler, Destination};
use crate::config::BrokerEndpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Transport for brokers addressed through a queue manager.
pub struct MqTransport {
    config: BrokerEndpoint,
    destination: Destination,
    address: String,
    queue_manager: Option<String>,
    session: Mutex<Option<StompSession>>,
    connected: Arc<AtomicBool>,
}

impl MqTransport {
    pub fn new(config: BrokerEndpoint) -> Self {
        let destination = Destination::derive_mq(&config);
        let address = format!("{}:{}", config.host, config.port);
        // The root virtual host means no queue manager was named.
        let queue_manager =
            (config.virtual_host != "/").then(|| config.virtual_host.clone());
        Self {
            config,
            destination,
            address,
            queue_manager,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BrokerTransport for MqTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        let host_header = self
            .queue_manager
            .as_deref()
            .unwrap_or(&self.config.host);
        let new_session = StompSession::connect(
            &self.address,
            host_header,
            &self.config,
            Arc::clone(&self.connected),
        )
        .await?;
        info!(
            address = %self.address,
            queue_manager = host_header,
            destination = %destination_path(&self.destination),
            "mq transport connected"
        );
        *session = Some(new_session);
        Ok(())
    }

    async fn start_consuming(&self, handler: DeliveryHandler) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        session.set_handler(handler).await;
        let mut frame = Frame::new("SUBSCRIBE")
            .header("id", "consumer-1")
            .header("destination", destination_path(&self.destination))
            .header("ack", "auto");
        if let Some(selector) = selector_for(&self.config) {
            debug!(%selector, "subscribing with selector");
            frame = frame.header("selector", selector);
        }
        session.send_frame(frame).await?;
        info!(destination = %destination_path(&self.destination), "consuming");
        Ok(())
    }

    async fn publish(&self, body: &str, routing_key: &str) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        let mut frame = Frame::new("SEND")
            .header("destination", destination_path(&self.destination))
            .header("content-type", "text/plain")
            .header("persistent", "true");
        if !routing_key.is_empty() {
            frame = frame.header("routing_key", routing_key);
        }
        for (name, value) in &self.config.message_headers {
            frame = frame.header(name, value.clone());
        }
        session.send_frame(frame.with_body(body.as_bytes())).await?;
        Ok(())
    }

    async fn send_reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        // Bare names get the queue scheme before parsing.
        let address = if reply_to.is_empty() || reply_to.contains("://") {
            reply_to.to_string()
        } else {
            format!("queue://{}", reply_to)
        };
        let destination = match Destination::parse(&address) {
            Some(destination) => destination,
            None => {
                warn!("reply requested without a reply-to address, skipping");
                return Ok(());
            }
        };
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        let mut frame = Frame::new("SEND")
            .header("destination", destination_path(&destination))
            .header("content-type", "text/plain")
            .header("persistent", "true");
        if !correlation_id.is_empty() {
            frame = frame.header("correlation-id", correlation_id);
        }
        session.send_frame(frame.with_body(body.as_bytes())).await?;
        debug!(reply_to = %destination.to_address(), correlation_id, "reply sent");
        Ok(())
    }

    async fn close(&self) {
        let mut session = self.session.lock().await;
        if let Some(session) = session.take() {
            session.disconnect().await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::broker_endpoint;
    use super::*;
    use crate::config::{BrokerFamily, ExchangeKind};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn test_queue_manager_from_virtual_host() {
        let mut config = broker_endpoint("orders");
        config.family = BrokerFamily::Mq;
        config.virtual_host = "QM1".to_string();
        let transport = MqTransport::new(config);
        assert_eq!(transport.queue_manager.as_deref(), Some("QM1"));

        let mut config = broker_endpoint("orders");
        config.family = BrokerFamily::Mq;
        let transport = MqTransport::new(config);
        assert_eq!(transport.queue_manager, None);
    }

    #[test]
    fn test_destination_resolves_name_before_kind() {
        let mut config = broker_endpoint("events");
        config.family = BrokerFamily::Mq;
        config.exchange_kind = ExchangeKind::Fanout;
        config.queue = Some("EVENTS.IN".to_string());
        let transport = MqTransport::new(config);
        assert_eq!(
            transport.destination,
            Destination::Topic("EVENTS.IN".to_string())
        );
    }

    /// The queue manager name rides the handshake host header, and a
    /// persistent reply to a bare address lands on the queue scheme.
    #[tokio::test]
    async fn test_handshake_and_bare_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            let connect = Frame::read(&mut reader).await.unwrap().unwrap();
            assert_eq!(connect.command, "CONNECT");
            assert_eq!(connect.header_value("host"), Some("QM1"));
            write_half
                .write_all(&Frame::new("CONNECTED").header("version", "1.2").to_bytes())
                .await
                .unwrap();

            let reply = Frame::read(&mut reader).await.unwrap().unwrap();
            assert_eq!(reply.command, "SEND");
            assert_eq!(reply.header_value("destination"), Some("/queue/DEV.REPLY"));
            assert_eq!(reply.header_value("correlation-id"), Some("c-1"));
            assert_eq!(reply.header_value("persistent"), Some("true"));
            assert_eq!(reply.body, b"done");
        });

        let mut config = broker_endpoint("orders");
        config.family = BrokerFamily::Mq;
        config.host = "127.0.0.1".to_string();
        config.port = port;
        config.virtual_host = "QM1".to_string();
        let transport = MqTransport::new(config);

        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        transport.send_reply("DEV.REPLY", "c-1", "done").await.unwrap();

        timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        transport.close().await;
    }
}
