//! Broker endpoint orchestration.
//!
//! Owns one transport per active broker endpoint and drives the endpoint
//! lifecycle: Stopped, Connecting while the transport dials, Running once
//! consuming or ready to publish. A connect failure on one endpoint never
//! stops the others.

use crate::config::{BrokerEndpoint, EndpointConfig, Protocol, SimulatorConfig};
use crate::error::SimulatorError;
use crate::journal::{ExchangeJournal, ExchangeRecord};
use crate::template::TemplateEngine;
use crate::transport::{make_transport, BrokerTransport, DeliveryHandler, InboundMessage};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle state of a broker endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Stopped,
    Connecting,
    Running,
}

struct ActiveEndpoint {
    broker: BrokerEndpoint,
    transport: Arc<dyn BrokerTransport>,
    state: EndpointState,
}

/// Runs every enabled broker endpoint in a configuration.
pub struct BrokerSimulator {
    endpoints: DashMap<String, ActiveEndpoint>,
    journal: Arc<ExchangeJournal>,
    templates: Arc<TemplateEngine>,
}

impl BrokerSimulator {
    pub fn new(journal: Arc<ExchangeJournal>, templates: Arc<TemplateEngine>) -> Self {
        Self {
            endpoints: DashMap::new(),
            journal,
            templates,
        }
    }

    /// Start every enabled broker endpoint. Failures are logged per
    /// endpoint and do not affect the rest.
    pub async fn start_all(&self, config: &SimulatorConfig) {
        let mut started = 0usize;
        let mut total = 0usize;
        for endpoint in config.enabled_endpoints(Protocol::Broker) {
            total += 1;
            if endpoint.broker.is_none() {
                warn!(
                    endpoint = %endpoint.name,
                    "broker endpoint without broker settings, skipping"
                );
                continue;
            }
            match self.start(endpoint).await {
                Ok(()) => started += 1,
                Err(error) => {
                    error!(endpoint = %endpoint.name, %error, "endpoint failed to start")
                }
            }
        }
        info!(started, total, "broker endpoints up");
    }

    /// Start a single endpoint: connect, then consume when the operation
    /// calls for it. The endpoint is visible as Connecting while the
    /// transport dials and is removed again if any step fails.
    pub async fn start(&self, endpoint: &EndpointConfig) -> Result<(), SimulatorError> {
        let broker = endpoint
            .broker
            .clone()
            .ok_or_else(|| SimulatorError::MissingBrokerConfig(endpoint.name.clone()))?;
        // Restarting an endpoint closes its previous transport first.
        if let Some((_, old)) = self.endpoints.remove(&endpoint.name) {
            old.transport.close().await;
        }
        let transport = make_transport(&broker);
        self.endpoints.insert(
            endpoint.name.clone(),
            ActiveEndpoint {
                broker: broker.clone(),
                transport: Arc::clone(&transport),
                state: EndpointState::Connecting,
            },
        );

        if let Err(error) = transport.connect().await {
            self.endpoints.remove(&endpoint.name);
            return Err(error.into());
        }

        if broker.operation.includes_consume() {
            let handler =
                self.delivery_handler(endpoint.name.clone(), broker.clone(), Arc::clone(&transport));
            if let Err(error) = transport.start_consuming(handler).await {
                transport.close().await;
                self.endpoints.remove(&endpoint.name);
                return Err(error.into());
            }
        }

        if let Some(mut active) = self.endpoints.get_mut(&endpoint.name) {
            active.state = EndpointState::Running;
        }
        info!(
            endpoint = %endpoint.name,
            operation = ?broker.operation,
            "broker endpoint running"
        );
        Ok(())
    }

    fn delivery_handler(
        &self,
        endpoint: String,
        broker: BrokerEndpoint,
        transport: Arc<dyn BrokerTransport>,
    ) -> DeliveryHandler {
        let journal = Arc::clone(&self.journal);
        let templates = Arc::clone(&self.templates);
        Arc::new(move |message: InboundMessage| {
            let endpoint = endpoint.clone();
            let broker = broker.clone();
            let transport = Arc::clone(&transport);
            let journal = Arc::clone(&journal);
            let templates = Arc::clone(&templates);
            Box::pin(async move {
                handle_delivery(endpoint, broker, transport, journal, templates, message).await
            })
        })
    }

    /// Stop one endpoint and close its transport.
    pub async fn stop(&self, name: &str) -> Result<(), SimulatorError> {
        match self.endpoints.remove(name) {
            Some((_, active)) => {
                active.transport.close().await;
                info!(endpoint = name, "broker endpoint stopped");
                Ok(())
            }
            None => Err(SimulatorError::UnknownEndpoint(name.to_string())),
        }
    }

    /// Stop everything. Close failures are already logged by the
    /// transports; nothing here can fail.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some((_, active)) = self.endpoints.remove(&name) {
                active.transport.close().await;
            }
        }
        info!("broker endpoints stopped");
    }

    /// Current state of an endpoint; anything unknown is Stopped.
    pub fn state(&self, name: &str) -> EndpointState {
        self.endpoints
            .get(name)
            .map(|active| active.state)
            .unwrap_or(EndpointState::Stopped)
    }

    pub fn active_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Publish the endpoint's configured message on demand.
    pub async fn publish_mock(&self, name: &str) -> Result<(), SimulatorError> {
        let (transport, broker, state) = match self.endpoints.get(name) {
            Some(active) => (
                Arc::clone(&active.transport),
                active.broker.clone(),
                active.state,
            ),
            None => return Err(SimulatorError::UnknownEndpoint(name.to_string())),
        };
        if state != EndpointState::Running {
            return Err(SimulatorError::NotRunning(name.to_string()));
        }
        let content = broker
            .message_body
            .clone()
            .ok_or_else(|| SimulatorError::MissingMessageBody(name.to_string()))?;

        let body = if broker.template {
            // No inbound message to draw on; global helpers still apply.
            let synthetic = InboundMessage {
                body: String::new(),
                routing_key: broker.publish_routing_key().to_string(),
                correlation_id: None,
                reply_to: None,
                headers: broker.message_headers.clone(),
            };
            match self.templates.render_reply(&content, &synthetic) {
                Ok(rendered) => rendered,
                Err(error) => {
                    warn!(endpoint = name, %error, "publish template failed, sending raw body");
                    content
                }
            }
        } else {
            content
        };

        transport
            .publish(&body, broker.publish_routing_key())
            .await
            .map_err(SimulatorError::from)?;

        let target = format!("{}/{}", broker.exchange, broker.publish_routing_key());
        let mut record = ExchangeRecord::broker("publish", &target);
        record.endpoint = Some(name.to_string());
        record.matched = true;
        record.response_body = Some(body);
        self.journal.record(record).await;
        Ok(())
    }
}

async fn handle_delivery(
    endpoint: String,
    broker: BrokerEndpoint,
    transport: Arc<dyn BrokerTransport>,
    journal: Arc<ExchangeJournal>,
    templates: Arc<TemplateEngine>,
    message: InboundMessage,
) -> anyhow::Result<()> {
    let target = format!("{}/{}", broker.exchange, message.routing_key);
    info!(endpoint = %endpoint, target = %target, matched = true, "message received");

    let mut record = ExchangeRecord::broker("consume", &target);
    record.endpoint = Some(endpoint.clone());
    record.matched = true;
    record.request_headers = message.headers.clone();
    record.request_body = Some(message.body.clone());
    journal.record(record).await;

    if !broker.auto_reply {
        return Ok(());
    }
    let content = match &broker.message_body {
        Some(content) => content.clone(),
        None => {
            warn!(endpoint = %endpoint, "auto-reply enabled but no reply body configured");
            return Ok(());
        }
    };
    if broker.reply_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(broker.reply_delay_ms)).await;
    }
    let body = if broker.template {
        match templates.render_reply(&content, &message) {
            Ok(rendered) => rendered,
            Err(error) => {
                warn!(endpoint = %endpoint, %error, "reply template failed, sending raw body");
                content
            }
        }
    } else {
        content
    };

    let reply_to = message.reply_to.as_deref().unwrap_or("");
    let correlation_id = message.correlation_id.as_deref().unwrap_or("");
    transport.send_reply(reply_to, correlation_id, &body).await?;

    if !reply_to.is_empty() {
        let mut record = ExchangeRecord::broker("reply", reply_to);
        record.endpoint = Some(endpoint);
        record.matched = true;
        record.response_body = Some(body);
        journal.record(record).await;
    }
    Ok(())
}
