//! Stand-in endpoint simulator
//!
//! Simulates the HTTP services and message-broker endpoints a system under
//! test depends on. Endpoints are declared in a YAML rule set; the
//! simulator answers matched requests with configured responses and drives
//! broker endpoints through connect, consume, and auto-reply.
//!
//! # Features
//!
//! - **Request Matching**: Match by path, method, headers, query params, body
//! - **Prioritized Rules**: Highest-priority rule whose criteria hold wins
//! - **Dynamic Templates**: Handlebars templates over request and message context
//! - **Latency Simulation**: Per-rule and per-reply delays
//! - **Broker Endpoints**: AMQP 0-9-1, STOMP, queue-manager, and in-process families
//! - **Auto-Reply**: Correlated replies to consumed messages
//! - **Exchange Journal**: Bounded in-memory record of recent traffic
//!
//! # Example Configuration
//!
//! ```yaml
//! endpoints:
//!   - name: user-service
//!     protocol: http
//!     http:
//!       method: GET
//!       path: /api/users
//!     rules:
//!       - response:
//!           status: 200
//!           body:
//!             type: json
//!             content:
//!               users: []
//!   - name: order-events
//!     protocol: broker
//!     broker:
//!       family: amqp
//!       exchange: orders
//!       exchange_kind: topic
//!       queue: orders-sim
//!       binding_pattern: "orders.#"
//!       operation: both
//!       auto_reply: true
//!       message_body: '{"status":"accepted"}'
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod journal;
pub mod matcher;
pub mod server;
pub mod template;
pub mod transport;

pub use broker::{BrokerSimulator, EndpointState};
pub use config::SimulatorConfig;
pub use error::{SimulatorError, TransportError};
pub use journal::ExchangeJournal;
pub use matcher::Matcher;
pub use server::HttpSimulator;
pub use template::TemplateEngine;
