//! Configuration for the stand-in server.
//!
//! Defines simulated endpoints, their matching rules, and broker settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration: every simulated endpoint plus global settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SimulatorConfig {
    /// List of simulated endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl SimulatorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Structural defects (empty or duplicate names, out-of-range status
    /// codes) are hard errors. An endpoint missing the sub-config for its
    /// protocol is kept but warned about here; it is skipped at dispatch
    /// and start time.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            endpoint
                .validate()
                .map_err(|e| anyhow::anyhow!("Endpoint {}: {}", i, e))?;
            if !seen.insert(endpoint.name.as_str()) {
                anyhow::bail!("Endpoint {}: duplicate name '{}'", i, endpoint.name);
            }
        }
        Ok(())
    }

    /// Enabled endpoints for one protocol, in file order.
    pub fn enabled_endpoints(&self, protocol: Protocol) -> impl Iterator<Item = &EndpointConfig> {
        self.endpoints
            .iter()
            .filter(move |e| e.enabled && e.protocol == protocol)
    }
}

/// A single simulated endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Unique endpoint name, used as its identity everywhere
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Protocol served by this endpoint
    pub protocol: Protocol,

    /// Interaction pattern, informational
    #[serde(default)]
    pub pattern: MessagePattern,

    /// Whether this endpoint participates in matching/startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP settings (required when protocol is http)
    #[serde(default)]
    pub http: Option<HttpEndpoint>,

    /// Broker settings (required when protocol is broker)
    #[serde(default)]
    pub broker: Option<BrokerEndpoint>,

    /// Response rules, HTTP only; evaluated priority-descending
    #[serde(default)]
    pub rules: Vec<ResponseRule>,
}

fn default_true() -> bool {
    true
}

impl EndpointConfig {
    /// Validate the endpoint definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Endpoint name cannot be empty");
        }
        match self.protocol {
            Protocol::Http if self.http.is_none() => {
                tracing::warn!(
                    endpoint = %self.name,
                    "http endpoint has no http settings and will never match"
                );
            }
            Protocol::Broker if self.broker.is_none() => {
                tracing::warn!(
                    endpoint = %self.name,
                    "broker endpoint has no broker settings and will not be started"
                );
            }
            _ => {}
        }
        for rule in &self.rules {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("endpoint '{}': {}", self.name, e))?;
        }
        Ok(())
    }
}

/// Protocol an endpoint simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Broker,
}

/// Interaction pattern of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePattern {
    #[default]
    RequestReply,
    FireAndForget,
    PubSub,
}

/// HTTP side of an endpoint: which requests it accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpEndpoint {
    /// HTTP method, compared case-insensitively
    pub method: String,

    /// Request path, literal unless flagged as a pattern
    pub path: String,

    /// Treat `path` as a full-match regular expression
    #[serde(default)]
    pub path_is_pattern: bool,
}

/// One response rule within an HTTP endpoint.
///
/// All declared criteria must hold for the rule to match; a rule with no
/// criteria matches unconditionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseRule {
    /// Optional rule name, surfaced in the journal
    #[serde(default)]
    pub name: Option<String>,

    /// Priority (higher wins; ties keep file order)
    #[serde(default)]
    pub priority: i32,

    /// Required header values, names looked up case-insensitively
    #[serde(default)]
    pub match_headers: HashMap<String, String>,

    /// Required query parameters, exact match
    #[serde(default)]
    pub match_query: HashMap<String, String>,

    /// Body pattern: `/regex/` delimited for a regex find, otherwise a
    /// substring the body must contain
    #[serde(default)]
    pub match_body: Option<String>,

    /// Response to produce when this rule is selected
    pub response: RuleResponse,
}

impl ResponseRule {
    /// Validate the rule definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.response.validate()
    }

    /// True when the rule declares no criteria at all.
    pub fn is_unconditional(&self) -> bool {
        self.match_headers.is_empty() && self.match_query.is_empty() && self.match_body.is_none()
    }
}

/// Response payload for a matched rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleResponse {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Delay before responding, enforced by the serving layer
    #[serde(default)]
    pub delay_ms: u64,

    /// Render the body through the template engine
    #[serde(default)]
    pub template: bool,
}

fn default_status() -> u16 {
    200
}

impl RuleResponse {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        Ok(())
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_string(content)?.into_bytes()),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } => "application/octet-stream",
        }
    }
}

/// Broker side of an endpoint: connection, topology, and reply policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerEndpoint {
    /// Broker family served by this endpoint
    #[serde(default)]
    pub family: BrokerFamily,

    /// Broker host
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login user
    #[serde(default)]
    pub username: Option<String>,

    /// Login password
    #[serde(default)]
    pub password: Option<String>,

    /// Virtual host; the mq family reads this as the queue manager name
    #[serde(default = "default_vhost")]
    pub virtual_host: String,

    /// Exchange name
    pub exchange: String,

    /// Exchange kind
    #[serde(default)]
    pub exchange_kind: ExchangeKind,

    /// Declare the exchange durable
    #[serde(default = "default_true")]
    pub exchange_durable: bool,

    /// Queue name; when absent, queue-like destinations fall back to the
    /// exchange name
    #[serde(default)]
    pub queue: Option<String>,

    /// Declare the queue durable
    #[serde(default = "default_true")]
    pub queue_durable: bool,

    /// Declare the queue exclusive
    #[serde(default)]
    pub queue_exclusive: bool,

    /// Routing key for published messages
    #[serde(default)]
    pub routing_key: Option<String>,

    /// Wildcard binding pattern for consumption (`#` multi-segment,
    /// `*` single-segment)
    #[serde(default)]
    pub binding_pattern: Option<String>,

    /// Operation mode
    #[serde(default)]
    pub operation: BrokerOperation,

    /// Reply automatically to consumed messages carrying a reply-to
    #[serde(default)]
    pub auto_reply: bool,

    /// Delay before an automatic reply is sent
    #[serde(default)]
    pub reply_delay_ms: u64,

    /// Message content for automatic replies and on-demand publication
    #[serde(default)]
    pub message_body: Option<String>,

    /// Headers attached to published messages
    #[serde(default)]
    pub message_headers: HashMap<String, String>,

    /// Render `message_body` through the template engine before sending
    #[serde(default)]
    pub template: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

impl BrokerEndpoint {
    /// Routing key to use for outbound publishes; empty means none.
    pub fn publish_routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or("")
    }
}

/// Broker family selector; each variant maps to one transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerFamily {
    /// AMQP 0-9-1 broker (RabbitMQ-compatible)
    #[default]
    Amqp,
    /// JMS-style broker speaking STOMP (Artemis-compatible)
    Stomp,
    /// Queue-manager-centric broker speaking STOMP (IBM MQ-compatible)
    Mq,
    /// In-process broker, used by tests and demos
    Memory,
}

/// Exchange kind, AMQP semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// What a broker endpoint does once running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOperation {
    /// Publish on demand only
    #[default]
    Publish,
    /// Consume inbound messages only
    Consume,
    /// Both directions
    Both,
}

impl BrokerOperation {
    /// Whether this mode sets up a consumer.
    pub fn includes_consume(&self) -> bool {
        matches!(self, BrokerOperation::Consume | BrokerOperation::Both)
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Number of exchange records retained in memory
    #[serde(default = "default_journal_capacity")]
    pub journal_capacity: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            journal_capacity: default_journal_capacity(),
        }
    }
}

fn default_journal_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_http_endpoint() {
        let yaml = r#"
endpoints:
  - name: hello-world
    protocol: http
    http:
      method: GET
      path: /hello
    rules:
      - response:
          status: 200
          body:
            type: text
            content: "Hello, World!"
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].name, "hello-world");
        assert!(config.endpoints[0].enabled);
        assert_eq!(config.endpoints[0].rules[0].response.status, 200);
    }

    #[test]
    fn test_parse_rule_criteria() {
        let yaml = r#"
endpoints:
  - name: users-api
    protocol: http
    http:
      method: GET
      path: "/users/[0-9]+"
      path_is_pattern: true
    rules:
      - name: test-env
        priority: 5
        match_headers:
          X-Env: test
        match_query:
          page: "1"
        match_body: "/foo.*bar/"
        response:
          status: 200
          headers:
            Content-Type: application/json
          body:
            type: json
            content:
              message: "success"
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        let rule = &config.endpoints[0].rules[0];
        assert_eq!(rule.priority, 5);
        assert_eq!(rule.match_headers.get("X-Env").unwrap(), "test");
        assert_eq!(rule.match_body.as_deref(), Some("/foo.*bar/"));
        assert!(!rule.is_unconditional());
        assert!(config.endpoints[0].http.as_ref().unwrap().path_is_pattern);
    }

    #[test]
    fn test_unconditional_rule() {
        let yaml = r#"
endpoints:
  - name: catch-all
    protocol: http
    http:
      method: GET
      path: /anything
    rules:
      - priority: -10
        response:
          status: 204
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        let rule = &config.endpoints[0].rules[0];
        assert!(rule.is_unconditional());
        assert_eq!(rule.priority, -10);
    }

    #[test]
    fn test_broker_endpoint_defaults() {
        let yaml = r#"
endpoints:
  - name: orders-queue
    protocol: broker
    broker:
      exchange: orders
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        let broker = config.endpoints[0].broker.as_ref().unwrap();
        assert_eq!(broker.family, BrokerFamily::Amqp);
        assert_eq!(broker.host, "localhost");
        assert_eq!(broker.port, 5672);
        assert_eq!(broker.virtual_host, "/");
        assert_eq!(broker.exchange_kind, ExchangeKind::Direct);
        assert!(broker.exchange_durable);
        assert!(broker.queue_durable);
        assert!(!broker.queue_exclusive);
        assert_eq!(broker.operation, BrokerOperation::Publish);
        assert!(!broker.auto_reply);
        assert_eq!(broker.reply_delay_ms, 0);
    }

    #[test]
    fn test_parse_consume_endpoint() {
        let yaml = r#"
endpoints:
  - name: notifications
    protocol: broker
    pattern: pub_sub
    broker:
      family: stomp
      host: artemis.internal
      port: 61613
      exchange: notifications
      exchange_kind: topic
      queue: notifications-sim
      binding_pattern: "orders.#"
      operation: both
      auto_reply: true
      reply_delay_ms: 50
      message_body: '{"ack":true}'
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        let broker = config.endpoints[0].broker.as_ref().unwrap();
        assert_eq!(broker.family, BrokerFamily::Stomp);
        assert_eq!(broker.exchange_kind, ExchangeKind::Topic);
        assert!(broker.operation.includes_consume());
        assert!(broker.auto_reply);
        assert_eq!(broker.binding_pattern.as_deref(), Some("orders.#"));
        assert_eq!(config.endpoints[0].pattern, MessagePattern::PubSub);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
endpoints:
  - name: dup
    protocol: http
    http:
      method: GET
      path: /a
  - name: dup
    protocol: http
    http:
      method: GET
      path: /b
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate name"));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let yaml = r#"
endpoints:
  - name: bad-status
    protocol: http
    http:
      method: GET
      path: /x
    rules:
      - response:
          status: 99
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_sub_config_is_not_fatal() {
        let yaml = r#"
endpoints:
  - name: incomplete
    protocol: broker
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_enabled_endpoints_filter() {
        let yaml = r#"
endpoints:
  - name: live
    protocol: http
    http:
      method: GET
      path: /live
  - name: dark
    protocol: http
    enabled: false
    http:
      method: GET
      path: /dark
  - name: queue
    protocol: broker
    broker:
      exchange: q
"#;
        let config: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        let http: Vec<_> = config.enabled_endpoints(Protocol::Http).collect();
        assert_eq!(http.len(), 1);
        assert_eq!(http[0].name, "live");
        let broker: Vec<_> = config.enabled_endpoints(Protocol::Broker).collect();
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn test_response_body_to_bytes() {
        let text = ResponseBody::Text {
            content: "hello".to_string(),
        };
        assert_eq!(text.to_bytes().unwrap(), b"hello");

        let json = ResponseBody::Json {
            content: serde_json::json!({"key": "value"}),
        };
        let bytes = json.to_bytes().unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("key"));

        let b64 = ResponseBody::Base64 {
            content: "aGVsbG8=".to_string(),
        };
        assert_eq!(b64.to_bytes().unwrap(), b"hello");
    }

    #[test]
    fn test_from_file() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            &temp_file,
            r#"
endpoints:
  - name: ping
    protocol: http
    http:
      method: GET
      path: /ping
    rules:
      - response:
          status: 204
"#,
        )
        .unwrap();

        let config = SimulatorConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].name, "ping");

        // Validation runs as part of loading.
        std::fs::write(
            &temp_file,
            r#"
endpoints:
  - name: ""
    protocol: http
"#,
        )
        .unwrap();
        assert!(SimulatorConfig::from_file(temp_file.path()).is_err());

        assert!(SimulatorConfig::from_file(Path::new("/nonexistent/standin.yaml")).is_err());
    }
}
