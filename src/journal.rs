//! Exchange journal.
//!
//! Records one entry per completed exchange: an HTTP request/response pair
//! or an inbound/outbound broker message. Bounded in-memory ring plus
//! running counters; every record also emits one structured log line.

use crate::config::Protocol;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::info;

/// One completed exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRecord {
    /// Protocol of the endpoint involved
    pub protocol: Protocol,
    /// Endpoint name, when one was identified
    pub endpoint: Option<String>,
    /// Selected rule name, HTTP only
    pub rule: Option<String>,
    /// HTTP method, or broker operation (consume/publish/reply)
    pub operation: String,
    /// Request path, or exchange/routing-key for broker traffic
    pub target: String,
    /// Request or message headers
    pub request_headers: HashMap<String, String>,
    /// Query parameters, HTTP only
    pub query_params: HashMap<String, String>,
    /// Request or message body
    pub request_body: Option<String>,
    /// Response status, HTTP only
    pub status: Option<u16>,
    /// Response body sent back, when any
    pub response_body: Option<String>,
    /// Whether an endpoint/rule matched
    pub matched: bool,
    /// Peer address, HTTP only
    pub client: Option<String>,
    /// When the exchange arrived
    pub received_at: DateTime<Utc>,
}

impl ExchangeRecord {
    /// Start an HTTP record stamped now; remaining fields are filled by
    /// the serving layer.
    pub fn http(method: &str, path: &str) -> Self {
        Self {
            protocol: Protocol::Http,
            endpoint: None,
            rule: None,
            operation: method.to_uppercase(),
            target: path.to_string(),
            request_headers: HashMap::new(),
            query_params: HashMap::new(),
            request_body: None,
            status: None,
            response_body: None,
            matched: false,
            client: None,
            received_at: Utc::now(),
        }
    }

    /// Start a broker record stamped now.
    pub fn broker(operation: &str, target: &str) -> Self {
        Self {
            protocol: Protocol::Broker,
            endpoint: None,
            rule: None,
            operation: operation.to_string(),
            target: target.to_string(),
            request_headers: HashMap::new(),
            query_params: HashMap::new(),
            request_body: None,
            status: None,
            response_body: None,
            matched: false,
            client: None,
            received_at: Utc::now(),
        }
    }
}

/// Bounded in-memory journal of exchanges.
pub struct ExchangeJournal {
    entries: Mutex<VecDeque<ExchangeRecord>>,
    capacity: usize,
    total: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
}

impl ExchangeJournal {
    /// Create a journal retaining at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            total: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Record one exchange. Oldest entries are evicted at capacity.
    pub async fn record(&self, record: ExchangeRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if record.matched {
            self.matched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            protocol = ?record.protocol,
            endpoint = record.endpoint.as_deref().unwrap_or("-"),
            operation = %record.operation,
            target = %record.target,
            matched = record.matched,
            status = record.status,
            "exchange recorded"
        );

        let mut entries = self.entries.lock().await;
        while entries.len() >= self.capacity.max(1) {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Most recent records, newest last, at most `n`.
    pub async fn recent(&self, n: usize) -> Vec<ExchangeRecord> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(n).rev().cloned().collect()
    }

    /// Number of retained records.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the journal holds no records.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Exchanges recorded since startup.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Exchanges that matched an endpoint/rule.
    pub fn matched_count(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    /// Exchanges that matched nothing.
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}
