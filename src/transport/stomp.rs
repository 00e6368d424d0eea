//! STOMP 1.2 transport.
//!
//! Speaks the text protocol directly over a tokio TCP stream. The session
//! splits the stream after the handshake: sends go through a mutex-guarded
//! write half, deliveries arrive on a dedicated reader task that feeds the
//! registered handler.

use super::{
    selector_for, BrokerTransport, DeliveryHandler, Destination, InboundMessage,
};
use crate::config::BrokerEndpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers owned by the protocol or mapped to dedicated message fields;
/// everything else is passed through as an application header.
const RESERVED_HEADERS: &[&str] = &[
    "destination",
    "message-id",
    "subscription",
    "ack",
    "content-length",
    "content-type",
    "correlation-id",
    "reply-to",
    "routing_key",
    "redelivered",
    "expires",
    "priority",
    "timestamp",
    "persistent",
];

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    }

    /// Wire encoding: command line, headers, blank line, body, NUL.
    /// A content-length header is added for non-empty bodies so the peer
    /// never has to scan the body for the terminator.
    pub fn to_bytes(&self) -> Vec<u8> {
        // STOMP 1.2 exempts CONNECT and CONNECTED from header escaping.
        let escape = self.command != "CONNECT" && self.command != "CONNECTED";
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.header_value("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Read one frame. Returns None on a clean EOF before any frame data.
    /// Bare newlines between frames are heartbeats and are skipped.
    pub async fn read<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut command = String::new();
        loop {
            command.clear();
            if reader.read_line(&mut command).await? == 0 {
                return Ok(None);
            }
            trim_line(&mut command);
            if !command.is_empty() {
                break;
            }
        }

        let unescape = command != "CONNECT" && command != "CONNECTED";
        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame truncated in headers",
                ));
            }
            trim_line(&mut line);
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if unescape {
                    headers.push((unescape_header(name), unescape_header(value)));
                } else {
                    headers.push((name.to_string(), value.to_string()));
                }
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.parse::<usize>().ok());

        let body = match content_length {
            Some(length) => {
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).await?;
                let mut nul = [0u8; 1];
                reader.read_exact(&mut nul).await?;
                if nul[0] != 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame body longer than content-length",
                    ));
                }
                body
            }
            None => {
                let mut body = Vec::new();
                reader.read_until(0, &mut body).await?;
                if body.pop() != Some(0) {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "frame truncated in body",
                    ));
                }
                body
            }
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }

    pub fn into_message(self) -> InboundMessage {
        let routing_key = self.header_value("routing_key").unwrap_or("").to_string();
        let correlation_id = self.header_value("correlation-id").map(str::to_string);
        let reply_to = self.header_value("reply-to").map(str::to_string);
        let headers: HashMap<String, String> = self
            .headers
            .iter()
            .filter(|(name, _)| !RESERVED_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let body = String::from_utf8_lossy(&self.body).into_owned();
        InboundMessage {
            body,
            routing_key,
            correlation_id,
            reply_to,
            headers,
        }
    }

    /// Human-readable reason from an ERROR frame.
    pub fn error_message(&self) -> String {
        let header = self.header_value("message").unwrap_or("");
        let body = String::from_utf8_lossy(&self.body);
        let body = body.trim();
        match (header.is_empty(), body.is_empty()) {
            (true, true) => "unspecified broker error".to_string(),
            (false, true) => header.to_string(),
            (true, false) => body.to_string(),
            (false, false) => format!("{}: {}", header, body),
        }
    }
}

fn trim_line(line: &mut String) {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub(crate) fn destination_path(destination: &Destination) -> String {
    match destination {
        Destination::Queue(name) => format!("/queue/{}", name),
        Destination::Topic(name) => format!("/topic/{}", name),
    }
}

/// A connected STOMP session: guarded write half plus a reader task that
/// dispatches MESSAGE frames to the registered handler.
pub(crate) struct StompSession {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    handler: Arc<Mutex<Option<DeliveryHandler>>>,
    reader: JoinHandle<()>,
}

impl StompSession {
    /// Dial, handshake, and spawn the reader task. The `alive` flag is set
    /// while the session link is up and cleared when the reader exits.
    pub(crate) async fn connect(
        address: &str,
        host_header: &str,
        config: &BrokerEndpoint,
        alive: Arc<AtomicBool>,
    ) -> Result<Self, TransportError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::connect(address, "connect timed out"))?
            .map_err(|error| TransportError::connect(address, error))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let mut frame = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host_header)
            .header("heart-beat", "0,0");
        if let Some(username) = &config.username {
            frame = frame.header("login", username.clone());
        }
        if let Some(password) = &config.password {
            frame = frame.header("passcode", password.clone());
        }
        writer.write_all(&frame.to_bytes()).await?;
        writer.flush().await?;

        let reply = timeout(CONNECT_TIMEOUT, Frame::read(&mut reader))
            .await
            .map_err(|_| TransportError::connect(address, "handshake timed out"))??
            .ok_or_else(|| {
                TransportError::connect(address, "connection closed during handshake")
            })?;
        match reply.command.as_str() {
            "CONNECTED" => {}
            "ERROR" => return Err(TransportError::connect(address, reply.error_message())),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    other
                )))
            }
        }

        alive.store(true, Ordering::SeqCst);
        let handler: Arc<Mutex<Option<DeliveryHandler>>> = Arc::new(Mutex::new(None));
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&handler), alive));
        Ok(Self {
            writer: Mutex::new(writer),
            handler,
            reader: reader_task,
        })
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn set_handler(&self, handler: DeliveryHandler) {
        *self.handler.lock().await = Some(handler);
    }

    /// Polite DISCONNECT, then stop the reader. Send failures at this
    /// point are expected when the link already dropped.
    pub(crate) async fn disconnect(&self) {
        if let Err(error) = self.send_frame(Frame::new("DISCONNECT")).await {
            debug!(%error, "disconnect frame not sent");
        }
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    handler: Arc<Mutex<Option<DeliveryHandler>>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match Frame::read(&mut reader).await {
            Ok(Some(frame)) => match frame.command.as_str() {
                "MESSAGE" => {
                    let callback = handler.lock().await.clone();
                    if let Some(callback) = callback {
                        if let Err(error) = callback(frame.into_message()).await {
                            warn!(%error, "delivery handler failed");
                        }
                    } else {
                        debug!("message before any subscription, dropping");
                    }
                }
                "ERROR" => {
                    error!(message = %frame.error_message(), "broker reported an error")
                }
                "RECEIPT" => {}
                other => debug!(command = other, "ignoring frame"),
            },
            Ok(None) => {
                debug!("broker closed the connection");
                break;
            }
            Err(error) => {
                warn!(%error, "read failed, stopping consumer loop");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

/// Transport over a plain STOMP broker.
pub struct StompTransport {
    config: BrokerEndpoint,
    destination: Destination,
    address: String,
    session: Mutex<Option<StompSession>>,
    connected: Arc<AtomicBool>,
}

impl StompTransport {
    pub fn new(config: BrokerEndpoint) -> Self {
        let destination = Destination::derive(&config);
        let address = format!("{}:{}", config.host, config.port);
        Self {
            config,
            destination,
            address,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BrokerTransport for StompTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        let new_session = StompSession::connect(
            &self.address,
            &self.config.virtual_host,
            &self.config,
            Arc::clone(&self.connected),
        )
        .await?;
        info!(
            address = %self.address,
            destination = %destination_path(&self.destination),
            "stomp transport connected"
        );
        *session = Some(new_session);
        Ok(())
    }

    async fn start_consuming(&self, handler: DeliveryHandler) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        session.set_handler(handler).await;
        let mut frame = Frame::new("SUBSCRIBE")
            .header("id", "sub-1")
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
            .header("content-type", "text/plain");
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
        let destination = match Destination::parse(reply_to) {
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
            .header("content-type", "text/plain");
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
