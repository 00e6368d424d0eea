//! Error types shared across the simulator.

use thiserror::Error;

/// Errors raised by broker transport adapters.
///
/// Every variant is scoped to one endpoint or one operation; nothing here
/// is treated as fatal by the orchestrator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker could not be reached or rejected the connection.
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    /// An operation was attempted before connect or after close.
    #[error("not connected")]
    NotConnected,

    /// Consuming requires a queue name in the endpoint settings.
    #[error("consuming requires a queue name")]
    QueueNameRequired,

    /// The peer sent something the protocol layer could not handle.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// AMQP client failure.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl TransportError {
    /// Build a connect failure from any displayable cause.
    pub fn connect(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        TransportError::Connect {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by the broker orchestrator.
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// Broker endpoint without broker settings; the endpoint is skipped.
    #[error("endpoint '{0}' has no broker settings")]
    MissingBrokerConfig(String),

    /// Operation addressed to an endpoint the orchestrator does not know.
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// Operation requires the endpoint to be running.
    #[error("endpoint '{0}' is not running")]
    NotRunning(String),

    /// On-demand publication without configured message content.
    #[error("endpoint '{0}' has no message body configured")]
    MissingMessageBody(String),

    /// Underlying transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
