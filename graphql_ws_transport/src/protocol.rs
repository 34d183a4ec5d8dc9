//! Vocabulary of the [legacy `graphql-ws` GraphQL over WebSocket Protocol][old].
//!
//! [old]: https://github.com/apollographql/subscriptions-transport-ws/blob/v0.11.0/PROTOCOL.md

use std::{fmt, str::FromStr};

use derive_more::with_trait::{Display, Error};
use serde::{Deserialize, Serialize};

/// Name of the WebSocket subprotocol, sent in the `Sec-WebSocket-Protocol` header.
pub const GRAPHQL_WS: &str = "graphql-ws";

/// Tag carried in the `type` field of every message.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client → server. Opens the protocol session.
    ConnectionInit,
    /// Server → client. The session was accepted.
    ConnectionAck,
    /// Server → client. The session was rejected or a connection-level failure happened.
    ConnectionError,
    /// Server → client. Heartbeat.
    #[serde(rename = "ka")]
    ConnectionKeepAlive,
    /// Client → server. Starts an operation.
    Start,
    /// Client → server. Stops an operation.
    Stop,
    /// Server → client. Result of an operation or one subscription event.
    Data,
    /// Both directions. An operation failed before execution.
    Error,
    /// Server → client. No more data will be sent for an operation.
    Complete,
}

impl MessageType {
    /// Every tag of the protocol.
    pub const ALL: [Self; 9] = [
        Self::ConnectionInit,
        Self::ConnectionAck,
        Self::ConnectionError,
        Self::ConnectionKeepAlive,
        Self::Start,
        Self::Stop,
        Self::Data,
        Self::Error,
        Self::Complete,
    ];

    /// Returns the wire representation of this tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionAck => "connection_ack",
            Self::ConnectionError => "connection_error",
            Self::ConnectionKeepAlive => "ka",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Data => "data",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error of parsing a [`MessageType`] from a tag that is not part of the protocol.
#[derive(Clone, Debug, Display, Eq, Error, PartialEq)]
#[display("Invalid message type: \"{_0}\"")]
pub struct UnknownMessageType(#[error(not(source))] pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.into()))
    }
}
