use std::{str::FromStr, sync::Arc};

use derive_more::with_trait::{Display, Error};
use serde::Deserialize;
use serde_json::Value;

use crate::protocol::MessageType;

/// Error of decoding a frame received from the server. Always fatal for the connection.
#[derive(Clone, Debug, Display, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object.
    #[display("Message must be JSON: {message}")]
    InvalidJson {
        /// Text of the offending frame.
        #[error(not(source))]
        message: String,

        /// Reason of the decoding failure.
        source: Arc<serde_json::Error>,
    },

    /// The frame carries a missing, unknown or client-only `type`.
    #[display("Invalid message type: \"{_0}\"")]
    InvalidMessageType(#[error(not(source))] String),
}

/// ServerMessage defines the message types that servers can send.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// ConnectionAck is sent in response to a client's ConnectionInit message if the server
    /// accepted the connection.
    ConnectionAck,
    /// ConnectionError is used for errors that are not associated with a GraphQL operation, such
    /// as rejected initialization parameters.
    ConnectionError {
        /// The error that occurred.
        payload: Value,
    },
    /// ConnectionKeepAlive is sent periodically after accepting a connection.
    ConnectionKeepAlive,
    /// Data contains the result of a query, mutation, or subscription event.
    Data {
        /// The id of the operation that the data is for.
        id: Option<String>,

        /// The data and errors that occurred during execution.
        payload: Value,
    },
    /// Error contains an error that occurs before execution, such as validation errors.
    Error {
        /// The id of the operation that triggered this error.
        id: Option<String>,

        /// The error(s).
        payload: Value,
    },
    /// Complete indicates that no more data will be sent for the given operation.
    Complete {
        /// The id of the operation that has completed.
        id: Option<String>,
    },
}

/// Loose shape shared by every frame, validated into a [`ServerMessage`].
#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type", default)]
    ty: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
}

impl ServerMessage {
    /// Returns the [`MessageType`] tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionAck => MessageType::ConnectionAck,
            Self::ConnectionError { .. } => MessageType::ConnectionError,
            Self::ConnectionKeepAlive => MessageType::ConnectionKeepAlive,
            Self::Data { .. } => MessageType::Data,
            Self::Error { .. } => MessageType::Error,
            Self::Complete { .. } => MessageType::Complete,
        }
    }
}

impl FromStr for ServerMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = serde_json::from_str::<RawMessage>(s).map_err(|source| {
            ProtocolError::InvalidJson {
                message: s.into(),
                source: Arc::new(source),
            }
        })?;
        let ty = raw.ty.unwrap_or_default();

        Ok(match ty.parse::<MessageType>() {
            Ok(MessageType::ConnectionAck) => Self::ConnectionAck,
            Ok(MessageType::ConnectionError) => Self::ConnectionError {
                payload: raw.payload,
            },
            Ok(MessageType::ConnectionKeepAlive) => Self::ConnectionKeepAlive,
            Ok(MessageType::Data) => Self::Data {
                id: raw.id,
                payload: raw.payload,
            },
            Ok(MessageType::Error) => Self::Error {
                id: raw.id,
                payload: raw.payload,
            },
            Ok(MessageType::Complete) => Self::Complete { id: raw.id },
            Ok(MessageType::ConnectionInit | MessageType::Start | MessageType::Stop) | Err(_) => {
                return Err(ProtocolError::InvalidMessageType(ty));
            }
        })
    }
}
