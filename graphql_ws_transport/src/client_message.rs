use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::MessageType;

/// Variables of an operation, as a JSON object.
pub type Variables = Map<String, Value>;

/// The payload for a client's "start" message. This triggers execution of a query, mutation, or
/// subscription.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    /// The document body.
    pub query: String,

    /// The variables. Sent as `{}` when there are none.
    pub variables: Variables,

    /// The optional operation name (required if the document contains multiple operations).
    pub operation_name: Option<String>,
}

impl StartPayload {
    /// Key identifying operations which are interchangeable for the server: same document, same
    /// variables and same selected operation.
    pub(crate) fn dedup_key(&self) -> String {
        serde_json::json!([
            self.query,
            sorted(&Value::Object(self.variables.clone())),
            self.operation_name,
        ])
        .to_string()
    }
}

/// Recursively orders object keys, so equal values always serialize identically regardless of
/// insertion order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Protocol extension attached to a "start" message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum Extension {
    /// Operation-scoped initialization payload.
    ConnectionInit {
        /// Arbitrary payload, often used for authentication.
        payload: Value,
    },
}

/// ClientMessage defines the message types that clients can send.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// ConnectionInit is sent by the client upon connecting.
    ConnectionInit {
        /// Optional parameters of any type sent to the server. These are often used for
        /// authentication.
        payload: Value,
    },
    /// Start messages are used to execute a GraphQL operation.
    Start {
        /// The id of the operation.
        id: String,

        /// The query, variables, and operation name.
        payload: StartPayload,

        /// Extensions of this operation, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        extensions: Option<Vec<Extension>>,
    },
    /// Stop messages are used to unsubscribe from a subscription.
    Stop {
        /// The id of the operation to stop.
        id: String,
    },
    /// Echo of an error reported by the server for an operation.
    Error {
        /// The id of the failed operation.
        id: String,

        /// The error payload, as received.
        payload: Value,
    },
}

impl ClientMessage {
    /// Returns the [`MessageType`] tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionInit { .. } => MessageType::ConnectionInit,
            Self::Start { .. } => MessageType::Start,
            Self::Stop { .. } => MessageType::Stop,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Encodes this message as the text of a single WebSocket frame.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
