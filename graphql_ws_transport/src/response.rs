//! GraphQL response envelope delivered to subscribers.

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Reads a `null` list as an empty one.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Location of an error in the GraphQL document.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Location {
    /// Line number, starting from 1.
    pub line: usize,

    /// Column number, starting from 1.
    pub column: usize,
}

/// Single error of a GraphQL response.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResponseError {
    /// Human readable description of the error.
    pub message: String,

    /// Locations in the document the error relates to.
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    /// Path to the response field the error relates to.
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,

    /// Additional, server specific, information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl ResponseError {
    /// Creates a new [`ResponseError`] carrying only a `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: vec![],
            path: vec![],
            extensions: None,
        }
    }

    /// Decodes the payload of an `error` message.
    ///
    /// Servers send either a list of errors or a single error object. Anything else is kept as
    /// the message of a single error.
    pub fn from_payload(payload: Value) -> Vec<Self> {
        match payload {
            Value::Array(items) => items.into_iter().flat_map(Self::from_payload).collect(),
            Value::String(message) => vec![Self::new(message)],
            payload @ Value::Object(_) => match serde_json::from_value(payload.clone()) {
                Ok(err) => vec![err],
                Err(_) => vec![Self::new(payload.to_string())],
            },
            other => vec![Self::new(other.to_string())],
        }
    }
}

/// Response of a GraphQL operation: `data` along with the `errors` which occurred, if any.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Response {
    /// The result data. May be `null`.
    #[serde(default)]
    pub data: Value,

    /// Errors of the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ResponseError>>,
}

impl Response {
    /// Creates a successful [`Response`] with the given `data`.
    pub fn new(data: Value) -> Self {
        Self { data, errors: None }
    }

    /// Creates a failed [`Response`]: `null` data with the given `errors`.
    pub fn failed(errors: Vec<ResponseError>) -> Self {
        Self {
            data: Value::Null,
            errors: Some(errors),
        }
    }

    /// Decodes the payload of a `data` message as-is.
    ///
    /// A payload which is not a response envelope is carried as `data`.
    pub fn from_payload(payload: Value) -> Self {
        let is_envelope = matches!(
            &payload,
            Value::Object(map)
                if map
                    .keys()
                    .all(|k| matches!(k.as_str(), "data" | "errors" | "extensions")),
        );
        if is_envelope {
            if let Ok(resp) = Self::deserialize(&payload) {
                return resp;
            }
        }
        Self::new(payload)
    }

    /// Indicates whether this response carries no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.as_ref().is_none_or(Vec::is_empty)
    }

    /// Returns the errors of this response, empty if there are none.
    pub fn errors(&self) -> &[ResponseError] {
        self.errors.as_deref().unwrap_or_default()
    }

    /// Deserializes `data` into the provided type.
    pub fn data_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}
