//! Options of the [`TestClient`] calls, and the way they are turned into HTTP requests.
//!
//! [`TestClient`]: crate::TestClient

use graphql_ws_transport::{InitPayload, Variables};
use http::{header, HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde::Serialize;

/// Cookies to send, by name. Values are percent-encoded when sent.
pub type Cookies = IndexMap<String, String>;

/// Single GraphQL operation, as sent in the body of a request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// The document body.
    pub query: String,

    /// The variables. Sent as `{}` when there are none.
    pub variables: Variables,

    /// The operation to execute. Sent as `null` when not specified.
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    /// Creates a new [`GraphQLRequest`] of the provided `query` document.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Variables::new(),
            operation_name: None,
        }
    }

    /// Specifies the variables of this request.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Specifies the operation to execute.
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// Headers and cookies of a single call, overlaid on the client's global ones.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Headers of the call. A header replaces every global value of the same name.
    pub headers: HeaderMap,

    /// Cookies of the call. A cookie replaces the global one of the same name.
    pub cookies: Cookies,
}

impl RequestOptions {
    /// Creates empty [`RequestOptions`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header to the call.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a cookie to the call.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }
}

/// Options of a [`TestClient::query()`] or a [`TestClient::mutate()`] call.
///
/// [`TestClient::mutate()`]: crate::TestClient::mutate
/// [`TestClient::query()`]: crate::TestClient::query
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Variables of the operation.
    pub variables: Variables,

    /// Operation to execute, if the document contains several.
    pub operation_name: Option<String>,

    /// Headers and cookies of the call.
    pub request: RequestOptions,
}

impl QueryOptions {
    /// Creates empty [`QueryOptions`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the variables of the operation.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Specifies the operation to execute.
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Adds a header to the call.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.request = self.request.with_header(name, value);
        self
    }

    /// Adds a cookie to the call.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request = self.request.with_cookie(name, value);
        self
    }
}

/// Options of a [`TestClient::subscribe()`] call.
///
/// Headers and cookies are sent with the WebSocket handshake request.
///
/// [`TestClient::subscribe()`]: crate::TestClient::subscribe
#[derive(Debug, Default)]
pub struct SubscribeOptions {
    /// The subscription document.
    pub query: String,

    /// Variables of the operation.
    pub variables: Variables,

    /// Operation to execute, if the document contains several.
    pub operation_name: Option<String>,

    /// Payload of the `connection_init` message. `{}` if not specified.
    pub init_payload: Option<InitPayload>,

    /// Headers and cookies of the handshake request.
    pub request: RequestOptions,
}

impl SubscribeOptions {
    /// Creates [`SubscribeOptions`] of the provided subscription `query` document.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Specifies the variables of the operation.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Specifies the operation to execute.
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Specifies the payload of the `connection_init` message.
    pub fn with_init_payload(mut self, payload: impl Into<InitPayload>) -> Self {
        self.init_payload = Some(payload.into());
        self
    }

    /// Adds a header to the handshake request.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.request = self.request.with_header(name, value);
        self
    }

    /// Adds a cookie to the handshake request.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request = self.request.with_cookie(name, value);
        self
    }
}

/// Overlays the `source` headers on the `target` ones: every header present in `source` replaces
/// all the values of the same name in `target`.
pub(crate) fn overlay(target: &mut HeaderMap, source: &HeaderMap) {
    for name in source.keys() {
        target.remove(name);
    }
    for (name, value) in source {
        target.append(name, value.clone());
    }
}

/// Builds the `Cookie` header out of the `global` cookies overlaid with the `call` ones.
///
/// Returns [`None`] if there are no cookies at all.
pub(crate) fn cookie_header(
    global: &Cookies,
    call: &Cookies,
) -> Result<Option<HeaderValue>, header::InvalidHeaderValue> {
    let mut cookies = global.clone();
    cookies.extend(call.iter().map(|(k, v)| (k.clone(), v.clone())));
    if cookies.is_empty() {
        return Ok(None);
    }

    let value = cookies
        .iter()
        .map(|(name, value)| format!("{name}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("; ");
    HeaderValue::from_str(&value).map(Some)
}
