#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod client;
mod client_message;
mod protocol;
mod registry;
mod response;
mod server_message;

use std::{fmt, future::Future};

use derive_more::with_trait::{Display, From};
use futures::future::{self, BoxFuture, FutureExt as _, TryFutureExt as _};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio_tungstenite::tungstenite;

pub use self::{
    client::{
        reconnect_delay, ConnectionState, Subscription, SubscriptionClient, SubscriptionRequest,
    },
    client_message::{ClientMessage, Extension, StartPayload, Variables},
    protocol::{MessageType, UnknownMessageType, GRAPHQL_WS},
    registry::{Payload, Publication, Publisher, Registration, SubscriberId},
    response::{Location, Response, ResponseError},
    server_message::{ProtocolError, ServerMessage},
};

/// Service name used in topics when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "graphql";

/// Error of the subscription transport.
#[derive(Debug, Display, derive_more::Error, From)]
pub enum Error {
    /// The WebSocket handshake request cannot be built, because of an invalid URI or header.
    #[display("Invalid handshake request: {_0}")]
    InvalidRequest(#[error(not(source))] String),

    /// Failure of the underlying WebSocket.
    #[display("WebSocket error: {_0}")]
    #[from]
    WebSocket(tungstenite::Error),

    /// A message cannot be (de)serialized.
    #[display("Serialization error: {_0}")]
    #[from]
    Serde(serde_json::Error),

    /// The server violated the protocol. The connection was closed without reconnecting.
    #[display("Protocol error: {_0}")]
    #[from]
    Protocol(ProtocolError),

    /// The [`InitPayload`] producer failed.
    #[display("Failed to produce connection init payload: {_0}")]
    InitPayload(#[error(not(source))] String),

    /// The operation cannot be started before the server acknowledged the connection.
    #[display("Connection is not ready")]
    NotReady,

    /// The transport has been closed.
    #[display("Connection is closed")]
    Closed,
}

/// Boxed fallible producer of a connection init payload.
type Producer = Box<dyn FnMut() -> BoxFuture<'static, Result<Value, String>> + Send>;

/// Payload sent along the `connection_init` message.
///
/// Either a fixed JSON value, or a producer which is called (and awaited) on every connection
/// attempt, so credentials can be refreshed between reconnects.
pub enum InitPayload {
    /// Fixed JSON value.
    Value(Value),

    /// Asynchronous producer of the value.
    Producer(Producer),
}

impl InitPayload {
    /// Creates an [`InitPayload`] out of an asynchronous producer.
    ///
    /// A failing producer aborts the connection attempt, which is treated as an unexpected
    /// disconnection.
    pub fn producer<F, Fut, E>(mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display,
    {
        Self::Producer(Box::new(move || f().map_err(|e| e.to_string()).boxed()))
    }

    pub(crate) fn resolve(&mut self) -> BoxFuture<'static, Result<Value, Error>> {
        match self {
            Self::Value(v) => future::ready(Ok(v.clone())).boxed(),
            Self::Producer(f) => f().map_err(Error::InitPayload).boxed(),
        }
    }
}

impl Default for InitPayload {
    fn default() -> Self {
        Self::Value(Value::Object(Default::default()))
    }
}

impl From<Value> for InitPayload {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for InitPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

type ConnectedCallback = Box<dyn FnMut() + Send>;
type ConnectionFailedCallback = Box<dyn FnMut(Value) -> BoxFuture<'static, ()> + Send>;

/// ClientConfig is used to configure a [`SubscriptionClient`] before it connects.
pub struct ClientConfig {
    pub(crate) headers: HeaderMap,
    pub(crate) protocols: Vec<String>,
    pub(crate) reconnect: bool,
    pub(crate) max_reconnect_attempts: Option<u32>,
    pub(crate) service_name: String,
    pub(crate) init_payload: InitPayload,
    pub(crate) on_connected: Option<ConnectedCallback>,
    pub(crate) on_connection_failed: Option<ConnectionFailedCallback>,
    pub(crate) on_reconnect_failed: Option<ConnectedCallback>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfig {
    /// Constructs the default configuration: no extra headers nor subprotocols, no reconnection,
    /// `{}` as the init payload.
    pub fn new() -> Self {
        Self {
            headers: HeaderMap::new(),
            protocols: vec![],
            reconnect: false,
            max_reconnect_attempts: None,
            service_name: DEFAULT_SERVICE_NAME.into(),
            init_payload: InitPayload::default(),
            on_connected: None,
            on_connection_failed: None,
            on_reconnect_failed: None,
        }
    }

    /// Specifies the headers sent with the WebSocket handshake request. Replaces any previously
    /// specified ones.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Adds a single header to the WebSocket handshake request.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Specifies additional subprotocols to offer along with `graphql-ws`, which is always
    /// offered first.
    pub fn with_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Specifies whether an unexpectedly closed connection should be re-established. Disabled by
    /// default.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Specifies the attempt counter value past which reconnecting is given up, so at most
    /// `max + 1` consecutive reconnection attempts are made. By default, there is no limit.
    pub fn with_max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    /// Specifies the service name prefixing the topics of operations. Defaults to
    /// [`DEFAULT_SERVICE_NAME`].
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Specifies the payload of the `connection_init` message.
    pub fn with_init_payload(mut self, payload: impl Into<InitPayload>) -> Self {
        self.init_payload = payload.into();
        self
    }

    /// Registers a callback invoked every time the server acknowledges the connection.
    pub fn on_connected(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    /// Registers a callback invoked with the payload of every `connection_error` message.
    pub fn on_connection_failed<F, Fut>(mut self, mut f: F) -> Self
    where
        F: FnMut(Value) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connection_failed = Some(Box::new(move |payload| f(payload).boxed()));
        self
    }

    /// Registers a callback invoked once the maximum number of reconnection attempts is
    /// exhausted.
    pub fn on_reconnect_failed(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_reconnect_failed = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("headers", &self.headers)
            .field("protocols", &self.protocols)
            .field("reconnect", &self.reconnect)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("service_name", &self.service_name)
            .field("init_payload", &self.init_payload)
            .finish_non_exhaustive()
    }
}
