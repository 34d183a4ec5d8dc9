#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod axum_host;
mod federation;
mod host;
mod request;
mod subscription;

use std::future;

use axum::Router;
use bytes::Bytes;
use derive_more::with_trait::{Display, From};
use futures::{channel::mpsc, StreamExt as _};
use graphql_ws_transport::{
    self as transport, ClientConfig, SubscriptionClient, SubscriptionRequest,
};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

use self::request::{cookie_header, overlay};

pub use graphql_ws_transport::{InitPayload, Location, Response, ResponseError, Variables};

pub use self::{
    axum_host::AxumHost,
    federation::FederatedEntity,
    host::{BoxError, Host},
    request::{Cookies, GraphQLRequest, QueryOptions, RequestOptions, SubscribeOptions},
    subscription::Subscription,
};

/// Default path of the GraphQL endpoint.
pub const DEFAULT_URL: &str = "/graphql";

/// Document of the request probing whether GraphQL is served by a [`Host`].
const PROBE: &[u8] = br#"{"query":"{ __typename }"}"#;

/// Error of checking whether a [`Host`] is able to serve GraphQL requests.
///
/// Checked once per [`TestClient`], so every call observes the same one.
#[derive(Clone, Debug, Display, derive_more::Error, Eq, PartialEq)]
pub enum SetupError {
    /// [`Host::ready()`] failed.
    #[display("Host failed to get ready: {_0}")]
    Host(#[error(not(source))] String),

    /// The [`Host`] failed to process the probing request.
    #[display("Invalid host instance: {_0}")]
    InvalidHost(#[error(not(source))] String),

    /// The [`Host`] doesn't serve GraphQL on the configured URL.
    #[display("GraphQL is not registered in the host instance!")]
    NotRegistered,
}

/// Error of a [`TestClient`] call.
#[derive(Debug, Display, derive_more::Error, From)]
pub enum Error {
    /// The [`Host`] is not able to serve GraphQL requests.
    #[display("{_0}")]
    #[from]
    Setup(SetupError),

    /// The [`Host`] failed to process a request.
    #[display("Host error: {_0}")]
    Host(#[error(not(source))] BoxError),

    /// The request cannot be built, because of an invalid URL or header.
    #[display("Invalid request: {_0}")]
    #[from]
    Http(http::Error),

    /// The request body cannot be serialized.
    #[display("Serialization error: {_0}")]
    #[from]
    Serde(serde_json::Error),

    /// The [`Host`] responded with something other than a GraphQL response.
    #[display("Unexpected `{status}` response: {body}")]
    InvalidResponse {
        /// Status of the response.
        status: StatusCode,

        /// Body of the response.
        body: String,
    },

    /// Failure of the subscription transport.
    #[display("{_0}")]
    #[from]
    Transport(transport::Error),

    /// The server rejected the subscription connection with a `connection_error`.
    #[display("Connection rejected: {_0}")]
    ConnectionRejected(#[error(not(source))] Value),

    /// The service doesn't support federation.
    #[display("Service is not federated")]
    NotFederated,

    /// The federated service resolved no entity.
    #[display("Entity not found")]
    EntityNotFound,

    /// The operation failed with the provided GraphQL errors.
    #[display(
        "GraphQL errors: {}",
        _0.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; "),
    )]
    GraphQL(#[error(not(source))] Vec<ResponseError>),
}

/// Global options of a [`TestClient`], applying to every call.
#[derive(Clone, Debug)]
pub struct TestClientOptions {
    /// Path of the GraphQL endpoint. Defaults to [`DEFAULT_URL`].
    pub url: String,

    /// Headers sent with every call.
    pub headers: HeaderMap,

    /// Cookies sent with every call.
    pub cookies: Cookies,
}

impl Default for TestClientOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.into(),
            headers: HeaderMap::new(),
            cookies: Cookies::new(),
        }
    }
}

impl TestClientOptions {
    /// Specifies the path of the GraphQL endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Specifies the headers sent with every call.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Specifies the cookies sent with every call.
    pub fn with_cookies(mut self, cookies: Cookies) -> Self {
        self.cookies = cookies;
        self
    }
}

/// Client issuing GraphQL operations against a [`Host`].
///
/// Queries, mutations and batches are injected into the [`Host`] in-process. Subscriptions are
/// done over a WebSocket speaking the legacy `graphql-ws` protocol, so the [`Host`] is made to
/// listen on a loopback port if it doesn't already.
///
/// Before the first call, checks once that the [`Host`] serves GraphQL at all, and fails every
/// call with the same [`SetupError`] if it doesn't.
#[derive(Debug)]
pub struct TestClient<H = AxumHost> {
    host: H,
    options: TestClientOptions,
    readiness: OnceCell<Result<(), SetupError>>,
}

impl TestClient<AxumHost> {
    /// Creates a new [`TestClient`] of the provided [`Router`], with default options.
    pub fn from_router(router: Router) -> Self {
        Self::new(AxumHost::new(router))
    }
}

impl<H: Host> TestClient<H> {
    /// Creates a new [`TestClient`] of the provided [`Host`], with default options.
    pub fn new(host: H) -> Self {
        Self::with_options(host, TestClientOptions::default())
    }

    /// Creates a new [`TestClient`] of the provided [`Host`] and [`TestClientOptions`].
    pub fn with_options(host: H, options: TestClientOptions) -> Self {
        Self {
            host,
            options,
            readiness: OnceCell::new(),
        }
    }

    /// Returns the [`Host`] of this [`TestClient`].
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Returns the path of the GraphQL endpoint.
    pub fn url(&self) -> &str {
        &self.options.url
    }

    /// Returns the headers sent with every call.
    pub fn headers(&self) -> &HeaderMap {
        &self.options.headers
    }

    /// Returns the cookies sent with every call.
    pub fn cookies(&self) -> &Cookies {
        &self.options.cookies
    }

    /// Replaces the headers sent with every subsequent call.
    pub fn set_headers(&mut self, headers: HeaderMap) {
        self.options.headers = headers;
    }

    /// Replaces the cookies sent with every subsequent call.
    pub fn set_cookies(&mut self, cookies: Cookies) {
        self.options.cookies = cookies;
    }

    /// Resolves once the [`Host`] is checked to serve GraphQL.
    ///
    /// # Errors
    ///
    /// With [`Error::Setup`] if it doesn't.
    pub async fn ready(&self) -> Result<(), Error> {
        self.readiness
            .get_or_init(|| self.check_readiness())
            .await
            .clone()
            .map_err(Error::Setup)
    }

    async fn check_readiness(&self) -> Result<(), SetupError> {
        self.host
            .ready()
            .await
            .map_err(|e| SetupError::Host(e.to_string()))?;

        let probe = http::Request::post(self.url())
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(Bytes::from_static(PROBE))
            .map_err(|e| SetupError::InvalidHost(e.to_string()))?;
        let response = self
            .host
            .inject(probe)
            .await
            .map_err(|e| SetupError::InvalidHost(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
                Err(SetupError::NotRegistered)
            }
            _ => Ok(()),
        }
    }

    /// Executes the `query` document.
    ///
    /// GraphQL errors are not failures of the call: they are reported in the [`Response`].
    ///
    /// # Errors
    ///
    /// If the [`Host`] is not ready, or doesn't respond with a GraphQL response.
    pub async fn query(
        &self,
        query: impl Into<String>,
        options: QueryOptions,
    ) -> Result<Response, Error> {
        let QueryOptions {
            variables,
            operation_name,
            request,
        } = options;
        let body = GraphQLRequest {
            query: query.into(),
            variables,
            operation_name,
        };
        self.post(&body, &request).await
    }

    /// Executes the `mutation` document.
    ///
    /// # Errors
    ///
    /// See [`TestClient::query()`].
    pub async fn mutate(
        &self,
        mutation: impl Into<String>,
        options: QueryOptions,
    ) -> Result<Response, Error> {
        self.query(mutation, options).await
    }

    /// Executes the `requests` in a single batch, returning their responses in the same order.
    ///
    /// # Errors
    ///
    /// See [`TestClient::query()`].
    pub async fn batch_queries(
        &self,
        requests: Vec<GraphQLRequest>,
        options: RequestOptions,
    ) -> Result<Vec<Response>, Error> {
        self.post(&requests, &options).await
    }

    /// Subscribes to the operation described by the `options` over a new WebSocket connection.
    ///
    /// Resolves once the server acknowledged the connection and the operation is started.
    ///
    /// # Errors
    ///
    /// - With [`Error::ConnectionRejected`] if the server rejects the connection.
    /// - With [`Error::Transport`] if the connection fails, or the server breaks the protocol.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription, Error> {
        self.ready().await?;

        let SubscribeOptions {
            query,
            variables,
            operation_name,
            init_payload,
            request,
        } = options;

        let addr = match self.host.local_addr() {
            Some(addr) => addr,
            None => {
                let addr = self.host.listen().await.map_err(Error::Host)?;
                log::warn!(
                    "Host is listening on {addr} to serve subscriptions. \
                     Remember to close the host instance manually.",
                );
                addr
            }
        };
        let uri = format!("ws://{addr}{}", self.url());

        let (rejected, mut rejections) = mpsc::unbounded();
        let mut config = ClientConfig::new()
            .with_headers(self.request_headers(HeaderMap::new(), &request)?)
            .on_connection_failed(move |payload| {
                _ = rejected.unbounded_send(payload);
                future::ready(())
            });
        if let Some(payload) = init_payload {
            config = config.with_init_payload(payload);
        }

        let mut request = SubscriptionRequest::new(query).with_variables(variables);
        if let Some(name) = operation_name {
            request = request.with_operation_name(name);
        }

        // Deferred until the connection is acknowledged.
        let client = SubscriptionClient::connect(&uri, config)?;
        match client.subscribe(request).await {
            Ok(inner) => Ok(Subscription::new(client, inner)),
            Err(e) => {
                // The rejection is signaled before the client stops, which ends `rejections`.
                if let Some(payload) = rejections.next().await {
                    return Err(Error::ConnectionRejected(payload));
                }
                Err(e.into())
            }
        }
    }

    /// Resolves the `entity` via the `_entities` query of a federated service, returning it
    /// along with its `__typename`.
    ///
    /// # Errors
    ///
    /// - With [`Error::NotFederated`] if the service doesn't support federation.
    /// - With [`Error::GraphQL`] if the query fails otherwise.
    /// - With [`Error::EntityNotFound`] if no entity is resolved.
    pub async fn get_federated_entity(&self, entity: FederatedEntity) -> Result<Value, Error> {
        let response = self
            .query(
                entity.query(),
                QueryOptions::new().with_variables(entity.variables()),
            )
            .await?;

        if let Some(errors) = response.errors.filter(|errors| !errors.is_empty()) {
            if errors
                .iter()
                .any(|e| federation::is_not_federated(&e.message))
            {
                return Err(Error::NotFederated);
            }
            return Err(Error::GraphQL(errors));
        }

        response
            .data
            .get("_entities")
            .and_then(|entities| entities.get(0))
            .filter(|entity| !entity.is_null())
            .cloned()
            .ok_or(Error::EntityNotFound)
    }

    /// Overlays the `base` headers with the global headers and then the call ones, and sets the
    /// `Cookie` header if there are any cookies.
    fn request_headers(&self, base: HeaderMap, call: &RequestOptions) -> Result<HeaderMap, Error> {
        let mut headers = base;
        overlay(&mut headers, &self.options.headers);
        overlay(&mut headers, &call.headers);
        if let Some(cookie) =
            cookie_header(&self.options.cookies, &call.cookies).map_err(http::Error::from)?
        {
            headers.insert(header::COOKIE, cookie);
        }
        Ok(headers)
    }

    async fn post<B, R>(&self, body: &B, options: &RequestOptions) -> Result<R, Error>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.ready().await?;

        let mut base = HeaderMap::new();
        base.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut request =
            http::Request::post(self.url()).body(Bytes::from(serde_json::to_vec(body)?))?;
        *request.headers_mut() = self.request_headers(base, options)?;

        let response = self.host.inject(request).await.map_err(Error::Host)?;
        let (parts, body) = response.into_parts();
        log::debug!("`{}` responded with `{}`", self.url(), parts.status);

        serde_json::from_slice(&body).map_err(|_| Error::InvalidResponse {
            status: parts.status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
