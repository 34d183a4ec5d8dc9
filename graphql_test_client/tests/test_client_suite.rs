use std::{borrow::Cow, io, net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response as AxumResponse,
    routing::post,
    Extension, Router,
};
use bytes::Bytes;
use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt as _,
};
use graphql_test_client::{
    AxumHost, BoxError, Cookies, Error, GraphQLRequest, Host, QueryOptions, RequestOptions,
    SetupError, SubscribeOptions, TestClient, TestClientOptions, Variables,
};
use graphql_ws_transport::{self as transport, ProtocolError};
use http::{header, HeaderMap, HeaderValue};
use juniper::{
    graphql_object, graphql_subscription, FieldError, FieldResult, GraphQLObject, InputValue,
    RootNode,
};
use juniper_axum::{extract::JuniperRequest, response::JuniperResponse, subscriptions};
use juniper_graphql_ws::ConnectionConfig;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[derive(Clone, Debug, Default)]
struct Context {
    headers: HeaderMap,
}

impl juniper::Context for Context {}

impl Context {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(Into::into)
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split("; "))
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .and_then(|(_, v)| urlencoding::decode(v).ok())
            .map(Cow::into_owned)
    }
}

struct Query;

#[graphql_object(context = Context)]
impl Query {
    fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    fn header(context: &Context, name: String) -> Option<String> {
        context.header(&name)
    }

    fn cookie(context: &Context, name: String) -> Option<String> {
        context.cookie(&name)
    }

    fn must_be_non_null() -> FieldResult<i32> {
        Err("Resolution failed".into())
    }
}

struct Mutation;

#[graphql_object(context = Context)]
impl Mutation {
    fn subtract(a: i32, b: i32) -> i32 {
        a - b
    }
}

#[derive(Clone, Debug, GraphQLObject)]
struct Notification {
    id: i32,
    message: String,
}

struct Subscription;

type NotificationStream = BoxStream<'static, Result<Notification, FieldError>>;

#[graphql_subscription(context = Context)]
impl Subscription {
    async fn notification_added(messages: Vec<String>) -> NotificationStream {
        stream::iter(messages)
            .enumerate()
            .map(|(n, message)| {
                Ok(Notification {
                    id: n as i32 + 1,
                    message,
                })
            })
            .boxed()
    }

    async fn must_be_non_null() -> BoxStream<'static, Result<i32, FieldError>> {
        stream::once(future::ready(Err(FieldError::from("Resolution failed")))).boxed()
    }
}

type Schema = RootNode<'static, Query, Mutation, Subscription>;

async fn graphql(
    Extension(schema): Extension<Arc<Schema>>,
    headers: HeaderMap,
    JuniperRequest(request): JuniperRequest,
) -> JuniperResponse {
    JuniperResponse(request.execute(&*schema, &Context { headers }).await)
}

async fn init(params: juniper::Variables) -> Result<ConnectionConfig<Context>, io::Error> {
    match params.get("token").and_then(InputValue::as_string_value) {
        None | Some("secret") => Ok(ConnectionConfig::new(Context::default())),
        Some(_) => Err(io::Error::other("Unauthorized")),
    }
}

fn app() -> Router {
    let schema = Schema::new(Query, Mutation, Subscription);

    Router::new()
        .route(
            "/graphql",
            post(graphql).get(subscriptions::graphql_ws::<Arc<Schema>>(init)),
        )
        .layer(Extension(Arc::new(schema)))
}

fn client() -> TestClient {
    TestClient::from_router(app())
}

fn variables(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, found: {other}"),
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn queries() {
    init_logger();
    let client = client();

    let resp = client
        .query("{ add(a: 1, b: 2) }", QueryOptions::new())
        .await
        .unwrap();

    assert_eq!(resp.data, json!({"add": 3}));
    assert!(resp.is_ok());
}

#[tokio::test]
async fn queries_with_variables() {
    let client = client();

    let resp = client
        .query(
            "query Add($a: Int!, $b: Int!) { add(a: $a, b: $b) } query Other { add(a: 0, b: 0) }",
            QueryOptions::new()
                .with_variables(variables(json!({"a": 2, "b": 5})))
                .with_operation_name("Add"),
        )
        .await
        .unwrap();

    assert_eq!(resp.data, json!({"add": 7}));
}

#[tokio::test]
async fn mutates() {
    let client = client();

    let resp = client
        .mutate("mutation { subtract(a: 5, b: 2) }", QueryOptions::new())
        .await
        .unwrap();

    assert_eq!(resp.data, json!({"subtract": 3}));
}

#[tokio::test]
async fn batches_queries() {
    let client = client();

    let resps = client
        .batch_queries(
            vec![
                GraphQLRequest::new("{ add(a: 1, b: 2) }"),
                GraphQLRequest::new("query Add($a: Int!) { add(a: $a, b: 10) }")
                    .with_variables(variables(json!({"a": 5})))
                    .with_operation_name("Add"),
                GraphQLRequest::new("{ three: add(a: 1, b: 2) four: add(a: 2, b: 2) }"),
            ],
            RequestOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        resps.into_iter().map(|r| r.data).collect::<Vec<_>>(),
        [
            json!({"add": 3}),
            json!({"add": 15}),
            json!({"three": 3, "four": 4}),
        ],
    );
}

#[tokio::test]
async fn call_headers_take_precedence() {
    let mut headers = HeaderMap::new();
    headers.insert("x-tag", HeaderValue::from_static("global"));
    headers.insert("x-global", HeaderValue::from_static("kept"));
    let client = TestClient::with_options(
        AxumHost::new(app()),
        TestClientOptions::default().with_headers(headers),
    );
    let query = r#"{
        tag: header(name: "x-tag")
        global: header(name: "x-global")
        contentType: header(name: "content-type")
    }"#;

    let resp = client.query(query, QueryOptions::new()).await.unwrap();
    assert_eq!(
        resp.data,
        json!({"tag": "global", "global": "kept", "contentType": "application/json"}),
    );

    let resp = client
        .query(
            query,
            QueryOptions::new().with_header(
                header::HeaderName::from_static("x-tag"),
                HeaderValue::from_static("call"),
            ),
        )
        .await
        .unwrap();
    assert_eq!(
        resp.data,
        json!({"tag": "call", "global": "kept", "contentType": "application/json"}),
    );
}

#[tokio::test]
async fn call_cookies_take_precedence() {
    let mut client = client();
    client.set_cookies(Cookies::from([
        ("session".into(), "global".into()),
        ("theme".into(), "dark mode".into()),
    ]));
    let query = r#"{
        session: cookie(name: "session")
        theme: cookie(name: "theme")
    }"#;

    let resp = client.query(query, QueryOptions::new()).await.unwrap();
    assert_eq!(resp.data, json!({"session": "global", "theme": "dark mode"}));

    let resp = client
        .query(query, QueryOptions::new().with_cookie("session", "call"))
        .await
        .unwrap();
    assert_eq!(resp.data, json!({"session": "call", "theme": "dark mode"}));

    client.set_cookies(Cookies::from([("session".into(), "renewed".into())]));
    let resp = client.query(query, QueryOptions::new()).await.unwrap();
    assert_eq!(resp.data, json!({"session": "renewed", "theme": null}));
}

#[tokio::test]
async fn replaces_global_headers() {
    let mut client = client();
    let query = r#"{ header(name: "authorization") }"#;

    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer first"));
    client.set_headers(headers);
    let resp = client.query(query, QueryOptions::new()).await.unwrap();
    assert_eq!(resp.data, json!({"header": "Bearer first"}));

    client.set_headers(HeaderMap::new());
    assert!(client.headers().is_empty());
    let resp = client.query(query, QueryOptions::new()).await.unwrap();
    assert_eq!(resp.data, json!({"header": null}));
}

#[tokio::test]
async fn reports_execution_errors_in_response() {
    let client = client();

    let resp = client
        .query("{ mustBeNonNull }", QueryOptions::new())
        .await
        .unwrap();

    assert!(resp.data.get("mustBeNonNull").is_none_or(Value::is_null));
    assert_eq!(resp.errors().len(), 1);
    assert_eq!(resp.errors()[0].message, "Resolution failed");
    assert_eq!(resp.errors()[0].path, [json!("mustBeNonNull")]);
}

#[tokio::test]
async fn fails_when_graphql_is_not_registered() {
    let client = TestClient::from_router(Router::new());

    let err = client
        .query("{ add(a: 1, b: 2) }", QueryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Setup(SetupError::NotRegistered)), "{err}");
    assert_eq!(
        err.to_string(),
        "GraphQL is not registered in the host instance!",
    );

    let err = client
        .subscribe(SubscribeOptions::new("subscription { mustBeNonNull }"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Setup(SetupError::NotRegistered)), "{err}");
    assert_eq!(client.host().local_addr(), None);
}

#[tokio::test]
async fn fails_when_served_on_another_url() {
    let client = TestClient::with_options(
        AxumHost::new(app()),
        TestClientOptions::default().with_url("/api"),
    );

    assert!(matches!(
        client.ready().await,
        Err(Error::Setup(SetupError::NotRegistered)),
    ));
}

struct FailingHost {
    ready: bool,
}

#[async_trait]
impl Host for FailingHost {
    async fn ready(&self) -> Result<(), BoxError> {
        if self.ready {
            Ok(())
        } else {
            Err("plugin failed to load".into())
        }
    }

    async fn inject(&self, _: http::Request<Bytes>) -> Result<http::Response<Bytes>, BoxError> {
        Err("connection reset".into())
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    async fn listen(&self) -> Result<std::net::SocketAddr, BoxError> {
        Err("cannot listen".into())
    }
}

#[tokio::test]
async fn fails_when_host_fails() {
    let client = TestClient::new(FailingHost { ready: false });
    for _ in 0..2 {
        assert_eq!(
            client.ready().await.unwrap_err().to_string(),
            "Host failed to get ready: plugin failed to load",
        );
    }

    let client = TestClient::new(FailingHost { ready: true });
    assert!(matches!(
        client.query("{ add(a: 1, b: 2) }", QueryOptions::new()).await,
        Err(Error::Setup(SetupError::InvalidHost(msg))) if msg == "connection reset",
    ));
}

#[tokio::test]
async fn subscribes() {
    init_logger();
    let client = client();

    let mut subscription = client
        .subscribe(
            SubscribeOptions::new(
                "subscription ($messages: [String!]!) { \
                   notificationAdded(messages: $messages) { id message } \
                 }",
            )
            .with_variables(variables(json!({"messages": ["first", "second"]}))),
        )
        .await
        .unwrap();
    assert!(client.host().local_addr().is_some());

    assert_eq!(
        subscription.next().await.unwrap().data,
        json!({"notificationAdded": {"id": 1, "message": "first"}}),
    );
    assert_eq!(
        subscription.next().await.unwrap().data,
        json!({"notificationAdded": {"id": 2, "message": "second"}}),
    );
    assert_eq!(subscription.next().await, None);

    subscription.unsubscribe().await;
    client.host().close();
}

#[tokio::test]
async fn subscribes_with_operation_name() {
    let client = client();

    let mut subscription = client
        .subscribe(
            SubscribeOptions::new(
                r#"subscription Other { mustBeNonNull }
                   subscription Notifications { notificationAdded(messages: ["hi"]) { message } }"#,
            )
            .with_operation_name("Notifications"),
        )
        .await
        .unwrap();

    assert_eq!(
        subscription.next().await.unwrap().data,
        json!({"notificationAdded": {"message": "hi"}}),
    );

    subscription.unsubscribe().await;
    client.host().close();
}

#[tokio::test]
async fn reuses_listening_host() {
    let client = client();
    let addr = client
        .host()
        .listen_on((Ipv4Addr::LOCALHOST, 0).into())
        .await
        .unwrap();

    let subscription = client
        .subscribe(SubscribeOptions::new(
            r#"subscription { notificationAdded(messages: []) { id } }"#,
        ))
        .await
        .unwrap();

    assert_eq!(client.host().local_addr(), Some(addr));
    assert_eq!(client.host().listen().await.unwrap(), addr);

    subscription.unsubscribe().await;
    client.host().close();
}

#[tokio::test]
async fn delivers_subscription_errors() {
    let client = client();

    let mut subscription = client
        .subscribe(SubscribeOptions::new("subscription { mustBeNonNull }"))
        .await
        .unwrap();

    let resp = subscription.next().await.unwrap();
    assert!(resp.data.get("mustBeNonNull").is_none_or(Value::is_null));
    assert!(!resp.is_ok());
    assert_eq!(resp.errors()[0].message, "Resolution failed");

    subscription.unsubscribe().await;
    client.host().close();
}

#[tokio::test]
async fn sends_init_payload() {
    let client = client();

    let subscription = client
        .subscribe(
            SubscribeOptions::new(r#"subscription { notificationAdded(messages: ["a"]) { id } }"#)
                .with_init_payload(json!({"token": "secret"})),
        )
        .await
        .unwrap();
    subscription.unsubscribe().await;

    let err = client
        .subscribe(
            SubscribeOptions::new(r#"subscription { notificationAdded(messages: ["a"]) { id } }"#)
                .with_init_payload(json!({"token": "forged"})),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(
            &err,
            Error::ConnectionRejected(payload) if *payload == json!({"message": "Unauthorized"}),
        ),
        "{err}",
    );

    client.host().close();
}

async fn unknown_frame(ws: WebSocketUpgrade) -> AxumResponse {
    ws.protocols(["graphql-ws"]).on_upgrade(send_unknown_frame)
}

/// Answers `connection_init` with a frame of an unknown type.
async fn send_unknown_frame(mut socket: WebSocket) {
    if let Some(Ok(_)) = socket.recv().await {
        _ = socket
            .send(Message::Text(r#"{"type":"greeting"}"#.into()))
            .await;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

#[tokio::test]
async fn fails_on_protocol_error() {
    init_logger();
    let schema = Schema::new(Query, Mutation, Subscription);
    let client = TestClient::from_router(
        Router::new()
            .route("/graphql", post(graphql).get(unknown_frame))
            .layer(Extension(Arc::new(schema))),
    );

    let err = client
        .subscribe(SubscribeOptions::new(
            r#"subscription { notificationAdded(messages: ["a"]) { id } }"#,
        ))
        .await
        .unwrap_err();
    assert!(
        matches!(
            &err,
            Error::Transport(transport::Error::Protocol(ProtocolError::InvalidMessageType(ty)))
                if ty == "greeting",
        ),
        "{err}",
    );

    client.host().close();
}
