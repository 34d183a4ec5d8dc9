//! Client side of the [legacy `graphql-ws` GraphQL over WebSocket Protocol][old].
//!
//! A single task owns the socket and every operation multiplexed over it. Handles talk to it over
//! a channel, so all the state transitions are serialized without locking.
//!
//! [old]: https://github.com/apollographql/subscriptions-transport-ws/blob/v0.11.0/PROTOCOL.md

use std::{
    future::Future,
    ops::ControlFlow,
    pin::{pin, Pin},
    task::{ready, Context, Poll},
    time::Duration,
};

use futures::{
    channel::{mpsc, oneshot},
    SinkExt as _, Stream, StreamExt as _,
};
use http::{header, HeaderValue, Uri};
use serde_json::Value;
use tokio::{net::TcpStream, sync::watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest as _, handshake::client::Request, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    client_message::{ClientMessage, Extension, StartPayload, Variables},
    protocol::GRAPHQL_WS,
    registry::{Payload, Publication, Publisher, Registration, Registry, Release, SubscriberId},
    response::{Response, ResponseError},
    server_message::{ProtocolError, ServerMessage},
    ClientConfig, Error,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

type Reply = oneshot::Sender<Result<Registration, Error>>;

/// Delay before the reconnection attempt following `attempt` failed ones.
///
/// Doubles from 100 milliseconds on every attempt, and never exceeds 10 seconds.
pub fn reconnect_delay(attempt: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(10);

    (BASE * (1 << attempt.min(7))).min(MAX)
}

/// Lifecycle phase of a [`SubscriptionClient`]'s connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// The socket is being opened and the init payload is being resolved.
    Connecting,
    /// `connection_init` was sent, waiting for `connection_ack`.
    AwaitingAck,
    /// The server acknowledged the connection. Operations are started right away.
    Ready,
    /// The connection was lost, waiting before the next attempt.
    Reconnecting,
    /// Terminal state.
    Closed,
}

/// Operation to subscribe to.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionRequest {
    payload: StartPayload,
    extensions: Option<Vec<Extension>>,
}

impl SubscriptionRequest {
    /// Creates a new [`SubscriptionRequest`] for the given document, without variables.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            payload: StartPayload {
                query: query.into(),
                variables: Variables::new(),
                operation_name: None,
            },
            extensions: None,
        }
    }

    /// Specifies the variables of the operation.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.payload.variables = variables;
        self
    }

    /// Specifies which operation of the document to execute.
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.payload.operation_name = Some(name.into());
        self
    }

    /// Attaches an operation-scoped init payload, sent as a `connectionInit` extension of the
    /// `start` message.
    pub fn connection_init(mut self, payload: Value) -> Self {
        self.extensions
            .get_or_insert_with(Vec::new)
            .push(Extension::ConnectionInit { payload });
        self
    }

    /// Returns the payload of the `start` message of this request.
    pub fn payload(&self) -> &StartPayload {
        &self.payload
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Subscribe {
        request: SubscriptionRequest,
        publisher: Publisher,
        reply: Reply,
    },
    Unsubscribe {
        operation_id: String,
        subscriber_id: SubscriberId,
        force: bool,
    },
    Close,
}

/// Client of a `graphql-ws` server, multiplexing any number of operations over a single
/// WebSocket connection.
///
/// The connection is driven by a background task, spawned on [`SubscriptionClient::connect()`],
/// which stops once the client is [closed](SubscriptionClient::close) or every handle to it
/// (including [`Subscription`]s) is dropped.
#[derive(Debug)]
pub struct SubscriptionClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SubscriptionClient {
    /// Starts connecting to the provided `uri`.
    ///
    /// Returns as soon as the handshake request is validated: operations subscribed before the
    /// server acknowledges the connection are started once it does.
    ///
    /// # Errors
    ///
    /// If the `uri` or the configured subprotocols are not valid for a handshake request.
    ///
    /// # Panics
    ///
    /// If called outside a [`tokio`] runtime.
    pub fn connect(uri: &str, config: ClientConfig) -> Result<Self, Error> {
        let uri = uri
            .parse::<Uri>()
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        let protocols = std::iter::once(GRAPHQL_WS)
            .chain(config.protocols.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ");
        let protocols = HeaderValue::from_str(&protocols)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        // Fails early on anything `tungstenite` won't connect to.
        handshake_request(&uri, &config, &protocols)?;

        let (commands_tx, commands_rx) = mpsc::unbounded();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let actor = Actor {
            uri,
            protocols,
            registry: Registry::new(config.service_name.clone()),
            config,
            commands: commands_rx,
            state: state_tx,
            socket: None,
            attempts: 0,
            pending: vec![],
            fatal: None,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
        })
    }

    /// Registers the `publisher` as a subscriber of the operation described by the `request`.
    ///
    /// An operation identical to an already registered one (same document, variables and
    /// operation name) reuses it instead of being started again. Otherwise, resolves once the
    /// `start` message has been sent.
    ///
    /// # Errors
    ///
    /// If the client is closed before the operation could be started.
    pub async fn create_subscription(
        &self,
        request: SubscriptionRequest,
        publisher: Publisher,
    ) -> Result<Registration, Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .unbounded_send(Command::Subscribe {
                request,
                publisher,
                reply,
            })
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Subscribes to the operation described by the `request`, returning the [`Stream`] of its
    /// responses.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionClient::create_subscription()`].
    pub async fn subscribe(&self, request: SubscriptionRequest) -> Result<Subscription, Error> {
        let (publisher, publications) = mpsc::unbounded();
        let registration = self.create_subscription(request, publisher).await?;
        Ok(Subscription {
            registration,
            commands: self.commands.clone(),
            publications,
            terminated: false,
            released: false,
        })
    }

    /// Detaches the subscriber of the `registration` from its operation, stopping the operation
    /// once no subscriber is left, or right away if `force`d.
    pub fn unsubscribe(&self, registration: &Registration, force: bool) {
        _ = self.commands.unbounded_send(Command::Unsubscribe {
            operation_id: registration.operation_id.clone(),
            subscriber_id: registration.subscriber_id,
            force,
        });
    }

    /// Stops every operation and closes the connection. Reconnection is never attempted
    /// afterwards.
    pub fn close(&self) {
        _ = self.commands.unbounded_send(Command::Close);
    }

    /// Returns the current [`ConnectionState`].
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the client reaches the [`ConnectionState::Closed`] state.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

/// [`Stream`] of the responses of a subscribed operation.
///
/// Ends once the operation completes or fails, or the client is closed. Dropping it
/// unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    registration: Registration,
    commands: mpsc::UnboundedSender<Command>,
    publications: mpsc::UnboundedReceiver<Publication>,
    terminated: bool,
    released: bool,
}

impl Subscription {
    /// Returns the id of the operation this [`Subscription`] is attached to.
    pub fn id(&self) -> &str {
        &self.registration.operation_id
    }

    /// Returns the topic of the operation this [`Subscription`] is attached to.
    pub fn topic(&self) -> &str {
        &self.registration.topic
    }

    /// Returns the [`Registration`] backing this [`Subscription`].
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Unsubscribes, stopping the operation if no other subscriber is left.
    pub fn unsubscribe(mut self) {
        self.release(false);
    }

    /// Unsubscribes, stopping the operation even if other subscribers are left.
    pub fn force_unsubscribe(mut self) {
        self.release(true);
    }

    fn release(&mut self, force: bool) {
        if !self.released {
            self.released = true;
            _ = self.commands.unbounded_send(Command::Unsubscribe {
                operation_id: self.registration.operation_id.clone(),
                subscriber_id: self.registration.subscriber_id,
                force,
            });
        }
    }
}

impl Stream for Subscription {
    type Item = Response;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match ready!(self.publications.poll_next_unpin(cx)) {
            Some(Publication {
                payload: Payload::Data(resp),
                ..
            }) => Poll::Ready(Some(resp)),
            Some(Publication {
                payload: Payload::Terminated,
                ..
            })
            | None => {
                self.terminated = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release(false);
    }
}

/// Reason of leaving the [`ConnectionState::AwaitingAck`] or [`ConnectionState::Ready`] state.
enum Disconnect {
    /// [`SubscriptionClient::close()`] was called, or every handle was dropped.
    ClosedByUser,
    /// The socket was closed or failed.
    Lost,
    /// The server sent a `connection_error` message.
    Rejected(Value),
    /// The server violated the protocol.
    Fatal(ProtocolError),
}

enum Event {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(Option<Command>),
}

struct Actor {
    uri: Uri,
    protocols: HeaderValue,
    config: ClientConfig,
    registry: Registry,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    socket: Option<Socket>,
    attempts: u32,
    pending: Vec<(Registration, Reply)>,
    fatal: Option<ProtocolError>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let outcome = match self.current() {
                ConnectionState::Connecting => self.connect().await,
                ConnectionState::AwaitingAck | ConnectionState::Ready => Err(self.serve().await),
                ConnectionState::Reconnecting => self.backoff().await,
                ConnectionState::Closed => break,
            };
            if let Err(disconnect) = outcome {
                self.disconnect(disconnect).await;
            }
        }
        log::debug!("subscription client for `{}` stopped", self.uri);
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to the `next` state, performing its entry actions.
    async fn transition(&mut self, mut next: ConnectionState) {
        if next == ConnectionState::Reconnecting
            && self
                .config
                .max_reconnect_attempts
                .is_some_and(|max| self.attempts > max)
        {
            log::warn!(
                "giving up reconnecting to `{}` after {} attempts",
                self.uri,
                self.attempts,
            );
            if let Some(f) = self.config.on_reconnect_failed.as_mut() {
                f();
            }
            next = ConnectionState::Closed;
        }

        log::debug!("connection to `{}`: {:?} -> {next:?}", self.uri, self.current());
        self.state.send_replace(next);

        match next {
            ConnectionState::Connecting | ConnectionState::AwaitingAck => {}
            ConnectionState::Ready => {
                self.attempts = 0;
                for id in self.registry.unstarted() {
                    // A failed write drops the socket, which is noticed by `serve()`.
                    if self.start_operation(&id).await.is_err() {
                        break;
                    }
                }
                let (started, pending) = std::mem::take(&mut self.pending)
                    .into_iter()
                    .partition::<Vec<_>, _>(|(reg, _)| {
                        !self.registry.contains(&reg.operation_id)
                            || self.registry.is_started(&reg.operation_id)
                    });
                self.pending = pending;
                for (reg, reply) in started {
                    _ = reply.send(Ok(reg));
                }
                if let Some(f) = self.config.on_connected.as_mut() {
                    f();
                }
            }
            ConnectionState::Reconnecting => {
                self.socket = None;
                self.registry.reset();
            }
            ConnectionState::Closed => {
                if let Some(mut socket) = self.socket.take() {
                    _ = socket.close(None).await;
                }
                if !self.registry.is_empty() {
                    log::debug!("terminating {} operations", self.registry.len());
                    self.registry.clear();
                }
                for (_, reply) in self.pending.drain(..) {
                    _ = reply.send(Err(self
                        .fatal
                        .clone()
                        .map_or(Error::Closed, Error::Protocol)));
                }
            }
        }
    }

    /// Handles the `disconnect`, honoring the reconnection policy.
    async fn disconnect(&mut self, disconnect: Disconnect) {
        match disconnect {
            Disconnect::ClosedByUser => {
                log::debug!(
                    "closing connection to `{}`, stopping {} operations",
                    self.uri,
                    self.registry.len(),
                );
                for id in self.registry.ids() {
                    if let Release::Stop { started: true } = self.registry.force_release(&id) {
                        if self.send(&ClientMessage::Stop { id }).await.is_err() {
                            break;
                        }
                    }
                }
                self.transition(ConnectionState::Closed).await;
            }
            Disconnect::Lost => self.lose().await,
            Disconnect::Rejected(payload) => {
                log::warn!("connection to `{}` rejected: {payload}", self.uri);
                self.lose().await;
                if let Some(f) = self.config.on_connection_failed.as_mut() {
                    f(payload).await;
                }
            }
            Disconnect::Fatal(e) => {
                log::error!("closing connection to `{}`: {e}", self.uri);
                self.fatal = Some(e);
                self.transition(ConnectionState::Closed).await;
            }
        }
    }

    async fn lose(&mut self) {
        let next = if self.config.reconnect {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Closed
        };
        self.transition(next).await;
    }

    /// Opens the socket and initializes the connection.
    async fn connect(&mut self) -> Result<(), Disconnect> {
        let request = handshake_request(&self.uri, &self.config, &self.protocols).map_err(|e| {
            log::warn!("failed to connect to `{}`: {e}", self.uri);
            Disconnect::Lost
        })?;
        let init = self.config.init_payload.resolve();

        let connecting = async move {
            let (mut socket, _) = connect_async(request).await?;
            match init.await {
                Ok(payload) => Ok::<_, Error>((socket, payload)),
                Err(e) => {
                    _ = socket.close(None).await;
                    Err(e)
                }
            }
        };

        match self.drive(connecting).await {
            None => Err(Disconnect::ClosedByUser),
            Some(Err(e)) => {
                log::warn!("failed to connect to `{}`: {e}", self.uri);
                Err(Disconnect::Lost)
            }
            Some(Ok((socket, payload))) => {
                self.socket = Some(socket);
                _ = self.send(&ClientMessage::ConnectionInit { payload }).await;
                self.transition(ConnectionState::AwaitingAck).await;
                Ok(())
            }
        }
    }

    /// Waits before the next connection attempt.
    async fn backoff(&mut self) -> Result<(), Disconnect> {
        let delay = reconnect_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        log::debug!(
            "reconnecting to `{}` in {delay:?}, attempt {}",
            self.uri,
            self.attempts,
        );

        match self.drive(tokio::time::sleep(delay)).await {
            Some(()) => {
                self.transition(ConnectionState::Connecting).await;
                Ok(())
            }
            None => Err(Disconnect::ClosedByUser),
        }
    }

    /// Processes frames and commands until the connection ends.
    async fn serve(&mut self) -> Disconnect {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return Disconnect::Lost;
            };
            let event = tokio::select! {
                frame = socket.next() => Event::Frame(frame),
                cmd = self.commands.next() => Event::Command(cmd),
            };

            match event {
                Event::Frame(Some(Ok(Message::Text(text)))) => {
                    if let Err(disconnect) = self.dispatch(text.as_str()).await {
                        return disconnect;
                    }
                }
                Event::Frame(Some(Ok(Message::Close(frame)))) => {
                    log::debug!("connection to `{}` closed by server: {frame:?}", self.uri);
                    return Disconnect::Lost;
                }
                // Pings are answered by `tungstenite` itself.
                Event::Frame(Some(Ok(_))) => {}
                Event::Frame(Some(Err(e))) => {
                    log::warn!("connection to `{}` failed: {e}", self.uri);
                    return Disconnect::Lost;
                }
                Event::Frame(None) => return Disconnect::Lost,
                Event::Command(Some(cmd)) => {
                    if self.handle_command(cmd).await.is_break() {
                        return Disconnect::ClosedByUser;
                    }
                }
                Event::Command(None) => return Disconnect::ClosedByUser,
            }
        }
    }

    /// Polls the `fut` to completion, handling commands meanwhile.
    ///
    /// Returns [`None`] if the client was closed before the `fut` completed.
    async fn drive<T>(&mut self, fut: impl Future<Output = T>) -> Option<T> {
        let mut fut = pin!(fut);
        loop {
            let cmd = tokio::select! {
                out = &mut fut => return Some(out),
                cmd = self.commands.next() => cmd,
            };
            match cmd {
                Some(cmd) => {
                    if self.handle_command(cmd).await.is_break() {
                        return None;
                    }
                }
                None => return None,
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Subscribe {
                request,
                publisher,
                reply,
            } => {
                let reg = self
                    .registry
                    .register(request.payload, request.extensions, publisher);
                log::debug!(
                    "subscriber {} registered on operation {}, {} subscribers",
                    reg.subscriber_id,
                    reg.operation_id,
                    self.registry.ref_count(&reg.operation_id),
                );
                if reg.reused {
                    _ = reply.send(Ok(reg));
                } else if self.start_operation(&reg.operation_id).await.is_ok() {
                    _ = reply.send(Ok(reg));
                } else {
                    self.pending.push((reg, reply));
                }
            }
            Command::Unsubscribe {
                operation_id,
                subscriber_id,
                force,
            } => match self.registry.release(&operation_id, subscriber_id, force) {
                Release::Stop { started } => {
                    log::debug!("operation {operation_id} released");
                    if started && self.socket.is_some() {
                        _ = self.send(&ClientMessage::Stop { id: operation_id }).await;
                    }
                }
                Release::Retained(count) => {
                    log::debug!("operation {operation_id} still has {count} subscribers");
                }
                Release::Unknown => {}
            },
            Command::Close => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Sends the `start` message of the operation, unless it's started already.
    async fn start_operation(&mut self, id: &str) -> Result<(), Error> {
        if self.current() != ConnectionState::Ready {
            return Err(Error::NotReady);
        }
        match self.registry.mark_started(id) {
            Some(msg) => self.send(&msg).await,
            None => Ok(()),
        }
    }

    async fn dispatch(&mut self, text: &str) -> Result<(), Disconnect> {
        let msg = text.parse::<ServerMessage>().map_err(Disconnect::Fatal)?;
        log::debug!("received `{}` message", msg.message_type());

        match msg {
            ServerMessage::ConnectionAck => {
                if self.current() == ConnectionState::AwaitingAck {
                    self.transition(ConnectionState::Ready).await;
                }
            }
            ServerMessage::ConnectionKeepAlive => {}
            ServerMessage::ConnectionError { payload } => return Err(Disconnect::Rejected(payload)),
            ServerMessage::Data { id, payload } => {
                if let Some(id) = id {
                    self.registry
                        .publish(&id, Payload::Data(Response::from_payload(payload)));
                }
            }
            ServerMessage::Error { id, payload } => {
                if let Some(id) = id {
                    let errors = ResponseError::from_payload(payload.clone());
                    self.registry
                        .publish(&id, Payload::Data(Response::failed(errors)));
                    self.registry.publish(&id, Payload::Terminated);
                    self.registry.remove(&id);
                    _ = self.send(&ClientMessage::Error { id, payload }).await;
                }
            }
            ServerMessage::Complete { id } => {
                if let Some(id) = id {
                    self.registry.publish(&id, Payload::Terminated);
                    self.registry.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Writes the `msg` to the socket, dropping the socket if that fails.
    async fn send(&mut self, msg: &ClientMessage) -> Result<(), Error> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(Error::Closed);
        };
        let text = msg.to_text()?;
        log::debug!("sending `{}` message", msg.message_type());

        if let Err(e) = socket.send(Message::text(text)).await {
            log::warn!("failed to send `{}` message: {e}", msg.message_type());
            self.socket = None;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Builds the WebSocket handshake request offering the `graphql-ws` subprotocol.
fn handshake_request(
    uri: &Uri,
    config: &ClientConfig,
    protocols: &HeaderValue,
) -> Result<Request, Error> {
    let mut request = uri.clone().into_client_request()?;
    let headers = request.headers_mut();
    for name in config.headers.keys() {
        headers.remove(name);
    }
    for (name, value) in &config.headers {
        headers.append(name, value.clone());
    }
    headers.insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    Ok(request)
}
