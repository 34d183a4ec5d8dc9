use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt as _};
use graphql_ws_transport::{self as transport, Response, SubscriptionClient};

/// [`Stream`] of the responses of a subscription started by [`TestClient::subscribe()`].
///
/// Owns its own WebSocket connection, which is closed on [`Subscription::unsubscribe()`] or
/// once dropped.
///
/// [`TestClient::subscribe()`]: crate::TestClient::subscribe
#[derive(Debug)]
pub struct Subscription {
    client: SubscriptionClient,
    inner: transport::Subscription,
}

impl Subscription {
    pub(crate) fn new(client: SubscriptionClient, inner: transport::Subscription) -> Self {
        Self { client, inner }
    }

    /// Returns the [`SubscriptionClient`] driving the connection of this [`Subscription`].
    pub fn client(&self) -> &SubscriptionClient {
        &self.client
    }

    /// Returns the id of the underlying operation.
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Stops the operation and closes the connection.
    ///
    /// Resolves once the connection is closed.
    pub async fn unsubscribe(self) {
        self.client.close();
        self.client.closed().await;
    }
}

impl Stream for Subscription {
    type Item = Response;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
