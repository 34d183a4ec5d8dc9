use std::{
    convert::Infallible,
    net::{Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    Router,
};
use bytes::Bytes;
use tokio::{
    net::TcpListener,
    sync::{watch, OnceCell},
};
use tower::ServiceExt as _;

use crate::host::{BoxError, Host};

/// [`Host`] serving an [`axum::Router`].
///
/// Requests are injected into the [`Router`] directly. Once asked to [listen](Host::listen), it
/// is served on a spawned task until [closed](AxumHost::close) or dropped.
#[derive(Debug)]
pub struct AxumHost {
    router: Router,
    addr: OnceCell<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl AxumHost {
    /// Wraps the provided [`Router`].
    pub fn new(router: Router) -> Self {
        Self {
            router,
            addr: OnceCell::new(),
            shutdown: watch::channel(false).0,
        }
    }

    /// Returns the wrapped [`Router`].
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Makes the [`Router`] listen on the provided `addr`, returning the bound one.
    ///
    /// Listens only once: subsequent calls return the address bound by the first one.
    ///
    /// # Errors
    ///
    /// If binding fails.
    pub async fn listen_on(&self, addr: SocketAddr) -> Result<SocketAddr, BoxError> {
        self.addr.get_or_try_init(|| self.serve(addr)).await.copied()
    }

    /// Stops listening, letting in-flight connections finish.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr, BoxError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        log::debug!("Listening on {addr}");

        let router = self.router.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let serving = axum::serve(listener, router).with_graceful_shutdown(async move {
                _ = shutdown.wait_for(|closed| *closed).await;
            });
            if let Err(e) = serving.await {
                log::error!("Serving on {addr} failed: {e}");
            }
        });

        Ok(addr)
    }
}

#[async_trait]
impl Host for AxumHost {
    async fn inject(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, BoxError> {
        let response = self
            .router
            .clone()
            .oneshot(request.map(Body::from))
            .await
            .unwrap_or_else(|e: Infallible| match e {});

        let (parts, body) = response.into_parts();
        let body = body::to_bytes(body, usize::MAX).await?;
        Ok(http::Response::from_parts(parts, body))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr.get().copied()
    }

    async fn listen(&self) -> Result<SocketAddr, BoxError> {
        self.listen_on((Ipv4Addr::LOCALHOST, 0).into()).await
    }
}

impl From<Router> for AxumHost {
    fn from(router: Router) -> Self {
        Self::new(router)
    }
}
