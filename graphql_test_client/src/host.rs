//! Seam between a [`TestClient`] and the web framework serving the GraphQL endpoint.
//!
//! [`TestClient`]: crate::TestClient

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

/// Type-erased error of a [`Host`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Web framework instance hosting a GraphQL endpoint.
#[async_trait]
pub trait Host: Send + Sync {
    /// Resolves once the host is able to serve requests.
    ///
    /// Ready right away by default.
    ///
    /// # Errors
    ///
    /// If the host failed to initialize.
    async fn ready(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Dispatches the `request` to the host in-process, without any socket involved.
    ///
    /// # Errors
    ///
    /// If the host is unable to process the `request` at all. Error responses are returned as
    /// [`Ok`].
    async fn inject(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, BoxError>;

    /// Returns the address the host is listening on, if it is.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Makes the host listen on an ephemeral loopback port, returning the bound address.
    ///
    /// Returns the already bound address if the host listens already.
    ///
    /// # Errors
    ///
    /// If binding fails.
    async fn listen(&self) -> Result<SocketAddr, BoxError>;
}
