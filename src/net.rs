//! Outbound connection factory.
//!
//! Every component that talks to the network asks an [`Egress`] for its
//! sockets and HTTP clients, so the choice between the OS default route and
//! a specific interface lives in one place.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::{Client, ClientBuilder};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::error::Error;

/// Where outbound traffic leaves the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Egress {
    /// Whatever the routing table picks.
    #[default]
    DefaultRoute,
    /// Pinned to the named interface with `SO_BINDTODEVICE`.
    Interface(String),
}

impl Egress {
    pub fn bound_to(interface: Option<&str>) -> Self {
        interface.map_or(Egress::DefaultRoute, |name| {
            Egress::Interface(name.to_string())
        })
    }

    /// Opens a TCP connection to `host:port`.
    ///
    /// Name resolution always goes through the system resolver on the
    /// default route; only the TCP payload path is pinned. Each resolved
    /// address is tried in order until one accepts.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, Error> {
        let mut last_err = None;
        for addr in lookup_host((host, port)).await? {
            match self.connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("{host} ({addr}) via {self}: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
            .into())
    }

    async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        // The socket is closed on drop if binding or connecting fails.
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Egress::Interface(name) = self {
            bind_socket(&socket, name)?;
        }
        socket.connect(addr).await
    }

    /// Builds an HTTP client whose connections follow this egress.
    ///
    /// # Errors
    ///
    /// Fails when the client cannot be built or interface binding is not
    /// supported on this platform.
    pub fn http_client(&self, timeout: Duration) -> Result<Client, Error> {
        let builder = Client::builder().timeout(timeout);
        let builder = match self {
            Egress::DefaultRoute => builder,
            Egress::Interface(name) => bind_client(builder, name)?,
        };
        Ok(builder.build()?)
    }
}

impl std::fmt::Display for Egress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Egress::DefaultRoute => f.write_str("default route"),
            Egress::Interface(name) => f.write_str(name),
        }
    }
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_socket(socket: &TcpSocket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_socket(_socket: &TcpSocket, interface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot bind to {interface}: interface binding is not supported on this platform"),
    ))
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
#[allow(clippy::unnecessary_wraps)]
fn bind_client(builder: ClientBuilder, interface: &str) -> Result<ClientBuilder, Error> {
    Ok(builder.interface(interface))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_client(_builder: ClientBuilder, interface: &str) -> Result<ClientBuilder, Error> {
    Err(Error::Config(format!(
        "cannot bind HTTP client to {interface}: interface binding is not supported on this platform"
    )))
}

/// TLS connector validating against the bundled Mozilla root set.
///
/// # Errors
///
/// Fails only if the crypto provider rejects the default protocol versions.
pub fn tls_connector() -> Result<TlsConnector, Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    tls_connector_with(roots)
}

/// TLS connector trusting exactly `roots`.
///
/// # Errors
///
/// Fails only if the crypto provider rejects the default protocol versions.
pub fn tls_connector_with(roots: RootCertStore) -> Result<TlsConnector, Error> {
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Runs `fut` with an upper bound, mapping expiry to [`Error::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))?
}
