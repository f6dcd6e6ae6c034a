use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::error::Error;
use crate::net::{self, Egress};

const HTTPS_PORT: u16 = 443;

/// Outcome of probing one interface against every target host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// True as soon as any single host completed a handshake.
    pub successful: bool,
    /// One `"{host}: {error}"` entry per failed host, in probe order.
    pub failures: Vec<String>,
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, interface: &str, hosts: &[String]) -> ProbeResult;
}

/// Proves reachability with real TLS handshakes on port 443.
///
/// An interface counts as up when *any* host succeeds. This is a deliberate
/// optimistic policy: one unreachable target should not page anyone.
pub struct TlsProber {
    connector: TlsConnector,
    /// Upper bound for one host: connect plus TLS handshake.
    timeout: Duration,
    port: u16,
}

impl TlsProber {
    /// # Errors
    ///
    /// Fails if the TLS client configuration cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        Ok(Self::with_connector(net::tls_connector()?, timeout))
    }

    pub fn with_connector(connector: TlsConnector, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            port: HTTPS_PORT,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn handshake(&self, egress: &Egress, host: &str) -> Result<(), Error> {
        net::with_timeout(self.timeout, async {
            let tcp = egress.connect(host, self.port).await?;
            let server_name = ServerName::try_from(host.to_string())?;
            let mut tls = self.connector.connect(server_name, tcp).await?;
            // Best effort close_notify; the handshake already proved the path.
            let _ = tls.shutdown().await;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Prober for TlsProber {
    async fn probe(&self, interface: &str, hosts: &[String]) -> ProbeResult {
        let egress = Egress::Interface(interface.to_string());
        let mut result = ProbeResult::default();

        // No short-circuit: later hosts are still probed for diagnostics.
        for host in hosts {
            match self.handshake(&egress, host).await {
                Ok(()) => {
                    debug!("Connected to {host} via {interface}");
                    result.successful = true;
                }
                Err(e) => {
                    warn!("Failed to connect to {host} via {interface}: {e}");
                    result.failures.push(format!("{host}: {e}"));
                }
            }
        }

        info!(
            "{interface}: {} ({} of {} hosts failed)",
            if result.successful { "UP" } else { "DOWN" },
            result.failures.len(),
            hosts.len()
        );
        result
    }
}
