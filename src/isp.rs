//! ISP verification: public IP over a pinned interface, then WHOIS.
//!
//! Every step that cannot complete resolves to "verified". Only a WHOIS
//! organization that provably does not contain the expected name fails.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::config::WhoisConfig;
use crate::error::Error;
use crate::net::{self, Egress};

const WHOIS_PORT: u16 = 43;

/// Registry field names carrying the organization (ARIN, RIPE, generic).
const ORG_FIELDS: [&str; 3] = ["orgname", "org-name", "organization"];

#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &Url, egress: &Egress, timeout: Duration) -> Result<String, Error>;
}

#[async_trait]
pub trait Whois: Send + Sync {
    async fn whois(&self, ip: &str, timeout: Duration) -> Result<String, Error>;
}

/// Plain GET through `reqwest`, bound to the requested egress.
pub struct HttpFetcher;

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &Url, egress: &Egress, timeout: Duration) -> Result<String, Error> {
        let client = egress.http_client(timeout)?;
        let response = client.get(url.clone()).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// WHOIS over TCP, following one referral hop (IANA `refer:` or ARIN
/// `ReferralServer: whois://`).
pub struct WhoisClient {
    server: String,
    port: u16,
}

impl WhoisClient {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: WHOIS_PORT,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn query(server: &str, port: u16, ip: &str) -> Result<String, Error> {
        let mut stream = TcpStream::connect((server, port)).await?;
        stream.write_all(format!("{ip}\r\n").as_bytes()).await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

#[async_trait]
impl Whois for WhoisClient {
    async fn whois(&self, ip: &str, timeout: Duration) -> Result<String, Error> {
        net::with_timeout(timeout, async {
            let response = Self::query(&self.server, self.port, ip).await?;
            match referral(&response) {
                Some(next) if !next.is(&self.server, self.port) => {
                    debug!("WHOIS for {ip} referred to {}:{}", next.host, next.port);
                    Self::query(next.host, next.port, ip).await
                }
                _ => Ok(response),
            }
        })
        .await
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Referral<'a> {
    host: &'a str,
    port: u16,
}

impl Referral<'_> {
    fn is(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}

fn referral(response: &str) -> Option<Referral<'_>> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("refer") {
            (!value.is_empty()).then_some(Referral {
                host: value,
                port: WHOIS_PORT,
            })
        } else if key.eq_ignore_ascii_case("referralserver") {
            whois_url(value)
        } else {
            None
        }
    })
}

/// `whois://host[:port][/]`. Other schemes (rwhois) speak a different protocol.
fn whois_url(value: &str) -> Option<Referral<'_>> {
    let scheme = value.get(..8)?;
    if !scheme.eq_ignore_ascii_case("whois://") {
        return None;
    }
    let authority = value[8..].trim_end_matches('/');
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, WHOIS_PORT),
    };
    (!host.is_empty()).then_some(Referral { host, port })
}

/// Organization from the first recognised, non-empty registry field.
pub fn extract_org(whois: &str) -> Option<String> {
    // Blank values are skipped: an empty field does not count as the first match.
    whois.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim().to_ascii_lowercase().replace(' ', "");
        let value = value.trim();
        (ORG_FIELDS.contains(&key.as_str()) && !value.is_empty()).then(|| value.to_string())
    })
}

/// Case-insensitive substring test: `expected` must appear inside `actual`.
pub fn org_matches(expected: &str, actual: &str) -> bool {
    actual.to_uppercase().contains(&expected.to_uppercase())
}

/// Public IP and WHOIS organization seen from one egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IspLookup {
    pub ip: String,
    pub org: String,
}

pub struct IspVerifier {
    fetcher: Box<dyn Fetch>,
    whois: Box<dyn Whois>,
    lookup_url: Url,
    lookup_timeout: Duration,
    query_timeout: Duration,
}

impl IspVerifier {
    pub fn new(fetcher: Box<dyn Fetch>, whois: Box<dyn Whois>, config: &WhoisConfig) -> Self {
        Self {
            fetcher,
            whois,
            lookup_url: config.ip_lookup_url.clone(),
            lookup_timeout: config.lookup_timeout,
            query_timeout: config.query_timeout,
        }
    }

    pub fn from_config(config: &WhoisConfig) -> Self {
        Self::new(
            Box::new(HttpFetcher),
            Box::new(WhoisClient::new(config.server.clone())),
            config,
        )
    }

    pub fn lookup_url(&self) -> &Url {
        &self.lookup_url
    }

    /// Resolves the public IP and organization, failing on any step.
    ///
    /// # Errors
    ///
    /// Returns the first lookup error, or [`Error::Whois`] when the lookup
    /// yields no IP or no organization field.
    pub async fn lookup(&self, egress: &Egress) -> Result<IspLookup, Error> {
        let body = self
            .fetcher
            .fetch(&self.lookup_url, egress, self.lookup_timeout)
            .await?;
        let ip = body.trim();
        if ip.is_empty() {
            return Err(Error::Whois(format!(
                "{} returned an empty body",
                self.lookup_url
            )));
        }

        let response = self.whois.whois(ip, self.query_timeout).await?;
        let org = extract_org(&response)
            .ok_or_else(|| Error::Whois(format!("no organization field for {ip}")))?;

        Ok(IspLookup {
            ip: ip.to_string(),
            org,
        })
    }

    /// Fail-open check that `interface` routes through `expected_org`.
    pub async fn verify(&self, interface: &str, expected_org: &str) -> bool {
        let egress = Egress::Interface(interface.to_string());
        match self.lookup(&egress).await {
            Ok(IspLookup { ip, org }) => {
                let matched = org_matches(expected_org, &org);
                if matched {
                    info!("{interface}: ISP verified as {org} ({ip})");
                } else {
                    warn!("{interface}: ISP mismatch, expected '{expected_org}', got '{org}' ({ip})");
                }
                matched
            }
            Err(e) => {
                debug!("{interface}: skipping ISP verification: {e}");
                true
            }
        }
    }
}
