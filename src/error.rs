use std::time::Duration;

use thiserror::Error;
use tokio_rustls::rustls;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment file error: {0}")]
    EnvFile(#[from] dotenvy::Error),
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid TLS server name: {0}")]
    ServerName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("mail message error: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("--{channel} requires missing settings: {}", .missing.join(", "))]
    MissingSettings {
        channel: &'static str,
        missing: Vec<&'static str>,
    },
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("chat API rejected the message: {0}")]
    ChatApi(String),
    #[error("WHOIS error: {0}")]
    Whois(String),
    #[error("corrupt state file: {0}")]
    StateCorruption(String),
}
