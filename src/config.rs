use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use lettre::message::Mailbox;
use serde::Deserialize;
use url::Url;

use crate::error::Error;

const APP_DIR: &str = "linkwatch";
const DEFAULT_TARGETS: [&str; 2] = ["one.one.one.one", "google.com"];
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_IP_LOOKUP_URL: &str = "https://api.ipify.org";
const DEFAULT_WHOIS_SERVER: &str = "whois.iana.org";
const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SMTP_PORT: u16 = 465;
const DEFAULT_CHANNEL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

/// Validated configuration, built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub interfaces: Vec<InterfaceConfig>,
    pub targets: Vec<String>,
    pub probe_timeout: Duration,
    pub state_file: PathBuf,
    pub whois: WhoisConfig,
    pub email: Availability<EmailConfig>,
    pub telegram: Availability<TelegramConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub label: String,
    pub expected_org: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WhoisConfig {
    pub enabled: bool,
    pub ip_lookup_url: Url,
    pub lookup_timeout: Duration,
    pub query_timeout: Duration,
    pub server: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// TLS from the first byte (SMTPS, usually port 465).
    Implicit,
    /// Cleartext session upgraded with STARTTLS (usually port 587).
    StartTls,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub sender: Mailbox,
    pub recipient: Mailbox,
    pub server: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub security: SmtpSecurity,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_url: Url,
    pub timeout: Duration,
}

/// A channel is usable only when every required setting is present.
#[derive(Debug, Clone)]
pub enum Availability<T> {
    Ready(T),
    Missing(Vec<&'static str>),
}

impl<T> Availability<T> {
    pub fn ready(&self) -> Option<&T> {
        match self {
            Availability::Ready(settings) => Some(settings),
            Availability::Missing(_) => None,
        }
    }

    pub fn missing(&self) -> &[&'static str] {
        match self {
            Availability::Ready(_) => &[],
            Availability::Missing(missing) => missing,
        }
    }
}

/// Per-invocation override of an environment-derived default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Toggle {
    #[default]
    Inherit,
    ForceOn,
    ForceOff,
}

impl Toggle {
    pub fn from_flags(on: bool, off: bool) -> Self {
        match (on, off) {
            (true, _) => Toggle::ForceOn,
            (false, true) => Toggle::ForceOff,
            (false, false) => Toggle::Inherit,
        }
    }

    fn resolve(self, feature: &'static str, missing: &[&'static str], available: bool) -> Result<bool, Error> {
        match self {
            Toggle::Inherit => Ok(available),
            Toggle::ForceOn if !missing.is_empty() => Err(Error::MissingSettings {
                channel: feature,
                missing: missing.to_vec(),
            }),
            Toggle::ForceOn => Ok(true),
            Toggle::ForceOff => Ok(false),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overrides {
    pub email: Toggle,
    pub telegram: Toggle,
    pub whois: Toggle,
    pub dry_run: bool,
}

/// What this invocation actually does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub email: bool,
    pub telegram: bool,
    pub whois: bool,
    pub dry_run: bool,
}

impl Features {
    /// Merges channel availability with the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSettings`] when a channel is forced on while
    /// some of its required settings are absent.
    pub fn resolve(config: &Config, overrides: &Overrides) -> Result<Self, Error> {
        let email_missing = config.email.missing();
        let telegram_missing = config.telegram.missing();
        Ok(Self {
            email: overrides
                .email
                .resolve("email", email_missing, email_missing.is_empty())?,
            telegram: overrides
                .telegram
                .resolve("telegram", telegram_missing, telegram_missing.is_empty())?,
            whois: overrides.whois.resolve("whois", &[], config.whois.enabled)?,
            dry_run: overrides.dry_run,
        })
    }

    pub fn enabled(&self) -> Vec<&'static str> {
        [("email", self.email), ("telegram", self.telegram), ("whois", self.whois)]
            .into_iter()
            .filter_map(|(name, on)| on.then_some(name))
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    interfaces: Vec<RawInterface>,
    targets: Option<Vec<String>>,
    probe_timeout_secs: Option<u64>,
    state_file: Option<PathBuf>,
    #[serde(default)]
    whois: RawWhois,
    #[serde(default)]
    email: RawEmail,
    #[serde(default)]
    telegram: RawTelegram,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInterface {
    name: String,
    label: Option<String>,
    expected_org: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWhois {
    #[serde(default)]
    enabled: bool,
    ip_lookup_url: Option<String>,
    lookup_timeout_secs: Option<u64>,
    query_timeout_secs: Option<u64>,
    server: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEmail {
    sender: Option<String>,
    recipient: Option<String>,
    server: Option<String>,
    login: Option<String>,
    password: Option<String>,
    port: Option<u16>,
    security: Option<SmtpSecurity>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTelegram {
    bot_token: Option<String>,
    chat_id: Option<String>,
    api_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl Config {
    /// Loads the TOML file at `path`, or the default location.
    ///
    /// Credentials left out of the file are taken from the environment
    /// (`SMTP_*`, `TELEGRAM_*`), including any `.env` already loaded.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed, or when validation
    /// rejects a value.
    pub fn load(path: Option<&Path>) -> Result<Config, Error> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::Config(format!("no configuration file at {}", path.display()))
            } else {
                e.into()
            }
        })?;
        Self::from_toml(&content, |key| dotenvy::var(key).ok())
    }

    /// Parses and validates `content`, looking up absent credentials with `env`.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error.
    pub fn from_toml(content: &str, env: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::validate(raw, &env)
    }

    /// `$XDG_CONFIG_HOME/linkwatch/config.toml` or the platform equivalent.
    ///
    /// # Errors
    ///
    /// Fails when the platform has no configuration directory.
    pub fn default_path() -> Result<PathBuf, Error> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join("config.toml"))
            .ok_or_else(|| Error::Config("cannot determine the configuration directory".to_string()))
    }

    fn default_state_file() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map_or_else(
                || PathBuf::from("interface_states.csv"),
                |dir| dir.join(APP_DIR).join("interface_states.csv"),
            )
    }

    fn validate(raw: RawConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Config, Error> {
        if raw.interfaces.is_empty() {
            return Err(Error::Config("at least one [[interfaces]] entry is required".to_string()));
        }

        let mut seen = HashSet::new();
        let mut interfaces = Vec::with_capacity(raw.interfaces.len());
        for iface in raw.interfaces {
            let name = iface.name.trim().to_string();
            if name.is_empty() {
                return Err(Error::Config("interface name must not be empty".to_string()));
            }
            if !seen.insert(name.clone()) {
                return Err(Error::Config(format!("interface {name} is listed twice")));
            }
            interfaces.push(InterfaceConfig {
                label: non_empty(iface.label).unwrap_or_else(|| name.clone()),
                expected_org: non_empty(iface.expected_org),
                name,
            });
        }

        let targets: Vec<String> = raw
            .targets
            .unwrap_or_else(|| DEFAULT_TARGETS.map(String::from).to_vec())
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if targets.is_empty() {
            return Err(Error::Config("targets must list at least one host".to_string()));
        }

        let whois = WhoisConfig {
            enabled: raw.whois.enabled,
            ip_lookup_url: Url::parse(
                raw.whois
                    .ip_lookup_url
                    .as_deref()
                    .unwrap_or(DEFAULT_IP_LOOKUP_URL),
            )?,
            lookup_timeout: timeout(
                "whois.lookup_timeout_secs",
                raw.whois.lookup_timeout_secs,
                DEFAULT_LOOKUP_TIMEOUT_SECS,
            )?,
            query_timeout: timeout(
                "whois.query_timeout_secs",
                raw.whois.query_timeout_secs,
                DEFAULT_QUERY_TIMEOUT_SECS,
            )?,
            server: non_empty(raw.whois.server).unwrap_or_else(|| DEFAULT_WHOIS_SERVER.to_string()),
        };

        Ok(Config {
            interfaces,
            targets,
            probe_timeout: timeout(
                "probe_timeout_secs",
                raw.probe_timeout_secs,
                DEFAULT_PROBE_TIMEOUT_SECS,
            )?,
            state_file: raw.state_file.unwrap_or_else(Self::default_state_file),
            whois,
            email: email_settings(raw.email, env)?,
            telegram: telegram_settings(raw.telegram, env)?,
        })
    }

    /// Human-readable summary for `--show-config`.
    pub fn describe(&self, features: &Features) -> String {
        let mut out = String::from("Interfaces:\n");
        for iface in &self.interfaces {
            let org = iface
                .expected_org
                .as_ref()
                .map_or(String::new(), |org| format!("  (WHOIS: {org})"));
            let _ = writeln!(out, "  {:<10} {}{org}", iface.name, iface.label);
        }
        let _ = writeln!(out, "\nTargets: {}", self.targets.join(", "));
        let _ = writeln!(out, "State file: {}", self.state_file.display());
        out.push_str("\nFeatures:\n");

        match (features.email, &self.email) {
            (true, Availability::Ready(email)) => {
                let mode = match email.security {
                    SmtpSecurity::Implicit => "SSL",
                    SmtpSecurity::StartTls => "STARTTLS",
                };
                let _ = writeln!(out, "  Email:    enabled ({}:{} {mode})", email.server, email.port);
            }
            (_, settings) => {
                let _ = writeln!(out, "  Email:    disabled ({})", disabled_reason(settings.missing()));
            }
        }

        match (features.telegram, &self.telegram) {
            (true, Availability::Ready(telegram)) => {
                let _ = writeln!(
                    out,
                    "  Telegram: enabled (token: {}, chat: {})",
                    redact(&telegram.bot_token),
                    telegram.chat_id
                );
            }
            (_, settings) => {
                let _ = writeln!(out, "  Telegram: disabled ({})", disabled_reason(settings.missing()));
            }
        }

        if features.whois {
            let _ = writeln!(out, "  WHOIS:    enabled (IP lookup: {})", self.whois.ip_lookup_url);
        } else {
            out.push_str("  WHOIS:    disabled\n");
        }
        out
    }
}

fn email_settings(
    raw: RawEmail,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Availability<EmailConfig>, Error> {
    let mut missing = Vec::new();
    let mut required = |value: Option<String>, key: &'static str| {
        let value = non_empty(value.or_else(|| env(key)));
        if value.is_none() {
            missing.push(key);
        }
        value.unwrap_or_default()
    };
    let sender = required(raw.sender, "SMTP_SENDER");
    let recipient = required(raw.recipient, "SMTP_RECIPIENT");
    let server = required(raw.server, "SMTP_SERVER");
    let login = required(raw.login, "SMTP_LOGIN");
    let password = required(raw.password, "SMTP_PASSWORD");

    if !missing.is_empty() {
        return Ok(Availability::Missing(missing));
    }
    Ok(Availability::Ready(EmailConfig {
        sender: sender.parse()?,
        recipient: recipient.parse()?,
        server,
        port: raw.port.unwrap_or(DEFAULT_SMTP_PORT),
        login,
        password,
        security: raw.security.unwrap_or(SmtpSecurity::Implicit),
        timeout: timeout("email.timeout_secs", raw.timeout_secs, DEFAULT_CHANNEL_TIMEOUT_SECS)?,
    }))
}

fn telegram_settings(
    raw: RawTelegram,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Availability<TelegramConfig>, Error> {
    let bot_token = non_empty(raw.bot_token.or_else(|| env("TELEGRAM_BOT_TOKEN")));
    let chat_id = non_empty(raw.chat_id.or_else(|| env("TELEGRAM_CHAT_ID")));

    let (Some(bot_token), Some(chat_id)) = (bot_token.clone(), chat_id.clone()) else {
        let missing = [
            ("TELEGRAM_BOT_TOKEN", bot_token.is_none()),
            ("TELEGRAM_CHAT_ID", chat_id.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, absent)| absent.then_some(key))
        .collect();
        return Ok(Availability::Missing(missing));
    };

    Ok(Availability::Ready(TelegramConfig {
        bot_token,
        chat_id,
        api_url: Url::parse(raw.api_url.as_deref().unwrap_or(DEFAULT_TELEGRAM_API))?,
        timeout: timeout("telegram.timeout_secs", raw.timeout_secs, DEFAULT_CHANNEL_TIMEOUT_SECS)?,
    }))
}

fn timeout(key: &str, secs: Option<u64>, default: u64) -> Result<Duration, Error> {
    match secs.unwrap_or(default) {
        0 => Err(Error::Config(format!("{key} must be greater than zero"))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn disabled_reason(missing: &[&str]) -> String {
    if missing.is_empty() {
        "disabled via flag".to_string()
    } else {
        format!("missing {}", missing.join(", "))
    }
}

/// Treats a missing `.env` as "nothing to load"; any other failure is kept.
///
/// # Errors
///
/// Returns the dotenvy error when the file exists but cannot be read or parsed.
pub fn optional_env_file<T>(loaded: dotenvy::Result<T>) -> Result<Option<T>, Error> {
    match loaded {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Keeps the first and last four characters of a secret.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "****".to_string()
    }
}
