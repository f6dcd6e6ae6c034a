use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Alert, AlertChannel};
use crate::config::TelegramConfig;
use crate::error::Error;
use crate::net::Egress;

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    description: Option<String>,
}

/// Bot API `sendMessage`, optionally pinned to the working interface.
pub struct TelegramChannel {
    config: TelegramConfig,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        Self { config }
    }

    // Built by hand: `Url::join` would read "bot<id>:<secret>" as a scheme.
    fn endpoint(&self) -> Result<Url, Error> {
        let base = self.config.api_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!(
            "{base}/bot{}/sendMessage",
            self.config.bot_token
        ))?)
    }
}

#[async_trait]
impl AlertChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &Alert, egress: &Egress) -> Result<(), Error> {
        let client = egress.http_client(self.config.timeout)?;
        let payload = SendMessage {
            chat_id: &self.config.chat_id,
            text: format!("*{}*\n{}", alert.subject, alert.body),
            parse_mode: "Markdown",
        };

        let response = client
            .post(self.endpoint()?)
            .json(&payload)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let status = response.status();
        let body = response.text().await.map_err(reqwest::Error::without_url)?;

        // Transport success is not enough: the API reports rejections in the body.
        match serde_json::from_str::<ApiResponse>(&body) {
            Ok(ApiResponse { ok: true, .. }) => Ok(()),
            Ok(api) => Err(Error::ChatApi(
                api.description.unwrap_or_else(|| format!("HTTP {status}")),
            )),
            Err(_) if status.is_success() && !is_json(&body) => Ok(()),
            Err(_) => Err(Error::ChatApi(format!("HTTP {status}"))),
        }
    }
}

fn is_json(body: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(body).is_ok()
}
