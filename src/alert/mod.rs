//! Alert formatting and fan-out to the notification channels.

use async_trait::async_trait;
use log::{error, info};

use crate::config::{Config, Features};
use crate::error::Error;
use crate::net::Egress;
use crate::state::StateDelta;

pub mod mail;
pub mod telegram;

pub use mail::MailChannel;
pub use telegram::TelegramChannel;

pub const DEFAULT_SUBJECT: &str = "Network Interface Status Update";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub subject: String,
    pub body: String,
}

impl Alert {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Alert describing `delta`, or `None` when nothing changed.
    pub fn from_delta(delta: &StateDelta) -> Option<Self> {
        (!delta.is_empty()).then(|| Self::new(DEFAULT_SUBJECT, format_body(delta)))
    }
}

/// Failures first, then restorations; either section may be absent.
pub fn format_body(delta: &StateDelta) -> String {
    let mut parts = Vec::with_capacity(2);
    if !delta.new_failures.is_empty() {
        parts.push(format!(
            "The following interfaces failed connectivity:\n\n{}",
            delta.new_failures.join("\n\n")
        ));
    }
    if !delta.restored.is_empty() {
        parts.push(format!(
            "The following interfaces have been restored:\n\n{}",
            delta.restored.join("\n")
        ));
    }
    parts.join("\n\n")
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert, egress: &Egress) -> Result<(), Error>;
}

/// Outcome of one channel for one alert.
#[derive(Debug)]
pub struct Delivery {
    pub channel: &'static str,
    pub result: Result<(), Error>,
}

#[derive(Default)]
pub struct Dispatcher {
    channels: Vec<Box<dyn AlertChannel>>,
}

impl Dispatcher {
    pub fn new(channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self { channels }
    }

    /// Builds every channel that is both configured and enabled.
    ///
    /// # Errors
    ///
    /// Fails if a channel's TLS configuration cannot be built.
    pub fn from_config(config: &Config, features: &Features) -> Result<Self, Error> {
        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
        if let Some(email) = config.email.ready().filter(|_| features.email) {
            channels.push(Box::new(MailChannel::new(email.clone())?));
        }
        if let Some(telegram) = config.telegram.ready().filter(|_| features.telegram) {
            channels.push(Box::new(TelegramChannel::new(telegram.clone())));
        }
        Ok(Self { channels })
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Sends `alert` on every channel in turn.
    ///
    /// A failing channel is logged and reported but never stops the others.
    pub async fn dispatch(&self, alert: &Alert, egress: &Egress) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let name = channel.name();
            info!("Sending {name} alert via {egress}");
            let result = channel.send(alert, egress).await;
            match &result {
                Ok(()) => info!("{name} alert sent"),
                Err(e) => error!("Failed to send {name} alert: {e}"),
            }
            deliveries.push(Delivery {
                channel: name,
                result,
            });
        }
        deliveries
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every alert it is asked to send.
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub sent: Arc<Mutex<Vec<(Alert, Egress)>>>,
    }

    #[async_trait]
    impl AlertChannel for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn send(&self, alert: &Alert, egress: &Egress) -> Result<(), Error> {
            self.sent
                .lock()
                .unwrap()
                .push((alert.clone(), egress.clone()));
            Ok(())
        }
    }

    pub(crate) struct Broken;

    #[async_trait]
    impl AlertChannel for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn send(&self, _: &Alert, _: &Egress) -> Result<(), Error> {
            Err(Error::ChatApi("Unauthorized".to_string()))
        }
    }

    #[test]
    fn test_body_with_both_sections() {
        let delta = StateDelta {
            new_failures: vec![
                "Wi-Fi (wlan0):\n  a.example: timed out after 5s".to_string(),
                "LTE (wwan0):\n  a.example: refused".to_string(),
            ],
            restored: vec!["Primary".to_string(), "Backup".to_string()],
        };

        assert_eq!(
            format_body(&delta),
            "The following interfaces failed connectivity:\n\n\
             Wi-Fi (wlan0):\n  a.example: timed out after 5s\n\n\
             LTE (wwan0):\n  a.example: refused\n\n\
             The following interfaces have been restored:\n\n\
             Primary\nBackup"
        );
    }

    #[test]
    fn test_body_with_one_section() {
        let delta = StateDelta {
            new_failures: vec![],
            restored: vec!["Primary".to_string()],
        };
        assert_eq!(
            format_body(&delta),
            "The following interfaces have been restored:\n\nPrimary"
        );
    }

    #[test]
    fn test_no_alert_for_empty_delta() {
        assert_eq!(Alert::from_delta(&StateDelta::default()), None);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let recorder = Recorder::default();
        let dispatcher = Dispatcher::new(vec![Box::new(Broken), Box::new(recorder.clone())]);
        let alert = Alert::new(DEFAULT_SUBJECT, "body");
        let egress = Egress::Interface("wlan0".to_string());

        let deliveries = dispatcher.dispatch(&alert, &egress).await;

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].channel, "broken");
        assert!(deliveries[0].result.is_err());
        assert!(deliveries[1].result.is_ok());
        assert_eq!(*recorder.sent.lock().unwrap(), vec![(alert, egress)]);
    }
}
