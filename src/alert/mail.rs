//! Mail channel.
//!
//! The TCP connection comes from [`Egress`] so it can be pinned to the working
//! interface; lettre drives the SMTP conversation over that socket.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use lettre::Message;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{
    AsyncSmtpConnection, AsyncTokioStream, CertificateStore, TlsParameters,
};
use lettre::transport::smtp::extension::ClientId;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;

use super::{Alert, AlertChannel};
use crate::config::{EmailConfig, SmtpSecurity};
use crate::error::Error;
use crate::net::{self, Egress};

const MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

pub struct MailChannel {
    config: EmailConfig,
    /// Handshake for implicit TLS, done before lettre sees the stream.
    tls: TlsConnector,
    /// Handshake for STARTTLS, done by lettre after the upgrade command.
    starttls: TlsParameters,
}

impl MailChannel {
    /// # Errors
    ///
    /// Fails if a TLS client configuration cannot be built.
    pub fn new(config: EmailConfig) -> Result<Self, Error> {
        let starttls = TlsParameters::builder(config.server.clone())
            .certificate_store(CertificateStore::WebpkiRoots)
            .build_rustls()?;
        Ok(Self {
            tls: net::tls_connector()?,
            starttls,
            config,
        })
    }

    fn message(&self, alert: &Alert) -> Result<Message, Error> {
        Ok(Message::builder()
            .from(self.config.sender.clone())
            .to(self.config.recipient.clone())
            .subject(alert.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(alert.body.clone())?)
    }

    async fn deliver(&self, alert: &Alert, egress: &Egress) -> Result<(), Error> {
        let message = self.message(alert)?;
        let tcp = egress.connect(&self.config.server, self.config.port).await?;
        let hello = hello_name(tcp.local_addr()?.ip());
        debug!(
            "SMTP session with {}:{} via {egress}",
            self.config.server, self.config.port
        );

        let mut connection = match self.config.security {
            SmtpSecurity::Implicit => {
                let server_name = ServerName::try_from(self.config.server.clone())?;
                let stream = ImplicitTls(self.tls.connect(server_name, tcp).await?);
                AsyncSmtpConnection::connect_with_transport(Box::new(stream), &hello).await?
            }
            SmtpSecurity::StartTls => {
                let mut connection =
                    AsyncSmtpConnection::connect_with_transport(Box::new(tcp), &hello).await?;
                connection.starttls(self.starttls.clone(), &hello).await?;
                connection
            }
        };

        let credentials = Credentials::new(self.config.login.clone(), self.config.password.clone());
        connection.auth(MECHANISMS, &credentials).await?;
        connection
            .send(message.envelope(), &message.formatted())
            .await?;
        if let Err(e) = connection.quit().await {
            debug!("SMTP QUIT failed after delivery: {e}");
        }
        Ok(())
    }
}

#[async_trait]
impl AlertChannel for MailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, alert: &Alert, egress: &Egress) -> Result<(), Error> {
        net::with_timeout(self.config.timeout, self.deliver(alert, egress)).await
    }
}

/// Address literal of our end of the connection, for EHLO.
fn hello_name(local: IpAddr) -> ClientId {
    match local {
        IpAddr::V4(ip) => ClientId::Ipv4(ip),
        IpAddr::V6(ip) => ClientId::Ipv6(ip),
    }
}

/// An already-negotiated TLS session handed to lettre as a plain stream.
#[derive(Debug)]
struct ImplicitTls(TlsStream<TcpStream>);

impl AsyncTokioStream for ImplicitTls {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.get_ref().0.peer_addr()
    }
}

impl AsyncRead for ImplicitTls {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for ImplicitTls {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tests::{TEST_CA, test_acceptor, test_connector};
    use lettre::transport::smtp::client::Certificate;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    #[derive(Debug, Default)]
    struct Transcript {
        commands: Vec<String>,
        data: String,
    }

    /// Relay options: what EHLO advertises and how RCPT is answered.
    #[derive(Clone, Copy)]
    struct Relay {
        auth: &'static str,
        rcpt_reply: &'static str,
    }

    impl Default for Relay {
        fn default() -> Self {
            Self {
                auth: "AUTH PLAIN LOGIN",
                rcpt_reply: "250 ok",
            }
        }
    }

    /// Serves one SMTP session over `stream`, recording every command.
    async fn converse<S>(stream: S, relay: Relay, greet: bool, transcript: &mut Transcript)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);
        if greet {
            write.write_all(b"220 mock ESMTP ready\r\n").await.unwrap();
        }

        let mut login_step = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            transcript.commands.push(line.clone());

            let reply = if line.starts_with("EHLO") {
                format!("250-mock greets you\r\n250-{}\r\n250 8BITMIME\r\n", relay.auth)
            } else if line.starts_with("AUTH PLAIN") {
                "235 2.7.0 accepted\r\n".to_string()
            } else if line == "AUTH LOGIN" {
                login_step = Some(0);
                "334 VXNlcm5hbWU6\r\n".to_string()
            } else if let Some(step) = login_step.filter(|s| *s < 2) {
                login_step = Some(step + 1);
                if step == 0 { "334 UGFzc3dvcmQ6\r\n" } else { "235 accepted\r\n" }.to_string()
            } else if line.starts_with("MAIL FROM") {
                "250 ok\r\n".to_string()
            } else if line.starts_with("RCPT TO") {
                format!("{}\r\n", relay.rcpt_reply)
            } else if line == "DATA" {
                write.write_all(b"354 go ahead\r\n").await.unwrap();
                loop {
                    let mut data_line = String::new();
                    reader.read_line(&mut data_line).await.unwrap();
                    if data_line == ".\r\n" {
                        break;
                    }
                    transcript.data.push_str(&data_line);
                }
                "250 queued\r\n".to_string()
            } else if line == "QUIT" {
                write.write_all(b"221 bye\r\n").await.unwrap();
                break;
            } else {
                "500 unrecognised\r\n".to_string()
            };
            write.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    /// Accepts one client on `listener` and speaks SMTP in the given security mode.
    async fn serve(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        security: SmtpSecurity,
        relay: Relay,
    ) -> Transcript {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut transcript = Transcript::default();
        match security {
            SmtpSecurity::Implicit => {
                let tls = acceptor.accept(tcp).await.unwrap();
                converse(tls, relay, true, &mut transcript).await;
            }
            SmtpSecurity::StartTls => {
                let mut plain = BufReader::new(tcp);
                plain.write_all(b"220 mock ESMTP ready\r\n").await.unwrap();
                for reply in ["250-mock greets you\r\n250 STARTTLS\r\n", "220 go ahead\r\n"] {
                    let mut line = String::new();
                    plain.read_line(&mut line).await.unwrap();
                    transcript.commands.push(line.trim_end().to_string());
                    plain.write_all(reply.as_bytes()).await.unwrap();
                }
                let tls = acceptor.accept(plain.into_inner()).await.unwrap();
                converse(tls, relay, false, &mut transcript).await;
            }
        }
        transcript
    }

    fn config(port: u16, security: SmtpSecurity) -> EmailConfig {
        EmailConfig {
            sender: "monitor@example.com".parse().unwrap(),
            recipient: "ops@example.com".parse().unwrap(),
            server: "localhost".to_string(),
            port,
            login: "monitor".to_string(),
            password: "hunter2".to_string(),
            security,
            timeout: Duration::from_secs(10),
        }
    }

    /// Channel trusting only the test CA, so it can talk to the local relay.
    fn channel(config: EmailConfig) -> MailChannel {
        let starttls = TlsParameters::builder(config.server.clone())
            .certificate_store(CertificateStore::None)
            .add_root_certificate(Certificate::from_der(TEST_CA.to_vec()).unwrap())
            .build_rustls()
            .unwrap();
        MailChannel {
            config,
            tls: test_connector(),
            starttls,
        }
    }

    async fn deliver(security: SmtpSecurity, relay: Relay) -> (Result<(), Error>, Transcript) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve(listener, test_acceptor(), security, relay));

        let alert = Alert::new("Network Interface Status Update", "eth0 is down");
        let result = channel(config(port, security))
            .send(&alert, &Egress::DefaultRoute)
            .await;
        (result, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_implicit_tls_delivery() {
        let (result, transcript) = deliver(SmtpSecurity::Implicit, Relay::default()).await;
        assert!(result.is_ok(), "Expected delivery to succeed: {result:?}");

        assert_eq!(
            transcript.commands,
            vec![
                "EHLO [127.0.0.1]",
                "AUTH PLAIN AG1vbml0b3IAaHVudGVyMg==",
                "MAIL FROM:<monitor@example.com>",
                "RCPT TO:<ops@example.com>",
                "DATA",
                "QUIT",
            ]
        );
        assert!(transcript.data.contains("Subject: Network Interface Status Update\r\n"));
        assert!(transcript.data.contains("eth0 is down"));
    }

    #[tokio::test]
    async fn test_starttls_upgrades_before_auth() {
        let (result, transcript) = deliver(SmtpSecurity::StartTls, Relay::default()).await;
        assert!(result.is_ok(), "Expected delivery to succeed: {result:?}");

        assert_eq!(transcript.commands[0], "EHLO [127.0.0.1]");
        assert_eq!(transcript.commands[1], "STARTTLS");
        assert_eq!(transcript.commands[2], "EHLO [127.0.0.1]");
        assert!(transcript.commands[3].starts_with("AUTH PLAIN"));
        assert!(transcript.commands.contains(&"DATA".to_string()));
    }

    #[tokio::test]
    async fn test_falls_back_to_auth_login() {
        let relay = Relay {
            auth: "AUTH LOGIN",
            ..Relay::default()
        };
        let (result, transcript) = deliver(SmtpSecurity::Implicit, relay).await;
        assert!(result.is_ok(), "Expected delivery to succeed: {result:?}");

        assert_eq!(transcript.commands[1], "AUTH LOGIN");
        assert_eq!(transcript.commands[2], "bW9uaXRvcg==");
        assert_eq!(transcript.commands[3], "aHVudGVyMg==");
    }

    #[tokio::test]
    async fn test_rejected_recipient_is_an_error() {
        let relay = Relay {
            rcpt_reply: "550 5.1.1 no such user",
            ..Relay::default()
        };
        let (result, transcript) = deliver(SmtpSecurity::Implicit, relay).await;

        match result {
            Err(Error::Smtp(e)) => assert!(e.is_permanent(), "expected permanent error: {e}"),
            other => panic!("expected SMTP error, got {other:?}"),
        }
        assert!(!transcript.commands.contains(&"DATA".to_string()));
    }

    #[tokio::test]
    async fn test_untrusted_certificate_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = test_acceptor();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = acceptor.accept(tcp).await;
        });

        let channel = MailChannel::new(config(port, SmtpSecurity::Implicit)).unwrap();
        let result = channel
            .send(&Alert::new("s", "b"), &Egress::DefaultRoute)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_message_headers() {
        let channel = MailChannel::new(config(465, SmtpSecurity::Implicit)).unwrap();

        let message = channel
            .message(&Alert::new("Network Interface Status Update", "eth0 is down"))
            .unwrap();
        let text = String::from_utf8(message.formatted()).unwrap();

        assert!(text.contains("From: monitor@example.com\r\n"));
        assert!(text.contains("To: ops@example.com\r\n"));
        assert!(text.contains("Subject: Network Interface Status Update\r\n"));
        assert!(text.contains("Content-Type: text/plain"));
        assert!(text.contains("eth0 is down"));
    }

    #[test]
    fn test_hello_name_is_address_literal() {
        assert_eq!(hello_name("192.0.2.1".parse().unwrap()).to_string(), "[192.0.2.1]");
        assert_eq!(hello_name("::1".parse().unwrap()).to_string(), "[IPv6:::1]");
    }
}
