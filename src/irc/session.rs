//! IRC connection lifecycle: connect, register, serve, reconnect.
//!
//! A spawned reader task turns the socket into lines; the session loop owns
//! the write half and multiplexes inbound lines, outbound messages queued
//! through an [`IrcHandle`], and cancellation.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::handler::{Action, Reactor};
use super::message::Message;
use crate::util::truncate_to_bytes;

/// Wait between a lost connection and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Maximum length of a protocol line excluding CRLF (RFC 1459 allows 512 with it).
const MAX_LINE_BYTES: usize = 510;

const QUIT_REASON: &str = "Shutting down";

/// Errors from the IRC transport.
#[derive(Debug, Error)]
pub enum IrcError {
    #[error("IRC connection error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid server name for TLS: {0}")]
    InvalidServerName(String),

    #[error("Connection closed")]
    Closed,
}

/// Connection and identity settings for one server.
pub struct IrcSettings {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub password: Option<SecretString>,
    pub autoreconnect: bool,
    pub nickname: String,
    pub username: String,
    pub realname: String,
    pub invisible: bool,
    pub nickserv_password: Option<SecretString>,
    pub channels: Vec<String>,
}

impl fmt::Debug for IrcSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrcSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("autoreconnect", &self.autoreconnect)
            .field("nickname", &self.nickname)
            .field("username", &self.username)
            .field("realname", &self.realname)
            .field("invisible", &self.invisible)
            .field(
                "nickserv_password",
                &self.nickserv_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("channels", &self.channels)
            .finish()
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Registered with the server and joined the configured channels.
    Registered,
    /// The connection was lost. A reconnect follows when enabled.
    Disconnected { reason: String },
}

/// Cloneable sender for outbound messages.
///
/// Sending never blocks. Messages queued before registration completes are
/// held back and flushed once the configured channels have been joined.
#[derive(Debug, Clone)]
pub struct IrcHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl IrcHandle {
    pub fn send(&self, msg: Message) -> Result<(), IrcError> {
        self.tx.send(msg).map_err(|_| IrcError::Closed)
    }

    pub fn privmsg(&self, target: &str, text: &str) -> Result<(), IrcError> {
        self.send(Message::privmsg(target, text))
    }
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// How a single connection ended.
enum Exit {
    Cancelled,
    Lost(IrcError),
}

pub struct IrcSession {
    settings: Arc<IrcSettings>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Outbound messages waiting for registration; survives reconnects.
    pending: Vec<Message>,
    reconnect_delay: Duration,
}

impl IrcSession {
    pub fn new(
        settings: IrcSettings,
    ) -> (Self, IrcHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Self {
            settings: Arc::new(settings),
            outbound_rx,
            outbound_tx: outbound_tx.clone(),
            events: events_tx,
            pending: Vec::new(),
            reconnect_delay: RECONNECT_DELAY,
        };
        (session, IrcHandle { tx: outbound_tx }, events_rx)
    }

    /// Overrides [`RECONNECT_DELAY`].
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Runs until `cancel` fires, or until the connection is lost with
    /// autoreconnect disabled.
    ///
    /// On cancellation a `QUIT` is sent before the socket is closed.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), IrcError> {
        loop {
            let err = match self.connect_and_serve(&cancel).await {
                Ok(Exit::Cancelled) => return Ok(()),
                Ok(Exit::Lost(e)) | Err(e) => e,
            };

            tracing::warn!(
                host = %self.settings.host,
                port = self.settings.port,
                error = %err,
                "IRC connection lost"
            );
            let _ = self.events.send(SessionEvent::Disconnected {
                reason: err.to_string(),
            });

            if !self.settings.autoreconnect {
                return Err(err);
            }

            tracing::info!(delay_ms = self.reconnect_delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn connect_and_serve(&mut self, cancel: &CancellationToken) -> Result<Exit, IrcError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Exit::Cancelled),
            stream = connect(&self.settings) => stream?,
        };
        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            secure = self.settings.secure,
            "Connected to IRC server"
        );

        let (reader, mut writer) = tokio::io::split(stream);
        let (lines_tx, mut lines_rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_lines(reader, lines_tx));

        let exit = self.serve(&mut writer, &mut lines_rx, cancel).await;
        reader_task.abort();

        match exit {
            Ok(Exit::Cancelled) => {
                // Best effort; the server may already be gone
                if write_message(&mut writer, &Message::quit(QUIT_REASON)).await.is_ok() {
                    let _ = writer.shutdown().await;
                }
                Ok(Exit::Cancelled)
            }
            other => other,
        }
    }

    async fn serve(
        &mut self,
        writer: &mut WriteHalf<Box<dyn Transport>>,
        lines: &mut mpsc::Receiver<io::Result<String>>,
        cancel: &CancellationToken,
    ) -> Result<Exit, IrcError> {
        let settings = Arc::clone(&self.settings);
        let mut reactor = Reactor::new(Arc::clone(&settings));

        if let Some(password) = &settings.password {
            write_message(writer, &Message::pass(password.expose_secret())).await?;
        }
        write_message(writer, &Message::nick_cmd(&settings.nickname)).await?;
        write_message(
            writer,
            &Message::user(&settings.username, settings.invisible, &settings.realname),
        )
        .await?;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Exit::Cancelled),
                line = lines.recv() => {
                    let line = match line {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => return Ok(Exit::Lost(IrcError::Io(e))),
                        None => return Ok(Exit::Lost(IrcError::Closed)),
                    };
                    let Some(msg) = Message::parse(&line) else {
                        continue;
                    };
                    tracing::trace!(line = %line.trim_end(), "<<");

                    if msg.command == "ERROR" {
                        reactor.handle(&msg);
                        return Ok(Exit::Lost(IrcError::Closed));
                    }

                    for action in reactor.handle(&msg) {
                        match action {
                            Action::Send(out) => write_message(writer, &out).await?,
                            Action::SendAfter(delay, out) => self.send_later(delay, out, cancel),
                            Action::Registered => {
                                tracing::info!(nickname = %reactor.nickname(), "Registered with IRC server");
                                for queued in std::mem::take(&mut self.pending) {
                                    write_message(writer, &queued).await?;
                                }
                                let _ = self.events.send(SessionEvent::Registered);
                            }
                        }
                    }
                }
                Some(out) = self.outbound_rx.recv() => {
                    if reactor.is_registered() {
                        write_message(writer, &out).await?;
                    } else {
                        self.pending.push(out);
                    }
                }
            }
        }
    }

    /// Messages queued through the handle but not yet written.
    #[cfg(test)]
    pub(crate) fn drain_outbound(mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outbound_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn send_later(&self, delay: Duration, msg: Message, cancel: &CancellationToken) {
        let tx = self.outbound_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(msg);
                }
            }
        });
    }
}

async fn connect(settings: &IrcSettings) -> Result<Box<dyn Transport>, IrcError> {
    let tcp = TcpStream::connect((settings.host.as_str(), settings.port)).await?;
    if !settings.secure {
        return Ok(Box::new(tcp));
    }

    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| IrcError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    let server_name = ServerName::try_from(settings.host.clone())
        .map_err(|_| IrcError::InvalidServerName(settings.host.clone()))?;

    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| IrcError::Tls(e.to_string()))?;
    Ok(Box::new(tls))
}

/// Forwards inbound lines until EOF or a read error.
///
/// Servers are not required to send UTF-8; invalid bytes are replaced.
async fn read_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<io::Result<String>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(512);
    loop {
        buf.clear();
        let item = match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => Ok(String::from_utf8_lossy(&buf).into_owned()),
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<(), IrcError> {
    let line = msg.to_string().replace(['\r', '\n'], " ");
    let line = truncate_to_bytes(&line, MAX_LINE_BYTES);
    tracing::trace!(line = %line, ">>");

    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}
