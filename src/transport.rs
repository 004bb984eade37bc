//! Byte transport to the device: connecting, logging in, and line framing.
//!
//! A [`Connector`] produces a [`Link`] that has already passed the login
//! phase. The session only ever sees text lines, so other transports
//! ([`SshConnector`](crate::SshConnector), a serial bridge) plug in by implementing
//! [`Connector`] and handing back any async reader/writer pair.

use crate::config::ClientConfig;
use crate::error::{Result, TesiraError};
use crate::protocol::WELCOME_BANNER;
use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const READ_CHUNK: usize = 4096;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Login credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// An authenticated connection, positioned at the welcome banner
pub struct Link {
    pub reader: LineReader<BoxedReader>,
    pub writer: BoxedWriter,
}

/// Opens authenticated links to a device
///
/// Implementations return [`TesiraError::AuthenticationFailed`] when the
/// device rejects the credentials, so the session can try its fallback login.
/// Any other error is treated as a transport fault and retried later.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Link>>;
}

/// Telnet connector for the device's TTP service
#[derive(Debug, Clone)]
pub struct TelnetConnector {
    address: String,
    port: u16,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TelnetConnector {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }

    async fn open(&self, credentials: &Credentials) -> Result<Link> {
        let target = format!("{}:{}", self.address, self.port);
        tracing::info!("Connecting to {}", target);

        let stream = timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| TesiraError::Timeout)??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = LineReader::new(Box::new(read_half) as BoxedReader);
        let mut writer: BoxedWriter = Box::new(write_half);

        timeout(
            self.handshake_timeout,
            login(&mut reader, &mut writer, credentials),
        )
        .await
        .map_err(|_| TesiraError::Timeout)??;

        reader.finish_negotiation();
        tracing::debug!("Handshake with {} complete", target);
        Ok(Link { reader, writer })
    }
}

impl Connector for TelnetConnector {
    fn connect<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Link>> {
        Box::pin(self.open(credentials))
    }
}

/// Answer login prompts until the welcome banner shows up
///
/// The banner stays buffered so the session reader sees it as its first line.
async fn login<R, W>(reader: &mut LineReader<R>, writer: &mut W, credentials: &Credentials) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sent_username = false;
    let mut sent_password = false;

    loop {
        if reader.discard_before(WELCOME_BANNER) {
            return Ok(());
        }

        let text = reader.pending_text().to_lowercase();
        if text.contains("login:") {
            if sent_username {
                return Err(TesiraError::AuthenticationFailed(format!(
                    "login for {} was rejected",
                    credentials.username
                )));
            }
            reader.clear_pending();
            write_line(writer, &credentials.username).await?;
            sent_username = true;
        } else if text.contains("password:") && !sent_password {
            reader.clear_pending();
            write_line(writer, &credentials.password).await?;
            sent_password = true;
        } else if sent_password && ["incorrect", "denied", "failed"].iter().any(|m| text.contains(m)) {
            return Err(TesiraError::AuthenticationFailed(text.trim().to_string()));
        }

        let replies = reader.take_replies();
        if !replies.is_empty() {
            writer.write_all(&replies).await?;
            writer.flush().await?;
        }

        if reader.fill().await? == 0 {
            return Err(TesiraError::ConnectionClosed);
        }
    }
}

/// Write one command line
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    let mut bytes = Vec::with_capacity(line.len() + 2);
    bytes.extend_from_slice(line.as_bytes());
    bytes.extend_from_slice(b"\r\n");
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Telnet {
    Data,
    Command,
    Option(u8),
    Sub,
    SubCommand,
}

/// Splits a byte stream into text lines
///
/// Telnet option negotiation is stripped from the stream. Until
/// [`finish_negotiation`](LineReader::finish_negotiation) is called, DO and
/// WILL requests are answered with WONT and DONT through
/// [`take_replies`](LineReader::take_replies).
pub struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    telnet: Telnet,
    replies: Vec<u8>,
    negotiating: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            telnet: Telnet::Data,
            replies: Vec::new(),
            negotiating: true,
        }
    }

    /// Read one chunk from the transport; `Ok(0)` means end of stream
    pub async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        for &byte in &chunk[..n] {
            self.feed(byte);
        }
        Ok(n)
    }

    /// Next non-blank line, without its terminator
    pub async fn next_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if self.fill().await? == 0 {
                return Err(TesiraError::ConnectionClosed);
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let cleaned: Vec<u8> = raw
                .into_iter()
                .filter(|&b| b != b'\r' && b != b'\n' && b != 0)
                .collect();
            let line = String::from_utf8_lossy(&cleaned).trim_end().to_string();
            if !line.trim().is_empty() {
                return Some(line);
            }
        }
        None
    }

    fn feed(&mut self, byte: u8) {
        self.telnet = match (self.telnet, byte) {
            (Telnet::Data, IAC) => Telnet::Command,
            (Telnet::Data, b) => {
                self.buffer.push(b);
                Telnet::Data
            }
            (Telnet::Command, IAC) => {
                self.buffer.push(IAC);
                Telnet::Data
            }
            (Telnet::Command, DO | DONT | WILL | WONT) => Telnet::Option(byte),
            (Telnet::Command, SB) => Telnet::Sub,
            (Telnet::Command, _) => Telnet::Data,
            (Telnet::Option(command), option) => {
                if self.negotiating {
                    match command {
                        DO => self.replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => self.replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                }
                Telnet::Data
            }
            (Telnet::Sub, IAC) => Telnet::SubCommand,
            (Telnet::Sub, _) => Telnet::Sub,
            (Telnet::SubCommand, SE) => Telnet::Data,
            (Telnet::SubCommand, _) => Telnet::Sub,
        };
    }

    /// Buffered text not yet returned as a line (prompts have no newline)
    pub fn pending_text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    pub fn clear_pending(&mut self) {
        self.buffer.clear();
    }

    /// Drop buffered text before the line containing `marker`
    ///
    /// Returns false, leaving the buffer untouched, when `marker` is absent.
    pub fn discard_before(&mut self, marker: &str) -> bool {
        let needle = marker.as_bytes();
        let Some(at) = self.buffer.windows(needle.len()).position(|w| w == needle) else {
            return false;
        };
        let line_start = self.buffer[..at]
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        self.buffer.drain(..line_start);
        true
    }

    /// Negotiation replies waiting to be written
    pub fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.replies)
    }

    /// Stop answering option requests once the session is up
    pub fn finish_negotiation(&mut self) {
        self.negotiating = false;
        self.replies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn splits_lines_and_skips_blanks() {
        let (client, mut device) = duplex(1024);
        let mut reader = LineReader::new(client);
        device.write_all(b"first\r\n\r\n\0second\n  \nthird").await.unwrap();
        drop(device);

        assert_eq!(reader.next_line().await.unwrap(), "first");
        assert_eq!(reader.next_line().await.unwrap(), "second");
        assert!(matches!(
            reader.next_line().await,
            Err(TesiraError::ConnectionClosed)
        ));
        assert_eq!(reader.pending_text(), "third");
    }

    #[tokio::test]
    async fn strips_and_refuses_telnet_options() {
        let (client, mut device) = duplex(1024);
        let mut reader = LineReader::new(client);
        let mut bytes = vec![IAC, DO, 24, IAC, WILL, 1, b'o', b'k'];
        bytes.extend_from_slice(&[IAC, SB, 24, 1, IAC, SE, IAC, IAC, b'\n']);
        device.write_all(&bytes).await.unwrap();

        let line = reader.next_line().await.unwrap();
        assert!(line.starts_with("ok"));
        assert_eq!(reader.take_replies(), vec![IAC, WONT, 24, IAC, DONT, 1]);

        reader.finish_negotiation();
        device.write_all(&[IAC, DO, 31, b'x', b'\n']).await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), "x");
        assert!(reader.take_replies().is_empty());
    }

    #[tokio::test]
    async fn login_answers_prompts_and_keeps_banner() {
        let (client, device) = duplex(4096);
        let (device_read, mut device_write) = tokio::io::split(device);
        let (client_read, mut client_write) = tokio::io::split(client);
        let mut reader = LineReader::new(client_read);

        let device_task = tokio::spawn(async move {
            let mut device_reader = LineReader::new(device_read);
            device_write.write_all(b"login: ").await.unwrap();
            let user = device_reader.next_line().await.unwrap();
            device_write.write_all(b"Password: ").await.unwrap();
            let password = device_reader.next_line().await.unwrap();
            device_write
                .write_all(b"\r\nWelcome to the Tesira Text Protocol Server...\r\n")
                .await
                .unwrap();
            (user, password)
        });

        let credentials = Credentials::new("admin", "secret");
        login(&mut reader, &mut client_write, &credentials).await.unwrap();
        let (user, password) = device_task.await.unwrap();
        assert_eq!(user, "admin");
        assert_eq!(password, "secret");
        assert!(reader
            .next_line()
            .await
            .unwrap()
            .starts_with("Welcome to the Tesira Text Protocol Server"));
    }

    #[tokio::test]
    async fn login_reports_rejected_password() {
        let (client, device) = duplex(4096);
        let (device_read, mut device_write) = tokio::io::split(device);
        let (client_read, mut client_write) = tokio::io::split(client);
        let mut reader = LineReader::new(client_read);

        tokio::spawn(async move {
            let mut device_reader = LineReader::new(device_read);
            device_write.write_all(b"login: ").await.unwrap();
            device_reader.next_line().await.unwrap();
            device_write.write_all(b"Password: ").await.unwrap();
            device_reader.next_line().await.unwrap();
            device_write.write_all(b"\r\nLogin incorrect\r\nlogin: ").await.unwrap();
            // keep the stream open until the client gives up
            let _ = device_reader.next_line().await;
        });

        let credentials = Credentials::new("admin", "wrong");
        let result = login(&mut reader, &mut client_write, &credentials).await;
        assert!(matches!(result, Err(TesiraError::AuthenticationFailed(_))));
    }
}
