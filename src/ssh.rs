//! SSH transport: the device's TTP shell over an interactive SSH channel.

use crate::config::ClientConfig;
use crate::error::{Result, TesiraError};
use crate::protocol::WELCOME_BANNER;
use crate::transport::{BoxedReader, BoxedWriter, Connector, Credentials, LineReader, Link};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh_keys::key;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::timeout;

/// Keyboard-interactive exchanges before the login counts as rejected
const MAX_INTERACTIVE_ROUNDS: usize = 4;

/// Accepts whatever host key the device presents
struct TrustAnyHost;

#[async_trait]
impl client::Handler for TrustAnyHost {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &key::PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Read half of the shell channel; owns the SSH session so it lives as long
/// as the session reader does
struct ShellReader<R> {
    half: R,
    _session: Box<client::Handle<TrustAnyHost>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ShellReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.half).poll_read(cx, buf)
    }
}

/// SSH connector for the device's TTP shell (port 22)
///
/// Logs in with password authentication, then keyboard-interactive with the
/// same password. Host keys are not verified. A refused login is reported
/// as [`TesiraError::AuthenticationFailed`]; protocol and socket faults are
/// not.
#[derive(Debug, Clone)]
pub struct SshConnector {
    address: String,
    port: u16,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl SshConnector {
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
        tracing::info!("Connecting to {}:{} over SSH", self.address, self.port);

        let config = Arc::new(client::Config::default());
        let mut session = timeout(
            self.connect_timeout,
            client::connect(config, (self.address.clone(), self.port), TrustAnyHost),
        )
        .await
        .map_err(|_| TesiraError::Timeout)??;

        if !authenticate(&mut session, credentials).await? {
            return Err(TesiraError::AuthenticationFailed(format!(
                "SSH login for {} was rejected",
                credentials.username
            )));
        }

        let mut channel = session.channel_open_session().await?;
        channel.request_pty(false, "vt100", 80, 24, 0, 0, &[]).await?;
        channel.request_shell(false).await?;

        let (read_half, write_half) = tokio::io::split(channel.into_stream());
        let shell = ShellReader {
            half: read_half,
            _session: Box::new(session),
        };
        let mut reader = LineReader::new(Box::new(shell) as BoxedReader);
        reader.finish_negotiation();
        let writer: BoxedWriter = Box::new(write_half);

        timeout(self.handshake_timeout, wait_for_banner(&mut reader))
            .await
            .map_err(|_| TesiraError::Timeout)??;

        tracing::debug!("SSH handshake with {}:{} complete", self.address, self.port);
        Ok(Link { reader, writer })
    }
}

impl Connector for SshConnector {
    fn connect<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Link>> {
        Box::pin(self.open(credentials))
    }
}

/// Password first, then keyboard-interactive; false when both are refused
async fn authenticate(session: &mut client::Handle<TrustAnyHost>, credentials: &Credentials) -> Result<bool> {
    if session
        .authenticate_password(credentials.username.as_str(), credentials.password.as_str())
        .await?
    {
        return Ok(true);
    }

    tracing::debug!(
        "Password login for {} refused, trying keyboard-interactive",
        credentials.username
    );
    let mut response = session
        .authenticate_keyboard_interactive_start(credentials.username.as_str(), None::<String>)
        .await?;

    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers = interactive_answers(prompts.len(), &credentials.password);
                response = session.authenticate_keyboard_interactive_respond(answers).await?;
            }
            _ => return Ok(false),
        }
    }
    Ok(false)
}

/// Every keyboard-interactive prompt is answered with the password
fn interactive_answers(prompts: usize, password: &str) -> Vec<String> {
    vec![password.to_string(); prompts]
}

/// Read until the welcome banner, leaving it buffered
async fn wait_for_banner(reader: &mut LineReader<BoxedReader>) -> Result<()> {
    loop {
        if reader.discard_before(WELCOME_BANNER) {
            return Ok(());
        }
        if reader.fill().await? == 0 {
            return Err(TesiraError::ConnectionClosed);
        }
    }
}
