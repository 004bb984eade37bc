use crate::config::ClientConfig;
use crate::error::{Result, TesiraError};
use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::protocol::{CommandLine, TERMINATION_LINE, VERBOSE_COMMAND, WELCOME_BANNER};
use crate::transport::{write_line, Connector, Credentials, Link};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Query sent when the link has been idle for the keep-alive interval
const KEEP_ALIVE_COMMAND: &str = "SESSION get verbose";

/// Session connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    AttemptingConnection,
    Connected,
}

/// Receives everything the session produces
///
/// Both methods run on the session's reader or worker task and must not
/// block. No session lock is held while they run, so handlers may queue
/// commands through an [`Outbox`].
pub trait SessionHandler: Send + Sync + 'static {
    fn on_message(&self, message: Message);
    fn on_status_change(&self, status: ConnectionStatus);
}

struct StatusState {
    current: ConnectionStatus,
    reported: ConnectionStatus,
}

struct Shared {
    pipeline: Mutex<Pipeline>,
    status: Mutex<StatusState>,
    farewell: AtomicBool,
}

impl Shared {
    fn new(stall_threshold: u32) -> Self {
        Self {
            pipeline: Mutex::new(Pipeline::new(stall_threshold)),
            status: Mutex::new(StatusState {
                current: ConnectionStatus::Disconnected,
                reported: ConnectionStatus::Disconnected,
            }),
            farewell: AtomicBool::new(false),
        }
    }

    fn pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> ConnectionStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).current
    }

    /// Record a status change and report it when it is news to the handler
    ///
    /// A failed attempt (AttemptingConnection → Disconnected) is not
    /// reported unless `force` is set.
    fn transition(&self, handler: &dyn SessionHandler, status: ConnectionStatus, force: bool) {
        let report = {
            let mut state = self.status.lock().unwrap_or_else(|e| e.into_inner());
            let previous = state.current;
            state.current = status;

            let failed_attempt = previous == ConnectionStatus::AttemptingConnection
                && status == ConnectionStatus::Disconnected;
            if state.reported == status || (failed_attempt && !force) {
                false
            } else {
                state.reported = status;
                true
            }
        };

        if report {
            tracing::info!("Connection status changed to {:?}", status);
            handler.on_status_change(status);
        }
    }
}

/// Queues commands on a session
///
/// Cheap to clone; blocks and channels each hold one.
#[derive(Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

impl Outbox {
    /// Queue a raw command line
    ///
    /// Returns [`TesiraError::NotConnected`] without queueing when the
    /// session is not connected.
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        if !self.is_connected() {
            return Err(TesiraError::NotConnected);
        }
        let line = line.into();
        tracing::debug!("Queued: {}", line);
        self.shared.pipeline().enqueue(line);
        Ok(())
    }

    /// Queue a formatted command
    pub fn send_command(&self, command: &CommandLine) -> Result<()> {
        self.send(command.to_string())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status() == ConnectionStatus::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Outbox with no session behind it; every send fails with `NotConnected`
    pub fn detached() -> Self {
        Self {
            shared: Arc::new(Shared::new(crate::pipeline::DEFAULT_STALL_THRESHOLD)),
        }
    }

    /// Outbox that accepts sends, for exercising blocks without a device
    #[cfg(test)]
    pub(crate) fn connected_for_test() -> Self {
        let outbox = Self::detached();
        outbox.shared.status.lock().unwrap().current = ConnectionStatus::Connected;
        outbox
    }

    /// Lines queued so far, removing them
    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<String> {
        self.shared.pipeline().drain_outgoing()
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One persistent logical session to a device
///
/// [`start`](Session::start) spawns a worker that connects, logs in, and
/// keeps reconnecting until [`disconnect`](Session::disconnect) or
/// [`shutdown`](Session::shutdown).
pub struct Session {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Session {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new(Shared::new(config.stall_threshold));
        Self {
            config,
            connector,
            shared,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the connection worker
    ///
    /// Does nothing (besides a warning) while a worker is already running.
    pub fn start(&self, handler: Arc<dyn SessionHandler>) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::warn!("{}: connect requested while already running", self.config.name);
            return;
        }

        self.shared.farewell.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let task = SessionTask {
            config: self.config.clone(),
            connector: self.connector.clone(),
            shared: self.shared.clone(),
            handler,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());
        *worker = Some(Worker { cancel, handle });
    }

    /// Stop the worker and drop the link
    ///
    /// Idempotent. Cancels any pending retry wait.
    pub fn disconnect(&self) {
        if let Some(worker) = self.take_worker() {
            tracing::info!("{}: disconnecting", self.config.name);
            worker.cancel.cancel();
        }
    }

    /// Write the termination line, close the link and wait for the worker
    pub async fn shutdown(&self) {
        let Some(worker) = self.take_worker() else {
            return;
        };
        tracing::info!("{}: shutting down", self.config.name);
        self.shared.farewell.store(true, Ordering::SeqCst);
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            tracing::error!("{}: session worker failed: {}", self.config.name, e);
        }
    }

    fn take_worker(&self) -> Option<Worker> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Queue a raw command line
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        self.outbox().send(line)
    }

    pub fn outbox(&self) -> Outbox {
        Outbox {
            shared: self.shared.clone(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(worker) = self.take_worker() {
            worker.cancel.cancel();
        }
    }
}

struct SessionTask {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    handler: Arc<dyn SessionHandler>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(self) {
        let mut failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            self.set_status(ConnectionStatus::AttemptingConnection, false);

            match self.connect().await {
                Ok(link) => {
                    failures = 0;
                    self.run_link(link).await;
                    self.set_status(ConnectionStatus::Disconnected, false);
                    if !self.pause(self.config.reconnect_delay()).await {
                        break;
                    }
                }
                Err(TesiraError::AuthenticationFailed(reason)) => {
                    tracing::error!(
                        "{}: authentication failed, giving up this attempt: {}",
                        self.config.name,
                        reason
                    );
                    self.set_status(ConnectionStatus::Disconnected, true);
                    if !self.pause(self.config.retry_interval()).await {
                        break;
                    }
                }
                Err(e) => {
                    if failures == 0 {
                        tracing::error!(
                            "{}: could not connect to {}:{}: {}",
                            self.config.name,
                            self.config.address,
                            self.config.port,
                            e
                        );
                    } else {
                        tracing::debug!("{}: connect attempt {} failed: {}", self.config.name, failures + 1, e);
                    }
                    failures += 1;
                    self.set_status(ConnectionStatus::Disconnected, false);
                    if !self.pause(self.config.retry_interval()).await {
                        break;
                    }
                }
            }
        }

        self.set_status(ConnectionStatus::Disconnected, true);
        tracing::debug!("{}: session worker stopped", self.config.name);
    }

    fn set_status(&self, status: ConnectionStatus, force: bool) {
        self.shared.transition(self.handler.as_ref(), status, force);
    }

    /// Sleep unless cancelled first; false means stop
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Connect with the primary credentials, then once with the fallback ones
    async fn connect(&self) -> Result<Link> {
        let primary = Credentials::new(&self.config.username, &self.config.password);
        let fallback = Credentials::new(&self.config.fallback_username, &self.config.fallback_password);

        let first = tokio::select! {
            result = self.connector.connect(&primary) => result,
            _ = self.cancel.cancelled() => return Err(TesiraError::ConnectionClosed),
        };

        match first {
            Err(TesiraError::AuthenticationFailed(reason)) if fallback != primary => {
                tracing::warn!(
                    "{}: login as {} rejected ({}), retrying as {}",
                    self.config.name,
                    primary.username,
                    reason,
                    fallback.username
                );
                if !self.pause(self.config.fallback_delay()).await {
                    return Err(TesiraError::ConnectionClosed);
                }
                tokio::select! {
                    result = self.connector.connect(&fallback) => result,
                    _ = self.cancel.cancelled() => Err(TesiraError::ConnectionClosed),
                }
            }
            other => other,
        }
    }

    /// Pump one live link until it fails or the session is cancelled
    async fn run_link(&self, link: Link) {
        let Link { mut reader, mut writer } = link;
        let link_cancel = self.cancel.child_token();

        let reader_task = {
            let shared = self.shared.clone();
            let handler = self.handler.clone();
            let cancel = link_cancel.clone();
            let name = self.config.name.clone();
            tokio::spawn(async move {
                loop {
                    let line = tokio::select! {
                        line = reader.next_line() => line,
                        _ = cancel.cancelled() => break,
                    };
                    match line {
                        Ok(line) => {
                            tracing::debug!("Rx: {}", line);
                            let handshake = line.contains(WELCOME_BANNER)
                                && shared.status() != ConnectionStatus::Connected;
                            if handshake {
                                tracing::info!("{}: TTP session ready", name);
                                {
                                    let mut pipeline = shared.pipeline();
                                    pipeline.reset();
                                    pipeline.enqueue(VERBOSE_COMMAND);
                                }
                                shared.transition(handler.as_ref(), ConnectionStatus::Connected, false);
                                continue;
                            }
                            let message = shared.pipeline().on_line(&line);
                            if let Some(message) = message {
                                handler.on_message(message);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("{}: read failed: {}", name, e);
                            break;
                        }
                    }
                }
                cancel.cancel();
            })
        };

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let keep_alive = self.config.keep_alive_interval();
        let mut last_write = Instant::now();

        loop {
            tokio::select! {
                _ = link_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.shared.status() != ConnectionStatus::Connected {
                        continue;
                    }
                    let next = {
                        let mut pipeline = self.shared.pipeline();
                        let next = pipeline.poll();
                        if next.is_none() && pipeline.is_idle() && last_write.elapsed() >= keep_alive {
                            tracing::debug!("{}: link idle, queueing keep-alive", self.config.name);
                            pipeline.enqueue(KEEP_ALIVE_COMMAND);
                            last_write = Instant::now();
                        }
                        next
                    };
                    if let Some(line) = next {
                        tracing::debug!("Tx: {}", line);
                        if let Err(e) = write_line(&mut writer, &line).await {
                            tracing::warn!("{}: write failed: {}", self.config.name, e);
                            break;
                        }
                        last_write = Instant::now();
                    }
                }
            }
        }

        if self.shared.farewell.load(Ordering::SeqCst) {
            if let Err(e) = write_line(&mut writer, TERMINATION_LINE).await {
                tracing::debug!("{}: could not send termination line: {}", self.config.name, e);
            }
        }
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("{}: error closing link: {}", self.config.name, e);
        }

        link_cancel.cancel();
        if let Err(e) = reader_task.await {
            tracing::error!("{}: reader task failed: {}", self.config.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BoxedReader, LineReader};
    use futures_util::future::BoxFuture;

    /// Accepts one set of credentials and fails every other attempt
    struct ScriptedConnector {
        accepted: Credentials,
        refusal: fn() -> TesiraError,
        attempts: Mutex<Vec<String>>,
    }

    impl Connector for ScriptedConnector {
        fn connect<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Link>> {
            Box::pin(async move {
                self.attempts.lock().unwrap().push(credentials.username.clone());
                if *credentials != self.accepted {
                    return Err((self.refusal)());
                }
                let (client, _device) = tokio::io::duplex(64);
                let (read_half, write_half) = tokio::io::split(client);
                Ok(Link {
                    reader: LineReader::new(Box::new(read_half) as BoxedReader),
                    writer: Box::new(write_half),
                })
            })
        }
    }

    fn scripted_task(refusal: fn() -> TesiraError) -> (SessionTask, Arc<ScriptedConnector>) {
        let mut config = ClientConfig::new("127.0.0.1").with_credentials("admin", "wrong");
        config.fallback_delay_ms = 1;
        let connector = Arc::new(ScriptedConnector {
            accepted: Credentials::new("default", ""),
            refusal,
            attempts: Mutex::new(Vec::new()),
        });
        let task = SessionTask {
            shared: Arc::new(Shared::new(config.stall_threshold)),
            config,
            connector: connector.clone(),
            handler: Arc::new(Recorder {
                statuses: Mutex::new(Vec::new()),
            }),
            cancel: CancellationToken::new(),
        };
        (task, connector)
    }

    #[tokio::test]
    async fn rejected_login_retries_with_fallback_credentials() {
        let (task, connector) =
            scripted_task(|| TesiraError::AuthenticationFailed("SSH login for admin was rejected".into()));
        assert!(task.connect().await.is_ok());
        assert_eq!(*connector.attempts.lock().unwrap(), vec!["admin", "default"]);
    }

    #[tokio::test]
    async fn transport_fault_skips_fallback() {
        let (task, connector) = scripted_task(|| TesiraError::Timeout);
        assert!(matches!(task.connect().await, Err(TesiraError::Timeout)));
        assert_eq!(*connector.attempts.lock().unwrap(), vec!["admin"]);
    }

    struct Recorder {
        statuses: Mutex<Vec<ConnectionStatus>>,
    }

    impl SessionHandler for Recorder {
        fn on_message(&self, _message: Message) {}

        fn on_status_change(&self, status: ConnectionStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    #[test]
    fn failed_attempts_are_not_reported() {
        let shared = Shared::new(100);
        let recorder = Recorder {
            statuses: Mutex::new(Vec::new()),
        };

        shared.transition(&recorder, ConnectionStatus::AttemptingConnection, false);
        shared.transition(&recorder, ConnectionStatus::Disconnected, false);
        shared.transition(&recorder, ConnectionStatus::AttemptingConnection, false);
        shared.transition(&recorder, ConnectionStatus::Connected, false);
        shared.transition(&recorder, ConnectionStatus::Disconnected, false);

        assert_eq!(
            *recorder.statuses.lock().unwrap(),
            vec![
                ConnectionStatus::AttemptingConnection,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn forced_disconnect_is_reported_once() {
        let shared = Shared::new(100);
        let recorder = Recorder {
            statuses: Mutex::new(Vec::new()),
        };

        shared.transition(&recorder, ConnectionStatus::AttemptingConnection, false);
        shared.transition(&recorder, ConnectionStatus::Disconnected, true);
        shared.transition(&recorder, ConnectionStatus::Disconnected, true);

        assert_eq!(
            *recorder.statuses.lock().unwrap(),
            vec![
                ConnectionStatus::AttemptingConnection,
                ConnectionStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn outbox_refuses_sends_while_disconnected() {
        let outbox = Outbox::detached();
        assert!(matches!(outbox.send("X get level 1"), Err(TesiraError::NotConnected)));

        let outbox = Outbox::connected_for_test();
        outbox.send("X get level 1").unwrap();
        assert_eq!(outbox.drain(), vec!["X get level 1".to_string()]);
    }
}
