//! Mock Tesira server for session-level testing.
//!
//! [`MockTesira`] listens on a random localhost port and behaves like the
//! TTP service of a Tesira server: optional telnet-style login prompts, the
//! welcome banner, an echo of every command followed by a scripted result,
//! and unsolicited notifications pushed by the test.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tesira_ttp::{ClientConfig, ConnectionStatus, EventReceiver};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

pub const BANNER: &str = "Welcome to the Tesira Text Protocol Server...";

type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

struct MockState {
    login: Option<(String, String)>,
    responder: Responder,
    received: Mutex<Vec<String>>,
    login_attempts: Mutex<Vec<String>>,
    connections: Mutex<usize>,
    kick: watch::Sender<u64>,
    push: broadcast::Sender<String>,
}

/// A scripted Tesira server
pub struct MockTesira {
    port: u16,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockTesira {
    /// Server without a login phase, answering with [`tesira_reply`]
    pub async fn start() -> Self {
        Self::spawn(None, Arc::new(tesira_reply)).await
    }

    /// Server that only accepts `username`/`password`
    pub async fn with_login(username: &str, password: &str) -> Self {
        Self::spawn(Some((username.to_string(), password.to_string())), Arc::new(tesira_reply)).await
    }

    /// Server answering with a custom responder
    pub async fn with_responder(responder: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self::spawn(None, Arc::new(responder)).await
    }

    async fn spawn(login: Option<(String, String)>, responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock Tesira server");
        let port = listener.local_addr().expect("no local address").port();

        let (kick, _) = watch::channel(0);
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            login,
            responder,
            received: Mutex::new(Vec::new()),
            login_attempts: Mutex::new(Vec::new()),
            connections: Mutex::new(0),
            kick,
            push,
        });

        let handle = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    *state.connections.lock().unwrap() += 1;
                    tokio::spawn(serve(stream, state.clone()));
                }
            })
        };

        Self { port, state, handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Client config pointing at this server, with test-friendly timings
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1").with_port(self.port);
        config.name = "mock".to_string();
        config.retry_interval_ms = 100;
        config.fallback_delay_ms = 50;
        config.reconnect_delay_ms = 50;
        config.resubscribe_delay_ms = 200;
        config.connect_timeout_ms = 1_000;
        config.handshake_timeout_ms = 1_000;
        config.poll_interval_ms = 5;
        config
    }

    /// Every command line received so far, across connections
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.received().iter().filter(|l| l.as_str() == line).count()
    }

    pub fn login_attempts(&self) -> Vec<String> {
        self.state.login_attempts.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.state.connections.lock().unwrap()
    }

    /// Close every open connection from the server side
    pub fn drop_connections(&self) {
        self.state.kick.send_modify(|generation| *generation += 1);
    }

    /// Push an unsolicited line to every open connection
    pub fn notify(&self, line: &str) {
        let _ = self.state.push.send(line.to_string());
    }
}

impl Drop for MockTesira {
    fn drop(&mut self) {
        self.handle.abort();
        self.drop_connections();
    }
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut kicked = state.kick.subscribe();
    let mut pushes = state.push.subscribe();

    if let Some((username, password)) = &state.login {
        if writer.write_all(b"login: ").await.is_err() {
            return;
        }
        let Ok(Some(user)) = lines.next_line().await else {
            return;
        };
        if writer.write_all(b"Password: ").await.is_err() {
            return;
        }
        let Ok(Some(pass)) = lines.next_line().await else {
            return;
        };
        state.login_attempts.lock().unwrap().push(user.clone());

        if &user != username || &pass != password {
            let _ = writer.write_all(b"\r\nLogin incorrect\r\nlogin: ").await;
            return;
        }
    }

    if writer.write_all(format!("{}\r\n", BANNER).as_bytes()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    return;
                };
                state.received.lock().unwrap().push(line.clone());
                if line == "exit" {
                    return;
                }
                let reply = format!("{}\r\n{}\r\n", line, (state.responder)(&line));
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
            pushed = pushes.recv() => {
                if let Ok(pushed) = pushed {
                    if writer.write_all(format!("{}\r\n", pushed).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            _ = kicked.changed() => return,
        }
    }
}

/// Answers of a small Tesira configuration
///
/// Every block has four channels at -10 dB, unmuted, ranging -100..12 dB.
pub fn tesira_reply(line: &str) -> String {
    let reply = if line == "DEVICE get networkStatus" {
        "+OK \"value\":{\"schemaVersion\":2 \"hostname\":\"TesiraServer91\" \"defaultGatewayStatus\":\"0.0.0.0\"}"
    } else if line == "SESSION get aliases" {
        "+OK \"value\":[\"Level1\" \"Mute1\" \"Sel1\"]"
    } else if line.ends_with(" get numChannels") {
        "+OK \"value\":4"
    } else if line.ends_with(" get ganged") {
        "+OK \"value\":false"
    } else if line.contains(" get mute ") {
        "+OK \"value\":false"
    } else if line.contains(" get minLevel ") {
        "+OK \"value\":-100.000000"
    } else if line.contains(" get maxLevel ") {
        "+OK \"value\":12.000000"
    } else if line.contains(" get level ") {
        "+OK \"value\":-10.000000"
    } else if line.contains(" get label ") {
        "+OK \"value\":\"\""
    } else {
        "+OK"
    };
    reply.to_string()
}

/// Poll `check` until it holds, panicking after a few seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Receive statuses until `expected` shows up
pub async fn wait_for_status(statuses: &mut EventReceiver<ConnectionStatus>, expected: ConnectionStatus) {
    timeout(Duration::from_secs(5), async {
        loop {
            match statuses.recv().await {
                Ok(status) if status == expected => return,
                Ok(_) => continue,
                Err(e) => panic!("status stream failed: {}", e),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected));
}
