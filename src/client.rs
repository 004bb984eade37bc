use crate::block::BlockKind;
use crate::config::{ClientConfig, TransportKind};
use crate::connection::{ConnectionStatus, Outbox, Session, SessionHandler};
use crate::error::Result;
use crate::message::Message;
use crate::protocol::{AttributeCode, CommandLine, CommandValue, Verb, DEVICE_TAG, SESSION_TAG};
use crate::registry::{Block, BlockRegistry};
use crate::ssh::SshConnector;
use crate::subscription::{DeferredTask, EventReceiver};
use crate::transport::{Connector, TelnetConnector};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

const STATUS_CAPACITY: usize = 16;
const MESSAGE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct DeviceInfo {
    aliases: Vec<String>,
    network_status: Option<Value>,
}

/// Session callbacks: routes messages and restarts blocks on every connect
struct ClientInner {
    name: String,
    resubscribe_delay: Duration,
    registry: Arc<BlockRegistry>,
    outbox: Outbox,
    status_tx: broadcast::Sender<ConnectionStatus>,
    message_tx: broadcast::Sender<Message>,
    device: Mutex<DeviceInfo>,
    resubscribe: Mutex<Option<DeferredTask>>,
}

impl ClientInner {
    fn new(config: &ClientConfig, outbox: Outbox) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (message_tx, _) = broadcast::channel(MESSAGE_CAPACITY);
        Self {
            name: config.name.clone(),
            resubscribe_delay: config.resubscribe_delay(),
            registry: Arc::new(BlockRegistry::new(outbox.clone(), config.subscription_rate_ms)),
            outbox,
            status_tx,
            message_tx,
            device: Mutex::new(DeviceInfo::default()),
            resubscribe: Mutex::new(None),
        }
    }

    fn device(&self) -> MutexGuard<'_, DeviceInfo> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn replace_resubscribe(&self, task: Option<DeferredTask>) {
        let previous = std::mem::replace(&mut *self.resubscribe.lock().unwrap_or_else(|e| e.into_inner()), task);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn on_connected(&self) {
        for command in [
            CommandLine::get(DEVICE_TAG, AttributeCode::NetworkStatus),
            CommandLine::get(SESSION_TAG, AttributeCode::Aliases),
        ] {
            if let Err(e) = self.outbox.send_command(&command) {
                tracing::warn!("{}: could not send {}: {}", self.name, command, e);
            }
        }

        self.registry.initialize_all();

        let registry = self.registry.clone();
        let task = DeferredTask::schedule(self.resubscribe_delay, move || {
            tracing::debug!("Resubscribing {} blocks", registry.len());
            registry.resubscribe_all();
        });
        self.replace_resubscribe(Some(task));
    }

    /// Responses to `DEVICE` and `SESSION` commands
    fn handle_device_message(&self, message: &Message) {
        if let Message::ErrorResponse { command, message: error } = message {
            tracing::error!("{}: \"{}\" failed: {}", self.name, command, error);
            return;
        }

        let value = message.parse_payload().and_then(|p| p.get("value").cloned());
        match (message.verb(), message.attribute(), value) {
            (Some(Verb::Get), Some(AttributeCode::NetworkStatus), Some(status)) => {
                tracing::debug!("{}: network status {}", self.name, status);
                self.device().network_status = Some(status);
            }
            (Some(Verb::Get), Some(AttributeCode::Aliases), Some(Value::Array(aliases))) => {
                let aliases: Vec<String> = aliases
                    .iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect();
                tracing::info!("{}: device reports {} aliases", self.name, aliases.len());
                self.device().aliases = aliases;
            }
            (Some(Verb::RecallPreset | Verb::RecallPresetByName), _, _) => {
                tracing::info!("{}: preset recalled", self.name);
            }
            _ => {
                if let Some(command) = message.command() {
                    tracing::debug!("{}: {} acknowledged", self.name, command);
                }
            }
        }
    }
}

impl SessionHandler for ClientInner {
    fn on_message(&self, message: Message) {
        let tag = message.instance_tag();
        let routed = if tag == DEVICE_TAG || tag == SESSION_TAG {
            self.handle_device_message(&message);
            true
        } else {
            self.registry.route(&message)
        };

        if !routed && !matches!(message, Message::Notification { .. }) {
            tracing::warn!("{}: no block for response to \"{}\"", self.name, message.command().map(|c| c.line.as_str()).unwrap_or(""));
        }
        let _ = self.message_tx.send(message);
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => self.on_connected(),
            ConnectionStatus::Disconnected => self.replace_resubscribe(None),
            ConnectionStatus::AttemptingConnection => {}
        }
        let _ = self.status_tx.send(status);
    }
}

/// Client for one Biamp Tesira DSP
///
/// The `TesiraClient` keeps a TTP session to the device alive, owns the
/// block registry and re-initializes every registered block each time the
/// session (re)connects.
pub struct TesiraClient {
    inner: Arc<ClientInner>,
    session: Session,
}

impl TesiraClient {
    /// Create a client using the transport named in the config
    ///
    /// Nothing is connected until [`connect`](TesiraClient::connect) is
    /// called.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tesira_ttp::{BlockKind, ClientConfig, TesiraClient};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = TesiraClient::new(ClientConfig::new("192.168.1.50"))?;
    ///     let level = client.register_block(BlockKind::LevelControl, "Level1")?;
    ///     level.subscribe();
    ///     client.connect();
    ///     Ok(())
    /// }
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector: Arc<dyn Connector> = match config.transport {
            TransportKind::Telnet => Arc::new(TelnetConnector::from_config(&config)),
            TransportKind::Ssh => Arc::new(SshConnector::from_config(&config)),
        };
        Self::with_connector(config, connector)
    }

    /// Create a client over a custom transport
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let session = Session::new(config.clone(), connector);
        let inner = Arc::new(ClientInner::new(&config, session.outbox()));
        Ok(Self { inner, session })
    }

    /// Start connecting; reconnects automatically until disconnected
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        self.session.start(self.inner.clone());
    }

    /// Drop the session without the termination line
    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    /// Say goodbye to the device and stop the session
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Subscribe to connection status changes
    pub fn subscribe_status(&self) -> EventReceiver<ConnectionStatus> {
        EventReceiver::new(self.inner.status_tx.subscribe())
    }

    /// Subscribe to every classified message from the device
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tesira_ttp::{ClientConfig, TesiraClient};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = TesiraClient::new(ClientConfig::new("192.168.1.50"))?;
    ///     let mut messages = client.subscribe_messages();
    ///     client.connect();
    ///
    ///     while let Ok(message) = messages.recv().await {
    ///         println!("{:?}", message);
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe_messages(&self) -> EventReceiver<Message> {
        EventReceiver::new(self.inner.message_tx.subscribe())
    }

    /// Queue a raw command line
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        self.session.send(line)
    }

    pub fn send_command(&self, command: &CommandLine) -> Result<()> {
        self.inner.outbox.send_command(command)
    }

    /// `DEVICE recallPreset <id>`
    pub fn recall_preset(&self, id: u32) -> Result<()> {
        tracing::info!("{}: recalling preset {}", self.inner.name, id);
        let command = CommandLine::new(DEVICE_TAG, Verb::RecallPreset).with_value(CommandValue::Int(i64::from(id)));
        self.send_command(&command)
    }

    /// `DEVICE recallPresetByName "<name>"`
    pub fn recall_preset_by_name(&self, name: &str) -> Result<()> {
        tracing::info!("{}: recalling preset \"{}\"", self.inner.name, name);
        let command =
            CommandLine::new(DEVICE_TAG, Verb::RecallPresetByName).with_value(CommandValue::Text(name.to_string()));
        self.send_command(&command)
    }

    /// Register a block; see [`BlockRegistry::register`]
    pub fn register_block(&self, kind: BlockKind, instance_tag: impl Into<String>) -> Result<Block> {
        self.inner.registry.register(kind, instance_tag)
    }

    pub fn block(&self, instance_tag: &str) -> Option<Block> {
        self.inner.registry.lookup(instance_tag)
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.registry.blocks()
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.inner.registry
    }

    /// Instance tags the device reported for the loaded configuration
    pub fn aliases(&self) -> Vec<String> {
        self.inner.device().aliases.clone()
    }

    /// Last `DEVICE get networkStatus` answer
    pub fn network_status(&self) -> Option<Value> {
        self.inner.device().network_status.clone()
    }
}
