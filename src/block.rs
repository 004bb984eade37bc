use crate::connection::Outbox;
use crate::error::Result;
use crate::message::Message;
use crate::protocol::{AttributeCode, CommandLine, ParsedCommand};
use crate::subscription::{EventReceiver, SubscriptionSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// DSP block types the driver knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    LevelControl,
    MuteControl,
    /// Enumerated only, no implementation
    Dialer,
    LogicState,
    SourceSelector,
    Input,
    DanteInput,
    AecInput,
}

/// Block lifecycle, restarted on every connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    Created,
    /// Shape queries sent, waiting for the answers
    Initializing,
    /// Shape known, channels created
    Initialized,
    /// Traffic routed after initialization
    Active,
}

/// Change published by a block
#[derive(Debug, Clone, PartialEq)]
pub enum BlockEvent {
    /// Published once per connect, when the block knows its shape
    Initialized,
    /// A subscribed attribute changed on the device
    AttributeChanged(AttributeCode),
    SourceSelectionChanged(u32),
    /// The device rejected a command addressed to this block
    CommandFailed { command: String, message: String },
}

/// State every block carries, whatever its kind
pub struct BlockCore {
    instance_tag: String,
    kind: BlockKind,
    name: Mutex<Option<String>>,
    state: Mutex<BlockState>,
    subscriptions: Mutex<SubscriptionSet>,
    outbox: Outbox,
    events: broadcast::Sender<BlockEvent>,
}

impl BlockCore {
    pub fn new(kind: BlockKind, instance_tag: impl Into<String>, outbox: Outbox, subscription_rate_ms: u32) -> Self {
        let instance_tag = instance_tag.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            subscriptions: Mutex::new(SubscriptionSet::new(&instance_tag, subscription_rate_ms)),
            instance_tag,
            kind,
            name: Mutex::new(None),
            state: Mutex::new(BlockState::Created),
            outbox,
            events,
        }
    }

    pub fn instance_tag(&self) -> &str {
        &self.instance_tag
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Display name, the instance tag unless one was set
    pub fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.instance_tag.clone())
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap_or_else(|e| e.into_inner()) = Some(name.into());
    }

    pub fn state(&self) -> BlockState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: BlockState) -> BlockState {
        std::mem::replace(&mut *self.state.lock().unwrap_or_else(|e| e.into_inner()), state)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn events(&self) -> EventReceiver<BlockEvent> {
        EventReceiver::new(self.events.subscribe())
    }

    pub fn emit(&self, event: BlockEvent) {
        let _ = self.events.send(event);
    }

    /// Queue `<tag> get <attribute>`
    pub fn query(&self, attribute: AttributeCode) {
        let command = CommandLine::get(&self.instance_tag, attribute);
        if let Err(e) = self.outbox.send_command(&command) {
            tracing::warn!("{}: could not query {}: {}", self.instance_tag, attribute, e);
        }
    }

    pub fn send_command(&self, command: &CommandLine) -> Result<()> {
        self.outbox.send_command(command)
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscriptionSet> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, attribute: AttributeCode) -> String {
        self.subscriptions().subscribe(attribute, &self.outbox)
    }

    pub fn unsubscribe(&self, token: &str) {
        self.subscriptions().unsubscribe(token, &self.outbox);
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions().unsubscribe_all(&self.outbox);
    }

    /// Resend every recorded subscription
    pub fn resubscribe(&self) {
        let subscriptions = self.subscriptions();
        if !subscriptions.is_empty() {
            tracing::debug!("{}: resubscribing {} attributes", self.instance_tag, subscriptions.len());
        }
        subscriptions.resubscribe(&self.outbox);
    }

    pub fn subscribed_attribute(&self, token: &str) -> Option<AttributeCode> {
        self.subscriptions().attribute_for(token)
    }

    pub fn publish_tokens(&self) -> Vec<String> {
        self.subscriptions().tokens().map(str::to_string).collect()
    }

    pub(crate) fn begin_initialization(&self) {
        self.set_state(BlockState::Initializing);
    }

    /// Enter Initialized and publish the event, once per initialization
    pub(crate) fn mark_initialized(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != BlockState::Initializing {
            return;
        }
        *state = BlockState::Initialized;
        drop(state);

        tracing::info!("{:?} block \"{}\" initialized", self.kind, self.name());
        self.emit(BlockEvent::Initialized);
    }

    fn mark_active(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == BlockState::Initialized {
            *state = BlockState::Active;
        }
    }
}

/// A typed DSP block
///
/// Implementors provide the kind-specific parts (shape queries, response and
/// notification handling); routing and lifecycle come from the provided
/// methods.
pub trait ControlBlock: Send + Sync {
    fn core(&self) -> &BlockCore;

    /// Attributes subscribed by [`subscribe`](ControlBlock::subscribe)
    fn subscription_attributes(&self) -> &'static [AttributeCode];

    /// Queue the queries that reveal the block's shape
    fn query_shape(&self);

    /// Get response (with payload) or set acknowledgement (without)
    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>);

    /// Notification for a subscribed attribute
    fn handle_notification(&self, attribute: AttributeCode, data: &Value);

    fn instance_tag(&self) -> &str {
        self.core().instance_tag()
    }

    fn kind(&self) -> BlockKind {
        self.core().kind()
    }

    fn state(&self) -> BlockState {
        self.core().state()
    }

    fn events(&self) -> EventReceiver<BlockEvent> {
        self.core().events()
    }

    /// Restart the lifecycle and query the block's shape
    fn initialize(&self) {
        tracing::debug!("{}: initializing", self.instance_tag());
        self.core().begin_initialization();
        self.query_shape();
    }

    /// Subscribe the block's change notifications
    fn subscribe(&self) {
        for attribute in self.subscription_attributes() {
            self.core().subscribe(*attribute);
        }
    }

    fn unsubscribe(&self) {
        self.core().unsubscribe_all();
    }

    /// Deliver a message addressed to this block
    fn route(&self, message: &Message) {
        let core = self.core();
        let was_initialized = core.state() == BlockState::Initialized;

        match message {
            Message::Notification { publish_token, .. } => {
                let Some(attribute) = core.subscribed_attribute(publish_token) else {
                    tracing::debug!("{}: not subscribed to {}", core.instance_tag(), publish_token);
                    return;
                };
                let Some(data) = message.parse_payload() else {
                    return;
                };
                tracing::debug!("{}: notification {} = {}", core.instance_tag(), attribute, data);
                self.handle_notification(attribute, &data);
                core.emit(BlockEvent::AttributeChanged(attribute));
            }
            Message::ErrorResponse { command, message: error } => {
                tracing::error!("{}: \"{}\" failed: {}", core.instance_tag(), command, error);
                core.emit(BlockEvent::CommandFailed {
                    command: command.line.clone(),
                    message: error.clone(),
                });
            }
            Message::Acknowledged { command } => self.handle_response(command, None),
            Message::AcknowledgedWithPayload { command, .. } => {
                let Some(data) = message.parse_payload() else {
                    return;
                };
                tracing::debug!("{}: {} = {}", core.instance_tag(), command, data);
                self.handle_response(command, Some(&data));
            }
        }

        if was_initialized {
            core.mark_active();
        }
    }
}
