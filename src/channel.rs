//! Indexed channels of a control block.
//!
//! Channels cache the last known device values and publish a
//! [`ChannelEvent`] for every applied change. Writes only queue a command;
//! the cached value moves once the device confirms it, either through the
//! `+OK` of the `set` or through a subscription notification.

use crate::connection::Outbox;
use crate::error::{Result, TesiraError};
use crate::protocol::{AttributeCode, CommandLine, CommandValue, ParsedCommand, Verb};
use crate::subscription::EventReceiver;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Smallest level change a notification must carry to be applied (dB)
pub const LEVEL_THRESHOLD: f64 = 0.1;

const LEVEL_EPSILON: f64 = 1e-9;

const EVENT_CAPACITY: usize = 64;

/// Change published by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Level or gain in dB, with the 0-100 volume it maps to
    LevelChanged { level: f64, percent: u16 },
    MuteChanged(bool),
    BoundsChanged { min: f64, max: f64 },
    LabelChanged(String),
    StateChanged(bool),
}

/// Capability set of an I/O channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Level control: level, mute, bounds, label
    Level,
    /// Mute control: mute only
    Mute,
    /// Input and Dante input: level, mute, bounds
    Input,
    /// AEC input: gain only, fixed 0..66 dB range
    AecInput,
}

impl ChannelKind {
    pub fn supports_level(&self) -> bool {
        !matches!(self, ChannelKind::Mute)
    }

    pub fn supports_mute(&self) -> bool {
        !matches!(self, ChannelKind::AecInput)
    }

    /// Attribute that carries this channel's level
    pub fn level_attribute(&self) -> AttributeCode {
        match self {
            ChannelKind::AecInput => AttributeCode::Gain,
            _ => AttributeCode::Level,
        }
    }

    fn fixed_bounds(&self) -> Option<(f64, f64)> {
        match self {
            ChannelKind::AecInput => Some((0.0, 66.0)),
            _ => None,
        }
    }

    /// Per-channel queries sent whenever the block learns its shape
    fn queries(&self) -> &'static [AttributeCode] {
        match self {
            ChannelKind::Level => &[
                AttributeCode::Mute,
                AttributeCode::MinLevel,
                AttributeCode::MaxLevel,
                AttributeCode::Level,
                AttributeCode::Label,
            ],
            ChannelKind::Mute => &[AttributeCode::Mute],
            ChannelKind::Input => &[
                AttributeCode::Mute,
                AttributeCode::MinLevel,
                AttributeCode::MaxLevel,
                AttributeCode::Level,
            ],
            ChannelKind::AecInput => &[AttributeCode::Gain],
        }
    }
}

/// Linear map of `value` from one range onto another
pub fn scale_range(value: f64, from_min: f64, from_max: f64, to_min: f64, to_max: f64) -> f64 {
    if (from_max - from_min).abs() < f64::EPSILON {
        return to_min;
    }
    to_min + (value - from_min) * (to_max - to_min) / (from_max - from_min)
}

/// Volume surface consumed by UI layers
pub trait VolumeControl {
    fn name(&self) -> String;

    fn supports_level(&self) -> bool;

    fn supports_mute(&self) -> bool;

    /// Level in dB (minimum until the device reported one)
    fn level(&self) -> f64;

    fn min_level(&self) -> f64;

    fn max_level(&self) -> f64;

    fn set_level(&self, level: f64) -> Result<()>;

    fn muted(&self) -> bool;

    fn set_mute(&self, mute: bool) -> Result<()>;

    fn mute(&self) -> Result<()> {
        self.set_mute(true)
    }

    fn unmute(&self) -> Result<()> {
        self.set_mute(false)
    }

    /// Level scaled onto 0-100 between the channel's bounds
    fn volume_percent(&self) -> u16 {
        let percent = scale_range(self.level(), self.min_level(), self.max_level(), 0.0, 100.0);
        percent.round().clamp(0.0, 100.0) as u16
    }

    fn set_volume_percent(&self, percent: u16) -> Result<()> {
        let percent = f64::from(percent.min(100));
        self.set_level(scale_range(percent, 0.0, 100.0, self.min_level(), self.max_level()))
    }

    fn set_default_volume(&self) -> Result<()> {
        self.set_volume_percent(50)
    }
}

/// Behaviour shared by every channel type
pub trait BlockChannel: Send + Sync {
    fn index(&self) -> u32;

    /// Queue the channel's state queries
    fn query(&self);

    /// Apply a get response or set acknowledgement addressed to this channel
    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>);
}

/// Channels of one block keyed by 1-based index
pub struct ChannelSet<C> {
    instance_tag: String,
    channels: Mutex<BTreeMap<u32, Arc<C>>>,
}

impl<C: BlockChannel> ChannelSet<C> {
    pub fn new(instance_tag: impl Into<String>) -> Self {
        Self {
            instance_tag: instance_tag.into(),
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, Arc<C>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create missing channels 1..=count and return all of them
    pub fn ensure(&self, count: u32, create: impl Fn(u32) -> C) -> Vec<Arc<C>> {
        let mut channels = self.lock();
        for index in 1..=count {
            channels.entry(index).or_insert_with(|| Arc::new(create(index)));
        }
        channels.values().cloned().collect()
    }

    /// Channel `index`, or `ChannelOutOfRange`
    pub fn get(&self, index: u32) -> Result<Arc<C>> {
        match self.lock().get(&index) {
            Some(channel) => Ok(channel.clone()),
            None => {
                tracing::error!("{}: no channel {}", self.instance_tag, index);
                Err(TesiraError::ChannelOutOfRange {
                    instance_tag: self.instance_tag.clone(),
                    index,
                })
            }
        }
    }

    pub fn all(&self) -> Vec<Arc<C>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> u32 {
        self.lock().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hand a channel-addressed response to its channel
    ///
    /// Returns false when the command does not start with a channel index.
    pub fn route(&self, command: &ParsedCommand, payload: Option<&Value>) -> bool {
        let Some(index) = command.index() else {
            return false;
        };
        let channel = self.lock().get(&index).cloned();
        match channel {
            Some(channel) => channel.handle_response(command, payload),
            None => tracing::warn!(
                "{}: response for unknown channel {}: {}",
                self.instance_tag,
                index,
                command
            ),
        }
        true
    }
}

fn value_field(payload: Option<&Value>) -> Option<&Value> {
    payload.and_then(|p| p.get("value"))
}

/// Value written by a `set` command: the argument after the channel index
fn set_argument(command: &ParsedCommand) -> Option<&str> {
    command.args.get(1).map(String::as_str)
}

#[derive(Debug, Default)]
struct IoState {
    level: Option<f64>,
    min_level: f64,
    max_level: f64,
    mute: bool,
    label: Option<String>,
}

/// A level, mute, input or AEC input channel
pub struct IoChannel {
    instance_tag: String,
    index: u32,
    kind: ChannelKind,
    outbox: Outbox,
    state: Mutex<IoState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl IoChannel {
    pub(crate) fn new(instance_tag: impl Into<String>, index: u32, kind: ChannelKind, outbox: Outbox) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (min_level, max_level) = kind.fixed_bounds().unwrap_or((0.0, 0.0));
        Self {
            instance_tag: instance_tag.into(),
            index,
            kind,
            outbox,
            state: Mutex::new(IoState {
                min_level,
                max_level,
                ..Default::default()
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn instance_tag(&self) -> &str {
        &self.instance_tag
    }

    /// Last level reported by the device
    pub fn current_level(&self) -> Option<f64> {
        self.lock().level
    }

    pub fn label(&self) -> Option<String> {
        self.lock().label.clone()
    }

    /// Subscribe to this channel's changes
    pub fn events(&self) -> EventReceiver<ChannelEvent> {
        EventReceiver::new(self.events.subscribe())
    }

    fn emit(&self, event: ChannelEvent) {
        tracing::debug!("{} channel {}: {:?}", self.instance_tag, self.index, event);
        let _ = self.events.send(event);
    }

    fn unsupported(&self, capability: &'static str) -> TesiraError {
        TesiraError::UnsupportedCapability {
            instance_tag: self.instance_tag.clone(),
            channel: self.index,
            capability,
        }
    }

    /// Toggle the mute state
    pub fn toggle_mute(&self) -> Result<()> {
        self.set_mute(!self.muted())
    }

    /// Apply a pushed level; ignored below [`LEVEL_THRESHOLD`]
    pub(crate) fn push_level(&self, level: f64) {
        self.update_level(level, LEVEL_THRESHOLD);
    }

    pub(crate) fn push_mute(&self, mute: bool) {
        let changed = {
            let mut state = self.lock();
            let changed = state.mute != mute;
            state.mute = mute;
            changed
        };
        if changed {
            self.emit(ChannelEvent::MuteChanged(mute));
        }
    }

    fn update_level(&self, level: f64, threshold: f64) {
        let applied = {
            let mut state = self.lock();
            let apply = match state.level {
                None => true,
                Some(current) if threshold > 0.0 => (current - level).abs() + LEVEL_EPSILON >= threshold,
                Some(current) => current != level,
            };
            if apply {
                state.level = Some(level);
            }
            apply
        };
        if applied {
            let percent = self.volume_percent();
            self.emit(ChannelEvent::LevelChanged { level, percent });
        }
    }

    fn update_bounds(&self, min: Option<f64>, max: Option<f64>) {
        if self.kind.fixed_bounds().is_some() {
            return;
        }
        let changed = {
            let mut state = self.lock();
            let before = (state.min_level, state.max_level);
            if let Some(min) = min {
                state.min_level = min;
            }
            if let Some(max) = max {
                state.max_level = max;
            }
            (before != (state.min_level, state.max_level)).then_some((state.min_level, state.max_level))
        };
        if let Some((min, max)) = changed {
            self.emit(ChannelEvent::BoundsChanged { min, max });
        }
    }

    fn update_label(&self, label: String) {
        let changed = {
            let mut state = self.lock();
            let changed = state.label.as_deref() != Some(label.as_str());
            state.label = Some(label.clone());
            changed
        };
        if changed {
            self.emit(ChannelEvent::LabelChanged(label));
        }
    }

    fn apply_get(&self, attribute: AttributeCode, value: &Value) {
        match attribute {
            AttributeCode::Level | AttributeCode::Gain => match value.as_f64() {
                Some(level) => self.update_level(level, 0.0),
                None => self.bad_value(attribute, value),
            },
            AttributeCode::MinLevel => match value.as_f64() {
                Some(min) => self.update_bounds(Some(min), None),
                None => self.bad_value(attribute, value),
            },
            AttributeCode::MaxLevel => match value.as_f64() {
                Some(max) => self.update_bounds(None, Some(max)),
                None => self.bad_value(attribute, value),
            },
            AttributeCode::Mute => match value.as_bool() {
                Some(mute) => self.push_mute(mute),
                None => self.bad_value(attribute, value),
            },
            AttributeCode::Label => match value.as_str() {
                Some(label) => self.update_label(label.to_string()),
                None => self.bad_value(attribute, value),
            },
            other => tracing::debug!("{} channel {}: ignoring {}", self.instance_tag, self.index, other),
        }
    }

    fn apply_set(&self, attribute: AttributeCode, written: &str) {
        match attribute {
            AttributeCode::Level | AttributeCode::Gain => {
                if let Ok(level) = written.parse::<f64>() {
                    self.update_level(level, 0.0);
                }
            }
            AttributeCode::Mute => {
                if let Ok(mute) = written.parse::<bool>() {
                    self.push_mute(mute);
                }
            }
            AttributeCode::Label => self.update_label(written.to_string()),
            _ => {}
        }
    }

    fn bad_value(&self, attribute: AttributeCode, value: &Value) {
        tracing::error!(
            "{} channel {}: could not parse {} value from {}",
            self.instance_tag,
            self.index,
            attribute,
            value
        );
    }
}

impl BlockChannel for IoChannel {
    fn index(&self) -> u32 {
        self.index
    }

    fn query(&self) {
        for attribute in self.kind.queries() {
            let command = CommandLine::get(&self.instance_tag, *attribute).with_index(self.index);
            if let Err(e) = self.outbox.send_command(&command) {
                tracing::warn!("{}: could not query {}: {}", self.instance_tag, command, e);
            }
        }
    }

    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>) {
        let Some(attribute) = command.attribute else {
            return;
        };
        match command.verb {
            Some(Verb::Get) => match value_field(payload) {
                Some(value) => self.apply_get(attribute, value),
                None => tracing::debug!("{}: no value in response to {}", self.instance_tag, command),
            },
            Some(Verb::Set) if payload.is_none() => {
                if let Some(written) = set_argument(command) {
                    self.apply_set(attribute, written);
                }
            }
            _ => {}
        }
    }
}

impl VolumeControl for IoChannel {
    fn name(&self) -> String {
        match self.label() {
            Some(label) if !label.is_empty() => label,
            _ if self.kind == ChannelKind::Level => format!("{} Level {}", self.instance_tag, self.index),
            _ => format!("{} {}", self.instance_tag, self.index),
        }
    }

    fn supports_level(&self) -> bool {
        self.kind.supports_level()
    }

    fn supports_mute(&self) -> bool {
        self.kind.supports_mute()
    }

    fn level(&self) -> f64 {
        let state = self.lock();
        state.level.unwrap_or(state.min_level)
    }

    fn min_level(&self) -> f64 {
        self.lock().min_level
    }

    fn max_level(&self) -> f64 {
        self.lock().max_level
    }

    fn set_level(&self, level: f64) -> Result<()> {
        if !self.kind.supports_level() {
            return Err(self.unsupported("level"));
        }
        let command = CommandLine::set(&self.instance_tag, self.kind.level_attribute())
            .with_index(self.index)
            .with_value(CommandValue::Level(level));
        self.outbox.send_command(&command)
    }

    fn muted(&self) -> bool {
        self.lock().mute
    }

    fn set_mute(&self, mute: bool) -> Result<()> {
        if !self.kind.supports_mute() {
            return Err(self.unsupported("mute"));
        }
        let command = CommandLine::set(&self.instance_tag, AttributeCode::Mute)
            .with_index(self.index)
            .with_value(CommandValue::Bool(mute));
        self.outbox.send_command(&command)
    }
}

#[derive(Debug, Default)]
struct LogicState {
    state: bool,
    label: String,
}

/// One logic state channel
pub struct LogicStateChannel {
    instance_tag: String,
    index: u32,
    outbox: Outbox,
    state: Mutex<LogicState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl LogicStateChannel {
    pub(crate) fn new(instance_tag: impl Into<String>, index: u32, outbox: Outbox) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            instance_tag: instance_tag.into(),
            index,
            outbox,
            state: Mutex::new(LogicState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogicState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> bool {
        self.lock().state
    }

    pub fn label(&self) -> String {
        self.lock().label.clone()
    }

    pub fn set_state(&self, state: bool) -> Result<()> {
        let command = CommandLine::set(&self.instance_tag, AttributeCode::State)
            .with_index(self.index)
            .with_value(CommandValue::Bool(state));
        self.outbox.send_command(&command)
    }

    pub fn events(&self) -> EventReceiver<ChannelEvent> {
        EventReceiver::new(self.events.subscribe())
    }

    fn update_state(&self, state: bool) {
        let changed = {
            let mut current = self.lock();
            let changed = current.state != state;
            current.state = state;
            changed
        };
        if changed {
            let _ = self.events.send(ChannelEvent::StateChanged(state));
        }
    }

    fn update_label(&self, label: String) {
        let changed = {
            let mut current = self.lock();
            let changed = current.label != label;
            current.label = label.clone();
            changed
        };
        if changed {
            let _ = self.events.send(ChannelEvent::LabelChanged(label));
        }
    }
}

impl BlockChannel for LogicStateChannel {
    fn index(&self) -> u32 {
        self.index
    }

    fn query(&self) {
        for attribute in [AttributeCode::Label, AttributeCode::State] {
            let command = CommandLine::get(&self.instance_tag, attribute).with_index(self.index);
            if let Err(e) = self.outbox.send_command(&command) {
                tracing::warn!("{}: could not query {}: {}", self.instance_tag, command, e);
            }
        }
    }

    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>) {
        match (command.verb, command.attribute) {
            (Some(Verb::Get), Some(AttributeCode::State)) => {
                if let Some(state) = value_field(payload).and_then(Value::as_bool) {
                    self.update_state(state);
                }
            }
            (Some(Verb::Get), Some(AttributeCode::Label)) => {
                if let Some(label) = value_field(payload).and_then(Value::as_str) {
                    self.update_label(label.to_string());
                }
            }
            (Some(Verb::Set), Some(AttributeCode::State)) if payload.is_none() => {
                if let Some(state) = set_argument(command).and_then(|s| s.parse().ok()) {
                    self.update_state(state);
                }
            }
            _ => {}
        }
    }
}
