use super::{value_of, IoChannels};
use crate::block::{BlockCore, ControlBlock};
use crate::channel::{ChannelKind, IoChannel};
use crate::error::Result;
use crate::protocol::{AttributeCode, ParsedCommand};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Level control block: gain and mute per channel, optionally ganged
pub struct LevelControlBlock {
    core: BlockCore,
    channels: IoChannels,
    ganged: AtomicBool,
}

impl LevelControlBlock {
    pub(crate) fn new(core: BlockCore) -> Self {
        let channels = IoChannels::new(core.instance_tag(), ChannelKind::Level);
        Self {
            core,
            channels,
            ganged: AtomicBool::new(false),
        }
    }

    /// Channel `index` (1-based)
    pub fn channel(&self, index: u32) -> Result<Arc<IoChannel>> {
        self.channels.set().get(index)
    }

    pub fn channels(&self) -> Vec<Arc<IoChannel>> {
        self.channels.set().all()
    }

    pub fn number_of_channels(&self) -> u32 {
        self.channels.set().len()
    }

    /// Whether the block's faders move together
    pub fn ganged(&self) -> bool {
        self.ganged.load(Ordering::SeqCst)
    }
}

impl ControlBlock for LevelControlBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn subscription_attributes(&self) -> &'static [AttributeCode] {
        &[AttributeCode::Levels, AttributeCode::Mutes]
    }

    fn query_shape(&self) {
        self.core.query(AttributeCode::NumChannels);
        self.core.query(AttributeCode::Ganged);
    }

    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>) {
        if self.channels.set().route(command, payload) || !command.is_block_get() {
            return;
        }
        let Some(value) = value_of(payload) else {
            return;
        };
        match command.attribute {
            Some(AttributeCode::NumChannels) => self.channels.learn_count(&self.core, value),
            Some(AttributeCode::Ganged) => match value.as_bool() {
                Some(ganged) => self.ganged.store(ganged, Ordering::SeqCst),
                None => tracing::error!("{}: could not parse ganged from {}", self.core.instance_tag(), value),
            },
            _ => {}
        }
    }

    fn handle_notification(&self, attribute: AttributeCode, data: &Value) {
        self.channels.fan_out(&self.core, attribute, data);
    }
}
