use super::{value_of, IoChannels};
use crate::block::{BlockCore, ControlBlock};
use crate::channel::{ChannelKind, IoChannel};
use crate::error::Result;
use crate::protocol::{AttributeCode, ParsedCommand};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mute control block: one mute per channel
pub struct MuteControlBlock {
    core: BlockCore,
    channels: IoChannels,
    ganged: AtomicBool,
}

impl MuteControlBlock {
    pub(crate) fn new(core: BlockCore) -> Self {
        let channels = IoChannels::new(core.instance_tag(), ChannelKind::Mute);
        Self {
            core,
            channels,
            ganged: AtomicBool::new(false),
        }
    }

    pub fn channel(&self, index: u32) -> Result<Arc<IoChannel>> {
        self.channels.set().get(index)
    }

    pub fn channels(&self) -> Vec<Arc<IoChannel>> {
        self.channels.set().all()
    }

    pub fn number_of_channels(&self) -> u32 {
        self.channels.set().len()
    }

    pub fn ganged(&self) -> bool {
        self.ganged.load(Ordering::SeqCst)
    }
}

impl ControlBlock for MuteControlBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn subscription_attributes(&self) -> &'static [AttributeCode] {
        &[AttributeCode::Mutes]
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
            Some(AttributeCode::Ganged) => {
                if let Some(ganged) = value.as_bool() {
                    self.ganged.store(ganged, Ordering::SeqCst);
                }
            }
            _ => {}
        }
    }

    fn handle_notification(&self, attribute: AttributeCode, data: &Value) {
        self.channels.fan_out(&self.core, attribute, data);
    }
}
