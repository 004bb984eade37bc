use super::{value_of, IoChannels};
use crate::block::{BlockCore, ControlBlock};
use crate::channel::{ChannelKind, IoChannel};
use crate::error::Result;
use crate::protocol::{AttributeCode, ParsedCommand};
use serde_json::Value;
use std::sync::Arc;

/// Analog or Dante input block: level and mute per channel
pub struct InputBlock {
    core: BlockCore,
    channels: IoChannels,
}

impl InputBlock {
    pub(crate) fn new(core: BlockCore) -> Self {
        let channels = IoChannels::new(core.instance_tag(), ChannelKind::Input);
        Self { core, channels }
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
}

impl ControlBlock for InputBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn subscription_attributes(&self) -> &'static [AttributeCode] {
        &[AttributeCode::Levels, AttributeCode::Mutes]
    }

    fn query_shape(&self) {
        self.core.query(AttributeCode::NumChannels);
    }

    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>) {
        if self.channels.set().route(command, payload) || !command.is_block_get() {
            return;
        }
        if command.attribute == Some(AttributeCode::NumChannels) {
            if let Some(value) = value_of(payload) {
                self.channels.learn_count(&self.core, value);
            }
        }
    }

    fn handle_notification(&self, attribute: AttributeCode, data: &Value) {
        self.channels.fan_out(&self.core, attribute, data);
    }
}
