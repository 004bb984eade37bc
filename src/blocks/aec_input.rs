use super::{value_of, IoChannels};
use crate::block::{BlockCore, ControlBlock};
use crate::channel::{ChannelKind, IoChannel};
use crate::error::Result;
use crate::protocol::{AttributeCode, ParsedCommand};
use serde_json::Value;
use std::sync::Arc;

/// AEC input block: preamp gain per channel, no mute
pub struct AecInputBlock {
    core: BlockCore,
    channels: IoChannels,
}

impl AecInputBlock {
    pub(crate) fn new(core: BlockCore) -> Self {
        let channels = IoChannels::new(core.instance_tag(), ChannelKind::AecInput);
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

impl ControlBlock for AecInputBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn subscription_attributes(&self) -> &'static [AttributeCode] {
        &[AttributeCode::Levels]
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKind;
    use crate::blocks::test_support::{ack, core, response};
    use crate::channel::VolumeControl;

    #[test]
    fn gain_channels_write_gain() {
        let (core, outbox) = core(BlockKind::AecInput, "AecIn");
        let block = AecInputBlock::new(core);
        block.initialize();
        block.route(&response("AecIn get numChannels", "\"value\":1"));
        assert_eq!(
            outbox.drain(),
            vec!["AecIn get numChannels".to_string(), "AecIn get gain 1".to_string()]
        );

        block.route(&response("AecIn get gain 1", "\"value\":33.000000"));
        let channel = block.channel(1).unwrap();
        assert_eq!(channel.level(), 33.0);
        assert_eq!(channel.volume_percent(), 50);
        assert!(!channel.supports_mute());

        channel.set_level(42.0).unwrap();
        assert_eq!(outbox.drain(), vec!["AecIn set gain 1 42.0".to_string()]);
        block.route(&ack("AecIn set gain 1 42.0"));
        assert_eq!(channel.current_level(), Some(42.0));
    }
}
