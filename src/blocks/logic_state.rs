use crate::block::{BlockCore, ControlBlock};
use crate::channel::{BlockChannel, ChannelSet, LogicStateChannel};
use crate::error::Result;
use crate::protocol::{AttributeCode, ParsedCommand};
use serde_json::Value;
use std::sync::Arc;

/// Logic state block: a single settable boolean on channel 1
pub struct LogicStateBlock {
    core: BlockCore,
    channels: ChannelSet<LogicStateChannel>,
}

impl LogicStateBlock {
    pub(crate) fn new(core: BlockCore) -> Self {
        let channels = ChannelSet::new(core.instance_tag());
        Self { core, channels }
    }

    pub fn channel(&self, index: u32) -> Result<Arc<LogicStateChannel>> {
        self.channels.get(index)
    }

    pub fn current_state(&self) -> Result<bool> {
        Ok(self.channel(1)?.state())
    }

    pub fn set_state(&self, state: bool) -> Result<()> {
        self.channel(1)?.set_state(state)
    }
}

impl ControlBlock for LogicStateBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn subscription_attributes(&self) -> &'static [AttributeCode] {
        &[]
    }

    fn query_shape(&self) {
        let channels = self.channels.ensure(1, |index| {
            LogicStateChannel::new(self.core.instance_tag(), index, self.core.outbox().clone())
        });
        for channel in channels {
            channel.query();
        }
        self.core.mark_initialized();
    }

    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>) {
        if !self.channels.route(command, payload) {
            tracing::debug!("{}: ignoring {}", self.core.instance_tag(), command);
        }
    }

    fn handle_notification(&self, _attribute: AttributeCode, _data: &Value) {}
}
