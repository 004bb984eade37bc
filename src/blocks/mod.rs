//! Concrete control blocks.
//!
//! Level, mute, input and AEC input blocks share one multi-channel shape:
//! the block reports its channel count, channels are created for 1..N and
//! queried, and `levels`/`mutes` notifications carry one array element per
//! channel in index order.

mod aec_input;
mod input;
mod level;
mod logic_state;
mod mute;
mod source_selector;

pub use aec_input::AecInputBlock;
pub use input::InputBlock;
pub use level::LevelControlBlock;
pub use logic_state::LogicStateBlock;
pub use mute::MuteControlBlock;
pub use source_selector::SourceSelectorBlock;

use crate::block::BlockCore;
use crate::channel::{BlockChannel, ChannelKind, ChannelSet, IoChannel};
use crate::protocol::AttributeCode;
use serde_json::Value;

/// Largest channel count accepted from a `numChannels` answer
pub(crate) const MAX_CHANNELS: u32 = 512;

/// The `value` member of a response payload
pub(crate) fn value_of(payload: Option<&Value>) -> Option<&Value> {
    payload.and_then(|p| p.get("value"))
}

pub(crate) fn value_as_u32(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
        .and_then(|n| u32::try_from(n).ok())
}

/// Channels of a multi-channel block plus their capability set
pub(crate) struct IoChannels {
    kind: ChannelKind,
    set: ChannelSet<IoChannel>,
}

impl IoChannels {
    pub(crate) fn new(instance_tag: &str, kind: ChannelKind) -> Self {
        Self {
            kind,
            set: ChannelSet::new(instance_tag),
        }
    }

    pub(crate) fn set(&self) -> &ChannelSet<IoChannel> {
        &self.set
    }

    /// Handle a `numChannels` answer: create 1..N, query each, finish init
    pub(crate) fn learn_count(&self, core: &BlockCore, value: &Value) {
        let Some(count) = value_as_u32(value) else {
            tracing::error!("{}: could not parse channel count from {}", core.instance_tag(), value);
            return;
        };
        if count > MAX_CHANNELS {
            tracing::error!(
                "{}: reported {} channels, more than the {} supported",
                core.instance_tag(),
                count,
                MAX_CHANNELS
            );
            return;
        }
        tracing::debug!("{}: {} channels", core.instance_tag(), count);

        let kind = self.kind;
        let channels = self.set.ensure(count, |index| {
            IoChannel::new(core.instance_tag(), index, kind, core.outbox().clone())
        });
        for channel in channels {
            channel.query();
        }
        core.mark_initialized();
    }

    /// Spread a `levels` or `mutes` array over channels 1..N
    pub(crate) fn fan_out(&self, core: &BlockCore, attribute: AttributeCode, data: &Value) {
        let Some(values) = data.get("value").and_then(Value::as_array) else {
            tracing::error!("{}: {} notification without a value array: {}", core.instance_tag(), attribute, data);
            return;
        };

        let channels = self.set.all();
        if values.len() > channels.len() {
            tracing::warn!(
                "{}: {} carries {} values for {} channels",
                core.instance_tag(),
                attribute,
                values.len(),
                channels.len()
            );
        }

        for (channel, value) in channels.iter().zip(values) {
            match attribute {
                AttributeCode::Levels => match value.as_f64() {
                    Some(level) => channel.push_level(level),
                    None => tracing::error!("{}: bad level value {}", core.instance_tag(), value),
                },
                AttributeCode::Mutes => match value.as_bool() {
                    Some(mute) => channel.push_mute(mute),
                    None => tracing::error!("{}: bad mute value {}", core.instance_tag(), value),
                },
                other => {
                    tracing::debug!("{}: no fan-out for {}", core.instance_tag(), other);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::block::{BlockCore, BlockKind};
    use crate::connection::Outbox;
    use crate::message::Message;
    use crate::protocol::ParsedCommand;

    pub fn core(kind: BlockKind, tag: &str) -> (BlockCore, Outbox) {
        let outbox = Outbox::connected_for_test();
        (BlockCore::new(kind, tag, outbox.clone(), 200), outbox)
    }

    pub fn response(line: &str, payload: &str) -> Message {
        Message::AcknowledgedWithPayload {
            command: ParsedCommand::parse(line),
            payload: payload.to_string(),
        }
    }

    pub fn ack(line: &str) -> Message {
        Message::Acknowledged {
            command: ParsedCommand::parse(line),
        }
    }

    pub fn notification(token: &str, payload: &str) -> Message {
        Message::Notification {
            publish_token: token.to_string(),
            payload: payload.to_string(),
        }
    }
}
