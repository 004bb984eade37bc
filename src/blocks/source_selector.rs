use super::{value_as_u32, value_of};
use crate::block::{BlockCore, BlockEvent, ControlBlock};
use crate::error::{Result, TesiraError};
use crate::protocol::{AttributeCode, CommandLine, ParsedCommand, Verb};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default, Clone, Copy)]
struct Selector {
    inputs: u32,
    outputs: u32,
    sources: u32,
    selection: u32,
    stereo: bool,
}

/// Source selector block: picks one of N sources (0 means none)
pub struct SourceSelectorBlock {
    core: BlockCore,
    state: Mutex<Selector>,
}

impl SourceSelectorBlock {
    pub(crate) fn new(core: BlockCore) -> Self {
        Self {
            core,
            state: Mutex::new(Selector::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Selector> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn number_of_inputs(&self) -> u32 {
        self.lock().inputs
    }

    pub fn number_of_outputs(&self) -> u32 {
        self.lock().outputs
    }

    pub fn number_of_sources(&self) -> u32 {
        self.lock().sources
    }

    pub fn stereo_enabled(&self) -> bool {
        self.lock().stereo
    }

    pub fn source_selection(&self) -> u32 {
        self.lock().selection
    }

    /// Select source `source`, or 0 for none
    pub fn set_source_selection(&self, source: u32) -> Result<()> {
        let sources = self.number_of_sources();
        if sources > 0 && source > sources {
            tracing::error!("{}: no source {}", self.core.instance_tag(), source);
            return Err(TesiraError::ChannelOutOfRange {
                instance_tag: self.core.instance_tag().to_string(),
                index: source,
            });
        }
        let command = CommandLine::set(self.core.instance_tag(), AttributeCode::SourceSelection).with_index(source);
        self.core.send_command(&command)
    }

    fn update_selection(&self, selection: u32) {
        let changed = {
            let mut state = self.lock();
            let changed = state.selection != selection;
            state.selection = selection;
            changed
        };
        if changed {
            tracing::debug!("{}: source {} selected", self.core.instance_tag(), selection);
            self.core.emit(BlockEvent::SourceSelectionChanged(selection));
        }
    }

    fn apply(&self, attribute: AttributeCode, value: &Value) {
        let count = || value_as_u32(value);
        match attribute {
            AttributeCode::NumInputs => self.lock().inputs = count().unwrap_or_default(),
            AttributeCode::NumOutputs => self.lock().outputs = count().unwrap_or_default(),
            AttributeCode::NumSources => self.lock().sources = count().unwrap_or_default(),
            AttributeCode::SourceSelection => match count() {
                Some(selection) => self.update_selection(selection),
                None => tracing::error!("{}: bad source selection {}", self.core.instance_tag(), value),
            },
            AttributeCode::StereoEnable => {
                self.lock().stereo = value.as_bool().unwrap_or_default();
                self.core.mark_initialized();
            }
            _ => {}
        }
    }
}

impl ControlBlock for SourceSelectorBlock {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn subscription_attributes(&self) -> &'static [AttributeCode] {
        &[AttributeCode::SourceSelection]
    }

    fn query_shape(&self) {
        for attribute in [
            AttributeCode::NumInputs,
            AttributeCode::NumOutputs,
            AttributeCode::NumSources,
            AttributeCode::SourceSelection,
            AttributeCode::StereoEnable,
        ] {
            self.core.query(attribute);
        }
    }

    fn handle_response(&self, command: &ParsedCommand, payload: Option<&Value>) {
        let Some(attribute) = command.attribute else {
            return;
        };
        match (command.verb, payload) {
            (Some(Verb::Get), Some(_)) if command.is_block_get() => match value_of(payload) {
                Some(value) => self.apply(attribute, value),
                None => tracing::error!("{}: no value in response to {}", self.core.instance_tag(), command),
            },
            (Some(Verb::Set), None) if attribute == AttributeCode::SourceSelection => {
                if let Some(selection) = command.index() {
                    self.update_selection(selection);
                }
            }
            _ => {}
        }
    }

    fn handle_notification(&self, attribute: AttributeCode, data: &Value) {
        if attribute != AttributeCode::SourceSelection {
            return;
        }
        match data.get("value").and_then(value_as_u32) {
            Some(selection) => self.update_selection(selection),
            None => tracing::error!("{}: bad source selection notification {}", self.core.instance_tag(), data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockKind, BlockState};
    use crate::blocks::test_support::{ack, core, notification, response};

    fn initialized() -> (SourceSelectorBlock, crate::connection::Outbox) {
        let (core, outbox) = core(BlockKind::SourceSelector, "SrcSel");
        let block = SourceSelectorBlock::new(core);
        block.initialize();
        for (attr, value) in [
            ("numInputs", "4"),
            ("numOutputs", "1"),
            ("numSources", "4"),
            ("sourceSelection", "2"),
            ("stereoEnable", "false"),
        ] {
            block.route(&response(
                &format!("SrcSel get {}", attr),
                &format!("\"value\":{}", value),
            ));
        }
        (block, outbox)
    }

    #[test]
    fn initializes_when_stereo_enable_arrives() {
        let (core, outbox) = core(BlockKind::SourceSelector, "SrcSel");
        let block = SourceSelectorBlock::new(core);
        let mut events = block.events();
        block.initialize();
        assert_eq!(outbox.drain().len(), 5);

        block.route(&response("SrcSel get numSources", "\"value\":4"));
        assert_eq!(block.state(), BlockState::Initializing);
        block.route(&response("SrcSel get stereoEnable", "\"value\":true"));
        assert_eq!(block.state(), BlockState::Initialized);
        assert!(block.stereo_enabled());
        assert_eq!(events.try_recv().unwrap(), Some(BlockEvent::Initialized));
    }

    #[test]
    fn selection_follows_gets_acks_and_notifications() {
        let (block, outbox) = initialized();
        assert_eq!(block.number_of_inputs(), 4);
        assert_eq!(block.source_selection(), 2);
        outbox.drain();

        let mut events = block.events();
        block.set_source_selection(3).unwrap();
        assert_eq!(outbox.drain(), vec!["SrcSel set sourceSelection 3".to_string()]);
        block.route(&ack("SrcSel set sourceSelection 3"));
        assert_eq!(block.source_selection(), 3);
        assert_eq!(events.try_recv().unwrap(), Some(BlockEvent::SourceSelectionChanged(3)));

        block.subscribe();
        block.route(&notification("SrcSel_sourceSelection", "\"value\":1"));
        assert_eq!(block.source_selection(), 1);
        assert_eq!(events.try_recv().unwrap(), Some(BlockEvent::SourceSelectionChanged(1)));
        assert_eq!(
            events.try_recv().unwrap(),
            Some(BlockEvent::AttributeChanged(AttributeCode::SourceSelection))
        );
    }

    #[test]
    fn rejects_unknown_source() {
        let (block, outbox) = initialized();
        outbox.drain();
        assert!(matches!(
            block.set_source_selection(5),
            Err(TesiraError::ChannelOutOfRange { index: 5, .. })
        ));
        assert!(block.set_source_selection(0).is_ok());
    }
}
