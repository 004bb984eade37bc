//! Instance tag → block table.
//!
//! Blocks are built from a factory table keyed by [`BlockKind`], so adding a
//! block type means adding one entry to [`BlockFactories`].

use crate::block::{BlockCore, BlockEvent, BlockKind, BlockState, ControlBlock};
use crate::blocks::{
    AecInputBlock, InputBlock, LevelControlBlock, LogicStateBlock, MuteControlBlock, SourceSelectorBlock,
};
use crate::connection::Outbox;
use crate::error::{Result, TesiraError};
use crate::message::Message;
use crate::subscription::EventReceiver;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Handle to a registered block
#[derive(Clone)]
pub enum Block {
    LevelControl(Arc<LevelControlBlock>),
    MuteControl(Arc<MuteControlBlock>),
    LogicState(Arc<LogicStateBlock>),
    SourceSelector(Arc<SourceSelectorBlock>),
    /// Analog and Dante inputs
    Input(Arc<InputBlock>),
    AecInput(Arc<AecInputBlock>),
}

impl Block {
    pub fn as_control(&self) -> &dyn ControlBlock {
        match self {
            Block::LevelControl(b) => b.as_ref(),
            Block::MuteControl(b) => b.as_ref(),
            Block::LogicState(b) => b.as_ref(),
            Block::SourceSelector(b) => b.as_ref(),
            Block::Input(b) => b.as_ref(),
            Block::AecInput(b) => b.as_ref(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.as_control().kind()
    }

    pub fn instance_tag(&self) -> &str {
        self.as_control().instance_tag()
    }

    pub fn name(&self) -> String {
        self.as_control().core().name()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.as_control().core().set_name(name);
    }

    pub fn state(&self) -> BlockState {
        self.as_control().state()
    }

    pub fn events(&self) -> EventReceiver<BlockEvent> {
        self.as_control().events()
    }

    pub fn initialize(&self) {
        self.as_control().initialize();
    }

    /// Subscribe the block's change notifications
    pub fn subscribe(&self) {
        self.as_control().subscribe();
    }

    pub fn unsubscribe(&self) {
        self.as_control().unsubscribe();
    }

    pub fn route(&self, message: &Message) {
        self.as_control().route(message);
    }

    pub fn as_level(&self) -> Option<&Arc<LevelControlBlock>> {
        match self {
            Block::LevelControl(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_mute(&self) -> Option<&Arc<MuteControlBlock>> {
        match self {
            Block::MuteControl(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_logic_state(&self) -> Option<&Arc<LogicStateBlock>> {
        match self {
            Block::LogicState(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_source_selector(&self) -> Option<&Arc<SourceSelectorBlock>> {
        match self {
            Block::SourceSelector(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_input(&self) -> Option<&Arc<InputBlock>> {
        match self {
            Block::Input(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_aec_input(&self) -> Option<&Arc<AecInputBlock>> {
        match self {
            Block::AecInput(b) => Some(b),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("kind", &self.kind())
            .field("instance_tag", &self.instance_tag())
            .field("state", &self.state())
            .finish()
    }
}

pub type BlockFactory = fn(BlockCore) -> Block;

/// Constructors per block kind
#[derive(Clone)]
pub struct BlockFactories {
    factories: HashMap<BlockKind, BlockFactory>,
}

impl BlockFactories {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn insert(&mut self, kind: BlockKind, factory: BlockFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn remove(&mut self, kind: BlockKind) {
        self.factories.remove(&kind);
    }

    pub fn supports(&self, kind: BlockKind) -> bool {
        self.factories.contains_key(&kind)
    }

    fn build(&self, core: BlockCore) -> Result<Block> {
        let kind = core.kind();
        let factory = self.factories.get(&kind).ok_or(TesiraError::UnsupportedBlockKind(kind))?;
        Ok(factory(core))
    }
}

impl Default for BlockFactories {
    /// Every built-in kind; dialers have no implementation
    fn default() -> Self {
        let mut factories = Self::empty();
        factories.insert(BlockKind::LevelControl, |core| {
            Block::LevelControl(Arc::new(LevelControlBlock::new(core)))
        });
        factories.insert(BlockKind::MuteControl, |core| {
            Block::MuteControl(Arc::new(MuteControlBlock::new(core)))
        });
        factories.insert(BlockKind::LogicState, |core| {
            Block::LogicState(Arc::new(LogicStateBlock::new(core)))
        });
        factories.insert(BlockKind::SourceSelector, |core| {
            Block::SourceSelector(Arc::new(SourceSelectorBlock::new(core)))
        });
        factories.insert(BlockKind::Input, |core| Block::Input(Arc::new(InputBlock::new(core))));
        factories.insert(BlockKind::DanteInput, |core| Block::Input(Arc::new(InputBlock::new(core))));
        factories.insert(BlockKind::AecInput, |core| Block::AecInput(Arc::new(AecInputBlock::new(core))));
        factories
    }
}

/// The blocks of one device, keyed by instance tag
pub struct BlockRegistry {
    factories: BlockFactories,
    outbox: Outbox,
    subscription_rate_ms: u32,
    blocks: RwLock<HashMap<String, Block>>,
}

impl BlockRegistry {
    pub fn new(outbox: Outbox, subscription_rate_ms: u32) -> Self {
        Self::with_factories(BlockFactories::default(), outbox, subscription_rate_ms)
    }

    pub fn with_factories(factories: BlockFactories, outbox: Outbox, subscription_rate_ms: u32) -> Self {
        Self {
            factories,
            outbox,
            subscription_rate_ms,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Create the block for `instance_tag`
    ///
    /// The block is initialized straight away when the session is connected;
    /// otherwise it initializes on the next connect.
    pub fn register(&self, kind: BlockKind, instance_tag: impl Into<String>) -> Result<Block> {
        let instance_tag = instance_tag.into();
        let block = {
            let mut blocks = self.blocks.write().unwrap_or_else(|e| e.into_inner());
            if blocks.contains_key(&instance_tag) {
                tracing::error!("Block \"{}\" is already registered", instance_tag);
                return Err(TesiraError::DuplicateInstanceTag(instance_tag));
            }
            let core = BlockCore::new(kind, &instance_tag, self.outbox.clone(), self.subscription_rate_ms);
            let block = self.factories.build(core)?;
            blocks.insert(instance_tag, block.clone());
            block
        };

        tracing::info!("Registered {:?} block \"{}\"", kind, block.instance_tag());
        if self.outbox.is_connected() {
            block.initialize();
        }
        Ok(block)
    }

    pub fn lookup(&self, instance_tag: &str) -> Option<Block> {
        self.blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_tag)
            .cloned()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a message to the block it belongs to
    ///
    /// Notifications go to the block holding the publish token, everything
    /// else to the block named by the echoed instance tag. Returns false if
    /// no block claimed the message.
    pub fn route(&self, message: &Message) -> bool {
        let target = match message {
            Message::Notification { publish_token, .. } => {
                let target = self
                    .blocks()
                    .into_iter()
                    .find(|b| b.as_control().core().subscribed_attribute(publish_token).is_some());
                if target.is_none() {
                    tracing::debug!("No subscription for {}", publish_token);
                }
                target
            }
            _ => self.lookup(message.instance_tag()),
        };

        match target {
            Some(block) => {
                block.route(message);
                true
            }
            None => false,
        }
    }

    /// Restart every block's lifecycle
    pub fn initialize_all(&self) {
        for block in self.blocks() {
            block.initialize();
        }
    }

    /// Resend every recorded subscription of every block
    pub fn resubscribe_all(&self) {
        for block in self.blocks() {
            block.as_control().core().resubscribe();
        }
    }
}
