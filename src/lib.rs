//! Rust client for Biamp Tesira DSPs over the Tesira Text Protocol (TTP)
//!
//! This library keeps one persistent session to a Tesira server and mirrors
//! the DSP blocks you care about as typed objects. It supports:
//!
//! - Telnet or SSH login with fallback credentials and automatic reconnects
//! - One-command-in-flight pipelining with echo correlation
//! - Repair of the device's relaxed JSON payloads
//! - Level, mute, input, Dante input, AEC input, logic state and source
//!   selector blocks
//! - Change notifications re-subscribed after every reconnect
//! - Preset recall
//!
//! # Quick Start
//!
//! ```no_run
//! use tesira_ttp::{BlockKind, ClientConfig, TesiraClient, VolumeControl};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("192.168.1.50").with_credentials("admin", "secret");
//!     let client = TesiraClient::new(config)?;
//!
//!     // Register blocks by instance tag, then connect
//!     let block = client.register_block(BlockKind::LevelControl, "Program Level")?;
//!     block.subscribe();
//!     client.connect();
//!
//!     // Wait for the block to learn its channels
//!     let mut events = block.events();
//!     events.recv().await?;
//!
//!     if let Some(level) = block.as_level() {
//!         let channel = level.channel(1)?;
//!         channel.set_level(-20.0)?;
//!         channel.unmute()?;
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Transport**: telnet or SSH connect, login and line framing
//! - **Connection**: session state machine, reader task and writer loop
//! - **Pipeline**: outgoing queue and echo/response correlation
//! - **Message**: classification of device lines and payload repair
//! - **Registry**: instance tag → block routing
//! - **Blocks / Channels**: typed device objects with change events
//! - **Client**: the facade tying these together

mod block;
mod blocks;
mod channel;
mod client;
mod config;
mod connection;
mod error;
mod message;
mod normalize;
mod pipeline;
mod protocol;
mod registry;
mod ssh;
mod subscription;
mod transport;

// Public exports
pub use block::{BlockCore, BlockEvent, BlockKind, BlockState, ControlBlock};
pub use blocks::{
    AecInputBlock, InputBlock, LevelControlBlock, LogicStateBlock, MuteControlBlock, SourceSelectorBlock,
};
pub use channel::{
    scale_range, BlockChannel, ChannelEvent, ChannelKind, ChannelSet, IoChannel, LogicStateChannel,
    VolumeControl, LEVEL_THRESHOLD,
};
pub use client::TesiraClient;
pub use config::{ClientConfig, TransportKind};
pub use connection::{ConnectionStatus, Outbox, Session, SessionHandler};
pub use error::{Result, TesiraError};
pub use message::{classify, LineKind, Message};
pub use normalize::{normalize, parse_payload};
pub use pipeline::{Pipeline, DEFAULT_STALL_THRESHOLD};
pub use protocol::{
    publish_token, tokenize, AttributeCode, CommandLine, CommandValue, ParsedCommand, Verb, DEVICE_TAG,
    SESSION_TAG, TERMINATION_LINE, VERBOSE_COMMAND, WELCOME_BANNER,
};
pub use registry::{Block, BlockFactories, BlockFactory, BlockRegistry};
pub use ssh::SshConnector;
pub use subscription::{DeferredTask, EventReceiver, SubscriptionSet};
pub use transport::{BoxedReader, BoxedWriter, Connector, Credentials, LineReader, Link, TelnetConnector};
