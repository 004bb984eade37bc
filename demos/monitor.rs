//! Print connection, block and channel events from a Tesira DSP.
//!
//! usage: monitor <address> [<kind>:<instance tag> ...]
//!
//! Kinds: level, mute, logic, selector, input, dante, aec.
//! Set `RUST_LOG=tesira_ttp=debug` to see the wire traffic.

use tesira_ttp::{
    Block, BlockEvent, BlockKind, ChannelEvent, ClientConfig, ConnectionStatus, ControlBlock, TesiraClient,
};

fn parse_kind(name: &str) -> Option<BlockKind> {
    match name {
        "level" => Some(BlockKind::LevelControl),
        "mute" => Some(BlockKind::MuteControl),
        "logic" => Some(BlockKind::LogicState),
        "selector" => Some(BlockKind::SourceSelector),
        "input" => Some(BlockKind::Input),
        "dante" => Some(BlockKind::DanteInput),
        "aec" => Some(BlockKind::AecInput),
        _ => None,
    }
}

/// Forward channel events of a block once it knows its channels
fn watch_channels(block: &Block) {
    let channels: Vec<_> = match block {
        Block::LevelControl(b) => b.channels().into_iter().map(|c| (c.instance_tag().to_string(), c.events())).collect(),
        Block::MuteControl(b) => b.channels().into_iter().map(|c| (c.instance_tag().to_string(), c.events())).collect(),
        Block::Input(b) => b.channels().into_iter().map(|c| (c.instance_tag().to_string(), c.events())).collect(),
        Block::AecInput(b) => b.channels().into_iter().map(|c| (c.instance_tag().to_string(), c.events())).collect(),
        Block::LogicState(b) => match b.channel(1) {
            Ok(c) => vec![(b.core().instance_tag().to_string(), c.events())],
            Err(_) => Vec::new(),
        },
        Block::SourceSelector(_) => Vec::new(),
    };

    for (index, (tag, mut events)) in channels.into_iter().enumerate() {
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ChannelEvent::LevelChanged { level, percent } => {
                        println!("{} ch{}: level {:.1} dB ({}%)", tag, index + 1, level, percent)
                    }
                    other => println!("{} ch{}: {:?}", tag, index + 1, other),
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(address) = args.next() else {
        eprintln!("usage: monitor <address> [<kind>:<instance tag> ...]");
        return Ok(());
    };

    let client = TesiraClient::new(ClientConfig::new(address))?;
    for arg in args {
        let Some((kind, tag)) = arg.split_once(':') else {
            eprintln!("ignoring {}: expected <kind>:<instance tag>", arg);
            continue;
        };
        let Some(kind) = parse_kind(kind) else {
            eprintln!("ignoring {}: unknown block kind", arg);
            continue;
        };

        let block = client.register_block(kind, tag)?;
        block.subscribe();

        let mut events = block.events();
        tokio::spawn(async move {
            let mut watching = false;
            while let Ok(event) = events.recv().await {
                match event {
                    BlockEvent::Initialized => {
                        println!("{} initialized", block.name());
                        if !watching {
                            watch_channels(&block);
                            watching = true;
                        }
                    }
                    BlockEvent::SourceSelectionChanged(source) => println!("{}: source {}", block.name(), source),
                    BlockEvent::CommandFailed { command, message } => {
                        println!("{}: \"{}\" failed: {}", block.name(), command, message)
                    }
                    BlockEvent::AttributeChanged(_) => {}
                }
            }
        });
    }

    let mut statuses = client.subscribe_status();
    client.connect();

    loop {
        tokio::select! {
            status = statuses.recv() => match status {
                Ok(ConnectionStatus::Connected) => println!("connected to {}", client.name()),
                Ok(status) => println!("{:?}", status),
                Err(e) => {
                    eprintln!("status stream ended: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}
