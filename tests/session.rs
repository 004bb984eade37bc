mod common;

use common::{eventually, wait_for_status, MockTesira};
use std::time::Duration;
use tesira_ttp::{
    BlockEvent, BlockKind, BlockState, ConnectionStatus, Message, TesiraClient, VolumeControl, VERBOSE_COMMAND,
};
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn handshake_sends_verbose_first_and_queries_device() {
    let mock = MockTesira::start().await;
    let client = TesiraClient::new(mock.config()).unwrap();
    let mut statuses = client.subscribe_status();

    client.connect();
    wait_for_status(&mut statuses, ConnectionStatus::Connected).await;
    assert!(client.is_connected());

    eventually("device info", || client.network_status().is_some() && !client.aliases().is_empty()).await;
    let received = mock.received();
    assert_eq!(received[0], VERBOSE_COMMAND);
    assert!(received.contains(&"DEVICE get networkStatus".to_string()));
    assert!(received.contains(&"SESSION get aliases".to_string()));
    assert_eq!(client.aliases(), vec!["Level1", "Mute1", "Sel1"]);
    assert_eq!(
        client.network_status().unwrap()["hostname"].as_str(),
        Some("TesiraServer91")
    );

    client.shutdown().await;
}

#[tokio::test]
async fn responses_are_correlated_with_their_commands() {
    let mock = MockTesira::start().await;
    let client = TesiraClient::new(mock.config()).unwrap();
    let block = client.register_block(BlockKind::LevelControl, "Level1").unwrap();
    let mut events = block.events();
    let mut messages = client.subscribe_messages();

    client.connect();
    let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, BlockEvent::Initialized);

    let level = block.as_level().unwrap().clone();
    assert_eq!(level.number_of_channels(), 4);
    let last = level.channel(4).unwrap();
    eventually("channel 4 label", || last.label().is_some()).await;
    assert_eq!(last.level(), -10.0);
    assert_eq!(last.min_level(), -100.0);
    assert_eq!(last.max_level(), 12.0);
    assert_eq!(last.name(), "Level1 Level 4");

    let mut saw_count = false;
    while let Ok(Some(message)) = messages.try_recv() {
        if let Message::AcknowledgedWithPayload { command, payload } = &message {
            if command.line == "Level1 get numChannels" {
                assert_eq!(payload, "\"value\":4");
                saw_count = true;
            }
        }
    }
    assert!(saw_count);

    last.set_level(-20.0).unwrap();
    eventually("level write acknowledged", || last.level() == -20.0).await;
    assert_eq!(mock.count("Level1 set level 4 -20.0"), 1);
    assert_eq!(block.state(), BlockState::Active);

    client.shutdown().await;
}

#[tokio::test]
async fn mutes_notification_fans_out_to_channels() {
    let mock = MockTesira::start().await;
    let client = TesiraClient::new(mock.config()).unwrap();
    let block = client.register_block(BlockKind::MuteControl, "Mute1").unwrap();
    block.subscribe();

    client.connect();
    // The subscribe goes out after every initial query has been answered
    eventually("subscription", || mock.count("Mute1 subscribe mutes \"Mute1_mutes\" 200") == 1).await;

    let mute = block.as_mute().unwrap().clone();
    assert_eq!(mute.number_of_channels(), 4);
    mock.notify("! \"publishToken\":\"Mute1_mutes\" \"value\":[true false true false]");

    eventually("mute fan-out", || {
        mute.channel(1).unwrap().muted() && mute.channel(3).unwrap().muted()
    })
    .await;
    assert!(!mute.channel(2).unwrap().muted());
    assert!(!mute.channel(4).unwrap().muted());

    client.shutdown().await;
}

#[tokio::test]
async fn reconnect_resubscribes_exactly_once() {
    let mock = MockTesira::start().await;
    let client = TesiraClient::new(mock.config()).unwrap();
    let mut statuses = client.subscribe_status();
    client.register_block(BlockKind::LevelControl, "Level1").unwrap().subscribe();

    let levels = "Level1 subscribe levels \"Level1_levels\" 200";
    let mutes = "Level1 subscribe mutes \"Level1_mutes\" 200";

    client.connect();
    eventually("first subscription", || mock.count(levels) == 1 && mock.count(mutes) == 1).await;

    mock.drop_connections();
    wait_for_status(&mut statuses, ConnectionStatus::Disconnected).await;
    wait_for_status(&mut statuses, ConnectionStatus::Connected).await;
    assert_eq!(mock.connections(), 2);

    eventually("resubscription", || mock.count(levels) == 2 && mock.count(mutes) == 2).await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(mock.count(levels), 2);
    assert_eq!(mock.count(mutes), 2);
    assert_eq!(mock.count("Level1 get numChannels"), 2);

    client.shutdown().await;
}

#[tokio::test]
async fn falls_back_to_secondary_credentials() {
    let mock = MockTesira::with_login("default", "").await;
    let mut config = mock.config();
    config.username = "admin".to_string();
    config.password = "wrong".to_string();

    let client = TesiraClient::new(config).unwrap();
    let mut statuses = client.subscribe_status();
    client.connect();

    wait_for_status(&mut statuses, ConnectionStatus::Connected).await;
    assert_eq!(mock.login_attempts(), vec!["admin", "default"]);

    client.shutdown().await;
}

#[tokio::test]
async fn rejected_credentials_report_disconnected() {
    let mock = MockTesira::with_login("admin", "secret").await;
    let mut config = mock.config();
    config.username = "admin".to_string();
    config.password = "wrong".to_string();
    config.fallback_username = "guest".to_string();
    config.retry_interval_ms = 10_000;

    let client = TesiraClient::new(config).unwrap();
    let mut statuses = client.subscribe_status();
    client.connect();

    wait_for_status(&mut statuses, ConnectionStatus::AttemptingConnection).await;
    wait_for_status(&mut statuses, ConnectionStatus::Disconnected).await;
    assert_eq!(mock.login_attempts(), vec!["admin", "guest"]);
    assert!(!client.is_connected());

    client.disconnect();
}

#[tokio::test]
async fn device_errors_reach_the_block() {
    let mock = MockTesira::with_responder(|line| {
        if line.starts_with("Ghost ") {
            "-ERR address not found: {\"deviceId\":0 \"classCode\":0 \"instanceNum\":0}".to_string()
        } else {
            common::tesira_reply(line)
        }
    })
    .await;
    let client = TesiraClient::new(mock.config()).unwrap();
    let block = client.register_block(BlockKind::LevelControl, "Ghost").unwrap();
    let mut events = block.events();

    client.connect();
    let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    match event {
        BlockEvent::CommandFailed { command, message } => {
            assert_eq!(command, "Ghost get numChannels");
            assert!(message.starts_with("address not found"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(block.state(), BlockState::Initializing);

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_sends_termination_line() {
    let mock = MockTesira::start().await;
    let client = TesiraClient::new(mock.config()).unwrap();
    let mut statuses = client.subscribe_status();

    client.connect();
    wait_for_status(&mut statuses, ConnectionStatus::Connected).await;
    client.recall_preset(1001).unwrap();
    eventually("preset recall", || mock.count("DEVICE recallPreset 1001") == 1).await;

    client.shutdown().await;
    eventually("exit", || mock.count("exit") == 1).await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(client.send("DEVICE get networkStatus").is_err());
}

#[tokio::test]
async fn banner_text_in_a_reply_does_not_restart_the_session() {
    let mock = MockTesira::start().await;
    let client = TesiraClient::new(mock.config()).unwrap();
    let mut statuses = client.subscribe_status();

    client.connect();
    wait_for_status(&mut statuses, ConnectionStatus::Connected).await;

    let label = "Level1 set label 1 \"Welcome to the Tesira Text Protocol Server\"";
    client.send(label).unwrap();
    client.send("Level1 get level 1").unwrap();
    client.send("Level1 get level 2").unwrap();

    eventually("queued reads after the label write", || {
        mock.count("Level1 get level 1") == 1 && mock.count("Level1 get level 2") == 1
    })
    .await;
    assert_eq!(mock.count(label), 1);
    assert_eq!(mock.count(VERBOSE_COMMAND), 1);
    assert!(client.is_connected());

    client.shutdown().await;
}

#[tokio::test]
async fn keep_alive_only_while_idle() {
    let mock = MockTesira::with_responder(|line| {
        if line.starts_with("Slow ") {
            String::new()
        } else {
            common::tesira_reply(line)
        }
    })
    .await;
    let mut config = mock.config();
    config.keep_alive_interval_ms = 50;
    config.stall_threshold = 10_000;

    let client = TesiraClient::new(config).unwrap();
    let mut statuses = client.subscribe_status();
    client.connect();
    wait_for_status(&mut statuses, ConnectionStatus::Connected).await;

    eventually("keep-alive on an idle link", || mock.count("SESSION get verbose") >= 1).await;

    // never answered, so it stays in flight
    client.send("Slow get level 1").unwrap();
    eventually("slow command written", || mock.count("Slow get level 1") == 1).await;
    let before = mock.count("SESSION get verbose");
    sleep(Duration::from_millis(400)).await;
    assert_eq!(mock.count("SESSION get verbose"), before);

    client.shutdown().await;
}
