mod common;

use std::time::Duration;

use common::{start, test_config, Client};
use serde_json::json;
use voxroom::chat::protocol::{CloseCode, Frame};

#[tokio::test]
async fn thirteenth_message_warns_fourteenth_bans() {
    let handle = start(test_config());
    let mut flooder = Client::join(&handle, "10.0.0.1", "flooder", "test").await;
    let mut bystander = Client::join(&handle, "10.0.0.2", "bystander", "test").await;
    flooder.drain().await;

    for i in 1..=13 {
        flooder.send(json!({"type": "msg", "msg": format!("line {}", i)}));
    }
    let warning = flooder.expect_type("antiflood").await;
    assert_eq!(warning["event"], "flood_warning");

    let seen = bystander.drain_json().await;
    assert_eq!(seen.iter().filter(|m| m["type"] == "msg").count(), 12);
    assert!(seen.iter().all(|m| m["type"] != "antiflood"));

    flooder.send(json!({"type": "msg", "msg": "line 14"}));
    assert_eq!(flooder.expect_close().await, CloseCode::Banned);
    let banned = bystander.expect_type("antiflood").await;
    assert_eq!(banned["event"], "banned");
    assert!(bystander.drain().await.iter().all(|f| !matches!(f, Frame::Close { .. })));

    let mut again = Client::connect(&handle, "10.0.0.1", "flooder", "test");
    assert_eq!(again.expect_close().await, CloseCode::Banned);
    // a fresh cookie from the banned address is refused as well
    let mut other = Client::connect(&handle, "10.0.0.1", "new-cookie", "test");
    assert_eq!(other.expect_close().await, CloseCode::Banned);
}

#[tokio::test]
async fn banned_words_count_as_flooding() {
    let handle = start(test_config());
    let mut talker = Client::join(&handle, "10.0.0.1", "talker", "words").await;
    talker.send(json!({"type": "me", "msg": "vote trump"}));
    let warning = talker.expect_type("antiflood").await;
    assert_eq!(warning["event"], "flood_warning");
    talker.send(json!({"type": "bot", "msg": "TRUMP again"}));
    assert_eq!(talker.expect_close().await, CloseCode::Banned);
}

#[tokio::test(start_paused = true)]
async fn flood_ban_expires() {
    let mut config = test_config();
    config.moderation.ban_minutes = 1;
    let handle = start(config);
    let mut flooder = Client::join(&handle, "10.0.0.1", "flooder", "test").await;
    for i in 1..=14 {
        flooder.send(json!({"type": "me", "msg": format!("spam {}", i)}));
    }
    assert_eq!(flooder.expect_close().await, CloseCode::Banned);

    let mut refused = Client::connect(&handle, "10.0.0.1", "flooder", "test");
    assert_eq!(refused.expect_close().await, CloseCode::Banned);

    tokio::time::sleep(Duration::from_secs(61)).await;
    Client::join(&handle, "10.0.0.1", "flooder", "test").await;
}

#[tokio::test(start_paused = true)]
async fn warning_is_forgiven_after_timeout() {
    let mut config = test_config();
    config.flood.warning_timeout_secs = 30;
    let handle = start(config);
    let mut talker = Client::join(&handle, "10.0.0.1", "talker", "calm").await;
    talker.send(json!({"type": "me", "msg": "trump"}));
    assert_eq!(talker.expect_type("antiflood").await["event"], "flood_warning");

    tokio::time::sleep(Duration::from_secs(31)).await;
    talker.send(json!({"type": "me", "msg": "trump"}));
    assert_eq!(talker.expect_type("antiflood").await["event"], "flood_warning");
}
