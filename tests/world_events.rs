mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, Client};
use voxroom::chat::firewall::DisabledFirewall;
use voxroom::chat::render::SilentRenderer;
use voxroom::chat::ChatServer;
use voxroom::events::{Cadence, WorldEvent, WorldEventKind, WorldEvents};

#[tokio::test(start_paused = true)]
async fn scheduled_event_reaches_every_room() {
    let (server, handle) = ChatServer::new(test_config(), Arc::new(SilentRenderer), Arc::new(DisabledFirewall)).unwrap();
    let events = WorldEvents::new(vec![WorldEvent {
        kind: WorldEventKind::Amphetamine,
        cadence: Cadence::Fixed(Duration::from_secs(600)),
    }]);
    server.with_events(events).spawn();

    let mut a = Client::join(&handle, "10.0.0.1", "alice", "one").await;
    let mut b = Client::join(&handle, "10.0.0.2", "bob", "two").await;

    tokio::time::sleep(Duration::from_secs(601)).await;
    let note = a.expect_type("notification").await;
    assert_eq!(note["event_type"], "amphetamine");
    assert_eq!(b.expect_type("notification").await["event_type"], "amphetamine");

    // and again one period later
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(a.expect_type("notification").await["event_type"], "amphetamine");
}

#[tokio::test(start_paused = true)]
async fn disabled_events_stay_quiet() {
    let handle = common::start(test_config());
    let mut a = Client::join(&handle, "10.0.0.1", "alice", "one").await;
    tokio::time::sleep(Duration::from_secs(48 * 3600)).await;
    assert!(a.drain_json().await.iter().all(|m| m["type"] != "notification"));
}
