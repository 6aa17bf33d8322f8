mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{start_with, test_config, Client, GatedRenderer};
use serde_json::json;
use voxroom::chat::protocol::Frame;
use voxroom::chat::render::{RenderError, RenderJob, Renderer};

/// Takes longer on lines starting with "slow".
struct UnevenRenderer;

#[async_trait]
impl Renderer for UnevenRenderer {
    async fn render(&self, job: &RenderJob) -> Result<Option<Bytes>, RenderError> {
        if job.spoken.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(None)
    }
}

#[tokio::test]
async fn rendered_message_carries_audio() {
    let renderer = GatedRenderer::new();
    let handle = start_with(test_config(), Arc::new(renderer.clone()));
    let mut a = Client::join(&handle, "10.0.0.1", "alice", "race").await;
    let mut b = Client::join(&handle, "10.0.0.2", "bob", "race").await;
    a.drain().await;

    a.send(json!({"type": "msg", "msg": "<b>hi</b>"}));
    renderer.release(1);
    let msg = b.expect_type("msg").await;
    assert_eq!(msg["msg"], "&lt;b&gt;hi&lt;/b&gt;");
    assert!(matches!(b.next_frame().await, Some(Frame::Binary(_))));
    assert_eq!(a.expect_type("msg").await["msg"], "&lt;b&gt;hi&lt;/b&gt;");
}

#[tokio::test]
async fn sender_leaving_mid_render_still_reaches_the_room() {
    let renderer = GatedRenderer::new();
    let handle = start_with(test_config(), Arc::new(renderer.clone()));
    let mut a = Client::join(&handle, "10.0.0.1", "alice", "race").await;
    let mut b = Client::join(&handle, "10.0.0.2", "bob", "race").await;
    a.drain().await;

    a.send(json!({"type": "msg", "msg": "last words"}));
    a.leave();
    let gone = b.expect_type("disconnect").await;
    assert_eq!(gone["userid"].as_str().map(str::len), Some(16));

    renderer.release(1);
    let msg = b.expect_type("msg").await;
    assert_eq!(msg["msg"], "last words");
    // no audio without a live sender session
    assert!(b.drain().await.iter().all(|f| !matches!(f, Frame::Binary(_))));
    assert!(a
        .drain_json()
        .await
        .iter()
        .all(|m| m["type"] != "msg"));
}

#[tokio::test]
async fn room_emptied_mid_render_drops_the_message() {
    let renderer = GatedRenderer::new();
    let handle = start_with(test_config(), Arc::new(renderer.clone()));
    let a = Client::join(&handle, "10.0.0.1", "alice", "vanishing").await;
    a.send(json!({"type": "msg", "msg": "anyone?"}));
    a.leave();
    renderer.release(1);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut late = Client::join(&handle, "10.0.0.2", "bob", "vanishing").await;
    assert!(late.drain_json().await.iter().all(|m| m["type"] != "msg"));
}

#[tokio::test]
async fn lines_of_one_speaker_keep_their_order() {
    let handle = start_with(test_config(), Arc::new(UnevenRenderer));
    let mut a = Client::join(&handle, "10.0.0.1", "alice", "order").await;
    let mut b = Client::join(&handle, "10.0.0.2", "bob", "order").await;
    a.drain().await;

    a.send(json!({"type": "msg", "msg": "slow first"}));
    a.send(json!({"type": "msg", "msg": "quick second"}));
    assert_eq!(b.expect_type("msg").await["msg"], "slow first");
    assert_eq!(b.expect_type("msg").await["msg"], "quick second");
}
