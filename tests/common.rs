//! Test utilities & fixtures.
//! Starts the chat actor with in-process collaborators and wraps sessions in a small client.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use voxroom::chat::firewall::DisabledFirewall;
use voxroom::chat::protocol::{CloseCode, Frame};
use voxroom::chat::render::{RenderError, RenderJob, Renderer, SilentRenderer};
use voxroom::chat::session::SessionId;
use voxroom::chat::{ChatServer, ServerHandle};
use voxroom::config::Config;
use voxroom::events::WorldEvents;

pub const MODERATOR: &str = "mod-token";
pub const MILITIA: &str = "militia-token";

/// Defaults, minus the reconnect throttle and the world events.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.connect_interval_secs = 0;
    config.events.enabled = false;
    config.privileges.moderators = vec![MODERATOR.to_string()];
    config.privileges.militia = vec![MILITIA.to_string()];
    config
}

pub fn start(config: Config) -> ServerHandle {
    start_with(config, Arc::new(SilentRenderer))
}

pub fn start_with(config: Config, renderer: Arc<dyn Renderer>) -> ServerHandle {
    let (server, handle) = ChatServer::new(config, renderer, Arc::new(DisabledFirewall)).expect("server");
    server.with_events(WorldEvents::default()).spawn();
    handle
}

/// Renderer that holds every job until the test releases it.
#[derive(Debug, Clone)]
pub struct GatedRenderer {
    gate: Arc<Semaphore>,
}

impl GatedRenderer {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn release(&self, jobs: usize) {
        self.gate.add_permits(jobs);
    }
}

#[async_trait]
impl Renderer for GatedRenderer {
    async fn render(&self, _job: &RenderJob) -> Result<Option<Bytes>, RenderError> {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        Ok(Some(Bytes::from_static(b"RIFF-test-clip")))
    }
}

pub struct Client {
    pub id: SessionId,
    pub rx: mpsc::UnboundedReceiver<Frame>,
    handle: ServerHandle,
}

impl Client {
    pub fn connect(handle: &ServerHandle, addr: &str, token: &str, channel: &str) -> Self {
        let addr: IpAddr = addr.parse().expect("addr");
        let (id, rx) = handle.connect(addr, token, channel);
        Self {
            id,
            rx,
            handle: handle.clone(),
        }
    }

    /// Connect and consume the userlist and backlog.
    pub async fn join(handle: &ServerHandle, addr: &str, token: &str, channel: &str) -> Self {
        let mut client = Self::connect(handle, addr, token, channel);
        assert_eq!(client.expect_json().await["type"], "userlist");
        assert_eq!(client.expect_json().await["type"], "backlog");
        client
    }

    pub fn send(&self, msg: Value) {
        self.handle.text(self.id, msg.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        self.handle.text(self.id, text);
    }

    pub fn leave(&self) {
        self.handle.disconnected(self.id);
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_millis(500), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn expect_json(&mut self) -> Value {
        match self.next_frame().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).expect("json"),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// Skip frames until a text frame of `kind` arrives.
    pub async fn expect_type(&mut self, kind: &str) -> Value {
        loop {
            match self.next_frame().await {
                Some(Frame::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).expect("json");
                    if value["type"] == kind {
                        return value;
                    }
                }
                Some(_) => {}
                None => panic!("no '{}' frame arrived", kind),
            }
        }
    }

    pub async fn expect_close(&mut self) -> CloseCode {
        loop {
            match self.next_frame().await {
                Some(Frame::Close { code, .. }) => return code,
                Some(_) => {}
                None => panic!("connection was not closed"),
            }
        }
    }

    /// Everything received until the queue goes quiet.
    pub async fn drain(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame().await {
            out.push(frame);
        }
        out
    }

    pub async fn drain_json(&mut self) -> Vec<Value> {
        self.drain()
            .await
            .into_iter()
            .filter_map(|f| match f {
                Frame::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }
}
