//! The chat actor.
//!
//! One task owns [`ServerState`] and handles every event in arrival order: transport
//! connections and frames, finished renders, due timers and shutdown. Nothing else ever
//! touches the state, so handlers run without locks. Slow collaborators (the renderer,
//! the firewall) are spawned as separate tasks; renders report back through the same
//! event queue.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use super::firewall::Firewall;
use super::handlers;
use super::protocol::{Frame, SessionLink};
use super::render::{RenderError, RenderJob, Renderer};
use super::routing::RoutingTable;
use super::session::SessionId;
use super::state::{ConnectRequest, Deferred, ServerState};
use crate::config::Config;
use crate::events::scheduler::DelayedAction;
use crate::events::WorldEvents;
use crate::metrics;

#[derive(Debug)]
pub enum ServerEvent {
    Connected(ConnectRequest),
    Text { session: SessionId, text: String },
    Binary { session: SessionId, payload: Bytes },
    Disconnected { session: SessionId },
    RenderDone {
        job: Box<RenderJob>,
        result: Result<Option<Bytes>, RenderError>,
    },
    Shutdown { reason: String },
}

/// Cloneable entry point used by the transport (and by tests) to feed the actor.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerEvent>,
    next_session: Arc<AtomicU64>,
}

impl ServerHandle {
    /// Open a session and ask to join `channel`. Frames for the connection arrive on
    /// the returned receiver, a close frame included when the join is refused.
    pub fn connect(
        &self,
        addr: IpAddr,
        token: impl Into<String>,
        channel: impl Into<String>,
    ) -> (SessionId, mpsc::UnboundedReceiver<Frame>) {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(ServerEvent::Connected(ConnectRequest {
            session,
            addr,
            token: token.into(),
            channel: channel.into(),
            link: SessionLink::new(session, tx),
        }));
        (session, rx)
    }

    pub fn text(&self, session: SessionId, text: impl Into<String>) {
        self.send(ServerEvent::Text {
            session,
            text: text.into(),
        });
    }

    pub fn binary(&self, session: SessionId, payload: Bytes) {
        self.send(ServerEvent::Binary { session, payload });
    }

    pub fn disconnected(&self, session: SessionId) {
        self.send(ServerEvent::Disconnected { session });
    }

    pub fn shutdown(&self, reason: impl Into<String>) {
        self.send(ServerEvent::Shutdown {
            reason: reason.into(),
        });
    }

    fn send(&self, event: ServerEvent) {
        if self.tx.send(event).is_err() {
            debug!("Chat server is gone; dropping event");
        }
    }
}

pub struct ChatServer {
    state: ServerState,
    routes: RoutingTable,
    events: WorldEvents,
    renderer: Arc<dyn Renderer>,
    firewall: Arc<dyn Firewall>,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
    tx: mpsc::UnboundedSender<ServerEvent>,
    rng: StdRng,
}

impl ChatServer {
    pub fn new(config: Config, renderer: Arc<dyn Renderer>, firewall: Arc<dyn Firewall>) -> Result<(Self, ServerHandle)> {
        let events = WorldEvents::from_config(&config.events);
        let state = ServerState::new(config).map_err(|e| anyhow!("Invalid flood configuration: {}", e))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ServerHandle {
            tx: tx.clone(),
            next_session: Arc::new(AtomicU64::new(0)),
        };
        let server = Self {
            state,
            routes: RoutingTable::standard(),
            events,
            renderer,
            firewall,
            rx,
            tx,
            rng: StdRng::from_entropy(),
        };
        Ok((server, handle))
    }

    /// Replace the world event registry; tests use this to get a predictable cadence.
    pub fn with_events(mut self, events: WorldEvents) -> Self {
        self.events = events;
        self
    }

    /// Spawn the actor on the current runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Main loop. Returns once a shutdown event has been handled.
    pub async fn run(mut self) -> Result<()> {
        info!("Chat server started");
        let now = Instant::now();
        self.events.start(&mut self.state.timers, now, &mut self.rng);

        let period = Duration::from_secs(self.state.config.server.status_interval_secs.max(1));
        let mut status = tokio::time::interval_at(now + period, period);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = self.state.timers.next_due();
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(ServerEvent::Shutdown { reason }) => {
                            info!("Shutting down: {}", reason);
                            self.state.shutdown(&reason);
                            break;
                        }
                        Some(event) => self.handle_event(event, Instant::now()),
                        // unreachable while we hold a sender
                        None => break,
                    }
                }
                _ = wait_until(next_due) => {
                    self.run_due(Instant::now());
                }
                _ = status.tick() => {
                    self.log_status();
                }
            }
            self.spawn_deferred();
        }
        info!("Chat server stopped");
        Ok(())
    }

    fn handle_event(&mut self, event: ServerEvent, now: Instant) {
        match event {
            ServerEvent::Connected(req) => {
                let link = req.link.clone();
                let addr = req.addr;
                if let Err(e) = self.state.connect(req, now) {
                    debug!("Refused connection from {}: {}", addr, e);
                    link.close(e.close_code(), e.reason());
                }
                self.state.reap();
            }
            ServerEvent::Text { session, text } => {
                handlers::handle_text(&mut self.state, &self.routes, session, &text, now);
            }
            ServerEvent::Binary { session, payload } => {
                handlers::handle_binary(&mut self.state, session, payload);
            }
            ServerEvent::Disconnected { session } => {
                self.state.disconnect(session);
            }
            ServerEvent::RenderDone { job, result } => {
                handlers::render_done(&mut self.state, *job, result, now);
            }
            ServerEvent::Shutdown { .. } => {}
        }
    }

    /// Run every delayed action whose instant has passed.
    fn run_due(&mut self, now: Instant) {
        while let Some((due, action)) = self.state.timers.pop_due(now) {
            match action {
                DelayedAction::WorldEvent(index) => {
                    self.events.fire(
                        index,
                        &mut self.state.channels,
                        &mut self.state.timers,
                        due,
                        now,
                        &mut self.rng,
                    );
                }
                DelayedAction::LiftBan { tier, identity } => self.state.lift_ban(&identity, tier),
                DelayedAction::ClearFloodWarning {
                    channel,
                    user_id,
                    generation,
                } => self.state.clear_flood_warning(&channel, &user_id, generation),
            }
        }
    }

    fn spawn_deferred(&mut self) {
        for work in self.state.take_deferred() {
            match work {
                Deferred::Render(job) => {
                    let renderer = Arc::clone(&self.renderer);
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        // RenderDone is posted even when the renderer panics
                        let task_job = job.clone();
                        let result = tokio::spawn(async move { renderer.render(&task_job).await })
                            .await
                            .unwrap_or(Err(RenderError::Aborted));
                        let _ = tx.send(ServerEvent::RenderDone {
                            job: Box::new(job),
                            result,
                        });
                    });
                }
                Deferred::Firewall(req) => {
                    let firewall = Arc::clone(&self.firewall);
                    tokio::spawn(async move {
                        match firewall.apply_ban(&req.addresses, req.tier, req.duration).await {
                            Ok(()) => debug!("Firewall {} applied to {} addresses", req.tier, req.addresses.len()),
                            Err(e) => warn!("Firewall {} failed: {}", req.tier, e),
                        }
                    });
                }
            }
        }
    }

    fn log_status(&self) {
        let snap = metrics::snapshot();
        info!(
            "Status: {} channels, {} users, {} sessions, {} timers | accepted={} rejected={} routed={} warnings={} bans={} kicked={} render_failures={} audio_suppressed={} events={}",
            self.state.channels.len(),
            self.state.user_count(),
            self.state.sessions.len(),
            self.state.timers.len(),
            snap.connections_accepted,
            snap.connections_rejected,
            snap.messages_routed,
            snap.flood_warnings,
            snap.bans_applied,
            snap.sessions_kicked,
            snap.renders_failed,
            snap.audio_suppressed,
            snap.event_firings,
        );
    }
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(due) => sleep_until(due).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::firewall::DisabledFirewall;
    use crate::chat::protocol::CloseCode;
    use crate::chat::render::SilentRenderer;

    fn start(config: Config) -> ServerHandle {
        let (server, handle) = ChatServer::new(config, Arc::new(SilentRenderer), Arc::new(DisabledFirewall))
            .expect("server");
        server.with_events(WorldEvents::default()).spawn();
        handle
    }

    fn text_of(frame: Frame) -> serde_json::Value {
        match frame {
            Frame::Text(t) => serde_json::from_str(&t).expect("json"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn join_then_shutdown_closes_with_1000() {
        let handle = start(Config::default());
        let (_id, mut rx) = handle.connect("10.0.0.1".parse().unwrap(), "tok", "lobby");
        assert_eq!(text_of(rx.recv().await.unwrap())["type"], "userlist");
        assert_eq!(text_of(rx.recv().await.unwrap())["type"], "backlog");
        handle.shutdown("maintenance");
        match rx.recv().await.unwrap() {
            Frame::Close { code, .. } => assert_eq!(code, CloseCode::Shutdown),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_render_still_delivers_text() {
        let handle = start(Config::default());
        let (id, mut rx) = handle.connect("10.0.0.1".parse().unwrap(), "tok", "lobby");
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        handle.text(id, r#"{"type": "msg", "msg": "hello"}"#);
        let msg = text_of(rx.recv().await.unwrap());
        assert_eq!(msg["type"], "msg");
        assert_eq!(msg["msg"], "hello");
    }
}
