//! WebSocket transport.
//!
//! Every accepted TCP connection is upgraded here, gets its identity cookie, room name
//! and address from the handshake, and is then bridged to the chat actor: a reader
//! forwards client frames as events, a writer drains the session's outbound queue.

use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SET_COOKIE};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::identity::IdentityResolver;
use super::protocol::Frame;
use super::server::ServerHandle;
use crate::config::ServerConfig;
use crate::logutil::escape_log;
use crate::validation::{cookie_token, parse_channel_name};

/// What the upgrade request told us about the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub channel: String,
    pub token: String,
    /// Address claimed by a reverse proxy through `X-Real-IP`.
    pub real_ip: Option<IpAddr>,
    /// The cookie was generated for this connection.
    pub fresh_token: bool,
}

impl Handshake {
    pub fn from_request(req: &Request, default_channel: &str) -> Result<Self, String> {
        let channel = parse_channel_name(req.uri().path(), default_channel).map_err(|e| e.to_string())?;
        let existing = req
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(cookie_token);
        let real_ip = req
            .headers()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let fresh_token = existing.is_none();
        Ok(Self {
            channel,
            token: existing.unwrap_or_else(IdentityResolver::fresh_token),
            real_ip,
            fresh_token,
        })
    }

    /// Address the connection is accounted to.
    pub fn address(&self, peer: IpAddr, trust_proxy: bool) -> IpAddr {
        match self.real_ip {
            Some(ip) if trust_proxy => ip,
            _ => peer,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Listener {
    default_channel: String,
    trust_proxy: bool,
}

impl Listener {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            default_channel: config.default_channel.clone(),
            trust_proxy: config.trust_proxy_headers,
        }
    }

    /// Accept connections forever, one task per client.
    pub async fn serve(self, listener: TcpListener, handle: ServerHandle) -> Result<()> {
        info!("Listening for WebSocket clients on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer, handle).await {
                    debug!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, handle: ServerHandle) -> Result<()> {
        let mut handshake = None;
        let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            match Handshake::from_request(req, &self.default_channel) {
                Ok(hs) => {
                    if hs.fresh_token {
                        let cookie = format!("id={}; Path=/; Max-Age=31536000; SameSite=Lax", hs.token);
                        if let Ok(value) = HeaderValue::from_str(&cookie) {
                            resp.headers_mut().insert(SET_COOKIE, value);
                        }
                    }
                    handshake = Some(hs);
                    Ok(resp)
                }
                Err(reason) => {
                    let mut err = ErrorResponse::new(Some(reason));
                    *err.status_mut() = StatusCode::BAD_REQUEST;
                    Err(err)
                }
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(handshake) = handshake else {
            return Ok(());
        };
        let addr = handshake.address(peer.ip(), self.trust_proxy);
        debug!("Upgrade from {} for '{}'", addr, escape_log(&handshake.channel));

        let (session, mut frames) = handle.connect(addr, handshake.token, handshake.channel);
        let (mut sink, mut stream) = ws.split();

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let res = match frame {
                    Frame::Text(text) => sink.send(Message::Text(text)).await,
                    Frame::Binary(payload) => sink.send(Message::Binary(payload.to_vec())).await,
                    Frame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: code.code().into(),
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                };
                if res.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => handle.text(session, text),
                    Some(Ok(Message::Binary(payload))) => handle.binary(session, Bytes::from(payload)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Read error on session {}: {}", session, e);
                        break;
                    }
                },
                _ = &mut writer => break,
            }
        }
        handle.disconnected(session);
        Ok(())
    }
}
