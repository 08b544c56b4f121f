//! In-process realtime push hub.
//!
//! Live consumers subscribe to one `(instance, event)` pair over a
//! websocket; the runtime pushes the same payloads it POSTs to webhooks,
//! serialized raw (no envelope wrapper). At most one live transport per key:
//! a new subscription silently replaces the previous one, and nothing is
//! queued for disconnected subscribers.

use crate::token::TokenKeeper;
use crate::types::events::EventKind;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

/// One live push target. Implementations must not block: `push` is called
/// synchronously from event handlers.
pub trait PushTransport: Send + Sync {
    fn push(&self, frame: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct RealtimeHub {
    subscriptions: DashMap<String, Arc<dyn PushTransport>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(instance: &str, event: EventKind) -> String {
        format!("{instance}:{}", event.as_dotted())
    }

    /// Registers a transport for `(instance, event)`, replacing any prior
    /// one (last-writer-wins).
    pub fn subscribe(&self, instance: &str, event: EventKind, transport: Arc<dyn PushTransport>) {
        let key = Self::key(instance, event);
        if self.subscriptions.insert(key, transport).is_some() {
            debug!(target: "Hub", "Replaced subscription for {instance}:{event}");
        }
    }

    /// Pushes the payload to the matching subscriber, if any. A missing
    /// subscriber is a no-op; a failing transport is dropped.
    pub fn send(&self, instance: &str, event: EventKind, payload: &serde_json::Value) {
        let key = Self::key(instance, event);
        let Some(transport) = self.subscriptions.get(&key).map(|t| t.clone()) else {
            return;
        };
        let frame = payload.to_string();
        if let Err(e) = transport.push(&frame) {
            warn!(target: "Hub", "Push to {key} failed, dropping subscriber: {e}");
            self.subscriptions
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &transport));
        }
    }

    /// Drops every subscription belonging to an instance (teardown path).
    pub fn remove_instance(&self, instance: &str) {
        let prefix = format!("{instance}:");
        self.subscriptions.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Removes one subscription, but only if it still points at `transport`
    /// — a replacement must not be evicted by its predecessor's cleanup.
    fn unsubscribe(&self, instance: &str, event: EventKind, transport: &Arc<dyn PushTransport>) {
        let key = Self::key(instance, event);
        self.subscriptions
            .remove_if(&key, |_, current| Arc::ptr_eq(current, transport));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }
}

struct WsPushTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl PushTransport for WsPushTransport {
    fn push(&self, frame: &str) -> anyhow::Result<()> {
        self.tx
            .send(Message::text(frame.to_string()))
            .map_err(|_| anyhow::anyhow!("websocket writer is gone"))
    }
}

/// Accepts websocket subscribers on `listener` until the listener fails.
///
/// Handshake contract: query parameters `event` (must name an allowed event)
/// and `token` (signature-verified bearer credential whose embedded instance
/// name becomes the subscription key). Anything else is rejected with 401
/// before the transport ever reaches the hub.
pub async fn serve(
    hub: Arc<RealtimeHub>,
    keeper: TokenKeeper,
    listener: TcpListener,
) -> anyhow::Result<()> {
    info!(target: "Hub", "Listening for realtime subscribers on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let hub = hub.clone();
        let keeper = keeper.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(hub, keeper, stream).await {
                debug!(target: "Hub", "Connection from {peer} ended: {e}");
            }
        });
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Parses and authorizes the upgrade request's query string.
fn authorize(query: &str, keeper: &TokenKeeper) -> Option<(String, EventKind)> {
    let mut event = None;
    let mut token = None;
    for pair in query.split('&') {
        let (name, value) = pair.split_once('=')?;
        let value = urlencoding::decode(value).ok()?;
        match name {
            "event" => event = EventKind::from_dotted(&value),
            "token" => token = Some(value.into_owned()),
            _ => {}
        }
    }
    let event = event?;
    let instance = keeper.verify(&token?).ok()?;
    Some((instance, event))
}

async fn handle_connection(
    hub: Arc<RealtimeHub>,
    keeper: TokenKeeper,
    stream: TcpStream,
) -> anyhow::Result<()> {
    let mut subscription: Option<(String, EventKind)> = None;
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        match authorize(req.uri().query().unwrap_or(""), &keeper) {
            Some(granted) => {
                subscription = Some(granted);
                Ok(resp)
            }
            None => Err(unauthorized()),
        }
    })
    .await?;

    let (instance, event) = match subscription {
        Some(pair) => pair,
        // accept_hdr_async errors out on rejection, so this is unreachable
        // in practice; bail instead of panicking if the library changes.
        None => anyhow::bail!("handshake accepted without authorization"),
    };
    info!(target: "Hub", "Subscriber attached for {instance}:{event}");

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let transport: Arc<dyn PushTransport> = Arc::new(WsPushTransport { tx });
    hub.subscribe(&instance, event, transport.clone());

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are ignored; the loop only tracks liveness.
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.unsubscribe(&instance, event, &transport);
    drop(transport);
    writer.abort();
    debug!(target: "Hub", "Subscriber detached from {instance}:{event}");
    Ok(())
}
