//! Relay multiplexer: one logical pub/sub over a set of relay URLs.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::event::Event;

/// How long to wait for a relay's OK verdict on a published event.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription filter matching the NIP-01 REQ shape.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    kinds: Vec<u32>,
    since: Option<u64>,
    tags: Vec<(char, Vec<String>)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given kind set.
    pub fn kinds(mut self, kinds: &[u32]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// Lower bound on `created_at`.
    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    /// Add a `#<letter>` tag-value predicate.
    pub fn tag(mut self, letter: char, values: &[&str]) -> Self {
        self.tags
            .push((letter, values.iter().map(|v| v.to_string()).collect()));
        self
    }

    /// Assemble the wire filter object.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        if !self.kinds.is_empty() {
            map.insert(
                "kinds".into(),
                Value::Array(self.kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        for (letter, values) in &self.tags {
            map.insert(
                format!("#{letter}"),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(map)
    }
}

/// Message delivered to a subscription consumer.
#[derive(Debug)]
pub enum SubscriptionMessage {
    /// A filter-matching event, deduplicated by id across relays.
    Event(Event),
    /// A relay finished replaying stored events for this subscription.
    EndOfStored(String),
}

/// Aggregated per-relay outcome of a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PublishReport {
    pub accepted: usize,
    pub failed: usize,
}

impl PublishReport {
    /// At least one relay accepted the event.
    pub fn accepted_any(&self) -> bool {
        self.accepted > 0
    }
}

/// Commands handled by a per-relay connection task.
enum Cmd {
    Subscribe {
        id: String,
        filters: Vec<Value>,
        tx: mpsc::Sender<SubscriptionMessage>,
    },
    Publish {
        event: Event,
        done: oneshot::Sender<bool>,
    },
    Close {
        id: String,
    },
    Shutdown,
}

/// Handle to one logical subscription spanning several relays.
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<SubscriptionMessage>,
    conns: Vec<mpsc::Sender<Cmd>>,
    closed: bool,
}

impl Subscription {
    /// Next message in arrival order; `None` once every relay is gone.
    pub async fn recv(&mut self) -> Option<SubscriptionMessage> {
        self.rx.recv().await
    }

    /// Send CLOSE frames and stop delivery. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for conn in &self.conns {
            let _ = conn.send(Cmd::Close { id: self.id.clone() }).await;
        }
        self.rx.close();
    }
}

/// Pub/sub multiplexer over a set of relays, one connection task per URL.
pub struct RelayMultiplexer {
    tor_socks: Option<String>,
    conns: Mutex<HashMap<String, mpsc::Sender<Cmd>>>,
}

impl RelayMultiplexer {
    /// Create a multiplexer, optionally routing through a SOCKS5 proxy.
    pub fn new(tor_socks: Option<String>) -> Self {
        Self {
            tor_socks,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Command channel for `relay`, spawning the connection task on first use
    /// or after the previous one died.
    fn conn(&self, relay: &str) -> mpsc::Sender<Cmd> {
        let mut conns = self.conns.lock().unwrap();
        if let Some(tx) = conns.get(relay) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_conn(relay.to_string(), self.tor_socks.clone(), rx));
        conns.insert(relay.to_string(), tx.clone());
        tx
    }

    /// Open one subscription across `relays`. Each filter-matching event is
    /// delivered once, deduplicated by event id.
    pub async fn subscribe(&self, relays: &[String], filters: Vec<Value>) -> Subscription {
        let id = sub_id();
        let (raw_tx, mut raw_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let mut conns = Vec::new();
        for relay in relays {
            let conn = self.conn(relay);
            let cmd = Cmd::Subscribe {
                id: id.clone(),
                filters: filters.clone(),
                tx: raw_tx.clone(),
            };
            if conn.send(cmd).await.is_ok() {
                conns.push(conn);
            }
        }
        drop(raw_tx);
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(msg) = raw_rx.recv().await {
                let fresh = match &msg {
                    SubscriptionMessage::Event(ev) => seen.insert(ev.id.clone()),
                    SubscriptionMessage::EndOfStored(_) => true,
                };
                if fresh && out_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Subscription {
            id,
            rx: out_rx,
            conns,
            closed: false,
        }
    }

    /// Send `event` to every listed relay and count OK verdicts.
    pub async fn publish(&self, relays: &[String], event: &Event) -> PublishReport {
        let mut waits = Vec::new();
        for relay in relays {
            let conn = self.conn(relay);
            let (done_tx, done_rx) = oneshot::channel();
            let cmd = Cmd::Publish {
                event: event.clone(),
                done: done_tx,
            };
            waits.push(match conn.send(cmd).await {
                Ok(()) => Some(done_rx),
                Err(_) => None,
            });
        }
        let verdicts = join_all(waits.into_iter().map(|wait| async move {
            match wait {
                Some(rx) => matches!(tokio::time::timeout(PUBLISH_TIMEOUT, rx).await, Ok(Ok(true))),
                None => false,
            }
        }))
        .await;
        let accepted = verdicts.iter().filter(|ok| **ok).count();
        PublishReport {
            accepted,
            failed: verdicts.len() - accepted,
        }
    }

    /// Shut down the connection tasks for the listed relay URLs.
    pub async fn close_all(&self, relays: &[String]) {
        let conns: Vec<_> = {
            let mut map = self.conns.lock().unwrap();
            relays.iter().filter_map(|r| map.remove(r)).collect()
        };
        for conn in conns {
            let _ = conn.send(Cmd::Shutdown).await;
        }
    }
}

/// Random subscription id.
fn sub_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Connection task: owns the WebSocket, routes frames to subscriptions and
/// publish acknowledgements.
async fn run_conn(relay: String, tor_socks: Option<String>, mut rx: mpsc::Receiver<Cmd>) {
    let mut ws = match open_relay(&relay, tor_socks.as_deref()).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(relay = %relay, "connect failed: {e}");
            rx.close();
            while let Some(cmd) = rx.recv().await {
                if let Cmd::Publish { done, .. } = cmd {
                    let _ = done.send(false);
                }
            }
            return;
        }
    };
    let mut subs: HashMap<String, mpsc::Sender<SubscriptionMessage>> = HashMap::new();
    let mut pending: HashMap<String, oneshot::Sender<bool>> = HashMap::new();
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Cmd::Subscribe { id, filters, tx }) => {
                    let mut frame = vec![json!("REQ"), json!(id.clone())];
                    frame.extend(filters);
                    if ws.send(Message::Text(Value::Array(frame).to_string())).await.is_err() {
                        break;
                    }
                    subs.insert(id, tx);
                }
                Some(Cmd::Publish { event, done }) => {
                    let frame = json!(["EVENT", &event]);
                    match ws.send(Message::Text(frame.to_string())).await {
                        Ok(()) => {
                            pending.insert(event.id, done);
                        }
                        Err(e) => {
                            warn!(relay = %relay, "send failed: {e}");
                            let _ = done.send(false);
                            break;
                        }
                    }
                }
                Some(Cmd::Close { id }) => {
                    subs.remove(&id);
                    let _ = ws.send(Message::Text(json!(["CLOSE", id]).to_string())).await;
                }
                Some(Cmd::Shutdown) | None => break,
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(txt))) => {
                    route_frame(&relay, &txt, &mut subs, &mut pending).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(relay = %relay, "websocket error: {e}");
                    break;
                }
            },
        }
    }
    // Fail anything still waiting so publishers do not hang on the timeout.
    for (_, done) in pending.drain() {
        let _ = done.send(false);
    }
    rx.close();
    while let Some(cmd) = rx.recv().await {
        if let Cmd::Publish { done, .. } = cmd {
            let _ = done.send(false);
        }
    }
    debug!(relay = %relay, "connection task finished");
}

/// Dispatch one inbound relay frame.
async fn route_frame(
    relay: &str,
    txt: &str,
    subs: &mut HashMap<String, mpsc::Sender<SubscriptionMessage>>,
    pending: &mut HashMap<String, oneshot::Sender<bool>>,
) {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return;
    };
    let Some(arr) = val.as_array() else {
        return;
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => {
            let sub = arr[1].as_str().unwrap_or_default().to_string();
            if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                if let Some(tx) = subs.get(&sub) {
                    if tx.send(SubscriptionMessage::Event(ev)).await.is_err() {
                        subs.remove(&sub);
                    }
                }
            }
        }
        Some("EOSE") if arr.len() >= 2 => {
            let sub = arr[1].as_str().unwrap_or_default();
            if let Some(tx) = subs.get(sub) {
                let _ = tx
                    .send(SubscriptionMessage::EndOfStored(relay.to_string()))
                    .await;
            }
        }
        Some("OK") if arr.len() >= 3 => {
            let id = arr[1].as_str().unwrap_or_default();
            let accepted = arr[2].as_bool().unwrap_or(false);
            if let Some(done) = pending.remove(id) {
                let _ = done.send(accepted);
            }
        }
        Some("NOTICE") => {
            debug!(relay = %relay, "notice: {txt}");
        }
        _ => {}
    }
}

/// Transport carrying one relay connection: direct TCP, or tunnelled
/// through the configured SOCKS5 proxy.
enum RelayStream {
    Direct(TcpStream),
    Proxied(Socks5Stream<TcpStream>),
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            RelayStream::Direct(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::Proxied(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Direct(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::Proxied(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            RelayStream::Direct(s) => Pin::new(s).poll_flush(cx),
            RelayStream::Proxied(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            RelayStream::Direct(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::Proxied(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Resolve a relay URL, pick the transport, and complete the WebSocket
/// handshake.
async fn open_relay(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<RelayStream>> {
    let url = Url::parse(relay)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("relay url has no host: {relay}"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("relay url has no port: {relay}"))?;
    let stream = match tor_socks {
        Some(proxy) => RelayStream::Proxied(Socks5Stream::connect(proxy, (host, port)).await?),
        None => RelayStream::Direct(TcpStream::connect((host, port)).await?),
    };
    let (ws, _) = client_async(relay.into_client_request()?, stream).await?;
    Ok(ws)
}
