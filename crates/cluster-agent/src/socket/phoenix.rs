//! Phoenix channels client for the console's push socket.
//!
//! Speaks the V2 JSON serializer: every frame is an array
//! `[join_ref, ref, topic, event, payload]`. The connection lives in a
//! background task that reconnects with capped exponential backoff;
//! [`Socket::join`] only (re)joins the cluster channel once connected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{Publisher, PublisherRegistry, Socket};
use crate::error::{Error, Result};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Connection parameters for [`PhoenixSocket`].
#[derive(Debug, Clone)]
pub struct SocketArgs {
    pub cluster_id: String,
    pub console_url: String,
    pub deploy_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame(Option<String>, Option<String>, String, String, Value);

impl Frame {
    fn join_ref(&self) -> Option<&str> {
        self.0.as_deref()
    }

    fn msg_ref(&self) -> Option<&str> {
        self.1.as_deref()
    }

    fn topic(&self) -> &str {
        &self.2
    }

    fn event(&self) -> &str {
        &self.3
    }
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    id: String,
    #[serde(default)]
    kick: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Channel {
    Idle,
    Joining(String),
    Joined,
}

struct Inner {
    topic: String,
    registry: PublisherRegistry,
    connected: AtomicBool,
    channel: Mutex<Channel>,
    refs: AtomicU64,
    outbound: mpsc::UnboundedSender<String>,
}

impl Inner {
    fn next_ref(&self) -> String {
        (self.refs.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn send(&self, frame: &Frame) -> anyhow::Result<()> {
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(text)
            .map_err(|_| anyhow::anyhow!("socket connection task is gone"))
    }

    fn heartbeat(&self) -> anyhow::Result<()> {
        self.send(&Frame(
            None,
            Some(self.next_ref()),
            "phoenix".to_string(),
            "heartbeat".to_string(),
            json!({}),
        ))
    }

    fn on_connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.channel.lock() = Channel::Idle;
    }

    fn join(&self) -> anyhow::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            info!("socket not yet connected, waiting...");
            return Ok(());
        }

        let join_ref = {
            let mut channel = self.channel.lock();
            if *channel != Channel::Idle {
                return Ok(());
            }
            let join_ref = self.next_ref();
            *channel = Channel::Joining(join_ref.clone());
            join_ref
        };

        info!(channel = %self.topic, "connecting to channel");
        let sent = self.send(&Frame(
            Some(join_ref.clone()),
            Some(join_ref),
            self.topic.clone(),
            "phx_join".to_string(),
            json!({}),
        ));
        if sent.is_err() {
            *self.channel.lock() = Channel::Idle;
        }
        sent
    }

    fn handle_text(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed socket frame");
                return;
            }
        };
        trace!(topic = %frame.topic(), event = %frame.event(), "socket frame");

        if frame.topic() != self.topic {
            // heartbeat replies on the phoenix topic
            return;
        }

        match frame.event() {
            "phx_reply" => self.handle_reply(&frame),
            "phx_error" | "phx_close" => {
                info!(channel = %self.topic, event = %frame.event(), "left websocket channel");
                *self.channel.lock() = Channel::Idle;
            }
            event => match serde_json::from_value::<EventPayload>(frame.4.clone()) {
                Ok(payload) => {
                    debug!(event = %event, id = %payload.id, kick = payload.kick, "push event");
                    self.registry.dispatch(event, &payload.id, payload.kick);
                }
                Err(e) => {
                    debug!(event = %event, error = %e, "ignoring event without id");
                }
            },
        }
    }

    fn handle_reply(&self, frame: &Frame) {
        let mut channel = self.channel.lock();
        let Channel::Joining(pending) = &*channel else {
            return;
        };
        if frame.msg_ref() != Some(pending.as_str()) && frame.join_ref() != Some(pending.as_str())
        {
            return;
        }

        let status = frame.4.get("status").and_then(Value::as_str).unwrap_or("");
        if status == "ok" {
            info!(channel = %self.topic, "joined websocket channel, listening for updates");
            *channel = Channel::Joined;
        } else {
            warn!(channel = %self.topic, status = %status, "failed to join channel, retrying");
            *channel = Channel::Idle;
        }
    }
}

/// Websocket connection to the console joined to `cluster:{cluster_id}`.
pub struct PhoenixSocket {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl PhoenixSocket {
    /// Start connecting in the background. Must be called within a Tokio runtime.
    ///
    /// Only URL errors fail here; an unreachable console is retried forever
    /// while the agent keeps working off polls.
    pub fn connect(args: &SocketArgs) -> Result<Self> {
        let endpoint = endpoint(&args.console_url, &args.deploy_token)?;
        let (outbound, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            topic: format!("cluster:{}", args.cluster_id),
            registry: PublisherRegistry::new(),
            connected: AtomicBool::new(false),
            channel: Mutex::new(Channel::Idle),
            refs: AtomicU64::new(0),
            outbound,
        });

        let cancel = CancellationToken::new();
        tokio::spawn(run(endpoint, Arc::clone(&inner), rx, cancel.clone()));
        Ok(Self { inner, cancel })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        *self.inner.channel.lock() == Channel::Joined
    }
}

impl Drop for PhoenixSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Socket for PhoenixSocket {
    fn add_publisher(&self, event: &str, publisher: Arc<dyn Publisher>) {
        self.inner.registry.register(event, publisher);
    }

    async fn join(&self) -> anyhow::Result<()> {
        self.inner.join()
    }
}

/// `wss://{console host}/ext/socket/websocket?vsn=2.0.0&token={token}`
pub fn endpoint(console_url: &str, deploy_token: &str) -> Result<Url> {
    let console = Url::parse(console_url)?;
    let host = console
        .host_str()
        .ok_or_else(|| Error::Config(format!("console url {console_url} has no host")))?;
    let authority = match console.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut endpoint = Url::parse(&format!("wss://{authority}/ext/socket/websocket"))?;
    endpoint
        .query_pairs_mut()
        .append_pair("vsn", "2.0.0")
        .append_pair("token", deploy_token);
    Ok(endpoint)
}

/// Drop frames queued for a previous connection; their refs mean nothing on
/// a new one.
fn discard_pending(outbound: &mut mpsc::UnboundedReceiver<String>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

async fn run(
    endpoint: Url,
    inner: Arc<Inner>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let host = endpoint.host_str().unwrap_or_default().to_string();
    let mut delay = BASE_RECONNECT_DELAY;

    while !cancel.is_cancelled() {
        match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => {
                info!(host = %host, "connected to console socket");
                delay = BASE_RECONNECT_DELAY;
                let stale = discard_pending(&mut outbound);
                if stale > 0 {
                    debug!(frames = stale, "dropped frames queued while disconnected");
                }
                inner.on_connect();
                if let Err(e) = inner.join() {
                    warn!(error = %e, "failed to join channel after connect");
                }

                let (mut sink, mut source) = stream.split();
                let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
                heartbeat.tick().await;

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            inner.on_disconnect();
                            return;
                        }
                        _ = heartbeat.tick() => {
                            if let Err(e) = inner.heartbeat() {
                                error!(error = %e, "failed to queue heartbeat");
                            }
                        }
                        Some(text) = outbound.recv() => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                warn!(error = %e, "socket write failed");
                                break;
                            }
                        }
                        msg = source.next() => match msg {
                            Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str()),
                            Some(Ok(Message::Ping(payload))) => {
                                if let Err(e) = sink.send(Message::Pong(payload)).await {
                                    warn!(error = %e, "socket write failed");
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!(host = %host, "console socket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "console socket error");
                                break;
                            }
                        },
                    }
                }

                inner.on_disconnect();
                discard_pending(&mut outbound);
            }
            Err(e) => {
                warn!(host = %host, error = %e, retry_in = ?delay, "console socket connection failed");
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}
