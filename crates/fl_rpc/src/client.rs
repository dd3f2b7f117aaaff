//! RPC client — opens framed duplex links, signs and correlates
//! requests, and optionally reconnects with exponential backoff.
//!
//! One link per endpoint per client. Each link owns a driver task that
//! pumps the socket in both directions; pending requests park on
//! oneshot channels keyed by request id, and locks are never held
//! across a suspension point — the waker is cloned out instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, info, warn};

use fl_crypto::{is_valid_aid, Aid, KeyPair};
use fl_directory::DirectoryProvider;
use fl_events::{Event, EventFilter};

use crate::error::RpcError;
use crate::server::{parse_endpoint, HEARTBEAT_METHOD};
use crate::signing::{sign_request, SignaturePolicy};
use crate::wire::{now_ms, ControlFrame, Frame, Request, RequestId, Response};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    /// Bound on directory lookups during target resolution.
    pub discovery_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub signature_policy: SignaturePolicy,
    /// Capacity of per-link notification and event fan-out channels.
    pub inbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            signature_policy: SignaturePolicy::default(),
            inbound_buffer: 256,
        }
    }
}

/// Per-endpoint lifecycle events.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { url: String },
    Disconnected { url: String },
    Reconnecting { url: String, attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One outgoing call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// `rpc://host:port` URL, an AID, or a capability name.
    pub to: String,
    pub method: String,
    pub params: Option<Value>,
    /// Overrides the client-wide request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(to: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            method: method.into(),
            params: None,
            timeout: None,
        }
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── Link ─────────────────────────────────────────────────────────────────────

type PendingSender = oneshot::Sender<Result<Value, RpcError>>;

struct Link {
    url: String,
    state: Mutex<LinkState>,
    pending: Mutex<HashMap<String, PendingSender>>,
    outbound: mpsc::Sender<String>,
    notifications: broadcast::Sender<Request>,
    remote_events: broadcast::Sender<Event>,
    /// The last subscribe filter, re-sent after a reconnect.
    subscription: Mutex<Option<Option<EventFilter>>>,
    closer: watch::Sender<bool>,
}

impl Link {
    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Fail every in-flight request. Senders are drained out of the
    /// lock before completing them.
    fn reject_pending(&self, reason: &str) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(RpcError::Transport(reason.to_string())));
        }
    }

    /// Route one inbound frame: correlate responses, answer heartbeat
    /// probes, fan out notifications and remote events.
    fn route_inbound(&self, raw: &str) {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            debug!(url = %self.url, "unparseable inbound frame");
            return;
        };
        match Frame::decode(&value) {
            Ok(Frame::Response(response)) => {
                let key = response.id.to_string();
                let waiter = self.pending.lock().remove(&key);
                if let Some(tx) = waiter {
                    let outcome = match response.error {
                        Some(error) => Err(error.into()),
                        None => Ok(response.result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                } else {
                    debug!(url = %self.url, id = %key, "response with no pending request");
                }
            }
            Ok(Frame::Request(notification)) => {
                if notification.method == HEARTBEAT_METHOD {
                    let pong = Response::ok(notification.id.clone(), Value::String("pong".into()));
                    if let Ok(frame) = serde_json::to_string(&pong) {
                        let _ = self.outbound.try_send(frame);
                    }
                }
                let _ = self.notifications.send(notification);
            }
            Ok(Frame::Event(event)) => {
                let _ = self.remote_events.send(event);
            }
            Ok(Frame::Control(_)) => {
                debug!(url = %self.url, "unexpected control frame from server");
            }
            Err(reason) => debug!(url = %self.url, reason, "undecodable inbound frame"),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct RpcClient {
    identity: KeyPair,
    config: ClientConfig,
    directory: Arc<dyn DirectoryProvider>,
    links: tokio::sync::Mutex<HashMap<String, Arc<Link>>>,
    events: broadcast::Sender<ClientEvent>,
    closed: AtomicBool,
    counter: AtomicU64,
}

impl RpcClient {
    pub fn new(
        identity: KeyPair,
        config: ClientConfig,
        directory: Arc<dyn DirectoryProvider>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            identity,
            config,
            directory,
            links: tokio::sync::Mutex::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        })
    }

    /// Convenience constructor against the process-wide directory.
    pub fn with_shared_directory(identity: KeyPair, config: ClientConfig) -> Arc<Self> {
        let directory = fl_directory::shared();
        Self::new(identity, config, directory)
    }

    pub fn aid(&self) -> Aid {
        Aid::from_public_key(&self.identity.public_key())
    }

    pub fn subscribe_link_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Current state of the link to `url`, if one was ever opened.
    pub async fn link_state(&self, url: &str) -> Option<LinkState> {
        self.links.lock().await.get(url).map(|l| l.state())
    }

    /// Send a request and await its correlated response.
    pub async fn request(&self, opts: RequestOptions) -> Result<Value, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let url = self.resolve(&opts.to).await?;
        let link = self.link(&url).await?;

        let id_text = format!(
            "req-{}-{}",
            self.counter.fetch_add(1, Ordering::Relaxed),
            now_ms()
        );
        let mut request = Request::new(
            RequestId::Text(id_text.clone()),
            opts.method.clone(),
            opts.params.clone(),
        );
        sign_request(&self.identity, self.config.signature_policy, &mut request)?;
        let frame = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        link.pending.lock().insert(id_text.clone(), tx);
        if link.outbound.send(frame).await.is_err() {
            link.pending.lock().remove(&id_text);
            return Err(RpcError::Transport("link closed".into()));
        }

        let timeout = opts.timeout.unwrap_or(self.config.request_timeout);
        match time::timeout(timeout, rx).await {
            Err(_) => {
                // The timer fired: drop the pending entry so nothing
                // leaks, then report.
                link.pending.lock().remove(&id_text);
                Err(RpcError::Timeout(timeout.as_millis() as u64))
            }
            Ok(Err(_)) => Err(RpcError::Transport("link closed".into())),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Subscribe to the remote event stream at `to`. Replay frames
    /// arrive on the returned channel before any live event.
    pub async fn subscribe_events(
        &self,
        to: &str,
        filter: Option<EventFilter>,
    ) -> Result<broadcast::Receiver<Event>, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let url = self.resolve(to).await?;
        let link = self.link(&url).await?;
        let receiver = link.remote_events.subscribe();
        *link.subscription.lock() = Some(filter.clone());
        let frame = serde_json::to_string(&ControlFrame::Subscribe { filter })?;
        link.outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::Transport("link closed".into()))?;
        Ok(receiver)
    }

    /// Server-originated notifications on the link to `to`.
    pub async fn notifications(&self, to: &str) -> Result<broadcast::Receiver<Request>, RpcError> {
        let url = self.resolve(to).await?;
        let link = self.link(&url).await?;
        Ok(link.notifications.subscribe())
    }

    /// Intentional close: rejects all pending requests, stops every
    /// link without reconnecting, and fails subsequent calls.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let links = self.links.lock().await;
        for link in links.values() {
            link.set_state(LinkState::Closing);
            let _ = link.closer.send(true);
        }
    }

    // ── Target resolution ───────────────────────────────────────────────

    /// A `rpc://` URL is used directly; an AID goes through directory
    /// lookup; anything else is treated as a capability and the first
    /// discovered agent wins.
    async fn resolve(&self, to: &str) -> Result<String, RpcError> {
        if to.starts_with("rpc://") {
            return Ok(to.to_string());
        }
        if is_valid_aid(to) {
            let aid = Aid::new(to)?;
            return self.endpoint_of(&aid).await;
        }
        let discovered = time::timeout(
            self.config.discovery_timeout,
            self.directory.discover(to),
        )
        .await
        .map_err(|_| RpcError::DiscoveryFailed("directory discover timed out".into()))?;
        let first = discovered
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::DiscoveryFailed(format!("no agent with capability '{to}'")))?;
        self.endpoint_of(&first).await
    }

    async fn endpoint_of(&self, aid: &Aid) -> Result<String, RpcError> {
        let meta = time::timeout(self.config.discovery_timeout, self.directory.lookup(aid))
            .await
            .map_err(|_| RpcError::DiscoveryFailed("directory lookup timed out".into()))?
            .ok_or_else(|| RpcError::DiscoveryFailed(format!("{aid} is not registered")))?;
        meta.endpoints
            .rpc
            .ok_or_else(|| RpcError::DiscoveryFailed(format!("{aid} has no rpc endpoint")))
    }

    // ── Link management ─────────────────────────────────────────────────

    async fn link(&self, url: &str) -> Result<Arc<Link>, RpcError> {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get(url) {
            if link.state() != LinkState::Closed {
                return Ok(Arc::clone(link));
            }
            links.remove(url);
        }

        let addr = parse_endpoint(url)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| RpcError::Transport(format!("connect {url}: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.inbound_buffer.max(1));
        let (notifications, _) = broadcast::channel(self.config.inbound_buffer.max(1));
        let (remote_events, _) = broadcast::channel(self.config.inbound_buffer.max(1));
        let (closer, _) = watch::channel(false);
        let link = Arc::new(Link {
            url: url.to_string(),
            state: Mutex::new(LinkState::Open),
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            notifications,
            remote_events,
            subscription: Mutex::new(None),
            closer,
        });
        links.insert(url.to_string(), Arc::clone(&link));

        info!(url = %url, "link opened");
        let _ = self.events.send(ClientEvent::Connected {
            url: url.to_string(),
        });
        tokio::spawn(drive_link(
            Arc::clone(&link),
            stream,
            outbound_rx,
            addr,
            self.config.reconnect.clone(),
            self.events.clone(),
        ));
        Ok(link)
    }
}

// ── Link driver ──────────────────────────────────────────────────────────────

#[derive(PartialEq, Eq)]
enum CloseReason {
    /// `close()` or client drop.
    Local,
    /// EOF or socket error.
    Peer,
}

/// Owns one link's connection lifecycle, including reconnects. The
/// outbound queue survives reconnection; pending requests do not.
async fn drive_link(
    link: Arc<Link>,
    stream: TcpStream,
    mut outbound_rx: mpsc::Receiver<String>,
    addr: String,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ClientEvent>,
) {
    let mut current = Some(stream);
    loop {
        let stream = match current.take() {
            Some(s) => s,
            None => break,
        };
        let reason = run_link(&link, stream, &mut outbound_rx).await;

        match reason {
            CloseReason::Local => {
                link.reject_pending("Client closed");
                link.set_state(LinkState::Closed);
                let _ = events.send(ClientEvent::Disconnected {
                    url: link.url.clone(),
                });
                break;
            }
            CloseReason::Peer => {
                link.reject_pending("Server closed");
                let _ = events.send(ClientEvent::Disconnected {
                    url: link.url.clone(),
                });
            }
        }

        if !policy.enabled {
            link.set_state(LinkState::Closed);
            break;
        }

        link.set_state(LinkState::Connecting);
        let mut backoff = policy.initial_backoff;
        let mut closer_rx = link.closer.subscribe();
        for attempt in 1..=policy.max_attempts {
            let _ = events.send(ClientEvent::Reconnecting {
                url: link.url.clone(),
                attempt,
            });
            tokio::select! {
                _ = time::sleep(backoff) => {}
                _ = closer_rx.changed() => {
                    if *closer_rx.borrow() {
                        link.set_state(LinkState::Closed);
                        return;
                    }
                }
            }
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    current = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!(url = %link.url, attempt, error = %e, "reconnect failed");
                    backoff = (backoff * policy.backoff_factor).min(policy.max_backoff);
                }
            }
        }

        match current {
            Some(_) => {
                // Backoff resets on the next outage; re-announce any
                // event subscription before new traffic flows.
                link.set_state(LinkState::Open);
                info!(url = %link.url, "link reopened");
                let _ = events.send(ClientEvent::Connected {
                    url: link.url.clone(),
                });
                let filter = link.subscription.lock().clone();
                if let Some(filter) = filter {
                    if let Ok(frame) = serde_json::to_string(&ControlFrame::Subscribe { filter }) {
                        let _ = link.outbound.try_send(frame);
                    }
                }
            }
            None => {
                warn!(url = %link.url, attempts = policy.max_attempts, "reconnect exhausted");
                link.set_state(LinkState::Closed);
                break;
            }
        }
    }
}

/// Pump one live connection until it closes. Outbound frames come from
/// the link's queue; inbound bytes are reassembled into newline-framed
/// documents here — `read` keeps partial lines in our own buffer when
/// the select races, where a buffered `read_line` would lose them.
async fn run_link(
    link: &Arc<Link>,
    stream: TcpStream,
    outbound_rx: &mut mpsc::Receiver<String>,
) -> CloseReason {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut closer_rx = link.closer.subscribe();
    let mut inbound: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                None => return CloseReason::Local,
                Some(frame) => {
                    if write_half.write_all(frame.as_bytes()).await.is_err()
                        || write_half.write_all(b"\n").await.is_err()
                        || write_half.flush().await.is_err()
                    {
                        return CloseReason::Peer;
                    }
                }
            },
            read = read_half.read(&mut chunk) => match read {
                Ok(0) | Err(_) => return CloseReason::Peer,
                Ok(n) => {
                    inbound.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = inbound.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = inbound.drain(..=pos).collect();
                        if let Ok(text) = std::str::from_utf8(&line) {
                            let text = text.trim_end();
                            if !text.is_empty() {
                                link.route_inbound(text);
                            }
                        }
                    }
                }
            },
            _ = closer_rx.changed() => {
                if *closer_rx.borrow() {
                    return CloseReason::Local;
                }
            }
        }
    }
}
