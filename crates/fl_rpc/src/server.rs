//! RPC server — accepts framed duplex links, authenticates requests,
//! runs the middleware chain, dispatches handlers, and fans out
//! notifications and events.
//!
//! Connections live in an arena keyed by `ConnId`; frames and
//! middleware never hold a back-reference to the server. Each
//! connection owns a reader task and a writer task joined by a bounded
//! outbound queue, so a slow peer only ever loses its own frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use fl_crypto::Aid;
use fl_events::{Event, EventFilter, EventSink, EventStream, SubscriptionId};

use crate::error::{ErrorObject, RpcError};
use crate::middleware::{
    run_chain, Middleware, MiddlewareFuture, RequestContext,
};
use crate::signing::{verify_request, SignaturePolicy};
use crate::wire::{now_ms, ControlFrame, Frame, Request, RequestId, Response};

/// Liveness probe sent by the heartbeat sweep; clients answer with a
/// plain response frame.
pub const HEARTBEAT_METHOD: &str = "heartbeat.ping";

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Require a verifiable auth stamp on every request.
    pub require_auth: bool,
    pub signature_policy: SignaturePolicy,
    /// `None` disables the liveness sweep.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Outbound frames queued per connection before drops set in.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            signature_policy: SignaturePolicy::default(),
            heartbeat: None,
            outbound_buffer: 256,
        }
    }
}

// ── Connection arena ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

struct ConnectionHandle {
    outbound: mpsc::Sender<String>,
    closer: watch::Sender<bool>,
    alive: bool,
    did: Option<Aid>,
    subscription: Option<SubscriptionId>,
}

/// Lifecycle events observable via [`RpcServer::subscribe_events`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected { did: Aid },
    ClientDisconnected { did: Aid },
}

// ── Handlers ─────────────────────────────────────────────────────────────────

type HandlerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, ErrorObject>> + Send>>;
type Handler = Arc<dyn Fn(Option<Value>, Option<Aid>) -> HandlerFuture + Send + Sync>;

// ── Server ───────────────────────────────────────────────────────────────────

pub struct RpcServer {
    config: ServerConfig,
    handlers: RwLock<HashMap<String, Handler>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    connections: Mutex<HashMap<ConnId, ConnectionHandle>>,
    server_events: broadcast::Sender<ServerEvent>,
    stream: Option<Arc<EventStream>>,
    next_conn: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl RpcServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_event_stream(config, None)
    }

    /// A server with an attached event stream relays buffered and live
    /// events to connections that send a subscribe frame.
    pub fn with_event_stream(
        config: ServerConfig,
        stream: Option<Arc<EventStream>>,
    ) -> Arc<Self> {
        let (server_events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            server_events,
            stream,
            next_conn: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Register a method handler. Re-registering a method replaces it.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>, Option<Aid>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ErrorObject>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params, from| Box::pin(handler(params, from)));
        self.handlers.write().insert(method.into(), handler);
    }

    /// Append a middleware; the chain runs in registration order.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().push(middleware);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.server_events.subscribe()
    }

    /// Bind and start serving. Returns the bound address (useful with
    /// port 0 in tests); the accept loop runs until [`shutdown`].
    ///
    /// [`shutdown`]: RpcServer::shutdown
    pub async fn bind(self: &Arc<Self>, endpoint: &str) -> Result<SocketAddr, RpcError> {
        let addr = parse_endpoint(endpoint)?;
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "rpc server listening");

        let server = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => server.spawn_connection(stream, peer),
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        if let Some(heartbeat) = self.config.heartbeat.clone() {
            self.spawn_heartbeat(heartbeat);
        }
        Ok(local)
    }

    /// Stop the accept loop, the heartbeat sweep, and every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// AIDs of connections that have authenticated at least once.
    pub fn authenticated_clients(&self) -> Vec<Aid> {
        self.connections
            .lock()
            .values()
            .filter_map(|h| h.did.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    // ── Notifications ───────────────────────────────────────────────────

    /// Send a notification to the one connection authenticated as
    /// `aid`. Returns whether a writable recipient was found.
    pub fn notify(&self, aid: &Aid, method: &str, params: Option<Value>) -> bool {
        let Ok(frame) = serde_json::to_string(&Request::notification(method, params)) else {
            return false;
        };
        let conns = self.connections.lock();
        conns
            .values()
            .find(|h| h.did.as_ref() == Some(aid))
            .map_or(false, |h| h.outbound.try_send(frame.clone()).is_ok())
    }

    /// Fan a notification out to every writable connection; returns
    /// the number actually sent.
    pub fn broadcast_notify(&self, method: &str, params: Option<Value>) -> usize {
        let Ok(frame) = serde_json::to_string(&Request::notification(method, params)) else {
            return 0;
        };
        let conns = self.connections.lock();
        conns
            .values()
            .filter(|h| h.outbound.try_send(frame.clone()).is_ok())
            .count()
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn_id = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let (closer_tx, closer_rx) = watch::channel(false);
        self.connections.lock().insert(
            conn_id,
            ConnectionHandle {
                outbound: outbound_tx,
                closer: closer_tx,
                alive: true,
                did: None,
                subscription: None,
            },
        );
        debug!(conn = conn_id.0, peer = %peer, "connection accepted");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server
                .clone()
                .run_connection(conn_id, stream, outbound_rx, closer_rx)
                .await;
            server.drop_connection(conn_id);
        });
    }

    async fn run_connection(
        self: Arc<Self>,
        conn_id: ConnId,
        stream: TcpStream,
        mut outbound_rx: mpsc::Receiver<String>,
        mut closer_rx: watch::Receiver<bool>,
    ) {
        let (read_half, mut write_half) = stream.into_split();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            line.clear();
            tokio::select! {
                read = reader.read_line(&mut line) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => self.process_frame(conn_id, line.trim_end()).await,
                },
                _ = closer_rx.changed() => {
                    if *closer_rx.borrow() {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        writer.abort();
    }

    fn drop_connection(&self, conn_id: ConnId) {
        let removed = self.connections.lock().remove(&conn_id);
        let Some(handle) = removed else {
            return;
        };
        if let (Some(stream), Some(sub)) = (&self.stream, handle.subscription) {
            stream.unsubscribe(sub);
        }
        if let Some(did) = handle.did {
            debug!(conn = conn_id.0, did = %did, "client disconnected");
            let _ = self
                .server_events
                .send(ServerEvent::ClientDisconnected { did });
        }
    }

    // ── Frame processing ────────────────────────────────────────────────

    async fn process_frame(self: &Arc<Self>, conn_id: ConnId, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.send_response(
                    conn_id,
                    Response::err(RequestId::parse_error(), ErrorObject::parse_error(e.to_string())),
                );
                return;
            }
        };
        self.mark_alive(conn_id);
        match Frame::decode(&value) {
            Ok(Frame::Request(request)) => self.handle_request(conn_id, request).await,
            Ok(Frame::Control(ControlFrame::Subscribe { filter })) => {
                self.handle_subscribe(conn_id, filter)
            }
            Ok(Frame::Response(_)) => {
                // Heartbeat pong or stray response; liveness is already
                // recorded above.
            }
            Ok(Frame::Event(_)) => {
                debug!(conn = conn_id.0, "ignoring event frame from client");
            }
            Err(reason) => self.send_response(
                conn_id,
                Response::err(RequestId::parse_error(), ErrorObject::invalid_request(reason)),
            ),
        }
    }

    async fn handle_request(self: &Arc<Self>, conn_id: ConnId, request: Request) {
        if !request.is_well_formed() {
            let id = if request.id.is_valid() {
                request.id.clone()
            } else {
                RequestId::parse_error()
            };
            self.send_response(
                conn_id,
                Response::err(id, ErrorObject::invalid_request("not a JSON-RPC 2.0 request")),
            );
            return;
        }

        // Authentication. With require_auth off, a request may stay
        // anonymous — but a present-and-broken stamp is still refused
        // rather than silently downgraded.
        let from = match (&request.auth, self.config.require_auth) {
            (None, false) => None,
            (None, true) => {
                self.send_response(
                    conn_id,
                    Response::err(
                        request.id.clone(),
                        ErrorObject::authentication_failed("missing auth stamp"),
                    ),
                );
                return;
            }
            (Some(_), _) => match verify_request(self.config.signature_policy, &request) {
                Some(aid) => Some(aid),
                None => {
                    self.send_response(
                        conn_id,
                        Response::err(
                            request.id.clone(),
                            ErrorObject::authentication_failed("signature verification failed"),
                        ),
                    );
                    return;
                }
            },
        };
        if let Some(aid) = &from {
            self.note_authenticated(conn_id, aid);
        }

        let id = request.id.clone();
        let mut ctx = RequestContext {
            request,
            from,
            received_at: now_ms(),
            metadata: HashMap::new(),
        };
        let chain = self.middleware.read().clone();
        let dispatcher = dispatcher_fn({
            let server = Arc::clone(self);
            move |ctx: &mut RequestContext| {
                let handler = server.handlers.read().get(&ctx.request.method).cloned();
                let method = ctx.request.method.clone();
                let params = ctx.request.params.clone();
                let from = ctx.from.clone();
                Box::pin(async move {
                    let Some(handler) = handler else {
                        return Err(ErrorObject::method_not_found(&method));
                    };
                    // Handlers run in their own task so a panic surfaces
                    // as INTERNAL_ERROR instead of killing the connection.
                    match tokio::spawn(handler(params, from)).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            let mut error = ErrorObject::internal_error("handler failed");
                            if cfg!(debug_assertions) {
                                error = error.with_data(Value::String(e.to_string()));
                            }
                            Err(error)
                        }
                    }
                }) as MiddlewareFuture<'_>
            }
        });

        let response = match run_chain(&chain, &mut ctx, &dispatcher).await {
            Ok(result) => Response::ok(id, result),
            Err(error) => Response::err(id, error),
        };
        self.send_response(conn_id, response);
    }

    fn handle_subscribe(&self, conn_id: ConnId, filter: Option<EventFilter>) {
        let Some(stream) = &self.stream else {
            debug!(conn = conn_id.0, "subscribe frame but no event stream attached");
            return;
        };
        let mut conns = self.connections.lock();
        let Some(handle) = conns.get_mut(&conn_id) else {
            return;
        };
        // A repeated subscribe amends the filter: drop the old
        // registration, then replay under the new one.
        if let Some(old) = handle.subscription.take() {
            stream.unsubscribe(old);
        }
        let outbound = handle.outbound.clone();
        let sink: EventSink = Arc::new(move |event: &Event| match serde_json::to_string(event) {
            Ok(frame) => {
                if outbound.try_send(frame).is_err() {
                    debug!(sequence = event.sequence, "outbound queue full; event dropped");
                }
            }
            Err(e) => debug!(error = %e, "event frame serialisation failed"),
        });
        let (replayed, sub) = stream.subscribe_with_replay(filter, sink);
        handle.subscription = Some(sub);
        debug!(conn = conn_id.0, replayed, "event subscriber attached");
    }

    fn note_authenticated(&self, conn_id: ConnId, aid: &Aid) {
        let newly = {
            let mut conns = self.connections.lock();
            match conns.get_mut(&conn_id) {
                Some(handle) if handle.did.is_none() => {
                    handle.did = Some(aid.clone());
                    true
                }
                _ => false,
            }
        };
        if newly {
            info!(conn = conn_id.0, did = %aid, "client authenticated");
            let _ = self
                .server_events
                .send(ServerEvent::ClientConnected { did: aid.clone() });
        }
    }

    fn mark_alive(&self, conn_id: ConnId) {
        if let Some(handle) = self.connections.lock().get_mut(&conn_id) {
            handle.alive = true;
        }
    }

    fn send_response(&self, conn_id: ConnId, response: Response) {
        let Ok(frame) = serde_json::to_string(&response) else {
            debug!(conn = conn_id.0, "response serialisation failed");
            return;
        };
        let conns = self.connections.lock();
        if let Some(handle) = conns.get(&conn_id) {
            if handle.outbound.try_send(frame).is_err() {
                warn!(conn = conn_id.0, "outbound queue full; response dropped");
            }
        }
    }

    // ── Heartbeat ───────────────────────────────────────────────────────

    fn spawn_heartbeat(self: &Arc<Self>, config: HeartbeatConfig) {
        let server = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = time::interval(config.interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => server.heartbeat_sweep(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One pass: terminate connections that stayed silent a full
    /// interval, probe the rest.
    fn heartbeat_sweep(&self) {
        let Ok(ping) = serde_json::to_string(&Request::notification(HEARTBEAT_METHOD, None))
        else {
            return;
        };
        let mut conns = self.connections.lock();
        for (conn_id, handle) in conns.iter_mut() {
            if handle.alive {
                handle.alive = false;
                let _ = handle.outbound.try_send(ping.clone());
            } else {
                debug!(conn = conn_id.0, "heartbeat expired; terminating");
                let _ = handle.closer.send(true);
            }
        }
    }
}

/// Coerce a closure to the higher-ranked dispatcher type.
fn dispatcher_fn<F>(f: F) -> F
where
    F: for<'b> Fn(&'b mut RequestContext) -> MiddlewareFuture<'b> + Send + Sync,
{
    f
}

/// Accepts `rpc://host:port` or a bare `host:port`.
pub(crate) fn parse_endpoint(endpoint: &str) -> Result<String, RpcError> {
    let addr = endpoint.strip_prefix("rpc://").unwrap_or(endpoint);
    if addr.is_empty() || !addr.contains(':') {
        return Err(RpcError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(addr.to_string())
}
