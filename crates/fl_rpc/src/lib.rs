//! Fleetlock RPC runtime.
//!
//! Framed duplex JSON-RPC between agents: an authenticated server with
//! a middleware chain, notifications, heartbeats and remote event
//! fan-out, and a client with request correlation, per-request timers
//! and optional auto-reconnect. One JSON document per newline-framed
//! transport message; signatures cover canonical JSON per the
//! configured [`signing::SignaturePolicy`].

pub mod client;
pub mod error;
pub mod middleware;
pub mod server;
pub mod signing;
pub mod wire;

pub use client::{
    ClientConfig, ClientEvent, LinkState, ReconnectPolicy, RequestOptions, RpcClient,
};
pub use error::{codes, ErrorObject, RpcError};
pub use middleware::{
    run_chain, Middleware, MiddlewareFuture, MiddlewareResult, Next, RateLimiter, RequestContext,
    RequestLogger,
};
pub use server::{
    ConnId, HeartbeatConfig, RpcServer, ServerConfig, ServerEvent, HEARTBEAT_METHOD,
};
pub use signing::{sign_request, signing_payload, verify_request, SignaturePolicy};
pub use wire::{now_ms, AuthStamp, ControlFrame, Frame, Request, RequestId, Response};
