//! Middleware — composable pre/post handling around RPC dispatch.
//!
//! A middleware receives the request context and a [`Next`] handle; it
//! either short-circuits with its own result or error, or forwards via
//! `next.run(ctx).await`. `Next` is consumed by value, so calling it
//! twice is a compile error rather than a runtime bug.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use fl_crypto::Aid;

use crate::error::ErrorObject;
use crate::wire::Request;

/// Per-request context threaded through the chain. `metadata` is
/// scratch space middlewares may use to talk to each other.
pub struct RequestContext {
    pub request: Request,
    pub from: Option<Aid>,
    /// Unix milliseconds at frame receipt.
    pub received_at: u64,
    pub metadata: HashMap<String, Value>,
}

/// A middleware or handler outcome: the response's `result` value, or
/// the error object to send instead.
pub type MiddlewareResult = Result<Value, ErrorObject>;

pub type MiddlewareFuture<'a> = Pin<Box<dyn Future<Output = MiddlewareResult> + Send + 'a>>;

/// The final dispatch step at the end of the chain.
pub type Dispatcher =
    dyn for<'b> Fn(&'b mut RequestContext) -> MiddlewareFuture<'b> + Send + Sync;

pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a>;
}

/// Continuation handle: the rest of the chain plus the dispatcher.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    dispatcher: &'a Dispatcher,
}

impl<'a> Next<'a> {
    pub fn run<'b>(self, ctx: &'b mut RequestContext) -> MiddlewareFuture<'b>
    where
        'a: 'b,
    {
        let Next { chain, dispatcher } = self;
        match chain.split_first() {
            Some((mw, rest)) => mw.handle(
                ctx,
                Next {
                    chain: rest,
                    dispatcher,
                },
            ),
            None => dispatcher(ctx),
        }
    }
}

/// Run `ctx` through `chain`, ending at `dispatcher`.
pub async fn run_chain(
    chain: &[Arc<dyn Middleware>],
    ctx: &mut RequestContext,
    dispatcher: &Dispatcher,
) -> MiddlewareResult {
    Next { chain, dispatcher }.run(ctx).await
}

// ── Rate limiter ─────────────────────────────────────────────────────────────

const ANONYMOUS_KEY: &str = "<anonymous>";

/// Sliding-window limiter keyed by the authenticated sender. Requests
/// beyond `max_requests` inside `window` short-circuit with
/// `RATE_LIMIT_EXCEEDED`; unauthenticated senders share one bucket.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let hits = windows.entry(key.to_string()).or_default();
        while hits
            .front()
            .map_or(false, |t| now.duration_since(*t) >= self.window)
        {
            hits.pop_front();
        }
        if hits.len() >= self.max_requests {
            return false;
        }
        hits.push_back(now);
        true
    }
}

impl Middleware for RateLimiter {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a> {
        Box::pin(async move {
            let key = ctx
                .from
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| ANONYMOUS_KEY.to_string());
            if !self.allow(&key) {
                warn!(from = %key, method = %ctx.request.method, "rate limit exceeded");
                return Err(ErrorObject::rate_limit_exceeded());
            }
            next.run(ctx).await
        })
    }
}

// ── Request logger ───────────────────────────────────────────────────────────

/// Logs method, sender and elapsed milliseconds once the response is
/// known. Never mutates the response.
#[derive(Default)]
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> MiddlewareFuture<'a> {
        Box::pin(async move {
            let method = ctx.request.method.clone();
            let from = ctx
                .from
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| ANONYMOUS_KEY.to_string());
            let started = Instant::now();
            let outcome = next.run(ctx).await;
            info!(
                method = %method,
                from = %from,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "rpc request"
            );
            outcome
        })
    }
}
