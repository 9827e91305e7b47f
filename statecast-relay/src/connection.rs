//! A single client connection owned by this relay instance
//!
//! The relay never touches the transport directly. Each connection exposes a
//! bounded outbound queue that the transport adapter drains, plus a
//! cancellation token the adapter watches for forced termination.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::rate_limit::TokenBucket;

/// Opaque, unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Item queued for the transport adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON frame
    Text(Arc<str>),
    /// Liveness probe (websocket ping)
    Ping,
    /// Close the transport after everything queued before it
    Close,
}

/// Result of queueing an outbound item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// Queue full, item dropped
    Dropped,
    /// Transport gone
    Closed,
}

/// What hooks get to see about a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub authenticated: bool,
}

/// Per-connection limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub rate: f64,
    pub burst: f64,
    pub inbound_frames_per_second: u32,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            rate: 5.0,
            burst: 20.0,
            inbound_frames_per_second: 50,
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
    authenticated: AtomicBool,
    bucket: Mutex<TokenBucket>,
    /// A throttle notice went out and no batch has been paid for since
    throttle_notified: AtomicBool,
    inbound: DefaultDirectRateLimiter,
    last_liveness: Mutex<Instant>,
    connected_at: Instant,
    cancel: CancellationToken,
}

impl Connection {
    #[must_use]
    pub fn new(
        id: ConnectionId,
        sender: mpsc::Sender<Outbound>,
        authenticated: bool,
        limits: ConnectionLimits,
    ) -> Self {
        let per_second =
            NonZeroU32::new(limits.inbound_frames_per_second).unwrap_or(nonzero!(1u32));
        let now = Instant::now();

        Self {
            id,
            sender,
            authenticated: AtomicBool::new(authenticated),
            bucket: Mutex::new(TokenBucket::new(limits.rate, limits.burst)),
            throttle_notified: AtomicBool::new(false),
            inbound: RateLimiter::direct(Quota::per_second(per_second)),
            last_liveness: Mutex::new(now),
            connected_at: now,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn context(&self) -> ConnectionContext {
        ConnectionContext {
            id: self.id,
            authenticated: self.is_authenticated(),
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    /// Transport still accepting frames
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.cancel.is_cancelled()
    }

    /// Queue an item without waiting
    pub fn send(&self, item: Outbound) -> SendStatus {
        match self.sender.try_send(item) {
            Ok(()) => SendStatus::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendStatus::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => SendStatus::Closed,
        }
    }

    /// Spend outbound tokens (see [`TokenBucket::take`]).
    ///
    /// A paid spend ends the throttled period, so the next denial may be
    /// reported again.
    pub fn take_tokens(&self, cost: f64) -> bool {
        let allowed = self.bucket.lock().take(cost);
        if allowed && cost > 0.0 {
            self.throttle_notified.store(false, Ordering::Release);
        }
        allowed
    }

    /// Claim the one throttle notice allowed per throttled period
    #[must_use]
    pub fn claim_throttle_notice(&self) -> bool {
        !self.throttle_notified.swap(true, Ordering::AcqRel)
    }

    /// Admit one inbound client frame
    #[must_use]
    pub fn allow_inbound(&self) -> bool {
        self.inbound.check().is_ok()
    }

    pub fn record_liveness(&self) {
        *self.last_liveness.lock() = Instant::now();
    }

    #[must_use]
    pub fn last_liveness(&self) -> Instant {
        *self.last_liveness.lock()
    }

    #[must_use]
    pub const fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Token cancelled when the connection is forcibly terminated
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Force the transport down. Queued frames are abandoned.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("authenticated", &self.is_authenticated())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
