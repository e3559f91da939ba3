//! One-shot readiness notification for the replication transport.
//!
//! The poller multiplexes "this connection became readable/writable" events
//! for many sockets without exposing any threading to its callers. Each
//! registration is fire-once: the listener is removed the instant it runs and
//! must be re-added to receive another notification.
//!
//! Historically this kind of reactor is a dedicated thread blocked in
//! poll(2) with a self-pipe to wake it when the watched set changes. Here
//! each registration is a lightweight watcher task that races the source's
//! readiness future against an interrupt signal; the registration table and
//! the fire-once contract are identical to the classic design.
//!
//! ## Contract
//!
//! - A listener fires at most once per [`Poller::add_listener`] call.
//! - Re-registering the same (token, event) replaces a pending listener
//!   without firing it.
//! - [`Poller::interrupt`] fires (and removes) pending listeners for a token
//!   immediately, e.g. to force-wake a socket that will never report
//!   readiness after a local close.
//! - Listeners must not block: they run on the runtime's worker threads.
//! - A readiness error is delivered to that listener; it never affects other
//!   registrations.

#![warn(missing_docs)]
#![warn(clippy::all)]

use dashmap::DashMap;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Readiness event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// The source has bytes to read (or buffered input pending).
    Readable,
    /// The source can accept more bytes.
    Writable,
}

/// A one-shot readiness callback.
pub type Listener = Box<dyn FnOnce(io::Result<()>) + Send + 'static>;

/// Something whose readiness can be awaited, e.g. a TCP socket.
pub trait ReadySource: Send + Sync + 'static {
    /// Resolves when the source is ready for `event`, or with the error that
    /// makes readiness impossible.
    fn ready(self: Arc<Self>, event: Event) -> BoxFuture<'static, io::Result<()>>;
}

struct Registration {
    epoch: u64,
    // Option dance: the listener is FnOnce and leaves through the Mutex
    listener: Mutex<Option<Listener>>,
    cancel: Arc<Notify>,
}

impl Registration {
    fn take_listener(self) -> Option<Listener> {
        self.listener.into_inner().unwrap_or(None)
    }
}

/// Fire-once readiness multiplexer.
///
/// Cheap to clone; all clones share one registration table.
#[derive(Clone)]
pub struct Poller {
    slots: Arc<DashMap<(u64, Event), Registration>>,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);
static GLOBAL: Lazy<Poller> = Lazy::new(Poller::new);

impl Poller {
    /// Create a private poller. Most callers want [`Poller::global`].
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// The process-wide poller shared by all connections.
    pub fn global() -> Poller {
        GLOBAL.clone()
    }

    /// Allocate a token identifying one connection in the registration table.
    pub fn next_token() -> u64 {
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a one-shot listener for `event` on `token`.
    ///
    /// Replaces any pending listener for the same (token, event); the
    /// replaced listener is dropped without firing.
    pub fn add_listener(
        &self,
        token: u64,
        event: Event,
        source: Arc<dyn ReadySource>,
        listener: Listener,
    ) {
        let epoch = NEXT_EPOCH.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        trace!("poller: add listener token={} event={:?}", token, event);

        if let Some(old) = self.slots.insert(
            (token, event),
            Registration {
                epoch,
                listener: Mutex::new(Some(listener)),
                cancel: cancel.clone(),
            },
        ) {
            debug!(
                "poller: replaced pending listener token={} event={:?}",
                token, event
            );
            old.cancel.notify_one();
        }

        let poller = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.notified() => {}
                result = source.ready(event) => {
                    poller.fire(token, event, epoch, result);
                }
            }
        });
    }

    /// Immediately fire (and remove) any pending listeners for `token`.
    pub fn interrupt(&self, token: u64) {
        debug!("poller: interrupt token={}", token);
        for event in [Event::Readable, Event::Writable] {
            if let Some((_, reg)) = self.slots.remove(&(token, event)) {
                reg.cancel.notify_one();
                if let Some(listener) = reg.take_listener() {
                    listener(Ok(()));
                }
            }
        }
    }

    /// Drop any pending listeners for `token` without firing them.
    pub fn remove_listeners(&self, token: u64) {
        trace!("poller: remove listeners token={}", token);
        for event in [Event::Readable, Event::Writable] {
            if let Some((_, reg)) = self.slots.remove(&(token, event)) {
                reg.cancel.notify_one();
            }
        }
    }

    /// True if a listener is pending for (token, event). Mostly for tests.
    pub fn has_listener(&self, token: u64, event: Event) -> bool {
        self.slots.contains_key(&(token, event))
    }

    fn fire(&self, token: u64, event: Event, epoch: u64, result: io::Result<()>) {
        // Only fire if this watcher's registration is still the current one;
        // a replacement or interrupt may have raced ahead of us.
        let removed = self
            .slots
            .remove_if(&(token, event), |_, reg| reg.epoch == epoch);
        if let Some((_, reg)) = removed {
            trace!("poller: fire token={} event={:?}", token, event);
            if let Some(listener) = reg.take_listener() {
                listener(result);
            }
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}
