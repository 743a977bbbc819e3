//! Correlation table for request/response exchanges over the event bus.
//!
//! A caller registers a request id, sends its request as an ordinary event
//! and awaits the returned receiver. Whoever receives the matching response
//! resolves the entry. Entries leave the table on resolution, on timeout
//! (via [`PendingRequests::wait`]) or through TTL eviction, so an orphaned
//! request never outlives its deadline for long.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Default time a request may stay outstanding
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(30);

struct PendingEntry<T> {
    sender: oneshot::Sender<T>,
    deadline: Instant,
}

/// Pending request registry keyed by request id
pub struct PendingRequests<T> {
    entries: DashMap<String, PendingEntry<T>>,
    ttl: Duration,
}

impl<T> std::fmt::Debug for PendingRequests<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<T: Send + 'static> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TTL)
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a request and get the receiver its response will arrive on
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateRequest`] if the id is already pending.
    pub fn register(&self, request_id: impl Into<String>) -> CoreResult<oneshot::Receiver<T>> {
        let request_id = request_id.into();
        match self.entries.entry(request_id) {
            Entry::Occupied(occupied) => Err(CoreError::DuplicateRequest(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                vacant.insert(PendingEntry {
                    sender,
                    deadline: Instant::now() + self.ttl,
                });
                Ok(receiver)
            }
        }
    }

    /// Deliver a response. Unknown ids are ignored and reported as `false`.
    pub fn resolve(&self, request_id: &str, value: T) -> bool {
        match self.entries.remove(request_id) {
            Some((_, entry)) => {
                if entry.sender.send(value).is_err() {
                    debug!(request_id, "Requester stopped waiting before the response arrived");
                }
                true
            }
            None => {
                warn!(request_id, "Response for unknown request ignored");
                false
            }
        }
    }

    /// Drop a pending entry without answering it
    pub fn cancel(&self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Await a registered request, removing its entry if no answer arrives in time
    pub async fn wait(
        &self,
        request_id: &str,
        receiver: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Option<T> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => {
                // sender dropped by eviction
                self.entries.remove(request_id);
                None
            }
            Err(_) => {
                self.entries.remove(request_id);
                warn!(request_id, ?timeout, "Request timed out");
                None
            }
        }
    }

    /// Remove entries past their deadline
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|id, entry| {
            let expired = entry.deadline <= now;
            if expired {
                debug!(request_id = %id, "Evicting expired request");
            }
            !expired
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`PendingRequests::evict_expired`] periodically until cancelled
    pub fn spawn_eviction(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = self.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, "Evicted expired pending requests");
                        }
                    }
                }
            }
        })
    }
}
