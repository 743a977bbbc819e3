//! Named mutual-exclusion locks with leases.
//!
//! A lock is identified by a string such as `ENV:score`. At most one holder
//! owns it at a time; a holder that disappears loses it when its lease
//! expires. The master runs a [`LocalLockAuthority`] and workers reach it
//! through an RPC-backed implementation of [`LockAuthority`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};

/// Default lease length
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);
/// Default time to wait for a contended lock
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub lock_id: String,
    pub holder: String,
    #[serde(with = "millis")]
    pub lease: Duration,
    #[serde(with = "millis")]
    pub wait: Duration,
}

impl LockRequest {
    pub fn new(lock_id: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            lock_id: lock_id.into(),
            holder: holder.into(),
            lease: DEFAULT_LEASE,
            wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// Proof of ownership returned by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub lock_id: String,
    pub holder: String,
    /// Distinguishes successive leases on the same lock
    pub token: String,
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[async_trait]
pub trait LockAuthority: Send + Sync + 'static {
    /// Block until the lock is free (or its lease lapses) and take it
    ///
    /// # Errors
    ///
    /// [`MeshError::LockTimeout`] when `request.wait` elapses first,
    /// [`MeshError::LockUnavailable`] when the authority cannot be reached.
    async fn acquire(&self, request: LockRequest) -> MeshResult<LockLease>;

    /// Give a lock back. `Ok(false)` means the lease had already lapsed.
    async fn release(&self, lease: &LockLease) -> MeshResult<bool>;
}

struct Held {
    holder: String,
    token: String,
    expires_at: Instant,
}

/// In-process lock table
#[derive(Default)]
pub struct LocalLockAuthority {
    held: Mutex<HashMap<String, Held>>,
    released: Notify,
}

impl std::fmt::Debug for LocalLockAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLockAuthority")
            .field("held", &self.held_count())
            .finish()
    }
}

enum Attempt {
    Acquired(LockLease),
    Busy(Instant),
}

impl LocalLockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, request: &LockRequest) -> MeshResult<Attempt> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| MeshError::LockUnavailable("lock table poisoned".into()))?;
        let now = Instant::now();

        if let Some(current) = held.get(&request.lock_id) {
            if current.expires_at > now {
                return Ok(Attempt::Busy(current.expires_at));
            }
            warn!(
                lock_id = %request.lock_id,
                previous_holder = %current.holder,
                "Reclaiming lock with lapsed lease"
            );
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            request.lock_id.clone(),
            Held {
                holder: request.holder.clone(),
                token: token.clone(),
                expires_at: now + request.lease,
            },
        );
        Ok(Attempt::Acquired(LockLease {
            lock_id: request.lock_id.clone(),
            holder: request.holder.clone(),
            token,
        }))
    }

    /// Current holder of a lock whose lease has not lapsed
    pub fn holder_of(&self, lock_id: &str) -> Option<String> {
        let held = self.held.lock().ok()?;
        held.get(lock_id)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.holder.clone())
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or_default()
    }

    /// Drop lapsed leases and wake waiters
    pub fn sweep_expired(&self) -> usize {
        let removed = match self.held.lock() {
            Ok(mut held) => {
                let before = held.len();
                let now = Instant::now();
                held.retain(|_, h| h.expires_at > now);
                before - held.len()
            }
            Err(_) => 0,
        };
        if removed > 0 {
            debug!(removed, "Swept expired lock leases");
            self.released.notify_waiters();
        }
        removed
    }
}

#[async_trait]
impl LockAuthority for LocalLockAuthority {
    async fn acquire(&self, request: LockRequest) -> MeshResult<LockLease> {
        let started = Instant::now();
        let deadline = started + request.wait;

        loop {
            // register interest before looking, so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy_until = match self.try_take(&request)? {
                Attempt::Acquired(lease) => {
                    debug!(lock_id = %lease.lock_id, holder = %lease.holder, "Lock acquired");
                    return Ok(lease);
                }
                Attempt::Busy(until) => until,
            };

            if Instant::now() >= deadline {
                return Err(MeshError::LockTimeout {
                    lock_id: request.lock_id,
                    waited: started.elapsed(),
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(busy_until.min(deadline)) => {}
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> MeshResult<bool> {
        let released = {
            let mut held = self
                .held
                .lock()
                .map_err(|_| MeshError::LockUnavailable("lock table poisoned".into()))?;
            match held.get(&lease.lock_id) {
                Some(current) if current.token == lease.token => {
                    held.remove(&lease.lock_id);
                    true
                }
                _ => false,
            }
        };

        if released {
            debug!(lock_id = %lease.lock_id, holder = %lease.holder, "Lock released");
            self.released.notify_waiters();
        } else {
            warn!(
                lock_id = %lease.lock_id,
                holder = %lease.holder,
                "Release of a lease that is no longer held"
            );
        }
        Ok(released)
    }
}

/// Run `f` while holding a lock, releasing it on every path
pub async fn with_lock<F, Fut, T>(
    authority: &dyn LockAuthority,
    request: LockRequest,
    f: F,
) -> MeshResult<T>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = T> + Send,
    T: Send,
{
    let lease = authority.acquire(request).await?;
    let result = f().await;
    if let Err(err) = authority.release(&lease).await {
        warn!(lock_id = %lease.lock_id, error = %err, "Failed to release lock");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_acquire_release() {
        let locks = LocalLockAuthority::new();
        let lease = locks.acquire(LockRequest::new("ENV:score", "a")).await.unwrap();
        assert_eq!(locks.holder_of("ENV:score").as_deref(), Some("a"));
        assert!(locks.release(&lease).await.unwrap());
        assert!(locks.holder_of("ENV:score").is_none());
        // second release is a no-op
        assert!(!locks.release(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let locks = LocalLockAuthority::new();
        let _lease = locks.acquire(LockRequest::new("k", "a")).await.unwrap();
        let err = locks
            .acquire(LockRequest::new("k", "b").with_wait(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::LockTimeout { lock_id, .. } if lock_id == "k"));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let locks = Arc::new(LocalLockAuthority::new());
        let lease = locks.acquire(LockRequest::new("k", "a")).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(LockRequest::new("k", "b")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.release(&lease).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.holder, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lease_is_reclaimed() {
        let locks = LocalLockAuthority::new();
        let stale = locks
            .acquire(LockRequest::new("k", "crashed").with_lease(Duration::from_millis(50)))
            .await
            .unwrap();

        let fresh = locks.acquire(LockRequest::new("k", "b")).await.unwrap();
        assert_eq!(fresh.holder, "b");
        assert!(!locks.release(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_serializes_critical_sections() {
        let locks = Arc::new(LocalLockAuthority::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    with_lock(
                        locks.as_ref(),
                        LockRequest::new("shared", format!("t{i}")),
                        || async {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            inside.fetch_sub(1, Ordering::SeqCst);
                        },
                    )
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn test_request_wire_format() {
        let request = LockRequest::new("ENV:score", "w1")
            .with_lease(Duration::from_secs(2))
            .with_wait(Duration::from_millis(500));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["lease"], 2000);
        assert_eq!(json["wait"], 500);
        let back: LockRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_oversized_duration_saturates() {
        let request = LockRequest::new("k", "w1").with_wait(Duration::MAX);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["wait"], u64::MAX);
    }
}
