//! Request/response data access layered on the event bus.
//!
//! A read sends a `DataEvent` to the owner of the data (an agent or `ENV`)
//! and awaits the matching `DataResponseEvent`; a write does the same with
//! `DataUpdateEvent` while holding the lock `"{target}:{key}"`. Callers
//! never see an error: a failed or timed-out read yields the supplied
//! default and a failed write yields `false`.

use colony_core::{
    Address, DataRequest, DataResponse, DataUpdate, DataUpdateResponse, Event, EventKind,
    PendingRequests, Profile,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::MeshResult;
use crate::lock::{DEFAULT_LEASE, DEFAULT_LOCK_WAIT, LockAuthority, LockLease, LockRequest};

#[derive(Debug, Clone)]
pub struct DataAccessConfig {
    /// How long a read or write waits for its response
    pub request_timeout: Duration,
    pub lock_lease: Duration,
    pub lock_wait: Duration,
}

impl Default for DataAccessConfig {
    fn default() -> Self {
        Self {
            request_timeout: colony_core::DEFAULT_REQUEST_TTL,
            lock_lease: DEFAULT_LEASE,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

/// Lock guarding one key of one owner's profile
pub fn lock_key(target: &Address, key: &str) -> String {
    format!("{target}:{key}")
}

struct Inner {
    owner: Address,
    bus: EventBus,
    reads: Arc<PendingRequests<DataResponse>>,
    writes: Arc<PendingRequests<DataUpdateResponse>>,
    locks: Arc<dyn LockAuthority>,
    config: DataAccessConfig,
}

/// Data access client bound to one requester
#[derive(Clone)]
pub struct DataAccess {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccess")
            .field("owner", &self.inner.owner)
            .field("pending_reads", &self.inner.reads.len())
            .field("pending_writes", &self.inner.writes.len())
            .finish()
    }
}

impl DataAccess {
    pub fn new(
        owner: Address,
        bus: EventBus,
        locks: Arc<dyn LockAuthority>,
        config: DataAccessConfig,
    ) -> Self {
        let ttl = config.request_timeout;
        Self {
            inner: Arc::new(Inner {
                owner,
                bus,
                reads: Arc::new(PendingRequests::new(ttl)),
                writes: Arc::new(PendingRequests::new(ttl)),
                locks,
                config,
            }),
        }
    }

    pub fn owner(&self) -> &Address {
        &self.inner.owner
    }

    /// Read `key` from `target`'s profile, or `default` on any failure
    pub async fn get_data(&self, target: &Address, key: &str, default: Value) -> Value {
        let inner = &self.inner;
        let request_id = Uuid::new_v4().to_string();
        let receiver = match inner.reads.register(request_id.clone()) {
            Ok(receiver) => receiver,
            Err(err) => {
                warn!(error = %err, "Could not register data request");
                return default;
            }
        };

        let request = DataRequest {
            request_id: request_id.clone(),
            key: key.to_string(),
        };
        let sent = Event::new(EventKind::DATA_REQUEST, inner.owner.clone(), target.clone())
            .with_body(&request)
            .map_err(Into::into)
            .and_then(|event| inner.bus.dispatch(event));
        if let Err(err) = sent {
            inner.reads.cancel(&request_id);
            warn!(%target, key, error = %err, "Data request not sent");
            return default;
        }

        match inner
            .reads
            .wait(&request_id, receiver, inner.config.request_timeout)
            .await
        {
            Some(DataResponse {
                value: Some(value),
                error: None,
                ..
            }) => value,
            Some(response) => {
                debug!(%target, key, error = ?response.error, "Data request answered without a value");
                default
            }
            None => default,
        }
    }

    /// Write `key` on `target`'s profile under its lock
    pub async fn update_data(&self, target: &Address, key: &str, value: Value) -> bool {
        let Some(lease) = self.acquire(target, key).await else {
            return false;
        };
        let success = self.send_update(target, key, value).await;
        self.release(lease).await;
        success
    }

    /// Read-modify-write under a single lease.
    ///
    /// Returns the stored value, or `None` if the lock or the write failed.
    pub async fn update_with<F>(
        &self,
        target: &Address,
        key: &str,
        default: Value,
        f: F,
    ) -> Option<Value>
    where
        F: FnOnce(Value) -> Value + Send,
    {
        let lease = self.acquire(target, key).await?;
        let current = self.get_data(target, key, default).await;
        let next = f(current);
        let success = self.send_update(target, key, next.clone()).await;
        self.release(lease).await;
        success.then_some(next)
    }

    /// Route a response event to the waiting request. Returns whether it was one.
    pub fn handle_response(&self, event: &Event) -> bool {
        if event.is(&EventKind::DATA_RESPONSE) {
            match event.body::<DataResponse>() {
                Ok(response) => {
                    let request_id = response.request_id.clone();
                    self.inner.reads.resolve(&request_id, response);
                }
                Err(err) => warn!(error = %err, "Malformed data response"),
            }
            true
        } else if event.is(&EventKind::DATA_UPDATE_RESPONSE) {
            match event.body::<DataUpdateResponse>() {
                Ok(response) => {
                    let request_id = response.request_id.clone();
                    self.inner.writes.resolve(&request_id, response);
                }
                Err(err) => warn!(error = %err, "Malformed data update response"),
            }
            true
        } else {
            false
        }
    }

    pub fn pending_reads(&self) -> usize {
        self.inner.reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.writes.len()
    }

    /// Periodically evict requests that outlived their deadline
    pub fn spawn_eviction(&self, every: Duration, cancel: CancellationToken) -> [JoinHandle<()>; 2] {
        [
            Arc::clone(&self.inner.reads).spawn_eviction(every, cancel.clone()),
            Arc::clone(&self.inner.writes).spawn_eviction(every, cancel),
        ]
    }

    async fn acquire(&self, target: &Address, key: &str) -> Option<LockLease> {
        let request = LockRequest::new(lock_key(target, key), self.inner.owner.to_string())
            .with_lease(self.inner.config.lock_lease)
            .with_wait(self.inner.config.lock_wait);
        match self.inner.locks.acquire(request).await {
            Ok(lease) => Some(lease),
            Err(err) => {
                warn!(%target, key, error = %err, "Could not lock data for update");
                None
            }
        }
    }

    async fn release(&self, lease: LockLease) {
        if let Err(err) = self.inner.locks.release(&lease).await {
            warn!(lock_id = %lease.lock_id, error = %err, "Failed to release data lock");
        }
    }

    async fn send_update(&self, target: &Address, key: &str, value: Value) -> bool {
        let inner = &self.inner;
        let request_id = Uuid::new_v4().to_string();
        let receiver = match inner.writes.register(request_id.clone()) {
            Ok(receiver) => receiver,
            Err(err) => {
                warn!(error = %err, "Could not register data update");
                return false;
            }
        };

        let update = DataUpdate {
            request_id: request_id.clone(),
            key: key.to_string(),
            value,
        };
        let sent = Event::new(EventKind::DATA_UPDATE, inner.owner.clone(), target.clone())
            .with_body(&update)
            .map_err(Into::into)
            .and_then(|event| inner.bus.dispatch(event));
        if let Err(err) = sent {
            inner.writes.cancel(&request_id);
            warn!(%target, key, error = %err, "Data update not sent");
            return false;
        }

        match inner
            .writes
            .wait(&request_id, receiver, inner.config.request_timeout)
            .await
        {
            Some(response) if response.success => true,
            Some(response) => {
                warn!(%target, key, error = ?response.error, "Data update rejected");
                false
            }
            None => false,
        }
    }
}

/// Answer a `DataEvent` or `DataUpdateEvent` addressed to `owner` from its profile.
///
/// Returns `Ok(None)` for any other kind of event.
pub async fn answer_data_event(
    owner: &Address,
    profile: &RwLock<Profile>,
    event: &Event,
) -> MeshResult<Option<Event>> {
    let reply_to = event.from().clone();

    let reply = if event.is(&EventKind::DATA_REQUEST) {
        let request: DataRequest = event.body()?;
        let body = match profile.read().await.get(&request.key) {
            Some(value) => DataResponse::found(request.request_id, value.clone()),
            None => DataResponse::failed(
                request.request_id,
                format!("key '{}' not found", request.key),
            ),
        };
        Event::new(EventKind::DATA_RESPONSE, owner.clone(), reply_to).with_body(&body)?
    } else if event.is(&EventKind::DATA_UPDATE) {
        let update: DataUpdate = event.body()?;
        profile.write().await.update(update.key, update.value);
        Event::new(EventKind::DATA_UPDATE_RESPONSE, owner.clone(), reply_to)
            .with_body(&DataUpdateResponse::ok(update.request_id))?
    } else {
        return Ok(None);
    };

    Ok(Some(reply.with_parent(event.id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::lock::LocalLockAuthority;
    use colony_core::AgentId;
    use serde_json::json;

    /// Serve the environment's profile from the bus, like the environment does
    fn spawn_env_server(bus: &EventBus, profile: Arc<RwLock<Profile>>) -> JoinHandle<()> {
        let mut inbox = bus.attach_env().unwrap();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                if let Ok(Some(reply)) = answer_data_event(&Address::Env, &profile, &event).await {
                    bus.dispatch(reply).unwrap();
                }
            }
        })
    }

    /// Feed responses addressed to `owner` back into its data access client
    fn spawn_requester(bus: &EventBus, owner: &AgentId, access: DataAccess) -> JoinHandle<()> {
        let mut inbox = bus.register_agent(owner.clone(), "tester").unwrap();
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                access.handle_response(&event);
            }
        })
    }

    fn client(bus: &EventBus, owner: &AgentId, timeout: Duration) -> DataAccess {
        DataAccess::new(
            Address::Agent(owner.clone()),
            bus.clone(),
            Arc::new(LocalLockAuthority::new()),
            DataAccessConfig {
                request_timeout: timeout,
                ..DataAccessConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_get_and_update_env_data() {
        let bus = EventBus::new(BusConfig::default());
        let mut profile = Profile::new();
        profile.update("price", json!(10));
        let profile = Arc::new(RwLock::new(profile));
        spawn_env_server(&bus, Arc::clone(&profile));

        let owner = AgentId::parse("a1").unwrap();
        let access = client(&bus, &owner, Duration::from_secs(1));
        spawn_requester(&bus, &owner, access.clone());

        assert_eq!(access.get_data(&Address::Env, "price", json!(0)).await, json!(10));
        assert_eq!(access.get_data(&Address::Env, "missing", json!(-1)).await, json!(-1));

        assert!(access.update_data(&Address::Env, "price", json!(12)).await);
        assert_eq!(profile.read().await.get("price"), Some(&json!(12)));
        assert_eq!(access.pending_reads(), 0);
        assert_eq!(access.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_request_returns_default_and_cleans_up() {
        let bus = EventBus::new(BusConfig::default());
        // nobody serves ENV: the request is dropped as unroutable
        let owner = AgentId::parse("a1").unwrap();
        let access = client(&bus, &owner, Duration::from_millis(50));
        spawn_requester(&bus, &owner, access.clone());

        let value = access.get_data(&Address::Env, "price", json!("fallback")).await;
        assert_eq!(value, json!("fallback"));
        assert!(!access.update_data(&Address::Env, "price", json!(1)).await);
        assert_eq!(access.pending_reads(), 0);
        assert_eq!(access.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_read_modify_write_is_serialized() {
        let bus = EventBus::new(BusConfig::default());
        let profile = Arc::new(RwLock::new(Profile::new()));
        spawn_env_server(&bus, Arc::clone(&profile));
        let locks: Arc<dyn LockAuthority> = Arc::new(LocalLockAuthority::new());

        let mut tasks = Vec::new();
        for i in 0..5 {
            let owner = AgentId::parse(format!("w{i}")).unwrap();
            let access = DataAccess::new(
                Address::Agent(owner.clone()),
                bus.clone(),
                Arc::clone(&locks),
                DataAccessConfig::default(),
            );
            spawn_requester(&bus, &owner, access.clone());
            tasks.push(tokio::spawn(async move {
                access
                    .update_with(&Address::Env, "score", json!(0), |v| {
                        json!(v.as_i64().unwrap_or(0) + 1)
                    })
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }
        assert_eq!(profile.read().await.get("score"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_two_writers_share_one_lock() {
        let bus = EventBus::new(BusConfig::default());
        let profile = Arc::new(RwLock::new(Profile::new()));
        spawn_env_server(&bus, Arc::clone(&profile));
        let locks: Arc<dyn LockAuthority> = Arc::new(LocalLockAuthority::new());

        let writers: Vec<_> = [1, 2]
            .into_iter()
            .map(|n| {
                let owner = AgentId::parse(format!("writer{n}")).unwrap();
                let access = DataAccess::new(
                    Address::Agent(owner.clone()),
                    bus.clone(),
                    Arc::clone(&locks),
                    DataAccessConfig::default(),
                );
                spawn_requester(&bus, &owner, access.clone());
                tokio::spawn(async move {
                    access.update_data(&Address::Env, "score", json!(n)).await
                })
            })
            .collect();
        for writer in writers {
            assert!(writer.await.unwrap());
        }

        let score = profile.read().await.get("score").cloned();
        assert!(matches!(score, Some(ref v) if v == &json!(1) || v == &json!(2)), "{score:?}");
    }

    #[tokio::test]
    async fn test_answer_ignores_other_kinds() {
        let profile = RwLock::new(Profile::new());
        let event = Event::new("Ping", Address::All, Address::Env);
        assert!(answer_data_event(&Address::Env, &profile, &event)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_lock_key_format() {
        assert_eq!(lock_key(&Address::Env, "score"), "ENV:score");
    }
}
