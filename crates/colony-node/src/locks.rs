//! Lock authority used by workers: every acquire and release goes to the master

use async_trait::async_trait;
use colony_mesh::{LockAuthority, LockLease, LockRequest, MeshError, MeshResult};

use crate::client::PeerClient;
use crate::error::NodeError;
use crate::protocol::{ReleaseResponse, routes};

#[derive(Debug, Clone)]
pub struct RemoteLockAuthority {
    master_url: String,
    client: PeerClient,
}

impl RemoteLockAuthority {
    pub fn new(master_url: impl Into<String>, client: PeerClient) -> Self {
        Self {
            master_url: master_url.into(),
            client,
        }
    }
}

#[async_trait]
impl LockAuthority for RemoteLockAuthority {
    async fn acquire(&self, request: LockRequest) -> MeshResult<LockLease> {
        let lock_id = request.lock_id.clone();
        let wait = request.wait;
        self.client
            .post::<_, LockLease>("lock_acquire", &self.master_url, routes::LOCK_ACQUIRE, &request)
            .await
            .map_err(|err| {
                if err.has_remote_code("lock_timeout") {
                    MeshError::LockTimeout {
                        lock_id,
                        waited: wait,
                    }
                } else {
                    MeshError::LockUnavailable(err.to_string())
                }
            })
    }

    async fn release(&self, lease: &LockLease) -> MeshResult<bool> {
        match self
            .client
            .post::<_, ReleaseResponse>("lock_release", &self.master_url, routes::LOCK_RELEASE, lease)
            .await
        {
            Ok(response) => Ok(response.released),
            Err(NodeError::Remote { status: 404, .. }) => Ok(false),
            Err(err) => Err(MeshError::LockUnavailable(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unreachable_master_is_unavailable() {
        let client =
            PeerClient::new(Duration::from_millis(200), CircuitBreakerConfig::default()).unwrap();
        let locks = RemoteLockAuthority::new("http://127.0.0.1:9", client);
        let err = locks
            .acquire(LockRequest::new("env:score", "a1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::LockUnavailable(_)));
    }
}
