//! LeaseLock - lease 付きキーによる排他ロック
//!
//! 取得 = 「キーが存在しなければ lease 付きで作成」。保持者が落ちても
//! lease の TTL で必ず解放されます。

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::domain::keys;
use crate::domain::{CoordError, GateError, LeaseId, Result};
use crate::ports::{Compare, CoordinationService, Txn, TxnOp};

pub struct LeaseLock {
    coord: Arc<dyn CoordinationService>,
    holder: String,
    ttl: Duration,
}

impl LeaseLock {
    pub fn new(coord: Arc<dyn CoordinationService>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            coord,
            holder: holder.into(),
            ttl,
        }
    }

    /// `LockContention` when another holder owns the lock.
    pub async fn acquire(&self, task_name: &str) -> Result<LockGuard> {
        let key = keys::lock_path(task_name);
        let lease = self.coord.grant_lease(self.ttl).await?;

        let txn = Txn::new()
            .when(Compare::absent(key.clone()))
            .then(TxnOp::put_with_lease(key.clone(), self.holder.clone(), lease));
        let acquired = match self.coord.txn(txn).await {
            Ok(response) => response.succeeded,
            Err(e) => {
                let _ = self.coord.revoke_lease(lease).await;
                return Err(e.into());
            }
        };

        if !acquired {
            let _ = self.coord.revoke_lease(lease).await;
            debug!(lock = %key, "lock held elsewhere");
            return Err(GateError::LockContention(key));
        }

        debug!(lock = %key, holder = %self.holder, %lease, "lock acquired");
        Ok(LockGuard {
            coord: Arc::clone(&self.coord),
            key,
            lease,
        })
    }
}

/// A held lock. Dropping it without `release` leaves the key to expire with its lease.
pub struct LockGuard {
    coord: Arc<dyn CoordinationService>,
    key: String,
    lease: LeaseId,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extends the hold by a full TTL. A lease that already expired means the
    /// lock may belong to someone else now: `LockContention`.
    pub async fn renew(&self) -> Result<()> {
        match self.coord.keep_alive_once(self.lease).await {
            Ok(_) => Ok(()),
            Err(CoordError::LeaseNotFound(_)) => Err(GateError::LockContention(self.key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn release(self) -> Result<()> {
        self.coord.revoke_lease(self.lease).await?;
        debug!(lock = %self.key, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryCoordination;

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let coord = Arc::new(InMemoryCoordination::new());
        let a = LeaseLock::new(coord.clone(), "gate-a", Duration::from_secs(5));
        let b = LeaseLock::new(coord.clone(), "gate-b", Duration::from_secs(5));

        let guard = a.acquire("t").await.unwrap();
        assert_eq!(guard.key(), "/scheduler/lock/task/t");
        assert!(b.acquire("t").await.is_err());
        // 別タスクのロックは独立
        assert!(b.acquire("u").await.is_ok());

        guard.release().await.unwrap();
        assert!(b.acquire("t").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lock_expires() {
        let coord = Arc::new(InMemoryCoordination::new());
        let a = LeaseLock::new(coord.clone(), "gate-a", Duration::from_secs(2));
        let b = LeaseLock::new(coord.clone(), "gate-b", Duration::from_secs(2));

        let guard = a.acquire("t").await.unwrap();
        drop(guard);
        assert!(b.acquire("t").await.is_err());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(b.acquire("t").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_the_hold() {
        let coord = Arc::new(InMemoryCoordination::new());
        let a = LeaseLock::new(coord.clone(), "gate-a", Duration::from_secs(2));
        let b = LeaseLock::new(coord.clone(), "gate-b", Duration::from_secs(2));

        let guard = a.acquire("t").await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        guard.renew().await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(matches!(
            b.acquire("t").await.err(),
            Some(GateError::LockContention(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn renewing_an_expired_lock_reports_contention() {
        let coord = Arc::new(InMemoryCoordination::new());
        let a = LeaseLock::new(coord.clone(), "gate-a", Duration::from_secs(2));

        let guard = a.acquire("t").await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(
            guard.renew().await,
            Err(GateError::LockContention(key)) if key == "/scheduler/lock/task/t"
        ));
    }
}
