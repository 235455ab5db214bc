//! Lease-based leader election.
//!
//! One well-known lease key holds the current leader's id with a TTL. The
//! holder extends it only while the stored value is still its own id; any
//! mismatch means the lease was lost and the keeper demotes itself on the
//! spot. Transient dual leadership during a handoff is tolerated: assignment
//! consumers gate on generation.

use crate::coordination::{keys, CoordStore};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct LeaderElector {
    store: Arc<dyn CoordStore>,
    keeper_id: String,
    lease_ttl: Duration,
    is_leader: AtomicBool,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn CoordStore>, keeper_id: &str, lease_ttl: Duration) -> Self {
        Self {
            store,
            keeper_id: keeper_id.to_string(),
            lease_ttl,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn keeper_id(&self) -> &str {
        &self.keeper_id
    }

    /// Try to take the lease; also recognizes a lease we already hold.
    pub async fn try_acquire(&self) -> Result<bool> {
        let acquired = self
            .store
            .set_if_absent(
                keys::LEADER_LOCK,
                self.keeper_id.as_bytes(),
                self.lease_ttl,
            )
            .await?;
        if acquired {
            info!(keeper = %self.keeper_id, "acquired leader lease");
            self.is_leader.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        let holder = self.store.get(keys::LEADER_LOCK).await?;
        let ours = holder.as_deref() == Some(self.keeper_id.as_bytes());
        self.is_leader.store(ours, Ordering::SeqCst);
        Ok(ours)
    }

    /// One re-verify tick: holders extend while the value is still theirs,
    /// demote immediately otherwise; followers re-attempt when the key is
    /// absent.
    pub async fn maintain(&self) -> Result<bool> {
        if self.is_leader() {
            match self.store.get(keys::LEADER_LOCK).await? {
                Some(holder) if holder == self.keeper_id.as_bytes() => {
                    self.store.extend(keys::LEADER_LOCK, self.lease_ttl).await?;
                }
                holder => {
                    warn!(
                        keeper = %self.keeper_id,
                        held_by = ?holder.as_deref().map(String::from_utf8_lossy),
                        "leader lease lost; demoting"
                    );
                    self.is_leader.store(false, Ordering::SeqCst);
                }
            }
        } else if self.store.get(keys::LEADER_LOCK).await?.is_none() {
            self.try_acquire().await?;
        }
        Ok(self.is_leader())
    }

    /// Check-and-set release: delete only while the value is still ours.
    pub async fn release(&self) -> Result<()> {
        if let Some(holder) = self.store.get(keys::LEADER_LOCK).await? {
            if holder == self.keeper_id.as_bytes() {
                self.store.del(keys::LEADER_LOCK).await?;
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Interval between maintenance ticks: a third of the lease TTL.
    pub fn refresh_interval(&self) -> Duration {
        self.lease_ttl / 3
    }
}
