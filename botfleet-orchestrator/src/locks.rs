//! Per-instance mutual exclusion for lifecycle operations.
//!
//! At most one operation holds an instance's lease at a time; operations on different
//! instances never contend. Each lease carries a cancellation token so `destroy` can abort
//! whatever is in flight before taking its own lease.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Slot {
    lease: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<(Uuid, CancellationToken)>>,
}

type Slots = Arc<Mutex<HashMap<Uuid, Arc<Slot>>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<Uuid, Arc<Slot>>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default, Clone)]
pub struct InstanceLocks {
    slots: Slots,
}

pub struct InstanceLease {
    instance_id: Uuid,
    lease_id: Uuid,
    token: CancellationToken,
    slot: Arc<Slot>,
    slots: Slots,
    _guard: OwnedMutexGuard<()>,
}

impl InstanceLease {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if let Ok(mut active) = self.slot.active.lock() {
            if active.as_ref().map(|(id, _)| *id) == Some(self.lease_id) {
                *active = None;
            }
        }
        // Map + this lease are the only holders: nobody is waiting, drop the slot.
        let mut slots = lock_slots(&self.slots);
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.instance_id);
        }
    }
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, instance_id: Uuid) -> Arc<Slot> {
        lock_slots(&self.slots)
            .entry(instance_id)
            .or_insert_with(|| {
                Arc::new(Slot {
                    lease: Arc::new(tokio::sync::Mutex::new(())),
                    active: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Wait for the instance's lease.
    pub async fn acquire(&self, instance_id: Uuid) -> InstanceLease {
        let slot = self.slot(instance_id);
        let guard = slot.lease.clone().lock_owned().await;
        let lease_id = Uuid::new_v4();
        let token = CancellationToken::new();
        if let Ok(mut active) = slot.active.lock() {
            *active = Some((lease_id, token.clone()));
        }
        InstanceLease {
            instance_id,
            lease_id,
            token,
            slot,
            slots: self.slots.clone(),
            _guard: guard,
        }
    }

    /// Cancel the operation currently holding the lease, if any.
    pub fn cancel_active(&self, instance_id: Uuid) -> bool {
        let slot = lock_slots(&self.slots).get(&instance_id).cloned();
        let Some(slot) = slot else {
            return false;
        };
        let active = slot.active.lock().ok().and_then(|a| a.clone());
        match active {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_locked(&self, instance_id: Uuid) -> bool {
        let slot = lock_slots(&self.slots).get(&instance_id).cloned();
        slot.map_or(false, |s| s.lease.try_lock().is_err())
    }

    pub fn tracked(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn same_instance_is_serialized() {
        let locks = InstanceLocks::new();
        let id = Uuid::new_v4();
        let lease = locks.acquire(id).await;
        assert!(locks.is_locked(id));

        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _lease = l2.acquire(id).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        waiter.await.unwrap();
        assert!(!locks.is_locked(id));
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn different_instances_do_not_contend() {
        let locks = InstanceLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await;
        let _b = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn cancel_active_signals_the_holder() {
        let locks = InstanceLocks::new();
        let id = Uuid::new_v4();
        assert!(!locks.cancel_active(id));

        let lease = locks.acquire(id).await;
        assert!(locks.cancel_active(id));
        assert!(lease.is_cancelled());
        drop(lease);

        let fresh = locks.acquire(id).await;
        assert!(!fresh.is_cancelled());
    }
}
