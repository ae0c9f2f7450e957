use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;
use tokio::sync::RwLock;

use super::state::{CredentialId, CredentialState, UnavailableReason};

#[derive(Debug, Clone)]
pub struct Credential {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    NoneAvailable,
}

struct Slot {
    credential: Credential,
    state: CredentialState,
}

/// Holds the set of upstream credentials loaded at startup. One credential
/// is never shared across two concurrent callers exclusively — cooldown
/// state is visible to everyone immediately, which is what lets two turns
/// on the same credential run concurrently (see the ordering guarantees
/// this pool is built to support).
pub struct CredentialPool {
    slots: RwLock<Vec<Slot>>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(credentials: Vec<String>) -> Self {
        let slots = credentials
            .into_iter()
            .map(|value| Slot {
                credential: Credential { value },
                state: CredentialState::Active,
            })
            .collect();
        Self {
            slots: RwLock::new(slots),
            cursor: AtomicUsize::new(0),
        }
    }

    pub async fn random(&self) -> Result<(CredentialId, Credential), PoolError> {
        let slots = self.slots.read().await;
        let now = Instant::now();
        let mut rng = rand::rng();
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_available(now))
            .choose(&mut rng)
            .map(|(id, slot)| (id, slot.credential.clone()))
            .ok_or(PoolError::NoneAvailable)
    }

    /// Advances the round-robin cursor past any unavailable slot and wraps
    /// around. Two concurrent callers observe distinct, monotonically
    /// increasing start positions because the cursor is a single atomic.
    pub async fn next(&self) -> Result<(CredentialId, Credential), PoolError> {
        let slots = self.slots.read().await;
        let len = slots.len();
        if len == 0 {
            return Err(PoolError::NoneAvailable);
        }
        let now = Instant::now();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            let id = (start + offset) % len;
            if slots[id].state.is_available(now) {
                return Ok((id, slots[id].credential.clone()));
            }
        }
        Err(PoolError::NoneAvailable)
    }

    pub async fn cooldown(&self, id: CredentialId, duration: Duration, reason: UnavailableReason) {
        let until = Instant::now() + duration;
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(id) {
            slot.state = CredentialState::Unavailable { until, reason };
        }
    }

    pub async fn remove(&self, id: CredentialId) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(id) {
            slot.state = CredentialState::Removed;
        }
    }

    pub async fn size_available(&self) -> usize {
        let slots = self.slots.read().await;
        let now = Instant::now();
        slots.iter().filter(|slot| slot.state.is_available(now)).count()
    }

    /// Insertion-order size at pool-creation time; used as the retry loop's
    /// `max_retries` bound regardless of how many become unavailable mid-loop.
    pub async fn total_size(&self) -> usize {
        self.slots.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> CredentialPool {
        CredentialPool::new((0..n).map(|i| format!("cookie-{i}")).collect())
    }

    #[tokio::test]
    async fn next_advances_through_all_slots_before_repeating() {
        let pool = pool_of(3);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (id, _) = pool.next().await.unwrap();
            seen.push(id);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cooldown_excludes_credential_until_expiry() {
        let pool = pool_of(2);
        pool.cooldown(0, Duration::from_secs(600), UnavailableReason::RateLimit)
            .await;
        assert_eq!(pool.size_available().await, 1);
        let (id, _) = pool.next().await.unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn remove_is_permanent_for_process_lifetime() {
        let pool = pool_of(1);
        pool.remove(0).await;
        assert!(pool.next().await.is_err());
        assert_eq!(pool.size_available().await, 0);
    }

    #[tokio::test]
    async fn empty_pool_reports_none_available() {
        let pool = pool_of(0);
        assert_eq!(pool.next().await, Err(PoolError::NoneAvailable));
        assert_eq!(pool.random().await, Err(PoolError::NoneAvailable));
    }
}
