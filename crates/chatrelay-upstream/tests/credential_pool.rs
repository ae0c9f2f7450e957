use std::collections::HashMap;
use std::time::Duration;

use chatrelay_upstream::{CredentialPool, UnavailableReason};

#[tokio::test]
async fn fairness_holds_across_pool_sizes_and_call_counts() {
    for k in 1..=5usize {
        for n in [k, k * 3, k * 7, k * 10] {
            let pool = CredentialPool::new((0..k).map(|i| format!("cookie-{i}")).collect());
            let mut counts: HashMap<usize, usize> = HashMap::new();
            for _ in 0..n {
                let (id, _) = pool.next().await.expect("pool should have available slots");
                *counts.entry(id).or_insert(0) += 1;
            }
            let floor = n / k;
            let ceil = n.div_ceil(k);
            for id in 0..k {
                let count = *counts.get(&id).unwrap_or(&0);
                assert!(
                    count == floor || count == ceil,
                    "k={k} n={n} id={id} count={count} expected {floor} or {ceil}"
                );
            }
        }
    }
}

#[tokio::test]
async fn cooldown_is_respected_by_both_selection_methods() {
    let pool = CredentialPool::new(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    pool.cooldown(1, Duration::from_secs(600), UnavailableReason::RateLimit).await;

    for _ in 0..20 {
        let (id, _) = pool.next().await.unwrap();
        assert_ne!(id, 1);
    }
    for _ in 0..20 {
        let (id, _) = pool.random().await.unwrap();
        assert_ne!(id, 1);
    }
    assert_eq!(pool.size_available().await, 2);
}

#[tokio::test]
async fn all_credentials_in_cooldown_yields_none_available() {
    let pool = CredentialPool::new(vec!["a".to_string(), "b".to_string()]);
    pool.cooldown(0, Duration::from_secs(600), UnavailableReason::RateLimit).await;
    pool.cooldown(1, Duration::from_secs(600), UnavailableReason::FreeQuotaExhausted).await;

    assert!(pool.next().await.is_err());
    assert!(pool.random().await.is_err());
    assert_eq!(pool.size_available().await, 0);
}

#[tokio::test]
async fn removed_credential_never_recovers() {
    let pool = CredentialPool::new(vec!["a".to_string(), "b".to_string()]);
    pool.remove(0).await;

    for _ in 0..10 {
        let (id, _) = pool.next().await.unwrap();
        assert_eq!(id, 1);
    }
}

#[tokio::test]
async fn retry_bound_matches_pool_size_at_entry() {
    let pool = CredentialPool::new(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(pool.total_size().await, 3);
    pool.remove(0).await;
    // total_size is the retry-loop bound recorded at entry; it does not
    // shrink just because a credential became unavailable mid-loop.
    assert_eq!(pool.total_size().await, 3);
    assert_eq!(pool.size_available().await, 2);
}
