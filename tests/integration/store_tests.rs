//! TTL store expiry semantics against the wall clock.

use std::time::Duration;

use imgopt::TtlStore;

#[tokio::test]
async fn test_ttl_entry_lifecycle() {
    let store: TtlStore<String> = TtlStore::new();
    store
        .set_with_ttl("k", "v".to_string(), Duration::from_secs(1))
        .await;

    // Before expiry the value is present.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.get("k").await, Some("v".to_string()));

    // After expiry it is absent and no longer enumerated.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(store.get("k").await, None);
    assert!(!store.keys().await.contains(&"k".to_string()));
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn test_explicit_delete_before_expiry() {
    let store: TtlStore<u32> = TtlStore::new();
    store.set_with_ttl("k", 7, Duration::from_secs(30)).await;

    assert!(store.delete("k").await);
    assert_eq!(store.get("k").await, None);
}

#[tokio::test]
async fn test_sweep_counts_only_expired() {
    let store: TtlStore<u32> = TtlStore::new();
    store.set_with_ttl("short", 1, Duration::from_millis(50)).await;
    store.set_with_ttl("long", 2, Duration::from_secs(60)).await;

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(store.sweep().await, 1);
    assert_eq!(store.get("long").await, Some(2));
}
