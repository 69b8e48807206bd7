// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache fill admission across nodes.

use coherence::{CacheAccessDelegate, CoherenceConfig, RegionRegistry, TransactionalAccessDelegate};
use coherence_cluster::{LocalCluster, LocalTransport};
use coherence_store::{CacheStore, Error, InMemoryStore, OwnerToken, Timestamp};
use tick::ClockControl;

type TestResult = Result<(), Error>;
type Store = InMemoryStore<String, String>;
type Node = CacheAccessDelegate<String, String, Store, LocalTransport<String>>;
type TxNode = TransactionalAccessDelegate<String, String, Store, LocalTransport<String>>;

fn at(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn key(name: &str) -> String {
    name.to_string()
}

fn node(control: &ClockControl, cluster: &LocalCluster<String>) -> (RegionRegistry, Store, Node) {
    let regions = RegionRegistry::new(control.to_clock(), CoherenceConfig::default());
    let store = InMemoryStore::new();
    let cache = CacheAccessDelegate::builder::<String, String>(regions.acquire("entities"))
        .store(store.clone())
        .transport(cluster.join())
        .build();
    (regions, store, cache)
}

fn tx_node(control: &ClockControl, cluster: &LocalCluster<String>) -> (RegionRegistry, Store, TxNode) {
    let regions = RegionRegistry::new(control.to_clock(), CoherenceConfig::default());
    let store = InMemoryStore::new();
    let cache = CacheAccessDelegate::builder::<String, String>(regions.acquire("entities"))
        .store(store.clone())
        .transport(cluster.join())
        .build_transactional()
        .expect("inside a tokio runtime");
    (regions, store, cache)
}

/// Loads `k` through `cache` as `owner` and returns whether the fill was admitted.
async fn load(cache: &Node, k: &str, value: &str, as_of: Timestamp, owner: OwnerToken) -> Result<bool, Error> {
    if cache.get(&key(k), as_of, owner).await?.is_some() {
        return Ok(false);
    }
    cache.put_from_load(&key(k), value.to_string(), as_of, owner, false).await
}

#[tokio::test]
async fn reader_loses_to_concurrent_writer() -> TestResult {
    let control = ClockControl::new_at(at(100).to_system_time());
    let cluster = LocalCluster::new();
    let (_regions, store, cache) = tx_node(&control, &cluster);

    let reader = cache.begin();
    assert_eq!(cache.get(&reader, &key("k")).await?, None);

    control.set_time(at(101));
    let writer = cache.begin();
    cache.update(&writer, key("k"), "new".to_string()).await?;

    assert!(!cache.put_from_load(&reader, &key("k"), "old".to_string(), false).await?);
    assert!(!store.contains_key(&key("k")));

    let _ = cache.after_completion(&reader, true).await.wait().await;
    let _ = cache.after_completion(&writer, false).await.wait().await;
    Ok(())
}

#[tokio::test]
async fn peer_window_blocks_fill_until_end_arrives() -> TestResult {
    let control = ClockControl::new_at(at(100).to_system_time());
    let cluster = LocalCluster::new();
    let (_writer_regions, writer_store, writer_node) = tx_node(&control, &cluster);
    let (_reader_regions, _reader_store, reader_node) = node(&control, &cluster);

    let reader = OwnerToken::new();
    assert_eq!(reader_node.get(&key("k"), at(100), reader).await?, None);

    control.set_time(at(101));
    let tx = writer_node.begin();
    writer_node.update(&tx, key("k"), "X".to_string()).await?;
    writer_node.before_completion(&tx).await?;
    assert_eq!(reader_node.pending_puts().open_windows(&key("k")).await, vec![tx.owner()]);

    assert!(!reader_node.put_from_load(&key("k"), "stale".to_string(), at(100), reader, false).await?);

    let writes = writer_node.after_completion(&tx, true).await;
    assert_eq!(writes.wait().await, vec![coherence::WriteOutcome::Value]);
    assert!(writer_store.contains_key(&key("k")));

    // The end notice is asynchronous; the window stays open until it is delivered.
    assert_eq!(reader_node.pending_puts().open_windows(&key("k")).await, vec![tx.owner()]);
    assert_eq!(cluster.deliver_pending().await, 1);
    assert!(reader_node.pending_puts().open_windows(&key("k")).await.is_empty());

    control.set_time(at(102));
    let later = OwnerToken::new();
    assert!(load(&reader_node, "k", "X", at(102), later).await?);
    assert_eq!(reader_node.get(&key("k"), at(102), later).await?, Some("X".to_string()));
    Ok(())
}

#[tokio::test]
async fn remove_all_misses_everywhere_until_next_fill() -> TestResult {
    let control = ClockControl::new_at(at(100).to_system_time());
    let cluster = LocalCluster::new();
    let (_regions_a, _store_a, a) = node(&control, &cluster);
    let (_regions_b, store_b, b) = node(&control, &cluster);

    for (cache, owner) in [(&a, OwnerToken::new()), (&b, OwnerToken::new())] {
        assert!(load(cache, "k1", "v1", at(100), owner).await?);
        assert!(load(cache, "k2", "v2", at(100), owner).await?);
    }

    control.set_time(at(200));
    a.remove_all().await?;
    assert_eq!(store_b.len(), Some(0));

    for cache in [&a, &b] {
        let owner = OwnerToken::new();
        assert_eq!(cache.get(&key("k1"), at(150), owner).await?, None);
        assert_eq!(cache.get(&key("k2"), at(150), owner).await?, None);

        // Loads that started before the clear stay out.
        assert!(!cache.put_from_load(&key("k1"), "v1".to_string(), at(150), owner, false).await?);
        assert_eq!(cache.region().tracker().epoch(), at(200));
    }

    control.set_time(at(300));
    let owner = OwnerToken::new();
    assert!(load(&b, "k1", "fresh", at(300), owner).await?);
    assert_eq!(b.get(&key("k1"), at(300), owner).await?, Some("fresh".to_string()));
    assert_eq!(b.get(&key("k2"), at(300), owner).await?, None);
    Ok(())
}

#[tokio::test]
async fn region_invalidation_rejects_every_key() -> TestResult {
    let control = ClockControl::new_at(at(100).to_system_time());
    let cluster = LocalCluster::new();
    let (_regions, _store, cache) = node(&control, &cluster);
    let owners = [OwnerToken::new(), OwnerToken::new(), OwnerToken::new()];
    for (i, owner) in owners.iter().enumerate() {
        assert_eq!(cache.get(&format!("k{i}"), at(100), *owner).await?, None);
    }

    assert!(cache.pending_puts().begin_invalidating_region().await);
    for (i, owner) in owners.iter().enumerate() {
        assert!(!cache.put_from_load(&format!("k{i}"), "v".to_string(), at(100), *owner, false).await?);
    }
    assert!(cache.pending_puts().end_invalidating_region());
    assert!(!cache.pending_puts().end_invalidating_region(), "only one invalidation was open");
    Ok(())
}

#[tokio::test]
async fn release_and_end_are_idempotent() -> TestResult {
    let control = ClockControl::new_at(at(100).to_system_time());
    let cluster = LocalCluster::new();
    let (_regions, _store, cache) = node(&control, &cluster);
    let pending = cache.pending_puts();
    let writer = OwnerToken::new();

    assert!(pending.begin_invalidating_key(writer, &key("k")).await);
    assert!(pending.end_invalidating_key(writer, &key("k")).await);
    assert!(!pending.end_invalidating_key(writer, &key("k")).await);

    control.set_time(at(200));
    let reader = OwnerToken::new();
    assert!(pending.register_pending_put(reader, &key("k"), at(200)));
    let lock = pending.acquire_put_from_load_lock(reader, &key("k"), at(200)).await;
    let lock = lock.expect("no window is open");
    assert_eq!(lock.owner(), reader);
    pending.release_put_from_load_lock(lock);

    // The first admission consumed the registration; a naked put right after an
    // invalidation is turned down.
    assert!(pending.acquire_put_from_load_lock(reader, &key("k"), at(200)).await.is_none());
    Ok(())
}
