use atm_memo::{MemoConfig, MemoizationCache};
use atm_store::ContentStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_computation() {
    let cache = MemoizationCache::new(Arc::new(ContentStore::in_memory()), &MemoConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute("parcel_lookup", b"apn=1234", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(b"owner=alice".to_vec())
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;
    let digests: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap().output_digest)
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(digests.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cache.content().blob_count().unwrap(), 1);
    assert_eq!(cache.content().ref_count(&digests[0]), 1);

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_compute_independently() {
    let cache = MemoizationCache::new(Arc::new(ContentStore::in_memory()), &MemoConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                let input = format!("apn={}", i % 3);
                cache
                    .get_or_compute("parcel_lookup", input.as_bytes(), None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(format!("owner of {}", i % 3).into_bytes())
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn shared_output_bytes_are_stored_once() {
    let content = Arc::new(ContentStore::in_memory());
    let cache = MemoizationCache::new(Arc::clone(&content), &MemoConfig::default());

    let a = cache
        .get_or_compute("geocode", b"Seattle, WA", None, || async { Ok(b"53033".to_vec()) })
        .await
        .unwrap();
    let b = cache
        .get_or_compute("geocode", b"seattle wa", None, || async { Ok(b"53033".to_vec()) })
        .await
        .unwrap();

    assert_ne!(a.key, b.key);
    assert_eq!(a.output_digest, b.output_digest);
    assert_eq!(content.blob_count().unwrap(), 1);
    assert_eq!(content.ref_count(&a.output_digest), 2);
}
