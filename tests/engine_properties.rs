//! End-to-end behavioral properties of the engine over the in-memory store:
//! type exclusivity across partitions, lazy expiry, ordering rules, stream
//! id monotonicity, filter guarantees, and lost-update prevention under
//! concurrency.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use oxidis::engine::strings::SetCondition;
use oxidis::storage::StreamEntryId;
use oxidis::{Engine, EngineError};

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn type_exclusivity_across_partitions() {
    let engine = Engine::in_memory();
    engine
        .set("k", b"v", None, SetCondition::None, &cancel())
        .await
        .unwrap();

    // Every other type store refuses the occupied key.
    assert_eq!(
        engine.hset("k", "f", b"v", &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.list_push("k", &[b"v"], false, &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.set_add("k", &[b"v"], &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.zadd("k", &[(b"m", 1.0)], &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.stream_add("k", "*", &[("f", b"v")], &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.pf_add("k", &[b"m"], &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.bloom_add("k", b"m", &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.cuckoo_add("k", b"m", false, &cancel()).await,
        Err(EngineError::WrongType)
    );
    assert_eq!(
        engine.digest_create("k", 100, &cancel()).await,
        Err(EngineError::WrongType)
    );

    // Deleting the key frees it for a different type.
    assert_eq!(engine.delete(&["k"], &cancel()).await.unwrap(), 1);
    engine.hset("k", "f", b"v", &cancel()).await.unwrap();
    assert_eq!(
        engine.get("k", &cancel()).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn ttl_expiry_is_observed_lazily() {
    let engine = Engine::in_memory();
    engine
        .set("k", b"v", Some(100), SetCondition::None, &cancel())
        .await
        .unwrap();
    assert_eq!(
        engine.get("k", &cancel()).await.unwrap(),
        Some(b"v".to_vec())
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.get("k", &cancel()).await.unwrap(), None);
    assert_eq!(engine.pttl("k", &cancel()).await.unwrap(), -2);
    assert!(!engine.exists("k", &cancel()).await.unwrap());
}

#[tokio::test]
async fn expired_key_frees_its_partition() {
    let engine = Engine::in_memory();
    engine
        .set("k", b"v", Some(50), SetCondition::None, &cancel())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The expired string no longer blocks a hash under the same key.
    engine.hset("k", "f", b"v", &cancel()).await.unwrap();
    assert_eq!(
        engine.hget("k", "f", &cancel()).await.unwrap(),
        Some(b"v".to_vec())
    );
}

#[tokio::test]
async fn list_negative_indices() {
    let engine = Engine::in_memory();
    engine
        .list_push("l", &[b"a", b"b", b"c", b"d"], false, &cancel())
        .await
        .unwrap();

    assert_eq!(
        engine.list_range("l", -2, -1, &cancel()).await.unwrap(),
        vec![b"c".to_vec(), b"d".to_vec()]
    );
    assert!(engine.list_range("l", 5, 10, &cancel()).await.unwrap().is_empty());
    assert_eq!(
        engine.list_index("l", -1, &cancel()).await.unwrap(),
        Some(b"d".to_vec())
    );
}

#[tokio::test]
async fn sorted_set_orders_by_score_then_member() {
    let engine = Engine::in_memory();
    engine
        .zadd("z", &[(b"m1", 5.0), (b"m2", 5.0), (b"m3", 1.0)], &cancel())
        .await
        .unwrap();

    let all = engine.zrange_by_index("z", 0, -1, &cancel()).await.unwrap();
    let members: Vec<&[u8]> = all.iter().map(|e| e.member.as_slice()).collect();
    assert_eq!(members, vec![b"m3".as_ref(), b"m1", b"m2"]);
}

#[tokio::test]
async fn stream_ids_are_monotonic() {
    let engine = Engine::in_memory();
    let first = engine
        .stream_add("s", "*", &[("f", b"v")], &cancel())
        .await
        .unwrap()
        .unwrap();
    let second = engine
        .stream_add("s", "*", &[("f", b"v")], &cancel())
        .await
        .unwrap()
        .unwrap();
    assert!(second > first);
    if second.ms == first.ms {
        assert_eq!((second.ms, second.seq), (first.ms, first.seq + 1));
    }

    engine
        .stream_add("s2", "5-5", &[("f", b"v")], &cancel())
        .await
        .unwrap();
    assert!(matches!(
        engine.stream_add("s2", "5-5", &[("f", b"v")], &cancel()).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert_eq!(
        engine.stream_last_id("s2", &cancel()).await.unwrap(),
        Some(StreamEntryId::new(5, 5))
    );
}

#[tokio::test]
async fn bloom_filter_has_no_false_negatives() {
    let engine = Engine::in_memory();
    engine.bloom_reserve("bf", 0.01, 1000, &cancel()).await.unwrap();

    let items: Vec<Vec<u8>> = (0..500).map(|i| format!("elem-{i}").into_bytes()).collect();
    let refs: Vec<&[u8]> = items.iter().map(|i| i.as_slice()).collect();
    engine.bloom_madd("bf", &refs, &cancel()).await.unwrap();

    let found = engine.bloom_mexists("bf", &refs, &cancel()).await.unwrap();
    assert!(found.into_iter().all(|f| f));

    let info = engine.bloom_info("bf", &cancel()).await.unwrap();
    assert!(info.bit_size >= 64);
    assert!(info.hash_function_count >= 1);
}

#[tokio::test]
async fn incr_by_overflow_leaves_value_untouched() {
    let engine = Engine::in_memory();
    engine.incr_by("n", 1, &cancel()).await.unwrap();

    assert!(matches!(
        engine.incr_by("n", i64::MAX, &cancel()).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert_eq!(
        engine.get("n", &cancel()).await.unwrap(),
        Some(b"1".to_vec())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_converge() {
    let engine = Arc::new(Engine::in_memory());
    let n = 20;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                // Retry until the increment actually lands: the retry budget
                // may be exhausted under contention, which is a "no effect"
                // outcome, not an error.
                loop {
                    if engine.incr_by("ctr", 1, &cancel()).await.unwrap().is_some() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        engine.get("ctr", &cancel()).await.unwrap(),
        Some(n.to_string().into_bytes())
    );
}

#[tokio::test]
async fn group_lifecycle_end_to_end() {
    let engine = Engine::in_memory();
    for spec in ["1-0", "2-0", "3-0"] {
        engine
            .stream_add("s", spec, &[("f", b"v")], &cancel())
            .await
            .unwrap();
    }
    engine.group_create("s", "g", "-", false, &cancel()).await.unwrap();

    let delivered = engine
        .group_read("s", "g", "c1", ">", None, &cancel())
        .await
        .unwrap();
    assert_eq!(delivered.len(), 3);

    engine.ack("s", "g", &["1-0"], &cancel()).await.unwrap();
    let claimed = engine
        .claim("s", "g", "c2", 0, &["2-0"], false, &cancel())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // Trimming away entry 2-0 drops its pending reference in passing.
    engine
        .stream_trim(
            "s",
            oxidis::engine::streams::TrimStrategy::MinId(StreamEntryId::new(3, 0)),
            &cancel(),
        )
        .await
        .unwrap();
    let summary = engine.pending_summary("s", "g", &cancel()).await.unwrap();
    assert_eq!(summary.count, 1);
    assert_eq!(summary.min_id, Some(StreamEntryId::new(3, 0)));
}

#[tokio::test]
async fn cleanup_sweep_reclaims_across_types() {
    let engine = Engine::in_memory();
    engine
        .set("a", b"v", Some(30), SetCondition::None, &cancel())
        .await
        .unwrap();
    engine.hset("b", "f", b"v", &cancel()).await.unwrap();
    engine.pexpire("b", 30, &cancel()).await.unwrap();
    engine.set_add("c", &[b"m"], &cancel()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(engine.cleanup_expired_keys(&cancel()).await.unwrap(), 2);
    assert!(engine.exists("c", &cancel()).await.unwrap());
}
