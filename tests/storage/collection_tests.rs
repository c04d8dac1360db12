//! Collection interface tests.
//!
//! These tests verify the snapshot-chain contract of `SnapshotCollection`
//! on pooled collections. Every test works on freshly generated entity ids,
//! so tests can share one database.

use std::sync::{Arc, Mutex};

use chrono::Duration as ChronoDuration;

use chainstore::storage::{
    generate_entity_id, ErrorKind, Payload, Snapshot, SnapshotCollection, SqlDatabase,
    StorageClient, StoreError,
};

use super::{publication, Publication, PEOPLE, PUBLICATIONS};

// =============================================================================
// Add / AddAfter
// =============================================================================

pub async fn test_publication_scenario<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS);
    let id = generate_entity_id();

    let a = publications
        .add(&id, publication("A"))
        .await
        .expect("add should succeed");
    assert!(a.is_current());

    let b = publications
        .add_after(a.snapshot_id(), &id, publication("B"))
        .await
        .expect("add_after with current token should succeed");
    assert!(b.snapshot_id() > a.snapshot_id());

    let stale = publications
        .add_after(a.snapshot_id(), &id, publication("C"))
        .await
        .expect_err("stale token must conflict");
    assert!(stale.is_conflict());
    assert_eq!(stale.kind(), ErrorKind::Conflict);
    assert_eq!(stale.kind().http_status(), 409);

    let current = publications
        .get_current_snapshot(&id)
        .await
        .expect("current should exist");
    assert_eq!(current.snapshot_id(), b.snapshot_id());
    let doc: Publication = current.decode().unwrap();
    assert_eq!(doc.title, "B");
}

pub async fn test_add_existing_is_integrity<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS);
    let id = generate_entity_id();

    publications.add(&id, publication("first")).await.unwrap();
    let err = publications
        .add(&id, publication("second"))
        .await
        .expect_err("second add must fail");
    assert!(matches!(err, StoreError::Integrity { .. }));
    assert_eq!(err.kind().http_status(), 400);

    let current = publications.get_current_snapshot(&id).await.unwrap();
    assert_eq!(current.decode::<Publication>().unwrap().title, "first");
}

pub async fn test_add_after_unknown_entity_conflicts<DB: SqlDatabase>(
    client: &StorageClient<DB>,
) {
    let publications = client.collection(PUBLICATIONS);
    let id = generate_entity_id();
    let other = generate_entity_id();

    let created = publications.add(&other, publication("other")).await.unwrap();
    let err = publications
        .add_after(created.snapshot_id(), &id, publication("x"))
        .await
        .expect_err("token of another entity must not match");
    assert!(err.is_conflict());

    let current = publications.get_current_snapshot(&other).await.unwrap();
    assert_eq!(current.snapshot_id(), created.snapshot_id());
}

pub async fn test_get_current_missing_is_not_found<DB: SqlDatabase>(
    client: &StorageClient<DB>,
) {
    let err = client
        .collection(PUBLICATIONS)
        .get_current_snapshot(&generate_entity_id())
        .await
        .expect_err("missing entity");
    assert!(err.is_not_found());
    assert_eq!(err.kind().http_status(), 404);
}

pub async fn test_collections_are_independent<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let id = generate_entity_id();
    client
        .collection(PUBLICATIONS)
        .add(&id, publication("only here"))
        .await
        .unwrap();

    let err = client
        .collection(PEOPLE)
        .get_current_snapshot(&id)
        .await
        .expect_err("same id in another collection is a different entity");
    assert!(err.is_not_found());
}

// =============================================================================
// Chain integrity and history
// =============================================================================

pub async fn test_chain_integrity<DB: SqlDatabase>(client: &StorageClient<DB>) {
    const WRITES: usize = 5;

    let publications = client.collection(PUBLICATIONS);
    let id = generate_entity_id();

    let mut written = vec![publications.add(&id, publication("v1")).await.unwrap()];
    for n in 2..=WRITES {
        let prev = written.last().unwrap().snapshot_id();
        let next = publications
            .add_after(prev, &id, publication(&format!("v{n}")))
            .await
            .unwrap();
        written.push(next);
    }

    let history = publications.get_history(&id).try_collect().await.unwrap();
    assert_eq!(history.len(), WRITES);

    let closed: Vec<&Snapshot> = history.iter().filter(|s| !s.is_current()).collect();
    assert_eq!(closed.len(), WRITES - 1);

    for pair in history.windows(2) {
        assert!(pair[0].snapshot_id() < pair[1].snapshot_id());
        assert_eq!(pair[0].valid_to(), Some(pair[1].valid_from()));
    }

    let last = history.last().unwrap();
    assert!(last.is_current());
    assert_eq!(last.snapshot_id(), written[WRITES - 1].snapshot_id());
    assert_eq!(last.decode::<Publication>().unwrap().title, "v5");
}

pub async fn test_get_at<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS);
    let id = generate_entity_id();

    let first = publications.add(&id, publication("draft")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = publications
        .add_after(first.snapshot_id(), &id, publication("final"))
        .await
        .unwrap();

    let at_first = publications.get_at(&id, first.valid_from()).await.unwrap();
    assert_eq!(at_first.snapshot_id(), first.snapshot_id());
    assert_eq!(at_first.valid_to(), Some(second.valid_from()));

    let at_second = publications.get_at(&id, second.valid_from()).await.unwrap();
    assert_eq!(at_second.snapshot_id(), second.snapshot_id());

    let before = first.valid_from() - ChronoDuration::seconds(1);
    let err = publications
        .get_at(&id, before)
        .await
        .expect_err("entity did not exist yet");
    assert!(err.is_not_found());
}

// =============================================================================
// Concurrency
// =============================================================================

pub async fn test_concurrent_add_after_race<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS).clone();
    let id = generate_entity_id();
    let base = publications.add(&id, publication("base")).await.unwrap();

    let mut tasks = Vec::new();
    for title in ["left", "right"] {
        let publications = publications.clone();
        let id = id.clone();
        let prev = base.snapshot_id();
        tasks.push(tokio::spawn(async move {
            publications.add_after(prev, &id, publication(title)).await
        }));
    }

    let mut successes = Vec::new();
    let mut conflicts = 0;
    for task in tasks {
        match task.await.expect("task should not panic") {
            Ok(snapshot) => successes.push(snapshot),
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(successes.len(), 1, "exactly one writer wins");
    assert_eq!(conflicts, 1, "the other writer sees a conflict");

    let current = publications.get_current_snapshot(&id).await.unwrap();
    assert_eq!(current.snapshot_id(), successes[0].snapshot_id());

    let history = publications.get_history(&id).try_collect().await.unwrap();
    assert_eq!(history.len(), 2);
}

pub async fn test_concurrent_add_race<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS).clone();
    let id = generate_entity_id();

    let mut tasks = Vec::new();
    for title in ["one", "two", "three"] {
        let publications = publications.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            publications.add(&id, publication(title)).await
        }));
    }

    let mut created = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.expect("task should not panic") {
            Ok(_) => created += 1,
            Err(StoreError::Integrity { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(rejected, 2);

    let current = publications.get_by_id(&[id.as_str()]).try_collect().await.unwrap();
    assert_eq!(current.len(), 1, "one current snapshot per entity");
}

// =============================================================================
// Payloads
// =============================================================================

pub async fn test_round_trip_bytes<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS);
    let id = generate_entity_id();
    let raw: Vec<u8> = vec![0x00, 0xff, 0x7b, 0x01, 0xfe, 0x00, 0x22];

    publications
        .add(&id, Payload::from(raw.clone()))
        .await
        .unwrap();
    let current = publications.get_current_snapshot(&id).await.unwrap();
    assert_eq!(current.payload().as_bytes(), raw.as_slice());

    let err = current
        .decode::<Publication>()
        .expect_err("binary payload is not a publication");
    assert_eq!(err.kind(), ErrorKind::Serialization);
}

// =============================================================================
// Cursors
// =============================================================================

pub async fn test_get_by_id_omits_missing<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS);
    let a = generate_entity_id();
    let b = generate_entity_id();
    let missing = generate_entity_id();

    publications.add(&a, publication("a")).await.unwrap();
    publications.add(&b, publication("b")).await.unwrap();

    let mut cursor = publications.get_by_id(&[a.as_str(), missing.as_str(), b.as_str()]);
    let mut ids = Vec::new();
    while cursor.next().await {
        ids.push(cursor.snapshot().unwrap().entity_id().to_string());
    }
    assert!(cursor.err().is_none());
    ids.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(ids, expected);

    let empty = publications.get_by_id(&[]).try_collect().await.unwrap();
    assert!(empty.is_empty());
}

pub async fn test_get_all_returns_current_only<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let people = client.collection(PEOPLE);
    let id = generate_entity_id();

    let first = people.add(&id, super::person("Ada")).await.unwrap();
    let second = people
        .add_after(first.snapshot_id(), &id, super::person("Ada L."))
        .await
        .unwrap();

    let mut cursor = people.get_all();
    let mut matching = Vec::new();
    while cursor.next().await {
        let snapshot = cursor.snapshot().unwrap();
        assert!(snapshot.is_current());
        if snapshot.entity_id() == id {
            matching.push(snapshot.snapshot_id());
        }
    }
    assert!(cursor.err().is_none());
    assert_eq!(matching, vec![second.snapshot_id()]);
}

pub async fn test_cursor_early_close_releases<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS);
    for n in 0..20 {
        publications
            .add(&generate_entity_id(), publication(&format!("bulk {n}")))
            .await
            .unwrap();
    }

    // Abandon several scans mid-way; the pool must not run dry.
    for _ in 0..client.pool().options().get_max_connections() + 2 {
        let mut cursor = publications.get_all();
        assert!(cursor.next().await);
        assert!(cursor.snapshot().is_some());
        cursor.close();
    }

    let id = generate_entity_id();
    publications.add(&id, publication("after scans")).await.unwrap();
    publications.get_current_snapshot(&id).await.unwrap();
}

// =============================================================================
// Listeners
// =============================================================================

pub async fn test_listener_exactness<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let publications = client.collection(PUBLICATIONS);
    let id = generate_entity_id();

    let seen: Arc<Mutex<Vec<(String, Snapshot)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let watched = id.clone();
    publications.listen(Arc::new(move |collection: &str, snapshot: &Snapshot| {
        if snapshot.entity_id() == watched {
            sink.lock()
                .unwrap()
                .push((collection.to_string(), snapshot.clone()));
        }
    }));

    let first = publications.add(&id, publication("A")).await.unwrap();
    let second = publications
        .add_after(first.snapshot_id(), &id, publication("B"))
        .await
        .unwrap();
    let _ = publications
        .add_after(first.snapshot_id(), &id, publication("stale"))
        .await
        .expect_err("stale write");
    let _ = publications
        .add(&id, publication("duplicate"))
        .await
        .expect_err("duplicate create");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2, "one event per committed write");
    assert_eq!(seen[0], (PUBLICATIONS.to_string(), first));
    assert_eq!(seen[1], (PUBLICATIONS.to_string(), second));
}

pub async fn test_panicking_listener_is_isolated<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let people = client.collection(PEOPLE);
    let id = generate_entity_id();

    let watched = id.clone();
    people.listen(Arc::new(move |_: &str, snapshot: &Snapshot| {
        if snapshot.entity_id() == watched {
            panic!("observer failure");
        }
    }));
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let watched = id.clone();
    people.listen(Arc::new(move |_: &str, snapshot: &Snapshot| {
        if snapshot.entity_id() == watched {
            *counter.lock().unwrap() += 1;
        }
    }));

    let created = people
        .add(&id, super::person("Grace"))
        .await
        .expect("write succeeds despite a failing observer");
    assert!(created.is_current());
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[macro_export]
macro_rules! run_collection_tests {
    ($client:expr) => {
        use $crate::storage::collection_tests::*;

        // add / add_after
        test_publication_scenario($client).await;
        println!("  test_publication_scenario: PASSED");

        test_add_existing_is_integrity($client).await;
        println!("  test_add_existing_is_integrity: PASSED");

        test_add_after_unknown_entity_conflicts($client).await;
        println!("  test_add_after_unknown_entity_conflicts: PASSED");

        test_get_current_missing_is_not_found($client).await;
        println!("  test_get_current_missing_is_not_found: PASSED");

        test_collections_are_independent($client).await;
        println!("  test_collections_are_independent: PASSED");

        // chains
        test_chain_integrity($client).await;
        println!("  test_chain_integrity: PASSED");

        test_get_at($client).await;
        println!("  test_get_at: PASSED");

        // concurrency
        test_concurrent_add_after_race($client).await;
        println!("  test_concurrent_add_after_race: PASSED");

        test_concurrent_add_race($client).await;
        println!("  test_concurrent_add_race: PASSED");

        // payloads
        test_round_trip_bytes($client).await;
        println!("  test_round_trip_bytes: PASSED");

        // cursors
        test_get_by_id_omits_missing($client).await;
        println!("  test_get_by_id_omits_missing: PASSED");

        test_get_all_returns_current_only($client).await;
        println!("  test_get_all_returns_current_only: PASSED");

        test_cursor_early_close_releases($client).await;
        println!("  test_cursor_early_close_releases: PASSED");

        // listeners
        test_listener_exactness($client).await;
        println!("  test_listener_exactness: PASSED");

        test_panicking_listener_is_isolated($client).await;
        println!("  test_panicking_listener_is_isolated: PASSED");
    };
}
