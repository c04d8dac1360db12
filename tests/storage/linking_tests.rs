//! Cross-entity linking tests.

use chainstore::linking::{link, EntityRef, LinkOutcome};
use chainstore::storage::{
    generate_entity_id, SnapshotCollection, SqlDatabase, StorageClient, StoreError,
};
use chainstore::utils::retry::RetryConfig;

use super::{person, publication, Person, Publication, PEOPLE, PUBLICATIONS};

fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 1,
        max_delay_ms: 10,
        max_retries: 5,
        jitter: false,
    }
}

fn add_author(author: &str) -> impl Fn(&mut Publication) -> bool + Sync + '_ {
    move |doc: &mut Publication| {
        if doc.authors.iter().any(|a| a == author) {
            false
        } else {
            doc.authors.push(author.to_string());
            true
        }
    }
}

fn add_publication(publication: &str) -> impl Fn(&mut Person) -> bool + Sync + '_ {
    move |doc: &mut Person| {
        if doc.publications.iter().any(|p| p == publication) {
            false
        } else {
            doc.publications.push(publication.to_string());
            true
        }
    }
}

pub async fn test_link_writes_both_sides<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let pub_id = generate_entity_id();
    let person_id = generate_entity_id();
    let pub_v1 = client
        .collection(PUBLICATIONS)
        .add(&pub_id, publication("Notes"))
        .await
        .unwrap();
    let person_v1 = client
        .collection(PEOPLE)
        .add(&person_id, person("Ada"))
        .await
        .unwrap();

    let outcome = link(
        client,
        EntityRef::new(PUBLICATIONS, &pub_id),
        EntityRef::new(PEOPLE, &person_id),
        &fast_retry(),
        add_author(&person_id),
        add_publication(&pub_id),
    )
    .await
    .expect("link should succeed");

    let LinkOutcome::Linked { left, right } = outcome else {
        panic!("expected a write, got {outcome:?}");
    };
    let left = left.expect("publication updated");
    let right = right.expect("person updated");
    assert!(left.snapshot_id() > pub_v1.snapshot_id());
    assert!(right.snapshot_id() > person_v1.snapshot_id());

    let doc: Publication = client
        .collection(PUBLICATIONS)
        .get_current_snapshot(&pub_id)
        .await
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(doc.authors, vec![person_id.clone()]);

    let doc: Person = client
        .collection(PEOPLE)
        .get_current_snapshot(&person_id)
        .await
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(doc.publications, vec![pub_id.clone()]);
}

pub async fn test_link_is_idempotent<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let pub_id = generate_entity_id();
    let person_id = generate_entity_id();
    client
        .collection(PUBLICATIONS)
        .add(&pub_id, publication("Twice"))
        .await
        .unwrap();
    client
        .collection(PEOPLE)
        .add(&person_id, person("Grace"))
        .await
        .unwrap();

    let left = EntityRef::new(PUBLICATIONS, &pub_id);
    let right = EntityRef::new(PEOPLE, &person_id);
    for _ in 0..2 {
        link(
            client,
            left,
            right,
            &fast_retry(),
            add_author(&person_id),
            add_publication(&pub_id),
        )
        .await
        .unwrap();
    }

    let history = client
        .collection(PUBLICATIONS)
        .get_history(&pub_id)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(history.len(), 2, "second link writes nothing");

    let outcome = link(
        client,
        left,
        right,
        &fast_retry(),
        add_author(&person_id),
        add_publication(&pub_id),
    )
    .await
    .unwrap();
    assert_eq!(outcome, LinkOutcome::AlreadyLinked);
}

pub async fn test_link_updates_only_changed_side<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let pub_id = generate_entity_id();
    let person_id = generate_entity_id();
    client
        .collection(PUBLICATIONS)
        .add(
            &pub_id,
            chainstore::storage::Payload::encode(&Publication {
                title: "Half".to_string(),
                authors: vec![person_id.clone()],
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let person_v1 = client
        .collection(PEOPLE)
        .add(&person_id, person("Linus"))
        .await
        .unwrap();

    let outcome = link(
        client,
        EntityRef::new(PUBLICATIONS, &pub_id),
        EntityRef::new(PEOPLE, &person_id),
        &fast_retry(),
        add_author(&person_id),
        add_publication(&pub_id),
    )
    .await
    .unwrap();

    let LinkOutcome::Linked { left, right } = outcome else {
        panic!("expected a write, got {outcome:?}");
    };
    assert!(left.is_none(), "publication already referenced the person");
    let right = right.expect("person updated");
    assert!(right.snapshot_id() > person_v1.snapshot_id());
}

pub async fn test_link_missing_entity<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let pub_id = generate_entity_id();
    let missing = generate_entity_id();
    client
        .collection(PUBLICATIONS)
        .add(&pub_id, publication("Alone"))
        .await
        .unwrap();

    let err = link(
        client,
        EntityRef::new(PUBLICATIONS, &pub_id),
        EntityRef::new(PEOPLE, &missing),
        &fast_retry(),
        add_author(&missing),
        add_publication(&pub_id),
    )
    .await
    .expect_err("missing person");
    assert!(err.is_not_found());

    let history = client
        .collection(PUBLICATIONS)
        .get_history(&pub_id)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(history.len(), 1, "nothing written");
}

pub async fn test_link_to_self_rejected<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let id = generate_entity_id();
    let err = link(
        client,
        EntityRef::new(PEOPLE, &id),
        EntityRef::new(PEOPLE, &id),
        &fast_retry(),
        add_publication(&id),
        add_publication(&id),
    )
    .await
    .expect_err("an entity cannot be linked to itself");
    assert!(matches!(err, StoreError::Integrity { .. }));
}

pub async fn test_concurrent_links_converge<DB: SqlDatabase>(client: &StorageClient<DB>) {
    let pub_id = generate_entity_id();
    let authors: Vec<String> = (0..3).map(|_| generate_entity_id()).collect();
    client
        .collection(PUBLICATIONS)
        .add(&pub_id, publication("Anthology"))
        .await
        .unwrap();
    for author in &authors {
        client
            .collection(PEOPLE)
            .add(author, person("Contributor"))
            .await
            .unwrap();
    }

    let retry = RetryConfig {
        max_retries: 20,
        jitter: true,
        ..fast_retry()
    };
    let mut tasks = Vec::new();
    for author in authors.clone() {
        let client = client.clone();
        let pub_id = pub_id.clone();
        let retry = retry.clone();
        tasks.push(tokio::spawn(async move {
            link(
                &client,
                EntityRef::new(PUBLICATIONS, &pub_id),
                EntityRef::new(PEOPLE, &author),
                &retry,
                add_author(&author),
                add_publication(&pub_id),
            )
            .await
        }));
    }
    for task in tasks {
        task.await
            .expect("task should not panic")
            .expect("link should eventually succeed");
    }

    let mut doc: Publication = client
        .collection(PUBLICATIONS)
        .get_current_snapshot(&pub_id)
        .await
        .unwrap()
        .decode()
        .unwrap();
    doc.authors.sort();
    let mut expected = authors;
    expected.sort();
    assert_eq!(doc.authors, expected, "no link lost to a concurrent update");
}

#[macro_export]
macro_rules! run_linking_tests {
    ($client:expr) => {
        use $crate::storage::linking_tests::*;

        test_link_writes_both_sides($client).await;
        println!("  test_link_writes_both_sides: PASSED");

        test_link_is_idempotent($client).await;
        println!("  test_link_is_idempotent: PASSED");

        test_link_updates_only_changed_side($client).await;
        println!("  test_link_updates_only_changed_side: PASSED");

        test_link_missing_entity($client).await;
        println!("  test_link_missing_entity: PASSED");

        test_link_to_self_rejected($client).await;
        println!("  test_link_to_self_rejected: PASSED");

        test_concurrent_links_converge($client).await;
        println!("  test_concurrent_links_converge: PASSED");
    };
}
