use std::sync::Arc;

use super::*;

#[tokio::test]
async fn ensure_identity_reports_absence_then_presence() {
    let store = KeyStore::in_memory().await.expect("open");
    let user = UserId(7);

    assert!(store.ensure_identity(user).await.expect("lookup").is_none());

    let material = KeyStore::generate();
    store
        .persist_identity(user, &material)
        .await
        .expect("persist");

    let loaded = store
        .ensure_identity(user)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(loaded, material);
}

#[tokio::test]
async fn persist_identity_never_silently_overwrites() {
    let store = KeyStore::in_memory().await.expect("open");
    let user = UserId(3);

    let first = KeyStore::generate();
    store.persist_identity(user, &first).await.expect("persist");

    // Re-persisting the same pair is a no-op.
    store
        .persist_identity(user, &first)
        .await
        .expect("idempotent persist");

    let second = KeyStore::generate();
    assert!(store.persist_identity(user, &second).await.is_err());

    let loaded = store
        .ensure_identity(user)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(loaded, first);
}

#[tokio::test]
async fn adopt_pending_moves_the_pair_exactly_once() {
    let store = KeyStore::in_memory().await.expect("open");
    let user = UserId(11);
    let material = KeyStore::generate();

    store
        .stash_pending("new@example.com", &material)
        .await
        .expect("stash");

    let adopted = store
        .adopt_pending("new@example.com", user)
        .await
        .expect("adopt");
    assert_eq!(adopted, Some(material.clone()));

    // Second adoption finds no pending row.
    let again = store
        .adopt_pending("new@example.com", user)
        .await
        .expect("adopt again");
    assert_eq!(again, None);

    let identity = store
        .ensure_identity(user)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(identity, material);
}

#[tokio::test]
async fn adopt_pending_without_a_stash_is_a_no_op() {
    let store = KeyStore::in_memory().await.expect("open");
    let adopted = store
        .adopt_pending("nobody@example.com", UserId(1))
        .await
        .expect("adopt");
    assert_eq!(adopted, None);
}

#[tokio::test]
async fn adopt_pending_defers_to_an_existing_identity_key() {
    let store = KeyStore::in_memory().await.expect("open");
    let user = UserId(21);

    let established = KeyStore::generate();
    store
        .persist_identity(user, &established)
        .await
        .expect("persist");

    let late = KeyStore::generate();
    store
        .stash_pending("late@example.com", &late)
        .await
        .expect("stash");

    let adopted = store
        .adopt_pending("late@example.com", user)
        .await
        .expect("adopt");
    assert_eq!(adopted, None);

    // The established pair survives and the pending row is gone.
    let identity = store
        .ensure_identity(user)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(identity, established);
    let retry = store
        .adopt_pending("late@example.com", user)
        .await
        .expect("adopt retry");
    assert_eq!(retry, None);
}

#[tokio::test]
async fn concurrent_adoption_for_one_identity_is_exactly_once() {
    let store = Arc::new(KeyStore::in_memory().await.expect("open"));
    let user = UserId(42);
    let material = KeyStore::generate();
    store
        .stash_pending("race@example.com", &material)
        .await
        .expect("stash");

    let a = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.adopt_pending("race@example.com", user).await })
    };
    let b = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.adopt_pending("race@example.com", user).await })
    };

    let outcomes = [
        a.await.expect("join").expect("adopt"),
        b.await.expect("join").expect("adopt"),
    ];
    let adopted: Vec<_> = outcomes.iter().flatten().collect();
    assert_eq!(adopted.len(), 1, "exactly one adoption must win");
    assert_eq!(adopted[0], &material);
}

#[tokio::test]
async fn restashing_replaces_the_pending_pair() {
    let store = KeyStore::in_memory().await.expect("open");
    let first = KeyStore::generate();
    let second = KeyStore::generate();

    store
        .stash_pending("retry@example.com", &first)
        .await
        .expect("stash");
    store
        .stash_pending("retry@example.com", &second)
        .await
        .expect("restash");

    let adopted = store
        .adopt_pending("retry@example.com", UserId(9))
        .await
        .expect("adopt");
    assert_eq!(adopted, Some(second));
}

#[tokio::test]
async fn peer_key_cache_round_trips() {
    let store = KeyStore::in_memory().await.expect("open");
    let peer = UserId(5);

    assert!(store.lookup_peer_public_key(peer).await.is_none());
    store.record_peer_public_key(peer, "peer-public-key").await;
    assert_eq!(
        store.lookup_peer_public_key(peer).await.as_deref(),
        Some("peer-public-key")
    );
}
