//! Batch put, delete and get against the in-memory store.

mod common;

use std::time::Duration;

use common::{Album, Call, MockTransport, Track, album, store, track};
use ferridyn_mapper::transport::{BatchWriteInput, WriteRequest};
use ferridyn_mapper::{BatchError, Client, ClientConfig, Error, ItemError};

fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_retry_backoff(Duration::from_millis(1))
        .with_max_batch_retries(2)
}

fn writes(mock: &MockTransport) -> Vec<BatchWriteInput> {
    mock.calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::BatchWrite(w) => Some(w),
            _ => None,
        })
        .collect()
}

fn batch_error(err: Error) -> BatchError {
    match err {
        Error::Batch(e) => e,
        other => panic!("expected a batch error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delete_deduplicates_keys() {
    let mock = store();
    for no in 1..=3 {
        mock.insert("tracks", track("Low", no, ""));
    }
    mock.clear_calls();
    let client = Client::new(mock.clone());

    let items = vec![
        track("Low", 1, "a"),
        track("Low", 2, "b"),
        track("Low", 3, "c"),
        track("Low", 1, "d"),
    ];
    client.batch_delete("tracks", &items).run().await.unwrap();

    let writes = writes(&mock);
    assert_eq!(writes.len(), 1);
    let requests = &writes[0].request_items["tracks"];
    assert_eq!(requests.len(), 3);
    for req in requests {
        let WriteRequest::Delete { key } = req else {
            panic!("expected a delete");
        };
        // Only key attributes are sent.
        assert_eq!(key.len(), 2);
    }
    assert!(mock.items("tracks").is_empty());
}

#[tokio::test]
async fn test_put_last_duplicate_wins_across_tables() {
    let mock = store();
    let client = Client::new(mock.clone());

    let tracks = vec![track("Low", 1, "draft"), track("Low", 1, "Speed of Life")];
    let albums = vec![album("Low", 1977), album("Heroes", 1977)];
    client
        .batch_put("tracks", &tracks)
        .put("albums", &albums)
        .run()
        .await
        .unwrap();

    let writes = writes(&mock);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].request_items["tracks"].len(), 1);
    assert_eq!(writes[0].request_items["albums"].len(), 2);

    let stored = mock.items("tracks");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["title"].as_str(), Some("Speed of Life"));
    assert!(!stored[0].contains_key("genre"));
    assert_eq!(mock.items("albums").len(), 2);
}

#[tokio::test]
async fn test_put_splits_into_rounds() {
    let mock = store();
    let client = Client::new(mock.clone());

    let items: Vec<Track> = (1..=30).map(|no| track("Low", no, "")).collect();
    client.batch_put("tracks", &items).run().await.unwrap();

    let sizes: Vec<usize> = writes(&mock)
        .iter()
        .map(|w| w.request_items["tracks"].len())
        .collect();
    assert_eq!(sizes, vec![25, 5]);
    assert_eq!(mock.items("tracks").len(), 30);
}

#[tokio::test]
async fn test_configured_write_size() {
    let mock = store();
    let config = ClientConfig::default().with_batch_write_size(4);
    let client = Client::with_config(mock.clone(), config);

    let items: Vec<Album> = (0..10).map(|n| album(&format!("a{n}"), 1970 + n)).collect();
    client.batch_put("albums", &items).run().await.unwrap();

    assert_eq!(writes(&mock).len(), 3);
}

#[tokio::test]
async fn test_oversized_configured_sizes_are_capped() {
    let mock = store();
    let config: ClientConfig =
        serde_json::from_str(r#"{"batch_write_size": 1000, "batch_get_size": 1000}"#).unwrap();
    let client = Client::with_config(mock.clone(), config);

    let items: Vec<Track> = (1..=30).map(|no| track("Low", no, "")).collect();
    client.batch_put("tracks", &items).run().await.unwrap();
    let sizes: Vec<usize> = writes(&mock)
        .iter()
        .map(|w| w.request_items["tracks"].len())
        .collect();
    assert_eq!(sizes, vec![25, 5]);

    let mut albums: Vec<Album> = (0..120).map(|n| album(&format!("a{n}"), 0)).collect();
    for album in &albums {
        mock.insert("albums", album.clone());
    }
    mock.clear_calls();
    client.batch_get("albums", &mut albums).run().await.unwrap();
    let gets: Vec<usize> = mock
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::BatchGet(g) => Some(g.request_items["albums"].keys.len()),
            _ => None,
        })
        .collect();
    assert_eq!(gets, vec![100, 20]);
}

#[tokio::test]
async fn test_unprocessed_items_are_retried() {
    let mock = store();
    mock.leave_unprocessed(2);
    let client = Client::with_config(mock.clone(), fast_config());

    let items: Vec<Track> = (1..=5).map(|no| track("Low", no, "")).collect();
    client.batch_put("tracks", &items).run().await.unwrap();

    assert_eq!(writes(&mock).len(), 3);
    assert_eq!(mock.items("tracks").len(), 5);
}

#[tokio::test]
async fn test_partial_progress_does_not_count_as_a_stall() {
    let mock = store();
    mock.set_batch_capacity(3);
    let client = Client::with_config(mock.clone(), fast_config());

    let items: Vec<Track> = (1..=20).map(|no| track("Low", no, "")).collect();
    client.batch_put("tracks", &items).run().await.unwrap();

    assert_eq!(mock.items("tracks").len(), 20);
    assert_eq!(writes(&mock).len(), 7);
}

#[tokio::test]
async fn test_permanently_unprocessed_items_terminate() {
    let mock = store();
    mock.stick_table("albums");
    let client = Client::with_config(mock.clone(), fast_config());

    let tracks = vec![track("Low", 1, "")];
    let albums = vec![album("Low", 1977), album("Low", 1978)];
    let err = client
        .batch_put("tracks", &tracks)
        .put("albums", &albums)
        .run()
        .await
        .unwrap_err();

    let errors = batch_error(err);
    assert_eq!(errors.len(), 2);
    assert!(errors.table("tracks").is_none());
    // Both positions share the one deduplicated key.
    for i in 0..2 {
        assert_eq!(
            errors.get("albums", i),
            Some(&ItemError::Unprocessed { attempts: 4 })
        );
    }
    // One productive round, then three stalled ones.
    assert_eq!(writes(&mock).len(), 4);
    assert_eq!(mock.items("tracks").len(), 1);
}

#[tokio::test]
async fn test_invalid_items_are_reported_by_position() {
    let mock = store();
    let client = Client::new(mock.clone());

    let items = vec![track("Low", 1, ""), track("", 2, ""), track("Low", 3, "")];
    let err = client
        .batch_put("tracks", &items)
        .run()
        .await
        .unwrap_err();

    let errors = batch_error(err);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors.get("tracks", 1), Some(ItemError::InvalidKey(_))));
    assert_eq!(mock.items("tracks").len(), 2);
}

#[tokio::test]
async fn test_duplicate_table_registration() {
    let mock = store();
    let client = Client::new(mock.clone());

    let items = vec![album("Low", 1977)];
    let err = client
        .batch_delete("albums", &items)
        .delete("albums", &items)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateTableRegistration(ref t) if t == "albums"));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_transport_failure_aborts() {
    let mock = store();
    mock.fail_next(1);
    let client = Client::new(mock);

    let items = vec![album("Low", 1977)];
    let err = client.batch_put("albums", &items).run().await.unwrap_err();
    assert!(matches!(err, Error::Transport { context: "batch write", .. }));
}

// ---------------------------------------------------------------------------
// Gets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_get_fills_items_and_reports_missing() {
    let mock = store();
    mock.insert("tracks", track("Low", 1, "Speed of Life"));
    mock.insert("tracks", track("Low", 2, "Breaking Glass"));
    let client = Client::new(mock.clone());

    let mut keys = vec![
        track("Low", 1, ""),
        track("Low", 9, ""),
        track("Low", 2, ""),
        track("Low", 1, ""),
    ];
    let err = client
        .batch_get("tracks", &mut keys)
        .run()
        .await
        .unwrap_err();

    let errors = batch_error(err);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.get("tracks", 1), Some(&ItemError::NotFound));

    assert_eq!(keys[0].title, "Speed of Life");
    assert_eq!(keys[2].title, "Breaking Glass");
    // Duplicate keys receive the same item.
    assert_eq!(keys[3], keys[0]);
    // Missing items are left as given.
    assert_eq!(keys[1], track("Low", 9, ""));
}

#[tokio::test]
async fn test_get_across_tables_with_consistency() {
    let mock = store();
    mock.insert("tracks", track("Low", 1, "Speed of Life"));
    mock.insert("albums", album("Low", 1977));
    let client = Client::new(mock.clone());

    let mut tracks = vec![track("Low", 1, "")];
    let mut albums = vec![album("Low", 0)];
    client
        .batch_get("tracks", &mut tracks)
        .get("albums", &mut albums)
        .consistent()
        .run()
        .await
        .unwrap();

    assert_eq!(tracks[0].title, "Speed of Life");
    assert_eq!(albums[0].year, 1977);

    let gets: Vec<_> = mock
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::BatchGet(g) => Some(g),
            _ => None,
        })
        .collect();
    assert_eq!(gets.len(), 1);
    assert!(gets[0].request_items.values().all(|k| k.consistent_read));
}

#[tokio::test]
async fn test_get_retries_unprocessed_keys() {
    let mock = store();
    mock.insert("albums", album("Low", 1977));
    mock.leave_unprocessed(1);
    let client = Client::with_config(mock.clone(), fast_config());

    let mut albums = vec![album("Low", 0)];
    client.batch_get("albums", &mut albums).run().await.unwrap();
    assert_eq!(albums[0].year, 1977);
}

#[tokio::test]
async fn test_get_never_processed_is_not_found() {
    let mock = store();
    mock.insert("albums", album("Low", 1977));
    mock.stick_table("albums");
    let client = Client::with_config(mock, fast_config());

    let mut albums = vec![album("Low", 0)];
    let err = client
        .batch_get("albums", &mut albums)
        .run()
        .await
        .unwrap_err();
    assert_eq!(batch_error(err).get("albums", 0), Some(&ItemError::NotFound));
}
