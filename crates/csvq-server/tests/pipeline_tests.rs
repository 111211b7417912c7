//! Upload-to-store pipeline on the in-process broker.

mod common;

use common::{eventually, MemoryCache, MemoryStore, Pipeline, QUEUE};
use csvq_ingest::{decode_payload, DecodeError};
use csvq_server::broker::{BrokerChannel, InMemoryBroker, Settlement};
use csvq_server::consumer::Outcome;
use csvq_server::ingest::IngestError;
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ids(payloads: &[Vec<u8>]) -> Vec<String> {
    payloads
        .iter()
        .map(|p| {
            decode_payload(p)
                .unwrap()
                .record
                .get("id")
                .unwrap()
                .to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_upload_reaches_the_store() {
    let pipeline = Pipeline::standard().await;
    let upload = b"id,first_name,last_name\n1,Ann,Lee\n2,Bo,Kim";

    let summary = pipeline
        .publisher(4)
        .publish_upload(&upload[..])
        .await
        .unwrap();
    assert_eq!(summary.columns, 3);
    assert_eq!(summary.published, 2);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pipeline.consumer(1).run(shutdown.clone()));

    let store = &pipeline.store;
    eventually(|| async move { store.rows().await.len() == 2 }).await;

    let rows = pipeline.store.rows().await;
    assert_eq!(rows[0].id, "1");
    assert_eq!(rows[0].first_name.as_deref(), Some("Ann"));
    assert_eq!(rows[1].last_name.as_deref(), Some("Kim"));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_records_published_in_file_order() {
    let pipeline = Pipeline::standard().await;
    let mut upload = String::from("id,first_name\n");
    for id in 0..100 {
        upload.push_str(&format!("{id},name{id}\n"));
    }

    pipeline
        .publisher(7)
        .publish_upload(upload.as_bytes())
        .await
        .unwrap();

    let expected: Vec<String> = (0..100).map(|id| id.to_string()).collect();
    assert_eq!(ids(&pipeline.broker.published(QUEUE).await), expected);
}

#[tokio::test]
async fn test_publish_failure_stops_the_upload() {
    let pipeline = Pipeline::new(
        InMemoryBroker::failing_publish_on(2),
        MemoryStore::new(),
        MemoryCache::new(),
    )
    .await;
    let upload = b"id,first_name\n1,Ann\n2,Bo\n3,Cy\n";

    let err = pipeline
        .publisher(8)
        .publish_upload(&upload[..])
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Publish { published: 1, .. }));
    assert!(!err.is_malformed_input());
    assert_eq!(ids(&pipeline.broker.published(QUEUE).await), vec!["1"]);
}

#[tokio::test]
async fn test_short_line_aborts_after_earlier_records() {
    let pipeline = Pipeline::standard().await;
    let upload = b"id,first_name,last_name\n1,Ann,Lee\n3,Cy,\n4,Di,Wu\n";

    let err = pipeline
        .publisher(5)
        .publish_upload(&upload[..])
        .await
        .unwrap_err();

    assert!(err.is_malformed_input());
    assert!(matches!(
        err,
        IngestError::Decode {
            published: 1,
            source: DecodeError::MalformedRecord {
                line: 3,
                expected: 3,
                found: 2
            }
        }
    ));
    assert_eq!(pipeline.broker.published(QUEUE).await.len(), 1);
}

#[tokio::test]
async fn test_delivery_is_coerced_cached_and_acked() {
    let pipeline = Pipeline::standard().await;
    let payload = br#"{"id":"7","created_at":"-1","deleted_at":"1700000000000"}"#;
    pipeline.broker.publish(QUEUE, payload).await.unwrap();

    let consumer = pipeline.consumer(1);
    let mut stream = pipeline.broker.consume(QUEUE).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();

    assert_eq!(consumer.process_delivery(delivery).await.unwrap(), Outcome::Acked);

    let rows = pipeline.store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].created_at, None);
    assert_eq!(
        rows[0].deleted_at.map(|ts| ts.to_string()),
        Some("2023-11-14 22:13:20".to_string())
    );

    let (cached, ttl) = pipeline.cache.get("7").await.unwrap();
    assert_eq!(cached.as_bytes(), payload);
    assert_eq!(ttl, Duration::from_secs(3600));

    assert_eq!(
        pipeline.broker.settlements().await,
        vec![Settlement::Ack { delivery_tag: 1 }]
    );
}

#[tokio::test]
async fn test_failed_insert_is_never_acked() {
    let pipeline = Pipeline::new(
        InMemoryBroker::recording(),
        MemoryStore::failing_on(&["2"]),
        MemoryCache::new(),
    )
    .await;
    pipeline
        .publisher(64)
        .publish_upload(&b"id,first_name\n1,Ann\n2,Bo\n3,Cy\n"[..])
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pipeline.consumer(1).run(shutdown.clone()));

    let broker = &pipeline.broker;
    eventually(|| async move { broker.settlements().await.len() == 3 }).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(
        pipeline.broker.settlements().await,
        vec![
            Settlement::Ack { delivery_tag: 1 },
            Settlement::Nack {
                delivery_tag: 2,
                requeue: false
            },
            Settlement::Ack { delivery_tag: 3 },
        ]
    );
    let stored: Vec<String> = pipeline.store.rows().await.into_iter().map(|r| r.id).collect();
    assert_eq!(stored, vec!["1", "3"]);
    assert!(pipeline.cache.get("2").await.is_none());
}

#[tokio::test]
async fn test_cache_failure_still_acks() {
    let pipeline = Pipeline::new(InMemoryBroker::recording(), MemoryStore::new(), MemoryCache::down()).await;
    pipeline
        .broker
        .publish(QUEUE, br#""{\"id\":\"9\"}""#)
        .await
        .unwrap();

    let consumer = pipeline.consumer(1);
    let mut stream = pipeline.broker.consume(QUEUE).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();

    assert_eq!(consumer.process_delivery(delivery).await.unwrap(), Outcome::Acked);
    assert_eq!(pipeline.store.rows().await.len(), 1);
}

#[tokio::test]
async fn test_unusable_payloads_are_rejected_without_requeue() {
    let pipeline = Pipeline::standard().await;
    pipeline.broker.publish(QUEUE, b"not json").await.unwrap();
    pipeline
        .broker
        .publish(QUEUE, br#""{\"first_name\":\"NoId\"}""#)
        .await
        .unwrap();

    let consumer = pipeline.consumer(1);
    let mut stream = pipeline.broker.consume(QUEUE).await.unwrap();
    for _ in 0..2 {
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(consumer.process_delivery(delivery).await.unwrap(), Outcome::Rejected);
    }

    assert!(pipeline.store.rows().await.is_empty());
    assert!(pipeline
        .broker
        .settlements()
        .await
        .iter()
        .all(|s| matches!(s, Settlement::Nack { requeue: false, .. })));
}

#[tokio::test]
async fn test_last_write_wins() {
    let pipeline = Pipeline::standard().await;
    pipeline
        .publisher(64)
        .publish_upload(&b"id,first_name\n1,Ann\n1,Anna\n"[..])
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pipeline.consumer(1).run(shutdown.clone()));

    let broker = &pipeline.broker;
    eventually(|| async move { broker.settlements().await.len() == 2 }).await;
    shutdown.cancel();
    handle.await.unwrap();

    let rows = pipeline.store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].first_name.as_deref(), Some("Anna"));
}

#[tokio::test]
async fn test_worker_pool_settles_every_delivery() {
    let pipeline = Pipeline::standard().await;
    let mut upload = String::from("id\n");
    for id in 0..50 {
        upload.push_str(&format!("{id:03}\n"));
    }
    pipeline
        .publisher(32)
        .publish_upload(upload.as_bytes())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pipeline.consumer(4).run(shutdown.clone()));

    let store = &pipeline.store;
    eventually(|| async move { store.rows().await.len() == 50 }).await;
    shutdown.cancel();
    handle.await.unwrap();

    let settlements = pipeline.broker.settlements().await;
    assert_eq!(settlements.len(), 50);
    assert!(settlements
        .iter()
        .all(|s| matches!(s, Settlement::Ack { .. })));
}

#[tokio::test]
async fn test_consumer_resubscribes_after_stream_ends() {
    let pipeline = Pipeline::standard().await;
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pipeline.consumer(1).run(shutdown.clone()));

    pipeline.broker.publish(QUEUE, br#"{"id":"1"}"#).await.unwrap();
    let store = &pipeline.store;
    eventually(|| async move { store.rows().await.len() == 1 }).await;

    // Dropping the queue ends the subscription; a fresh declaration can be consumed again.
    pipeline.broker.delete_queue(QUEUE).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    pipeline.broker.declare_queue(QUEUE).await.unwrap();
    pipeline.broker.publish(QUEUE, br#"{"id":"2"}"#).await.unwrap();

    eventually(|| async move { store.rows().await.len() == 2 }).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
