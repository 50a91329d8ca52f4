//! At-least-once delivery, durability and flow control over the SQLite broker

mod common;

use common::*;
use loanq_core::port::time_provider::SystemTimeProvider;
use loanq_core::port::BrokerConnector;
use loanq_infra_sqlite::{create_pool, run_migrations, SqliteRecovery, DEFAULT_DELIVERY_LEASE};
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_unacked_delivery_is_redelivered_after_channel_close() {
    let url = temp_queue_url("redeliver");
    let producer = connected_producer(&url).await;
    assert!(producer.submit(&request(1, dec!(30000), 12)).await);
    producer.close().await;

    // A consumer takes the message and goes away without settling it
    let crashed = connector().connect(&url).await.unwrap();
    let mut stream = crashed.consume(QUEUE).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.redelivered);
    crashed.close().await.unwrap();
    drop(first);

    let consumer = RunningConsumer::start(&url, Duration::ZERO).await;
    let sink = consumer.sink.clone();
    eventually("redelivered decision", || sink.decisions().len() == 1).await;
    drained(&url).await;
    let consumer_stats = consumer.stop().await;

    assert_eq!(consumer_stats.acked, 1);
    assert_eq!(sink.decisions()[0].request.id, 1);
}

#[tokio::test]
async fn test_orphaned_delivery_returns_after_quick_restart() {
    let url = temp_queue_url("orphan");
    let producer = connected_producer(&url).await;
    assert!(producer.submit(&request(5, dec!(10000), 12)).await);
    producer.close().await;

    // Crash: the channel is dropped without close, its row stays unacked
    {
        let crashed = connector().connect(&url).await.unwrap();
        let mut stream = crashed.consume(QUEUE).await.unwrap();
        let _delivery = stream.next().await.unwrap().unwrap();
    }
    assert_eq!(stats(&url).await.unacked, 1);

    // Restart right away with default settings: startup recovery finds the
    // lease still fresh and leaves the row alone
    let pool = create_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let recovered = SqliteRecovery::new(pool.clone(), Arc::new(SystemTimeProvider), None)
        .recover_orphaned_deliveries()
        .await
        .unwrap();
    pool.close().await;
    assert_eq!(recovered, 0);

    // The running consumer picks it up once the lease runs out
    let consumer = RunningConsumer::start(&url, Duration::ZERO).await;
    let sink = consumer.sink.clone();
    eventually_within(
        "decision after lease expiry",
        DEFAULT_DELIVERY_LEASE * 2,
        || sink.decisions().len() == 1,
    )
    .await;
    drained(&url).await;
    let consumer_stats = consumer.stop().await;

    assert_eq!(consumer_stats.acked, 1);
    assert_eq!(sink.decisions()[0].request.id, 5);
}

#[tokio::test]
async fn test_messages_survive_broker_reopen() {
    let url = temp_queue_url("durable");
    {
        let producer = connected_producer(&url).await;
        for id in 1..=2 {
            assert!(producer.submit(&request(id, dec!(60000), 24)).await);
        }
        producer.close().await;
    }
    assert_eq!(stats(&url).await.ready, 2);

    // Nothing shared with the producer but the database file
    let consumer = RunningConsumer::start(&url, Duration::ZERO).await;
    let sink = consumer.sink.clone();
    eventually("both decisions", || sink.decisions().len() == 2).await;
    consumer.stop().await;

    assert!(sink.decisions().iter().all(|d| !d.is_approved()));
}

#[tokio::test]
async fn test_prefetch_one_keeps_a_single_message_in_flight() {
    let url = temp_queue_url("backpressure");
    let producer = connected_producer(&url).await;
    for id in 1..=4 {
        assert!(producer.submit(&request(id, dec!(1000), 12)).await);
    }

    let consumer = RunningConsumer::start(&url, Duration::from_millis(100)).await;
    let mut max_in_flight = 0;
    loop {
        let s = stats(&url).await;
        max_in_flight = max_in_flight.max(s.unacked);
        if s.ready == 0 && s.unacked == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    let consumer_stats = consumer.stop().await;
    producer.close().await;

    assert_eq!(consumer_stats.acked, 4);
    assert_eq!(max_in_flight, 1);
}

#[tokio::test]
async fn test_competing_consumers_process_each_message_once() {
    let url = temp_queue_url("competing");
    let first = RunningConsumer::start(&url, Duration::from_millis(20)).await;
    let second = RunningConsumer::start(&url, Duration::from_millis(20)).await;

    let producer = connected_producer(&url).await;
    for id in 1..=10 {
        assert!(producer.submit(&request(id, dec!(1000), 12)).await);
    }
    drained(&url).await;

    let a = first.sink.clone();
    let b = second.sink.clone();
    let stats_a = first.stop().await;
    let stats_b = second.stop().await;
    producer.close().await;

    let ids: Vec<i64> = a
        .decisions()
        .iter()
        .chain(b.decisions().iter())
        .map(|d| d.request.id)
        .collect();
    let unique: HashSet<i64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 10);
    assert_eq!(unique.len(), 10);
    assert_eq!(stats_a.acked + stats_b.acked, 10);
}

#[tokio::test]
async fn test_in_flight_message_finishes_before_shutdown() {
    let url = temp_queue_url("shutdown");
    let producer = connected_producer(&url).await;
    let consumer = RunningConsumer::start(&url, Duration::from_millis(300)).await;
    assert!(producer.submit(&request(9, dec!(1000), 12)).await);

    for _ in 0..200 {
        if stats(&url).await.unacked == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let sink = consumer.sink.clone();
    assert!(sink.decisions().is_empty());

    let consumer_stats = consumer.stop().await;
    producer.close().await;

    assert_eq!(consumer_stats.acked, 1);
    assert_eq!(sink.decisions().len(), 1);
    assert_eq!(stats(&url).await, Default::default());
}
