//! Integration tests for the delivery pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stream_relay::{
    ConsumerId, EventFilter, LivenessCheck, Liveness, ManualClock, MemoryQueue,
    MemoryQueueWriter, MemorySnapshotStore, NotifyError, PollingAgent, ProducerId,
    ProducerNotifier, QueueMessage, QueueReceiver, RateChange, ReceiverConfig, SequenceToken,
    StreamId, SubscriptionFilter, SubscriptionId, SubscriptionRegistry, SubscriptionState,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn pipeline(config: ReceiverConfig) -> (QueueReceiver, MemoryQueueWriter, Arc<ManualClock>) {
    let (queue, writer) = MemoryQueue::new();
    let clock = Arc::new(ManualClock::new());
    let receiver = QueueReceiver::with_clock(&config, Box::new(queue), clock.clone()).unwrap();
    (receiver, writer, clock)
}

fn send(writer: &MemoryQueueWriter, stream: &StreamId, values: &[u64]) {
    for value in values {
        writer
            .send(QueueMessage::encode(stream.clone(), &[*value]).unwrap())
            .unwrap();
    }
}

// --- Delivery ---

#[test]
fn test_two_streams_delivered_in_order() {
    init_tracing();
    let (mut receiver, writer, _clock) = pipeline(ReceiverConfig::default());
    let orders = StreamId::new("shop", "orders");
    let audit = StreamId::new("shop", "audit");

    let mut orders_cursor = receiver.create_cursor(orders.clone(), Some(SequenceToken::new(1, 0)), None);
    let mut audit_cursor = receiver.create_cursor(audit.clone(), Some(SequenceToken::new(1, 0)), None);

    writer
        .send(QueueMessage::encode(orders.clone(), &["created", "paid"]).unwrap())
        .unwrap();
    writer
        .send(QueueMessage::encode(audit.clone(), &["login"]).unwrap())
        .unwrap();
    writer
        .send(QueueMessage::encode(orders.clone(), &["shipped"]).unwrap())
        .unwrap();
    let report = receiver.poll();
    assert_eq!(report.received, 3);

    let mut delivered = Vec::new();
    while orders_cursor.move_next().unwrap() {
        let batch = orders_cursor.current().unwrap();
        for event in batch.events::<String>() {
            delivered.push(event.unwrap());
        }
    }
    assert_eq!(
        delivered,
        vec![
            ("created".to_string(), SequenceToken::new(1, 0)),
            ("paid".to_string(), SequenceToken::new(1, 1)),
            ("shipped".to_string(), SequenceToken::new(3, 0)),
        ]
    );

    assert!(audit_cursor.move_next().unwrap());
    let batch = audit_cursor.current().unwrap();
    assert_eq!(batch.token(), SequenceToken::new(2, 0));
    assert_eq!(batch.stream(), &audit);
    assert!(!audit_cursor.move_next().unwrap());
}

#[test]
fn test_cursor_waits_for_future_token() {
    let (mut receiver, writer, _clock) = pipeline(ReceiverConfig::default());
    let stream = StreamId::bare("s");

    let mut cursor = receiver.create_cursor(stream.clone(), Some(SequenceToken::new(3, 0)), None);
    assert!(!cursor.move_next().unwrap());

    send(&writer, &stream, &[10, 20]);
    receiver.poll();
    assert!(!cursor.move_next().unwrap());

    send(&writer, &stream, &[30]);
    receiver.poll();
    assert!(cursor.move_next().unwrap());
    assert_eq!(cursor.current().unwrap().token(), SequenceToken::new(3, 0));
    assert_eq!(cursor.last_delivered(), Some(SequenceToken::new(3, 0)));
}

#[test]
fn test_request_context_filter() {
    let (mut receiver, writer, _clock) = pipeline(ReceiverConfig::default());
    let stream = StreamId::new("tenants", "events");

    let filter: Arc<dyn EventFilter> =
        Arc::new(SubscriptionFilter::request_context("tenant", "acme"));
    let mut cursor = receiver.create_cursor(
        stream.clone(),
        Some(SequenceToken::new(1, 0)),
        Some(filter),
    );

    for tenant in ["globex", "acme", "initech", "acme"] {
        let mut context = HashMap::new();
        context.insert("tenant".to_string(), tenant.to_string());
        writer
            .send(
                QueueMessage::encode(stream.clone(), &[tenant])
                    .unwrap()
                    .with_request_context(context),
            )
            .unwrap();
    }
    receiver.poll();

    let mut tokens = Vec::new();
    while cursor.move_next().unwrap() {
        tokens.push(cursor.current().unwrap().token().sequence_number);
    }
    assert_eq!(tokens, vec![2, 4]);
}

// --- Eviction ---

fn small_cache_config() -> ReceiverConfig {
    // Each single-u64 batch is charged 65 bytes, so four fit.
    ReceiverConfig {
        cache_size_bytes: 300,
        data_min_time_in_cache: Duration::ZERO,
        data_max_age_in_cache: Duration::from_secs(60),
        ..ReceiverConfig::default()
    }
}

#[test]
fn test_lagging_cursor_detects_eviction() {
    init_tracing();
    let (mut receiver, writer, _clock) = pipeline(small_cache_config());
    let stream = StreamId::bare("s");
    let mut cursor = receiver.create_cursor(stream.clone(), Some(SequenceToken::new(1, 0)), None);

    send(&writer, &stream, &[1]);
    receiver.poll();
    assert!(cursor.move_next().unwrap());

    send(&writer, &stream, &[2, 3, 4, 5, 6, 7, 8, 9]);
    let report = receiver.poll();
    assert_eq!(report.received, 8);
    assert_eq!(report.evicted, 5);
    assert!(receiver.cache().size_bytes() <= 300);

    let err = cursor.move_next().unwrap_err();
    assert!(err.is_position_not_in_cache());
    match err {
        stream_relay::StreamError::PositionNotInCache { requested, oldest } => {
            assert_eq!(requested, Some(SequenceToken::new(2, 0)));
            assert_eq!(oldest, Some(SequenceToken::new(6, 0)));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Resubscribing from the oldest retained position works
    let oldest = receiver.cache().oldest_token().unwrap();
    let mut cursor = receiver.create_cursor(stream, Some(oldest), None);
    let mut seen = Vec::new();
    while cursor.move_next().unwrap() {
        seen.push(cursor.current().unwrap().token().sequence_number);
    }
    assert_eq!(seen, vec![6, 7, 8, 9]);
}

#[test]
fn test_new_cursor_on_evicted_token_fails_on_first_move() {
    let (mut receiver, writer, _clock) = pipeline(small_cache_config());
    let stream = StreamId::bare("s");
    send(&writer, &stream, &[1, 2, 3, 4, 5, 6]);
    receiver.poll();

    let mut cursor = receiver.create_cursor(stream, Some(SequenceToken::new(1, 0)), None);
    assert!(cursor.move_next().unwrap_err().is_position_not_in_cache());
}

#[test]
fn test_idle_cache_ages_out() {
    let (mut receiver, writer, clock) = pipeline(small_cache_config());
    let stream = StreamId::bare("s");
    send(&writer, &stream, &[1, 2]);
    receiver.poll();
    assert_eq!(receiver.cache().len(), 2);

    clock.advance(Duration::from_secs(61));
    let report = receiver.poll();
    assert_eq!(report.evicted, 2);
    assert!(receiver.cache().is_empty());
}

#[test]
fn test_min_time_protects_recent_data() {
    let config = ReceiverConfig {
        data_min_time_in_cache: Duration::from_secs(10),
        ..small_cache_config()
    };
    let (mut receiver, writer, clock) = pipeline(config);
    let stream = StreamId::bare("s");

    send(&writer, &stream, &[1, 2, 3, 4, 5, 6]);
    receiver.poll();
    // Over budget, but nothing is old enough to go
    assert_eq!(receiver.cache().len(), 6);

    clock.advance(Duration::from_secs(10));
    receiver.poll();
    assert_eq!(receiver.cache().len(), 4);
    assert_eq!(receiver.cache().oldest_token(), Some(SequenceToken::new(3, 0)));
}

// --- Backpressure ---

#[test]
fn test_slow_reader_slows_the_pull_rate() {
    let config = ReceiverConfig {
        target_batches_per_second: 12,
        cache_size_bytes: 1000,
        backpressure_window_size: Some(2),
        backpressure_low_threshold: 0.1,
        backpressure_high_threshold: 0.5,
        ..ReceiverConfig::default()
    };
    let (mut receiver, writer, _clock) = pipeline(config);
    let stream = StreamId::bare("s");

    send(&writer, &stream, &(0..12).collect::<Vec<_>>());
    receiver.poll();
    assert_eq!(receiver.cache().size_bytes(), 12 * 65);

    // Two reads at the head of a mostly full cache fill one window
    let mut cursor = receiver.create_cursor(stream, Some(SequenceToken::new(1, 0)), None);
    assert!(cursor.move_next().unwrap());
    assert!(receiver.cache().cursor_pressure(&cursor) > 0.5);
    assert!(cursor.move_next().unwrap());

    let report = receiver.poll();
    assert_eq!(report.rate_change, Some(RateChange::Decreased));
    assert_eq!(receiver.target_rate(), 11);
}

// --- Polling agent ---

#[test]
fn test_agent_feeds_concurrent_subscribers() {
    init_tracing();
    let (queue, writer) = MemoryQueue::new();
    let receiver = QueueReceiver::new(&ReceiverConfig::default(), Box::new(queue)).unwrap();
    let agent = PollingAgent::spawn(receiver, Duration::from_millis(5)).unwrap();
    let stream = StreamId::new("ns", "feed");

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let mut cursor =
                agent.create_cursor(stream.clone(), Some(SequenceToken::new(1, 0)), None);
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(10);
                let mut values = Vec::new();
                while values.len() < 40 && Instant::now() < deadline {
                    if cursor.move_next().unwrap() {
                        for event in cursor.current().unwrap().events::<u64>() {
                            values.push(event.unwrap().0);
                        }
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                values
            })
        })
        .collect();

    send(&writer, &stream, &(0..40).collect::<Vec<_>>());

    for reader in readers {
        assert_eq!(reader.join().unwrap(), (0..40).collect::<Vec<u64>>());
    }
    let receiver = agent.shutdown().unwrap();
    assert_eq!(receiver.next_sequence_number(), 41);
}

// --- Rendezvous feeding delivery ---

#[derive(Default)]
struct Producers {
    subscribers: parking_lot::Mutex<Vec<SubscriptionState>>,
}

impl ProducerNotifier for Producers {
    fn add_subscriber(
        &self,
        _producer: &ProducerId,
        subscription: &SubscriptionState,
    ) -> Result<(), NotifyError> {
        self.subscribers.lock().push(subscription.clone());
        Ok(())
    }

    fn remove_subscriber(
        &self,
        _producer: &ProducerId,
        _stream: &StreamId,
        subscription: SubscriptionId,
    ) -> Result<(), NotifyError> {
        self.subscribers
            .lock()
            .retain(|s| s.subscription_id != subscription);
        Ok(())
    }
}

#[test]
fn test_registered_filter_drives_delivery() {
    let store = Arc::new(MemorySnapshotStore::new());
    let producers = Arc::new(Producers::default());
    let liveness: Arc<dyn LivenessCheck> = Arc::new(|_: &ProducerId| Liveness::Active);
    let registry = SubscriptionRegistry::new(store, producers.clone(), liveness);
    let stream = StreamId::new("metrics", "cpu");

    registry
        .register_producer(&stream, &ProducerId("collector".into()))
        .unwrap();
    registry
        .register_consumer(
            &stream,
            SubscriptionId(1),
            &ConsumerId("dashboard".into()),
            Some(SubscriptionFilter::MinEvents { count: 2 }),
        )
        .unwrap();

    let subscription = producers.subscribers.lock()[0].clone();
    let filter: Arc<dyn EventFilter> = Arc::new(subscription.filter.unwrap());

    let (mut receiver, writer, _clock) = pipeline(ReceiverConfig::default());
    let mut cursor = receiver.create_cursor(stream.clone(), None, Some(filter));
    writer
        .send(QueueMessage::encode(stream.clone(), &[1u64]).unwrap())
        .unwrap();
    writer
        .send(QueueMessage::encode(stream.clone(), &[2u64, 3]).unwrap())
        .unwrap();
    receiver.poll();

    assert!(cursor.move_next().unwrap());
    assert_eq!(cursor.current().unwrap().event_count(), 2);
    assert!(!cursor.move_next().unwrap());

    registry.unregister_consumer(&stream, SubscriptionId(1)).unwrap();
    assert!(producers.subscribers.lock().is_empty());
}
