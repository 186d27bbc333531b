//! Concurrency and volume tests.

use crossbeam_channel::unbounded;
use durable_pubsub::{
    MessageId, PubSub, PubSubConfig, RetentionPolicy, RetentionStore, Sequence, SqliteStore,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_config() -> PubSubConfig {
    PubSubConfig {
        retention: RetentionPolicy::KeepAll,
        reconnect_base_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn sequences(store: &dyn RetentionStore, stream: &str) -> Vec<u64> {
    store
        .replay_after(&[stream], MessageId(0))
        .unwrap()
        .into_iter()
        .map(|m| m.sequence.0)
        .collect()
}

#[test]
fn test_concurrent_publishers_get_gapless_sequences() {
    let pubsub = Arc::new(PubSub::open(test_config()).unwrap());
    let threads = 8;
    let per_thread = 50;

    thread::scope(|s| {
        for t in 0..threads {
            let pubsub = Arc::clone(&pubsub);
            s.spawn(move || {
                for i in 0..per_thread {
                    pubsub.publish("shared", &format!("{t}-{i}")).unwrap();
                }
            });
        }
    });

    let replay = pubsub.replay_after(&["shared"], MessageId(0)).unwrap();
    let seqs: Vec<u64> = replay.iter().map(|m| m.sequence.0).collect();
    let expected: Vec<u64> = (1..=(threads * per_thread) as u64).collect();
    assert_eq!(seqs, expected);
}

#[test]
fn test_concurrent_appends_across_connections() {
    // Separate stores on one file contend through SQLite locking.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pubsub.db");
    SqliteStore::open(&path).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            let path = path.clone();
            s.spawn(move || {
                let store = SqliteStore::open(&path).unwrap();
                for i in 0..25 {
                    store.append("contended", &i.to_string()).unwrap();
                }
            });
        }
    });

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(sequences(&store, "contended"), (1..=100).collect::<Vec<_>>());
}

#[test]
fn test_many_streams_stay_independent() {
    let pubsub = Arc::new(PubSub::open(test_config()).unwrap());
    let streams: Vec<String> = (0..16).map(|i| format!("stream-{i}")).collect();

    thread::scope(|s| {
        for name in &streams {
            let pubsub = Arc::clone(&pubsub);
            s.spawn(move || {
                for i in 0..20 {
                    let message = pubsub.publish(name, &i.to_string()).unwrap();
                    assert_eq!(message.sequence, Sequence(i + 1));
                }
            });
        }
    });

    for name in &streams {
        let stream = pubsub.stream(name).unwrap().unwrap();
        assert_eq!(stream.sequence, Sequence(20));
        assert_eq!(stream.message_count, 20);
    }
}

#[test]
fn test_fanout_to_many_subscribers() {
    let pubsub = PubSub::open(test_config()).unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let subscribers = 50;
    let messages = 20;

    for _ in 0..subscribers {
        let received = Arc::clone(&received);
        pubsub
            .subscribe_stream("fanout", move |_| {
                received.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    for i in 0..messages {
        pubsub.publish("fanout", &i.to_string()).unwrap();
    }

    let expected = subscribers * messages;
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.load(Ordering::SeqCst) < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received.load(Ordering::SeqCst), expected);
}

#[test]
fn test_live_order_matches_publish_order() {
    let pubsub = PubSub::open(test_config()).unwrap();
    let (tx, rx) = unbounded();
    pubsub
        .subscribe_stream("ordered", move |event| {
            let _ = tx.send(event.sequence.0);
        })
        .unwrap();

    for i in 0..500 {
        pubsub.publish("ordered", &i.to_string()).unwrap();
    }

    let got: Vec<u64> = (0..500)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(got, (1..=500).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_publishers_preserve_live_order() {
    let pubsub = Arc::new(PubSub::open(test_config()).unwrap());
    let (tx, rx) = unbounded();
    pubsub
        .subscribe_stream("shared", move |event| {
            let _ = tx.send(event.sequence.0);
        })
        .unwrap();

    let threads = 8;
    let per_thread = 200;
    thread::scope(|s| {
        for t in 0..threads {
            let pubsub = Arc::clone(&pubsub);
            s.spawn(move || {
                for i in 0..per_thread {
                    pubsub.publish("shared", &format!("{t}-{i}")).unwrap();
                }
            });
        }
    });

    let got: Vec<u64> = (0..threads * per_thread)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert!(got.windows(2).all(|w| w[0] < w[1]), "live events out of order");
    assert_eq!(got.len(), threads * per_thread);
}

#[test]
fn test_callbacks_can_reenter_engine() {
    let pubsub = Arc::new(PubSub::open(test_config()).unwrap());
    let (relayed_tx, relayed_rx) = unbounded();
    let (late_tx, late_rx) = unbounded();

    let relay_sink = relayed_tx.clone();
    pubsub
        .subscribe_stream("relay", move |event| {
            let _ = relay_sink.send(event.data);
        })
        .unwrap();

    let weak: Weak<PubSub> = Arc::downgrade(&pubsub);
    pubsub
        .subscribe_stream("trigger", move |event| {
            let Some(pubsub) = weak.upgrade() else {
                return;
            };
            let data = event.data.unwrap_or_default();
            pubsub.publish("relay", &format!("relayed {data}")).unwrap();

            let late = late_tx.clone();
            let _ = pubsub.subscribe_stream("late", move |event| {
                let _ = late.send(event.data);
            });
        })
        .unwrap();

    pubsub.publish("trigger", "one").unwrap();
    assert_eq!(
        relayed_rx.recv_timeout(Duration::from_secs(2)).unwrap().as_deref(),
        Some("relayed one")
    );

    pubsub.publish("late", "hello").unwrap();
    assert_eq!(
        late_rx.recv_timeout(Duration::from_secs(2)).unwrap().as_deref(),
        Some("hello")
    );
}

#[test]
fn test_shutdown_while_callback_publishes() {
    let pubsub = Arc::new(PubSub::open(test_config()).unwrap());
    let (entered_tx, entered_rx) = unbounded();
    let (published_tx, published_rx) = unbounded();

    let weak = Arc::downgrade(&pubsub);
    pubsub
        .subscribe_stream("trigger", move |_| {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(200));
            if let Some(pubsub) = weak.upgrade() {
                let _ = published_tx.send(pubsub.publish("relay", "during shutdown").is_ok());
            }
        })
        .unwrap();

    pubsub.publish("trigger", "go").unwrap();
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let (stopped_tx, stopped_rx) = unbounded();
    let stopper = Arc::clone(&pubsub);
    thread::spawn(move || {
        stopper.shutdown();
        let _ = stopped_tx.send(());
    });

    assert!(stopped_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    // The message is stored even though the dispatcher is going away.
    assert!(published_rx.recv_timeout(Duration::from_secs(2)).unwrap());
    assert_eq!(
        pubsub.stream("relay").unwrap().unwrap().sequence,
        Sequence(1)
    );
}

#[test]
fn test_bounded_retention_under_load() {
    let pubsub = PubSub::open(PubSubConfig {
        retention: RetentionPolicy::KeepCount(10),
        ..test_config()
    })
    .unwrap();

    for i in 0..200 {
        pubsub.publish("bounded", &i.to_string()).unwrap();
    }
    pubsub.cleanup("bounded").unwrap();

    let left = pubsub.replay_after(&["bounded"], MessageId(0)).unwrap();
    let seqs: Vec<u64> = left.iter().map(|m| m.sequence.0).collect();
    assert_eq!(seqs, (191..=200).collect::<Vec<_>>());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_sequences_are_dense_per_stream(ops in prop::collection::vec(0usize..3, 1..60)) {
        let store = SqliteStore::open_in_memory().unwrap();
        let names = ["a", "b", "c"];
        let mut counts = [0u64; 3];

        for op in &ops {
            let appended = store.append(names[*op], "x").unwrap();
            counts[*op] += 1;
            prop_assert_eq!(appended.message.sequence, Sequence(counts[*op]));
        }

        for (name, count) in names.iter().zip(counts) {
            prop_assert_eq!(sequences(&store, name), (1..=count).collect::<Vec<_>>());
        }
    }

    #[test]
    fn prop_trim_keeps_newest(total in 1u64..40, keep in 0u64..45) {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..total {
            store.append("s", &i.to_string()).unwrap();
        }

        let stats = store.trim("s", keep).unwrap();
        let kept = keep.min(total);
        prop_assert_eq!(stats.deleted, total - kept);
        prop_assert_eq!(stats.remaining, kept);
        prop_assert_eq!(stats.stream_deleted, kept == 0);
        prop_assert_eq!(
            sequences(&store, "s"),
            ((total - kept + 1)..=total).collect::<Vec<_>>()
        );
    }
}
