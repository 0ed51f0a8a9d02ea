mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use offset_consumer::handler::{MessageHandlerBatchFn, MessageHandlerFn};
use offset_consumer::offset_manager::{
    GroupOffsetManager, OffsetManager, StoreOffsetManager, DEFAULT_METADATA,
};
use offset_consumer::offset_store::KvOffsetStore;
use offset_consumer::offsets::high_water_mark;
use offset_consumer::run::Fire;
use offset_consumer::store::MemoryDb;
use offset_consumer::{
    BatchSize, Consumer, Group, HighWaterMarkConsumer, Message, Offset, OffsetConsumer, Partition,
    Topic,
};
use rstest::rstest;
use tokio_util::sync::CancellationToken;

use common::{broker_with_topic, produce_n, wait_for_next_offset, TIMEOUT};

/// Counts fires and stops the consumer on the first one.
struct CountingFire {
    fired: AtomicUsize,
    stop: CancellationToken,
}

impl Fire for CountingFire {
    fn fire(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
    }
}

#[rstest]
#[case::single_messages(1)]
#[case::batches(3)]
#[tokio::test]
async fn test_drain_fires_once_when_caught_up(#[case] batch_size: usize) {
    let topic = Topic::from("orders");
    let broker = broker_with_topic(&topic, 3);
    // partition 0 is already consumed, partition 1 is empty
    produce_n(&broker, &topic, 0, 3);
    produce_n(&broker, &topic, 2, 4);

    let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
    let manager: Arc<dyn OffsetManager> =
        Arc::new(StoreOffsetManager::new(Arc::new(store), Offset::OLDEST));
    manager
        .mark_offset(&topic, Partition::new(0), Offset::new(3))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let stop = CancellationToken::new();
    let trigger = Arc::new(CountingFire {
        fired: AtomicUsize::new(0),
        stop: stop.clone(),
    });
    let consumer = HighWaterMarkConsumer::new(
        broker.clone(),
        topic.clone(),
        manager.clone(),
        Arc::new(MessageHandlerBatchFn::new(move |msgs: &[Message]| {
            let mut seen = recorder.lock().unwrap();
            seen.extend(msgs.iter().map(|msg| (msg.partition.as_i32(), msg.offset.as_i64())));
            Ok(())
        })),
        BatchSize::new(batch_size).unwrap(),
        trigger.clone(),
    );

    tokio::time::timeout(TIMEOUT, consumer.consume(&stop))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(trigger.fired.load(Ordering::SeqCst), 1);
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![(2, 0), (2, 1), (2, 2), (2, 3)]);
    assert_eq!(
        manager.next_offset(&topic, Partition::new(2)).await.unwrap(),
        Offset::new(4)
    );
}

#[tokio::test]
async fn test_drain_ignores_messages_produced_after_start() {
    let topic = Topic::from("orders");
    let broker = broker_with_topic(&topic, 1);
    produce_n(&broker, &topic, 0, 2);

    let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
    let manager: Arc<dyn OffsetManager> =
        Arc::new(StoreOffsetManager::new(Arc::new(store), Offset::OLDEST));
    let stop = CancellationToken::new();
    let trigger = Arc::new(CountingFire {
        fired: AtomicUsize::new(0),
        stop: stop.clone(),
    });
    let producer = broker.clone();
    let late_topic = topic.clone();
    let consumer = HighWaterMarkConsumer::new(
        broker.clone(),
        topic.clone(),
        manager.clone(),
        Arc::new(MessageHandlerBatchFn::new(move |msgs: &[Message]| {
            if msgs[0].offset == Offset::new(0) {
                producer.produce(&late_topic, Partition::new(0), "late", "v")?;
            }
            Ok(())
        })),
        BatchSize::default(),
        trigger.clone(),
    );

    tokio::time::timeout(TIMEOUT, consumer.consume(&stop))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trigger.fired.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.next_offset(&topic, Partition::new(0)).await.unwrap(),
        Offset::new(2)
    );
    assert_eq!(
        high_water_mark(broker.as_ref(), &topic, Partition::new(0))
            .await
            .unwrap(),
        Offset::new(3)
    );
}

#[tokio::test]
async fn test_group_manager_commits_with_metadata() {
    let topic = Topic::from("orders");
    let group = Group::from("sync");
    let broker = broker_with_topic(&topic, 2);
    produce_n(&broker, &topic, 0, 3);
    produce_n(&broker, &topic, 1, 1);

    let manager = Arc::new(GroupOffsetManager::new(
        broker.clone(),
        group.clone(),
        Offset::OLDEST,
    ));
    let consumer = OffsetConsumer::new(
        broker.clone(),
        topic.clone(),
        manager.clone(),
        Arc::new(MessageHandlerFn::new(|_: &Message| Ok(()))),
    );

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.consume(&cancel).await })
    };
    wait_for_next_offset(manager.as_ref(), &topic, 0, 3).await;
    wait_for_next_offset(manager.as_ref(), &topic, 1, 1).await;
    cancel.cancel();
    run.await.unwrap().unwrap();
    manager.close().await.unwrap();

    assert_eq!(
        broker.committed(&group, &topic, Partition::new(0)),
        Some((Offset::new(3), DEFAULT_METADATA.to_string()))
    );

    let restarted = GroupOffsetManager::new(broker.clone(), group, Offset::OLDEST);
    assert_eq!(
        restarted.next_offset(&topic, Partition::new(1)).await.unwrap(),
        Offset::new(1)
    );
    restarted.close().await.unwrap();
}

#[tokio::test]
async fn test_foreign_group_commit_starts_at_initial_offset() {
    let topic = Topic::from("orders");
    let group = Group::from("sync");
    let broker = broker_with_topic(&topic, 1);
    produce_n(&broker, &topic, 0, 5);
    broker
        .commit(&group, &topic, Partition::new(0), Offset::new(4), "someone-else")
        .unwrap();

    let manager = Arc::new(GroupOffsetManager::new(
        broker.clone(),
        group,
        Offset::OLDEST,
    ));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let consumer = OffsetConsumer::new(
        broker,
        topic.clone(),
        manager.clone(),
        Arc::new(MessageHandlerFn::new(move |msg: &Message| {
            recorder.lock().unwrap().push(msg.offset.as_i64());
            Ok(())
        })),
    );

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.consume(&cancel).await })
    };
    tokio::time::timeout(TIMEOUT, async {
        while seen.lock().unwrap().len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    run.await.unwrap().unwrap();
    manager.close().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}
