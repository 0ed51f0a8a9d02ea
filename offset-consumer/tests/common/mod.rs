#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use offset_consumer::broker::MemoryBroker;
use offset_consumer::offset_manager::OffsetManager;
use offset_consumer::{Offset, Partition, Topic};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn broker_with_topic(topic: &Topic, partitions: i32) -> Arc<MemoryBroker> {
    let broker = Arc::new(MemoryBroker::new());
    broker.create_topic(topic, partitions).unwrap();
    broker
}

/// Produces `count` messages `k{i}` => `v{i}` to one partition.
pub fn produce_n(broker: &MemoryBroker, topic: &Topic, partition: i32, count: usize) {
    for i in 0..count {
        broker
            .produce(topic, Partition::new(partition), format!("k{i}"), format!("v{i}"))
            .unwrap();
    }
}

pub async fn wait_for_next_offset(
    manager: &dyn OffsetManager,
    topic: &Topic,
    partition: i32,
    offset: i64,
) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let next = manager
                .next_offset(topic, Partition::new(partition))
                .await
                .unwrap();
            if next == Offset::new(offset) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("partition {partition} never reached offset {offset}"));
}
