use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::metrics_consts::*;
use crate::types::{Offset, Partition, Topic};

/// Offset gauges of the partition consumer loop.
pub trait MetricsConsumer: Send + Sync {
    fn current_offset(&self, topic: &Topic, partition: Partition, offset: Offset);
    fn high_water_mark_offset(&self, topic: &Topic, partition: Partition, offset: Offset);
    fn offset_fallback(&self, topic: &Topic, partition: Partition);
}

/// Outcome counters of the metrics handler decorators.
pub trait MetricsMessageHandler: Send + Sync {
    fn total_counter_inc(&self, topic: &Topic, partition: Partition);
    fn success_counter_inc(&self, topic: &Topic, partition: Partition);
    fn failure_counter_inc(&self, topic: &Topic, partition: Partition);
    fn duration_measure(&self, topic: &Topic, partition: Partition, duration: Duration);
}

pub trait MetricsSyncProducer: Send + Sync {
    fn total_counter_inc(&self, topic: &Topic);
    fn success_counter_inc(&self, topic: &Topic);
    fn failure_counter_inc(&self, topic: &Topic);
}

/// Metrics backed by the process-wide `metrics` recorder.
///
/// The binary installs the prometheus recorder once and hands the same
/// `KafkaMetrics` value to every constructor that reports.
#[derive(Debug, Clone, Default)]
pub struct KafkaMetrics {
    helper: MetricsHelper,
}

impl KafkaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a label reported with every metric, e.g. the service name.
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.helper = self.helper.with_label(key, value);
        self
    }

    fn partition(&self, topic: &Topic, partition: Partition) -> MetricsHelper {
        self.helper.clone().with_partition(topic, partition)
    }
}

impl MetricsConsumer for KafkaMetrics {
    fn current_offset(&self, topic: &Topic, partition: Partition, offset: Offset) {
        self.partition(topic, partition)
            .gauge(CONSUMER_CURRENT_OFFSET)
            .set(offset.as_i64() as f64);
    }

    fn high_water_mark_offset(&self, topic: &Topic, partition: Partition, offset: Offset) {
        self.partition(topic, partition)
            .gauge(CONSUMER_HIGH_WATER_MARK_OFFSET)
            .set(offset.as_i64() as f64);
    }

    fn offset_fallback(&self, topic: &Topic, partition: Partition) {
        self.partition(topic, partition)
            .counter(CONSUMER_OFFSET_FALLBACK)
            .increment(1);
    }
}

impl MetricsMessageHandler for KafkaMetrics {
    fn total_counter_inc(&self, topic: &Topic, partition: Partition) {
        self.partition(topic, partition)
            .counter(MESSAGE_HANDLER_TOTAL)
            .increment(1);
    }

    fn success_counter_inc(&self, topic: &Topic, partition: Partition) {
        self.partition(topic, partition)
            .counter(MESSAGE_HANDLER_SUCCESS)
            .increment(1);
    }

    fn failure_counter_inc(&self, topic: &Topic, partition: Partition) {
        self.partition(topic, partition)
            .counter(MESSAGE_HANDLER_FAILURE)
            .increment(1);
    }

    fn duration_measure(&self, topic: &Topic, partition: Partition, duration: Duration) {
        self.partition(topic, partition)
            .histogram(MESSAGE_HANDLER_DURATION)
            .record(duration.as_secs_f64());
    }
}

impl MetricsSyncProducer for KafkaMetrics {
    fn total_counter_inc(&self, topic: &Topic) {
        self.helper
            .counter(SYNC_PRODUCER_TOTAL)
            .with_label("topic", topic.as_str())
            .increment(1);
    }

    fn success_counter_inc(&self, topic: &Topic) {
        self.helper
            .counter(SYNC_PRODUCER_SUCCESS)
            .with_label("topic", topic.as_str())
            .increment(1);
    }

    fn failure_counter_inc(&self, topic: &Topic) {
        self.helper
            .counter(SYNC_PRODUCER_FAILURE)
            .with_label("topic", topic.as_str())
            .increment(1);
    }
}

/// Metrics kept in process, keyed by metric name, topic and partition.
///
/// Used where no recorder is installed, e.g. in tests that assert on what a
/// decorator reported.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    values: Mutex<HashMap<(String, String, Option<Partition>), f64>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value of a gauge or sum of a counter. Histograms count samples.
    pub fn value(&self, name: &str, topic: &Topic, partition: Option<Partition>) -> f64 {
        self.values
            .lock()
            .ok()
            .and_then(|values| {
                values
                    .get(&(name.to_string(), topic.to_string(), partition))
                    .copied()
            })
            .unwrap_or_default()
    }

    fn add(&self, name: &str, topic: &Topic, partition: Option<Partition>, value: f64) {
        if let Ok(mut values) = self.values.lock() {
            *values
                .entry((name.to_string(), topic.to_string(), partition))
                .or_default() += value;
        }
    }

    fn set(&self, name: &str, topic: &Topic, partition: Option<Partition>, value: f64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert((name.to_string(), topic.to_string(), partition), value);
        }
    }
}

impl MetricsConsumer for CountingMetrics {
    fn current_offset(&self, topic: &Topic, partition: Partition, offset: Offset) {
        self.set(CONSUMER_CURRENT_OFFSET, topic, Some(partition), offset.as_i64() as f64);
    }

    fn high_water_mark_offset(&self, topic: &Topic, partition: Partition, offset: Offset) {
        self.set(
            CONSUMER_HIGH_WATER_MARK_OFFSET,
            topic,
            Some(partition),
            offset.as_i64() as f64,
        );
    }

    fn offset_fallback(&self, topic: &Topic, partition: Partition) {
        self.add(CONSUMER_OFFSET_FALLBACK, topic, Some(partition), 1.0);
    }
}

impl MetricsMessageHandler for CountingMetrics {
    fn total_counter_inc(&self, topic: &Topic, partition: Partition) {
        self.add(MESSAGE_HANDLER_TOTAL, topic, Some(partition), 1.0);
    }

    fn success_counter_inc(&self, topic: &Topic, partition: Partition) {
        self.add(MESSAGE_HANDLER_SUCCESS, topic, Some(partition), 1.0);
    }

    fn failure_counter_inc(&self, topic: &Topic, partition: Partition) {
        self.add(MESSAGE_HANDLER_FAILURE, topic, Some(partition), 1.0);
    }

    fn duration_measure(&self, topic: &Topic, partition: Partition, _duration: Duration) {
        self.add(MESSAGE_HANDLER_DURATION, topic, Some(partition), 1.0);
    }
}

impl MetricsSyncProducer for CountingMetrics {
    fn total_counter_inc(&self, topic: &Topic) {
        self.add(SYNC_PRODUCER_TOTAL, topic, None, 1.0);
    }

    fn success_counter_inc(&self, topic: &Topic) {
        self.add(SYNC_PRODUCER_SUCCESS, topic, None, 1.0);
    }

    fn failure_counter_inc(&self, topic: &Topic) {
        self.add(SYNC_PRODUCER_FAILURE, topic, None, 1.0);
    }
}

/// Emits metrics with a consistent set of baseline labels.
#[derive(Debug, Clone, Default)]
pub struct MetricsHelper {
    baseline_labels: HashMap<String, String>,
}

impl MetricsHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the `topic` and `partition` labels.
    pub fn with_partition(self, topic: &Topic, partition: Partition) -> Self {
        self.with_label("topic", topic.as_str())
            .with_label("partition", &partition.to_string())
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.baseline_labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn counter(&self, name: &str) -> CounterHelper {
        CounterHelper {
            name: name.to_string(),
            labels: self.baseline_labels.clone(),
        }
    }

    pub fn histogram(&self, name: &str) -> HistogramHelper {
        HistogramHelper {
            name: name.to_string(),
            labels: self.baseline_labels.clone(),
        }
    }

    pub fn gauge(&self, name: &str) -> GaugeHelper {
        GaugeHelper {
            name: name.to_string(),
            labels: self.baseline_labels.clone(),
        }
    }
}

fn label_pairs(labels: HashMap<String, String>) -> Vec<(String, String)> {
    labels.into_iter().collect()
}

pub struct CounterHelper {
    name: String,
    labels: HashMap<String, String>,
}

impl CounterHelper {
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn increment(self, value: u64) {
        metrics::counter!(self.name, &label_pairs(self.labels)).increment(value);
    }
}

pub struct HistogramHelper {
    name: String,
    labels: HashMap<String, String>,
}

impl HistogramHelper {
    pub fn record(self, value: f64) {
        metrics::histogram!(self.name, &label_pairs(self.labels)).record(value);
    }
}

pub struct GaugeHelper {
    name: String,
    labels: HashMap<String, String>,
}

impl GaugeHelper {
    pub fn set(self, value: f64) {
        metrics::gauge!(self.name, &label_pairs(self.labels)).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_labels() {
        let helper = MetricsHelper::new()
            .with_label("service", "offset-consumer")
            .with_partition(&Topic::from("orders"), Partition::new(3));

        assert_eq!(helper.baseline_labels.len(), 3);
        assert_eq!(
            helper.baseline_labels.get("topic"),
            Some(&"orders".to_string())
        );
        assert_eq!(
            helper.baseline_labels.get("partition"),
            Some(&"3".to_string())
        );
    }

    #[test]
    fn test_counter_labels_do_not_leak_into_helper() {
        let helper = MetricsHelper::new().with_label("service", "offset-consumer");
        let counter = helper.counter("test_counter").with_label("topic", "orders");

        assert_eq!(counter.labels.len(), 2);
        assert_eq!(helper.baseline_labels.len(), 1);
    }

    #[test]
    fn test_kafka_metrics_without_recorder_is_noop() {
        let metrics = KafkaMetrics::new().with_label("service", "offset-consumer");
        let topic = Topic::from("orders");
        MetricsConsumer::current_offset(&metrics, &topic, Partition::new(0), Offset::new(10));
        MetricsMessageHandler::total_counter_inc(&metrics, &topic, Partition::new(0));
        MetricsSyncProducer::failure_counter_inc(&metrics, &topic);
    }

    #[test]
    fn test_counting_metrics() {
        let metrics = CountingMetrics::new();
        let topic = Topic::from("orders");
        let partition = Some(Partition::new(1));

        MetricsMessageHandler::failure_counter_inc(&metrics, &topic, Partition::new(1));
        MetricsMessageHandler::failure_counter_inc(&metrics, &topic, Partition::new(1));
        MetricsConsumer::current_offset(&metrics, &topic, Partition::new(1), Offset::new(5));
        MetricsConsumer::current_offset(&metrics, &topic, Partition::new(1), Offset::new(9));
        MetricsSyncProducer::total_counter_inc(&metrics, &topic);

        assert_eq!(metrics.value(MESSAGE_HANDLER_FAILURE, &topic, partition), 2.0);
        assert_eq!(metrics.value(CONSUMER_CURRENT_OFFSET, &topic, partition), 9.0);
        assert_eq!(metrics.value(SYNC_PRODUCER_TOTAL, &topic, None), 1.0);
        assert_eq!(metrics.value(MESSAGE_HANDLER_SUCCESS, &topic, partition), 0.0);
    }
}
