// ==== Consumer metrics ====
/// Gauge for the offset of the last message handed to the handler chain
pub const CONSUMER_CURRENT_OFFSET: &str = "kafka_consumer_current_offset";

/// Gauge for the partition high-water mark as reported by the cursor
pub const CONSUMER_HIGH_WATER_MARK_OFFSET: &str = "kafka_consumer_high_water_mark_offset";

/// Counter for out-of-range start offsets that fell back to the initial offset
pub const CONSUMER_OFFSET_FALLBACK: &str = "kafka_consumer_offset_fallback_total";

// ==== Message handler metrics ====
/// Counter for every message or batch entering a metrics-wrapped handler
pub const MESSAGE_HANDLER_TOTAL: &str = "kafka_message_handler_total";

/// Counter for handler invocations that returned success
pub const MESSAGE_HANDLER_SUCCESS: &str = "kafka_message_handler_success_total";

/// Counter for handler invocations that returned an error
pub const MESSAGE_HANDLER_FAILURE: &str = "kafka_message_handler_failure_total";

/// Histogram for handler duration, recorded regardless of outcome
pub const MESSAGE_HANDLER_DURATION: &str = "kafka_message_handler_duration_seconds";

// ==== Sync producer metrics ====
/// Counter for every send attempt
pub const SYNC_PRODUCER_TOTAL: &str = "kafka_sync_producer_total";

/// Counter for acknowledged sends
pub const SYNC_PRODUCER_SUCCESS: &str = "kafka_sync_producer_success_total";

/// Counter for failed sends
pub const SYNC_PRODUCER_FAILURE: &str = "kafka_sync_producer_failure_total";
