//! Partitioned log consumption with durable offset tracking.
//!
//! A consumer runs one loop per partition of a topic. Each loop resumes at
//! the offset its [`offset_manager::OffsetManager`] remembers, hands batches
//! of messages to a handler and marks `last offset + 1` once the handler
//! succeeded. With the transactional handlers the application state and the
//! offset are written in the same store transaction.
//!
//! ## Errors
//!
//! Library errors are typed (`thiserror`); handlers and consumers return
//! `anyhow::Result` annotated with topic, partition and offset. Log them with
//! `{e:#}` or `error = ?e` so the whole cause chain ends up in the log line.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod log_sampler;
pub mod metrics;
pub mod metrics_consts;
pub mod offset_manager;
pub mod offset_store;
pub mod offsets;
pub mod producer;
pub mod run;
pub mod store;
pub mod types;

pub use consumer::{Consumer, HighWaterMarkConsumer, OffsetConsumer, SimpleConsumer};
pub use types::{BatchSize, Group, Message, Offset, Partition, PartitionOffsets, Topic};
