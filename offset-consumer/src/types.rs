use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rdkafka::message::{Header as KafkaHeader, Headers, OwnedHeaders};
use serde::{Deserialize, Serialize};

use crate::error::{ConsumerError, DecodeError};

/// Name of a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Name of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Group(String);

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Group {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One ordered shard of a topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Partition(i32);

impl Partition {
    pub const fn new(partition: i32) -> Self {
        Self(partition)
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(content: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; 4] = content
            .try_into()
            .map_err(|_| DecodeError::InvalidLength {
                expected: 4,
                actual: content.len(),
            })?;
        Ok(Self(i32::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Partition {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().parse::<i32>() {
            Ok(partition) if partition >= 0 => Ok(Partition(partition)),
            _ => Err(DecodeError::InvalidPartition(value.to_string())),
        }
    }
}

impl From<i32> for Partition {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// All partitions of a topic as reported by the broker.
pub type Partitions = Vec<Partition>;

/// Position of a message within a partition.
///
/// [`Offset::NEWEST`] and [`Offset::OLDEST`] are sentinels that the broker
/// resolves when a cursor is opened. They are never persisted as such.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(i64);

impl Offset {
    pub const NEWEST: Offset = Offset(-1);
    pub const OLDEST: Offset = Offset(-2);

    pub const fn new(offset: i64) -> Self {
        Self(offset)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 < 0
    }

    /// The offset directly after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The offset directly before this one.
    pub fn prev(&self) -> Self {
        Self(self.0 - 1)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(content: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; 8] = content
            .try_into()
            .map_err(|_| DecodeError::InvalidLength {
                expected: 8,
                actual: content.len(),
            })?;
        Ok(Self(i64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Offset::NEWEST => f.write_str("newest"),
            Offset::OLDEST => f.write_str("oldest"),
            Offset(offset) => write!(f, "{offset}"),
        }
    }
}

impl FromStr for Offset {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "newest" => Ok(Offset::NEWEST),
            "oldest" => Ok(Offset::OLDEST),
            other => other
                .parse::<i64>()
                .map(Offset)
                .map_err(|_| DecodeError::InvalidOffset(value.to_string())),
        }
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Composite storage key of a topic and one of its partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: Topic,
    pub partition: Partition,
}

impl TopicPartition {
    pub fn new(topic: Topic, partition: Partition) -> Self {
        Self { topic, partition }
    }

    /// Text form `<topic>-<partition>`.
    pub fn text_key(&self) -> Vec<u8> {
        format!("{}-{}", self.topic, self.partition).into_bytes()
    }

    /// Binary form: big-endian u16 topic length, topic bytes, big-endian i32 partition.
    /// Topics longer than `u16::MAX` bytes have no binary form.
    pub fn binary_key(&self) -> Result<Vec<u8>, DecodeError> {
        let topic = self.topic.as_str().as_bytes();
        let len = u16::try_from(topic.len()).map_err(|_| DecodeError::TopicTooLong(topic.len()))?;

        let mut key = Vec::with_capacity(2 + topic.len() + 4);
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(topic);
        key.extend_from_slice(&self.partition.to_bytes());
        Ok(key)
    }

    pub fn from_binary_key(content: &[u8]) -> Result<Self, DecodeError> {
        if content.len() < 6 {
            return Err(DecodeError::InvalidLength {
                expected: 6,
                actual: content.len(),
            });
        }
        let len = usize::from(u16::from_be_bytes([content[0], content[1]]));
        let expected = 2 + len + 4;
        if content.len() != expected {
            return Err(DecodeError::InvalidLength {
                expected,
                actual: content.len(),
            });
        }
        let topic = String::from_utf8(content[2..2 + len].to_vec())?;
        let partition = Partition::from_bytes(&content[2 + len..])?;
        Ok(Self::new(Topic::from(topic), partition))
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Mapping of partition to offset, used for high-water marks and trigger targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOffsets(BTreeMap<Partition, Offset>);

/// Serialized form of one entry of [`PartitionOffsets`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffsetItem {
    #[serde(rename = "Offset")]
    pub offset: Offset,
    #[serde(rename = "Partition")]
    pub partition: Partition,
}

impl PartitionOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: Partition, offset: Offset) -> Option<Offset> {
        self.0.insert(partition, offset)
    }

    pub fn get(&self, partition: &Partition) -> Option<Offset> {
        self.0.get(partition).copied()
    }

    pub fn remove(&mut self, partition: &Partition) -> Option<Offset> {
        self.0.remove(partition)
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.0.contains_key(partition)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Partition, Offset)> + '_ {
        self.0.iter().map(|(p, o)| (*p, *o))
    }

    pub fn items(&self) -> Vec<PartitionOffsetItem> {
        self.iter()
            .map(|(partition, offset)| PartitionOffsetItem { offset, partition })
            .collect()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(&self.items())?)
    }

    pub fn from_json_bytes(content: &[u8]) -> Result<Self, DecodeError> {
        let items: Vec<PartitionOffsetItem> = serde_json::from_slice(content)?;
        Ok(items
            .into_iter()
            .map(|item| (item.partition, item.offset))
            .collect())
    }
}

impl FromIterator<(Partition, Offset)> for PartitionOffsets {
    fn from_iter<I: IntoIterator<Item = (Partition, Offset)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for PartitionOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (partition, offset)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{partition}: {offset}")?;
        }
        f.write_str("}")
    }
}

/// Maximum number of messages handed to a batch handler at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSize(usize);

impl BatchSize {
    pub fn new(size: usize) -> Result<Self, ConsumerError> {
        let size = Self(size);
        size.validate()?;
        Ok(size)
    }

    pub fn get(&self) -> usize {
        self.0
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.0 < 1 {
            return Err(ConsumerError::InvalidBatchSize(self.0));
        }
        Ok(())
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bootstrap broker addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Brokers(Vec<String>);

impl Brokers {
    /// Parses a comma separated list, dropping empty entries.
    pub fn parse(value: &str) -> Self {
        Self(
            value
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Brokers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// Multi-valued message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header(HashMap<String, Vec<String>>);

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn set(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.0.insert(key.into(), values);
    }

    pub fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_kafka_headers<H: Headers>(headers: &H) -> Self {
        let mut header = Header::new();
        for kafka_header in headers.iter() {
            let value = kafka_header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            header.add(kafka_header.key, value);
        }
        header
    }

    pub fn to_kafka_headers(&self) -> OwnedHeaders {
        self.iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(KafkaHeader {
                    key,
                    value: Some(value),
                })
            })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (key, value) in iter {
            header.add(key, value);
        }
        header
    }
}

/// Message key as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// A record delivered by the broker. Never produced by the consumer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub partition: Partition,
    pub offset: Offset,
    pub key: Vec<u8>,
    /// Empty value means the key was deleted.
    pub value: Vec<u8>,
    pub headers: Header,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        topic: Topic,
        partition: Partition,
        offset: Offset,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            key: key.into(),
            value: value.into(),
            headers: Header::new(),
            timestamp: None,
        }
    }

    pub fn with_headers(mut self, headers: Header) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}
