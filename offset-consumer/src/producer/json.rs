use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use super::{ProducerMessage, SyncProducer};
use crate::error::ProducerError;
use crate::types::Topic;

/// Checks an object before it is published.
pub trait Validate<K, O>: Send + Sync {
    /// Returns the reason the object is rejected.
    fn validate(&self, key: &K, object: &O) -> Result<(), String>;
}

/// Accepts every object.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoValidation;

impl<K, O> Validate<K, O> for NoValidation {
    fn validate(&self, _key: &K, _object: &O) -> Result<(), String> {
        Ok(())
    }
}

/// Publishes objects as JSON under their raw key, the format read by
/// [`MessageHandlerUpdater`](crate::handler::update::MessageHandlerUpdater).
///
/// A delete is published as the key with an empty value.
pub struct JsonSender<K, O> {
    producer: Arc<dyn SyncProducer>,
    topic: Topic,
    validator: Arc<dyn Validate<K, O>>,
    _types: PhantomData<fn(&K, &O)>,
}

impl<K, O> JsonSender<K, O>
where
    K: AsRef<[u8]> + Debug + 'static,
    O: Serialize + 'static,
{
    pub fn new(producer: Arc<dyn SyncProducer>, topic: Topic) -> Self {
        Self::with_validator(producer, topic, Arc::new(NoValidation))
    }

    pub fn with_validator(
        producer: Arc<dyn SyncProducer>,
        topic: Topic,
        validator: Arc<dyn Validate<K, O>>,
    ) -> Self {
        Self {
            producer,
            topic,
            validator,
            _types: PhantomData,
        }
    }

    fn update_message(&self, key: &K, object: &O) -> Result<ProducerMessage, ProducerError> {
        self.validator
            .validate(key, object)
            .map_err(|reason| ProducerError::Validation {
                key: format!("{key:?}"),
                reason,
            })?;
        let value = serde_json::to_vec(object)?;
        Ok(ProducerMessage::new(self.topic.clone(), key.as_ref(), value))
    }

    fn delete_message(&self, key: &K) -> ProducerMessage {
        ProducerMessage::new(self.topic.clone(), key.as_ref(), Vec::new())
    }

    pub async fn send_update(&self, key: &K, object: &O) -> Result<(), ProducerError> {
        let msg = self.update_message(key, object)?;
        self.producer.send_message(msg).await
    }

    /// Nothing is sent if any object fails validation or serialization.
    pub async fn send_updates(&self, objects: &[(K, O)]) -> Result<(), ProducerError> {
        let msgs = objects
            .iter()
            .map(|(key, object)| self.update_message(key, object))
            .collect::<Result<Vec<_>, _>>()?;
        self.producer.send_messages(msgs).await
    }

    pub async fn send_delete(&self, key: &K) -> Result<(), ProducerError> {
        self.producer.send_message(self.delete_message(key)).await
    }

    pub async fn send_deletes(&self, keys: &[K]) -> Result<(), ProducerError> {
        let msgs = keys.iter().map(|key| self.delete_message(key)).collect();
        self.producer.send_messages(msgs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::testing::RecordingProducer;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        amount: u64,
    }

    struct PositiveAmount;

    impl Validate<String, Order> for PositiveAmount {
        fn validate(&self, _key: &String, order: &Order) -> Result<(), String> {
            if order.amount == 0 {
                return Err("amount must be positive".to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_updates_and_deletes() {
        let producer = Arc::new(RecordingProducer::default());
        let sender: JsonSender<String, Order> = JsonSender::new(producer.clone(), Topic::from("orders"));

        sender
            .send_update(&"o-1".to_string(), &Order { amount: 3 })
            .await
            .unwrap();
        sender.send_delete(&"o-2".to_string()).await.unwrap();

        let sent = producer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].key, b"o-1".to_vec());
        let order: Order = serde_json::from_slice(&sent[0].value).unwrap();
        assert_eq!(order, Order { amount: 3 });
        assert_eq!(sent[1].key, b"o-2".to_vec());
        assert!(sent[1].value.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_object_rejects_whole_batch() {
        let producer = Arc::new(RecordingProducer::default());
        let sender: JsonSender<String, Order> = JsonSender::with_validator(
            producer.clone(),
            Topic::from("orders"),
            Arc::new(PositiveAmount),
        );

        let err = sender
            .send_updates(&[
                ("o-1".to_string(), Order { amount: 3 }),
                ("o-2".to_string(), Order { amount: 0 }),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, ProducerError::Validation { ref reason, .. } if reason == "amount must be positive"));
        assert!(producer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_deletes() {
        let producer = Arc::new(RecordingProducer::default());
        let sender: JsonSender<String, Order> = JsonSender::new(producer.clone(), Topic::from("orders"));

        sender
            .send_deletes(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        let keys: Vec<_> = producer.sent().into_iter().map(|msg| msg.key).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
