use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::PartitionCursor;
use crate::error::BrokerError;
use crate::types::{Message, Offset};

pub type CursorItem = Result<Message, BrokerError>;

/// Cursor fed by a background task through a bounded channel.
///
/// The task gets a sender, the shared high-water mark and a token that is
/// cancelled when the cursor is closed or dropped.
pub struct ChannelCursor {
    rx: mpsc::Receiver<CursorItem>,
    high_water_mark: Arc<AtomicI64>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl ChannelCursor {
    pub fn spawn<F, Fut>(capacity: usize, high_water_mark: Offset, feed: F) -> Self
    where
        F: FnOnce(mpsc::Sender<CursorItem>, Arc<AtomicI64>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let high_water_mark = Arc::new(AtomicI64::new(high_water_mark.as_i64()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(feed(tx, high_water_mark.clone(), cancel.clone()));

        Self {
            rx,
            high_water_mark,
            task: Some(task),
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }
}

#[async_trait]
impl PartitionCursor for ChannelCursor {
    async fn recv(&mut self) -> Result<Message, BrokerError> {
        self.rx.recv().await.unwrap_or(Err(BrokerError::CursorClosed))
    }

    fn try_recv(&mut self) -> Result<Option<Message>, BrokerError> {
        match self.rx.try_recv() {
            Ok(item) => item.map(Some),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn high_water_mark(&self) -> Offset {
        Offset::new(self.high_water_mark.load(Ordering::Acquire))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Partition, Topic};

    fn message(offset: i64) -> Message {
        Message::new(
            Topic::from("orders"),
            Partition::new(0),
            Offset::new(offset),
            "key",
            "value",
        )
    }

    #[tokio::test]
    async fn test_recv_and_drain() {
        let mut cursor = ChannelCursor::spawn(10, Offset::new(3), |tx, _hwm, _cancel| async move {
            for offset in 0..3 {
                if tx.send(Ok(message(offset))).await.is_err() {
                    return;
                }
            }
        });

        assert_eq!(cursor.recv().await.unwrap().offset, Offset::new(0));
        // give the feeder a chance to push the rest
        tokio::task::yield_now().await;
        let mut drained = Vec::new();
        while drained.len() < 2 {
            if let Some(msg) = cursor.try_recv().unwrap() {
                drained.push(msg.offset);
            } else {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(drained, vec![Offset::new(1), Offset::new(2)]);
        assert_eq!(cursor.try_recv().unwrap(), None);
        assert_eq!(cursor.high_water_mark(), Offset::new(3));
        cursor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_error_is_returned() {
        let mut cursor = ChannelCursor::spawn(10, Offset::new(0), |tx, _hwm, _cancel| async move {
            let item = Err(BrokerError::Stream("connection reset".to_string()));
            if tx.send(item).await.is_err() {
                return;
            }
        });

        let err = cursor.recv().await.unwrap_err();
        assert!(matches!(err, BrokerError::Stream(_)));
        assert!(matches!(
            cursor.recv().await.unwrap_err(),
            BrokerError::CursorClosed
        ));
    }

    #[tokio::test]
    async fn test_close_stops_feeder() {
        let stopped = CancellationToken::new();
        let feeder_stopped = stopped.clone();
        let mut cursor = ChannelCursor::spawn(1, Offset::new(0), |_tx, _hwm, cancel| async move {
            cancel.cancelled().await;
            feeder_stopped.cancel();
        });

        cursor.close().await.unwrap();
        assert!(stopped.is_cancelled());
    }
}
