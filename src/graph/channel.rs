// src/graph/channel.rs
//! The two channel kinds between stages.
//!
//! `Broadcast<T>`: one producer publishes a value once; any number of consumers read
//! it without depleting it.
//! `Barrier<T>`: a declared number of producers each send items and then complete;
//! the single consumer fires only once every producer has finished.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Broadcast '{0}' closed before a value was published")]
    Unpublished(String),
    #[error("Barrier '{name}': {abandoned} of {expected} producers finished without completing")]
    Abandoned {
        name: String,
        abandoned: usize,
        expected: usize,
    },
    #[error("Barrier '{0}' consumer is gone")]
    ConsumerGone(String),
}

/// Creates a named broadcast pair.
pub fn broadcast<T>(name: &str) -> (BroadcastPublisher<T>, Broadcast<T>) {
    let (tx, rx) = watch::channel(None);
    (
        BroadcastPublisher { tx },
        Broadcast {
            name: name.to_string(),
            rx,
        },
    )
}

pub struct BroadcastPublisher<T> {
    tx: watch::Sender<Option<Arc<T>>>,
}

impl<T> BroadcastPublisher<T> {
    /// Publishes the value. Consumes the publisher, so a broadcast is written at most once.
    pub fn publish(self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.tx.send_replace(Some(value.clone()));
        value
    }
}

/// Read side of a broadcast. Clone it once per consumer.
pub struct Broadcast<T> {
    name: String,
    rx: watch::Receiver<Option<Arc<T>>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Broadcast {
            name: self.name.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Broadcast<T> {
    /// Waits for the published value.
    /// Fails if the publisher was dropped without publishing (upstream failure).
    pub async fn get(&self) -> Result<Arc<T>, ChannelError> {
        let mut rx = self.rx.clone();
        loop {
            let current: Option<Arc<T>> = (*rx.borrow_and_update()).clone();
            if let Some(value) = current {
                return Ok(value);
            }
            if rx.changed().await.is_err() {
                let last: Option<Arc<T>> = (*rx.borrow()).clone();
                return last.ok_or_else(|| ChannelError::Unpublished(self.name.clone()));
            }
        }
    }
}

enum BarrierEvent<T> {
    Item(T),
    Completed,
    Abandoned,
}

/// Creates a barrier with `producers` declared producers.
pub fn barrier<T>(name: &str, producers: usize) -> (Vec<BarrierProducer<T>>, Barrier<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handles = (0..producers)
        .map(|_| BarrierProducer {
            name: name.to_string(),
            tx: tx.clone(),
            finished: false,
        })
        .collect();
    (
        handles,
        Barrier {
            name: name.to_string(),
            expected: producers,
            rx,
        },
    )
}

/// One producer slot of a barrier.
/// Dropping it without `complete` counts as abandoned.
pub struct BarrierProducer<T> {
    name: String,
    tx: mpsc::UnboundedSender<BarrierEvent<T>>,
    finished: bool,
}

impl<T> BarrierProducer<T> {
    pub fn send(&self, item: T) -> Result<(), ChannelError> {
        self.tx
            .send(BarrierEvent::Item(item))
            .map_err(|_| ChannelError::ConsumerGone(self.name.clone()))
    }

    pub fn complete(mut self) {
        self.finished = true;
        let _ = self.tx.send(BarrierEvent::Completed);
    }
}

impl<T> Drop for BarrierProducer<T> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send(BarrierEvent::Abandoned);
        }
    }
}

/// Items gathered by a barrier plus how many producers gave up.
#[derive(Debug)]
pub struct Collected<T> {
    pub items: Vec<T>,
    pub completed: usize,
    pub abandoned: usize,
}

pub struct Barrier<T> {
    name: String,
    expected: usize,
    rx: mpsc::UnboundedReceiver<BarrierEvent<T>>,
}

impl<T> Barrier<T> {
    /// Blocks until every declared producer completed or was dropped.
    pub async fn collect_partial(mut self) -> Collected<T> {
        let mut items = Vec::new();
        let mut completed = 0;
        let mut abandoned = 0;
        while completed + abandoned < self.expected {
            match self.rx.recv().await {
                Some(BarrierEvent::Item(item)) => items.push(item),
                Some(BarrierEvent::Completed) => completed += 1,
                Some(BarrierEvent::Abandoned) => abandoned += 1,
                None => break,
            }
        }
        Collected {
            items,
            completed,
            abandoned,
        }
    }

    /// Like `collect_partial`, but any abandoned producer fails the whole collection.
    pub async fn collect(self) -> Result<Vec<T>, ChannelError> {
        let name = self.name.clone();
        let expected = self.expected;
        let collected = self.collect_partial().await;
        if collected.abandoned > 0 {
            return Err(ChannelError::Abandoned {
                name,
                abandoned: collected.abandoned,
                expected,
            });
        }
        Ok(collected.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_broadcast_many_readers() -> Result<(), ChannelError> {
        let (publisher, reader) = broadcast::<String>("index");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reader = reader.clone();
            handles.push(tokio::spawn(async move { reader.get().await }));
        }
        publisher.publish("genome.hisat2_index".to_string());
        for handle in handles {
            let value = handle.await.expect("reader task")?;
            assert_eq!(value.as_str(), "genome.hisat2_index");
        }
        // Not depleted by earlier readers.
        assert_eq!(reader.get().await?.as_str(), "genome.hisat2_index");
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_dropped_publisher() {
        let (publisher, reader) = broadcast::<u32>("index");
        drop(publisher);
        let err = reader.get().await.unwrap_err();
        assert_eq!(err, ChannelError::Unpublished("index".to_string()));
    }

    #[tokio::test]
    async fn test_barrier_waits_for_all_producers() -> Result<(), ChannelError> {
        let (producers, barrier) = barrier::<usize>("refs", 3);
        let (fired_tx, mut fired_rx) = tokio::sync::oneshot::channel();
        let consumer = tokio::spawn(async move {
            let items = barrier.collect().await;
            let _ = fired_tx.send(());
            items
        });

        let mut producers = producers.into_iter();
        let first = producers.next().expect("producer");
        first.send(1)?;
        first.complete();
        let second = producers.next().expect("producer");
        second.send(2)?;
        second.send(3)?;
        second.complete();

        // Two of three done: the consumer must still be blocked.
        assert!(timeout(Duration::from_millis(50), &mut fired_rx).await.is_err());

        let third = producers.next().expect("producer");
        third.complete();
        let mut items = consumer.await.expect("consumer task")?;
        items.sort();
        assert_eq!(items, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn test_barrier_abandoned_producer() -> Result<(), ChannelError> {
        let (producers, barrier) = barrier::<&str>("samples", 2);
        let mut producers = producers.into_iter();
        let ok = producers.next().expect("producer");
        ok.send("S1")?;
        ok.complete();
        drop(producers);

        let err = barrier.collect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Abandoned { abandoned: 1, expected: 2, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_barrier_partial_keeps_items() {
        let (producers, barrier) = barrier::<u8>("samples", 2);
        let mut producers = producers.into_iter();
        let first = producers.next().expect("producer");
        let _ = first.send(7);
        drop(first);
        let second = producers.next().expect("producer");
        second.complete();

        let collected = barrier.collect_partial().await;
        assert_eq!(collected.items, vec![7]);
        assert_eq!(collected.completed, 1);
        assert_eq!(collected.abandoned, 1);
    }

    #[tokio::test]
    async fn test_empty_barrier_fires_immediately() {
        let (_producers, barrier) = barrier::<u8>("none", 0);
        let collected = timeout(Duration::from_millis(50), barrier.collect_partial())
            .await
            .expect("empty barrier should not block");
        assert!(collected.items.is_empty());
    }
}
