//! Subscribe half of publish/subscribe ("Subscribe box", spec §4.5:
//! "Pull/Subscribe box wraps a recv queue"): dials a
//! [`PublishBox`](super::PublishBox) endpoint, grows or shrinks its
//! byte-prefix filter set with control envelopes, and drains whatever
//! the peer forwards into a [`RecvQueue`] a caller drains at its own
//! pace.

use std::sync::Arc;

use telling_core::prelude::{AsyncRecv, Envelope, LifeLocked, Method, RecvDriver, RecvQueue, TellingError, TransportIo, Writer};

use crate::communicator::{PassiveSendChannel, SUB_OP_HEADER, SUB_OP_SUBSCRIBE, SUB_OP_UNSUBSCRIBE};

struct SubscribeSink {
    queue: RecvQueue<Envelope>,
}

#[async_trait::async_trait]
impl AsyncRecv for SubscribeSink {
    async fn on_recv(&self, envelope: Envelope) -> Result<(), TellingError> {
        self.queue.push(envelope);
        Ok(())
    }

    fn on_stop(&self) {
        self.queue.close();
    }
}

/// A subscriber's filter set starts empty: nothing is delivered until
/// at least one [`SubscribeBox::subscribe`] call succeeds.
pub struct SubscribeBox {
    send: PassiveSendChannel,
    sink: LifeLocked<SubscribeSink>,
    driver_task: tokio::task::JoinHandle<()>,
}

impl SubscribeBox {
    pub fn new(io: Arc<dyn TransportIo>) -> Self {
        let sink = LifeLocked::new(SubscribeSink { queue: RecvQueue::new() });
        let driver = RecvDriver::new(sink.weak(), io.clone());
        let driver_task = tokio::spawn(async move { driver.run().await });
        SubscribeBox { send: PassiveSendChannel::new(io), sink, driver_task }
    }

    /// Add `topic` (a byte-prefix) to this subscriber's filter set.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TellingError> {
        self.send_control(topic, SUB_OP_SUBSCRIBE).await
    }

    /// Remove `topic` from the filter set. Idempotent: the peer
    /// treats unsubscribing from an absent topic as a no-op.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TellingError> {
        self.send_control(topic, SUB_OP_UNSUBSCRIBE).await
    }

    async fn send_control(&self, topic: &str, op: &'static str) -> Result<(), TellingError> {
        let mut writer = Writer::new();
        let envelope = writer.start_request(Method::Get, topic)?.header(SUB_OP_HEADER, op)?.release()?;
        self.send.offer(envelope).await
    }

    /// Wait for the next envelope the peer forwarded to this
    /// subscriber (already filtered server-side by byte-prefix);
    /// `None` once the peer closes the connection and the backlog has
    /// drained.
    pub async fn recv(&self) -> Option<Envelope> {
        let guard = self.sink.value()?;
        guard.queue.recv().await
    }
}

impl Drop for SubscribeBox {
    fn drop(&mut self) {
        self.driver_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::PublishBox;
    use telling_transport::InProcRegistry;

    #[tokio::test]
    async fn subscribe_then_unsubscribe_then_resubscribe_round_trips() {
        let registry = InProcRegistry::new();
        let listener = registry.bind("events").await.unwrap();
        let publish = PublishBox::new(Box::new(listener));

        let client_io: Arc<dyn TransportIo> = Arc::new(registry.connect("events").await.unwrap());
        let subscriber = SubscribeBox::new(client_io);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        subscriber.subscribe("/voices").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        publish.publish("/voices/1", b"a".to_vec()).await.unwrap();
        let env = subscriber.recv().await.unwrap();
        assert_eq!(&env.body[..], b"a");

        subscriber.unsubscribe("/voices").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        publish.publish("/voices/2", b"dropped".to_vec()).await.unwrap();

        subscriber.subscribe("/voices").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        publish.publish("/voices/3", b"c".to_vec()).await.unwrap();
        let env = subscriber.recv().await.unwrap();
        assert_eq!(&env.body[..], b"c");
    }
}
