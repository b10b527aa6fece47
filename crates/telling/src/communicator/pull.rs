//! Pull half of the push/pull pattern ("Pull box", spec §4.5: "Pull
//! ... box wraps a recv queue"): drains whatever the peer pushes into
//! an internal [`RecvQueue`] a caller drains at its own pace.

use std::sync::Arc;

use telling_core::prelude::{AsyncRecv, Envelope, LifeLocked, RecvDriver, RecvQueue, TellingError, TransportIo};

struct PullSink {
    queue: RecvQueue<Envelope>,
}

#[async_trait::async_trait]
impl AsyncRecv for PullSink {
    async fn on_recv(&self, envelope: Envelope) -> Result<(), TellingError> {
        self.queue.push(envelope);
        Ok(())
    }

    fn on_stop(&self) {
        self.queue.close();
    }
}

pub struct PullBox {
    sink: LifeLocked<PullSink>,
    driver_task: tokio::task::JoinHandle<()>,
}

impl PullBox {
    pub fn new(io: Arc<dyn TransportIo>) -> Self {
        let sink = LifeLocked::new(PullSink { queue: RecvQueue::new() });
        let driver = RecvDriver::new(sink.weak(), io);
        let driver_task = tokio::spawn(async move { driver.run().await });
        PullBox { sink, driver_task }
    }

    /// Wait for the next pushed envelope; `None` once the peer closes
    /// the connection and the backlog has drained.
    pub async fn recv(&self) -> Option<Envelope> {
        let guard = self.sink.value()?;
        guard.queue.recv().await
    }
}

impl Drop for PullBox {
    fn drop(&mut self) {
        self.driver_task.abort();
    }
}
