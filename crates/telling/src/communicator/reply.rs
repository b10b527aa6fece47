//! Reply half of the request/reply pattern (spec §4.5). Two shapes
//! share the same [`telling_core::driver::RespondDriver`] plumbing:
//! [`Reply`] auto-dispatches every query to a [`ServiceHandler`] and
//! answers immediately (the broker's "device relay" forwarding path);
//! [`ReplyBox`] instead surfaces a manual `receive`/`respond` pair with
//! a single outstanding query, for callers that want to answer by hand
//! (spec §4.5 "Reply box surfaces receive(msg) / respond(msg) with a
//! single outstanding query").

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use telling_core::prelude::{
    tag_query_id, AsyncRespond, Envelope, LifeLocked, RecvQueue, RespondDriver, TellingError, TransportIo,
};

use crate::communicator::PassiveSendChannel;
use crate::handler::ServiceHandler;

struct ReplyRouter {
    handler: Arc<dyn ServiceHandler>,
    send: PassiveSendChannel,
}

#[async_trait::async_trait]
impl AsyncRespond for ReplyRouter {
    async fn on_query(&self, query_id: u64, envelope: Envelope) -> Result<(), TellingError> {
        let reply = self.handler.handle(&envelope).await?;
        self.send.offer(tag_query_id(reply, query_id)).await
    }
}

/// Auto-dispatching reply endpoint: every query is answered
/// immediately by `handler`, in arrival order. Used by accept loops
/// that have nothing else to do with a connection besides serve it.
pub struct Reply {
    driver_task: tokio::task::JoinHandle<()>,
    _router: Arc<LifeLocked<ReplyRouter>>,
}

impl Reply {
    pub fn new(io: Arc<dyn TransportIo>, handler: Arc<dyn ServiceHandler>) -> Self {
        let router = Arc::new(LifeLocked::new(ReplyRouter { handler, send: PassiveSendChannel::new(io.clone()) }));
        let driver = RespondDriver::new(router.weak(), io);
        let driver_task = tokio::spawn(async move { driver.run().await });
        Reply { driver_task, _router: router }
    }

    /// Wait for this connection's recv-loop to stop (the peer closed
    /// the connection, or a handler error terminated it) and then drop
    /// everything. Used by accept loops that spawn one `Reply` per
    /// inbound connection and have nothing else to do with it once
    /// it's no longer serving requests.
    pub async fn run_until_closed(mut self) {
        let _ = (&mut self.driver_task).await;
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        self.driver_task.abort();
    }
}

struct ReplyBoxRouter {
    queue: RecvQueue<(u64, Envelope)>,
}

#[async_trait::async_trait]
impl AsyncRespond for ReplyBoxRouter {
    async fn on_query(&self, query_id: u64, envelope: Envelope) -> Result<(), TellingError> {
        self.queue.push((query_id, envelope));
        Ok(())
    }

    fn on_stop(&self) {
        self.queue.close();
    }
}

/// Manual reply endpoint: a caller pulls the next query with
/// [`ReplyBox::receive`] and answers it with [`ReplyBox::respond`].
/// Only one query may be outstanding at a time; calling `receive`
/// again before answering the previous one is an error.
pub struct ReplyBox {
    router: Arc<LifeLocked<ReplyBoxRouter>>,
    send: PassiveSendChannel,
    outstanding: AsyncMutex<Option<u64>>,
    driver_task: tokio::task::JoinHandle<()>,
}

impl ReplyBox {
    pub fn new(io: Arc<dyn TransportIo>) -> Self {
        let router = Arc::new(LifeLocked::new(ReplyBoxRouter { queue: RecvQueue::new() }));
        let driver = RespondDriver::new(router.weak(), io.clone());
        let driver_task = tokio::spawn(async move { driver.run().await });
        ReplyBox { router, send: PassiveSendChannel::new(io), outstanding: AsyncMutex::new(None), driver_task }
    }

    /// Wait for the next query.
    pub async fn receive(&self) -> Result<Envelope, TellingError> {
        let mut outstanding = self.outstanding.lock().await;
        if outstanding.is_some() {
            return Err(TellingError::state("receive called with a query still outstanding"));
        }
        let guard = self.router.value().ok_or_else(|| TellingError::state("reply box torn down"))?;
        let (query_id, envelope) = guard.queue.recv().await.ok_or(TellingError::Closed)?;
        *outstanding = Some(query_id);
        Ok(envelope)
    }

    /// Answer the query [`ReplyBox::receive`] most recently returned.
    pub async fn respond(&self, envelope: Envelope) -> Result<(), TellingError> {
        let mut outstanding = self.outstanding.lock().await;
        let query_id =
            outstanding.take().ok_or_else(|| TellingError::state("respond called with no outstanding query"))?;
        self.send.offer(tag_query_id(envelope, query_id)).await
    }
}

impl Drop for ReplyBox {
    fn drop(&mut self) {
        self.driver_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telling_core::prelude::{Method, Status, Writer};
    use telling_transport::InProcRegistry;

    #[tokio::test]
    async fn receive_rejects_a_second_call_before_respond() {
        let registry = InProcRegistry::new();
        let listener = registry.bind("reply-box").await.unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client_io: Arc<dyn TransportIo> = Arc::new(registry.connect("reply-box").await.unwrap());
        let server_io = accept_task.await.unwrap();

        let server = ReplyBox::new(server_io);
        let request = Writer::new().start_request(Method::Get, "/x").unwrap().release().unwrap();
        client_io.send(request).await.unwrap();

        let _first = server.receive().await.unwrap();
        let err = server.receive().await.unwrap_err();
        assert!(matches!(err, TellingError::State(_)));

        let reply = Writer::new().start_reply(Status::OK, None).unwrap().release().unwrap();
        server.respond(reply).await.unwrap();
    }
}
