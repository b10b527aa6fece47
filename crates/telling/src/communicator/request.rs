//! Request half of the request/reply pattern ("Request box", spec
//! §4.5: "Request box returns a future per request"): sends are
//! pipelined through the shared send queue, and each call is
//! correlated to its reply by an explicit query id rather than by
//! send order, so concurrent calls never need to wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use telling_core::prelude::{tag_query_id, AsyncQuery, Envelope, LifeLocked, QueryDriver, TellingError, TransportIo};

use crate::communicator::PassiveSendChannel;

struct PendingReplies {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<Envelope, TellingError>>>>,
}

#[async_trait::async_trait]
impl AsyncQuery for PendingReplies {
    async fn on_recv(&self, query_id: u64, envelope: Envelope) -> Result<(), TellingError> {
        let waiter = self.waiters.lock().unwrap().remove(&query_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(envelope));
                Ok(())
            }
            None => Err(TellingError::state("reply arrived for an unknown or already-completed query")),
        }
    }

    fn on_error(&self, error: &TellingError) {
        // Fail every outstanding call; nothing else will ever resolve
        // them once the recv loop has stopped.
        let mut waiters = self.waiters.lock().unwrap();
        for (_, tx) in waiters.drain() {
            let cloned = match error {
                TellingError::Closed => TellingError::Closed,
                TellingError::TimedOut => TellingError::TimedOut,
                TellingError::Canceled => TellingError::Canceled,
                other => TellingError::Transport(other.to_string()),
            };
            let _ = tx.send(Err(cloned));
        }
    }
}

pub struct RequestBox {
    send: PassiveSendChannel,
    pending: Arc<LifeLocked<PendingReplies>>,
    next_query_id: AtomicU64,
    driver_task: tokio::task::JoinHandle<()>,
}

impl RequestBox {
    pub fn new(io: Arc<dyn TransportIo>) -> Self {
        let pending = Arc::new(LifeLocked::new(PendingReplies { waiters: Mutex::new(HashMap::new()) }));
        let driver = QueryDriver::new(pending.weak(), io.clone());
        let driver_task = tokio::spawn(async move { driver.run().await });
        RequestBox { send: PassiveSendChannel::new(io), pending, next_query_id: AtomicU64::new(1), driver_task }
    }

    /// Send `request` and await its correlated reply. Concurrent calls
    /// each get their own query id, so none waits on another's send or
    /// reply.
    pub async fn call(&self, request: Envelope) -> Result<Envelope, TellingError> {
        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let guard =
                self.pending.value().ok_or_else(|| TellingError::state("request box torn down"))?;
            guard.waiters.lock().unwrap().insert(query_id, tx);
        }

        if let Err(error) = self.send.offer(tag_query_id(request, query_id)).await {
            if let Some(guard) = self.pending.value() {
                guard.waiters.lock().unwrap().remove(&query_id);
            }
            return Err(error);
        }

        rx.await.map_err(|_| TellingError::Closed)?
    }
}

impl Drop for RequestBox {
    fn drop(&mut self) {
        self.driver_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use telling_core::prelude::{Method, Status, Writer};
    use telling_transport::InProcRegistry;

    use crate::communicator::reply::ReplyBox;

    #[tokio::test]
    async fn concurrent_calls_each_get_their_own_reply() {
        let registry = InProcRegistry::new();
        let listener = registry.bind("req").await.unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client_io: StdArc<dyn TransportIo> = StdArc::new(registry.connect("req").await.unwrap());
        let server_io = accept_task.await.unwrap();

        // Wire up a manual ReplyBox server that echoes the request URI
        // back as the reply's reason phrase, so each reply is tied to
        // the request that produced it.
        let server = ReplyBox::new(server_io);
        let server_task = tokio::spawn(async move {
            loop {
                let request = match server.receive().await {
                    Ok(request) => request,
                    Err(_) => return,
                };
                let uri = match &request.start_line {
                    telling_core::prelude::StartLine::Request { uri, .. } => uri.clone(),
                    _ => String::new(),
                };
                let reply =
                    Writer::new().start_reply(Status::OK, Some(uri)).unwrap().release().unwrap();
                if server.respond(reply).await.is_err() {
                    return;
                }
            }
        });

        let client = StdArc::new(RequestBox::new(client_io));

        let mut handles = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let request = Writer::new().start_request(Method::Get, format!("/voices/{i}")).unwrap().release().unwrap();
                let reply = client.call(request).await.unwrap();
                match reply.start_line {
                    telling_core::prelude::StartLine::Reply { reason, .. } => {
                        assert_eq!(reason.as_deref(), Some(format!("/voices/{i}").as_str()));
                    }
                    other => panic!("expected reply, got {other:?}"),
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        server_task.abort();
    }
}
