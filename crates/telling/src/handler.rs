//! Handler facades (spec §4.9): the event-method interfaces a
//! `telling` user implements, aggregated by communicator kind rather
//! than dispatched dynamically. A [`Reactor`] adapts a set of
//! per-method closures into a single [`ServiceHandler`] by a static
//! `match` over [`telling_core::message::Method`] — no virtual
//! dispatch table, so adding a method is a compile-time affair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use telling_core::prelude::{
    tag_query_id, AsyncQuery, AsyncRecv, Envelope, LifeLocked, Method, QueryDriver, RecvDriver, Status, TellingError,
    TransportIo, Writer,
};

use crate::communicator::{PassiveSendChannel, PushBox, SUB_OP_HEADER, SUB_OP_SUBSCRIBE, SUB_OP_UNSUBSCRIBE};

/// What a request/reply service implements to answer one query.
///
/// Async rather than a plain `fn` so a handler that itself needs to
/// forward the request elsewhere (the broker's routing path, spec
/// §4.7) can await that without blocking the recv-loop thread.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, request: &Envelope) -> Result<Envelope, TellingError>;
}

/// What a client implements to receive events from a [`ClientFacade`]
/// (spec §4.9: "aggregates the subscribe, request, and push event
/// methods"). Subscribe and request arrivals are required since a
/// facade with neither is pointless; the corresponding error hooks
/// default to empty so implementors only override what they care
/// about.
#[async_trait::async_trait]
pub trait ClientHandler: Send + Sync {
    /// A publication arrived on a topic this client is subscribed to.
    async fn on_recv_subscribing(&self, envelope: Envelope);

    /// The reply to a prior [`ClientFacade::request`] call arrived,
    /// tagged with the query id that call returned.
    async fn on_recv_requesting(&self, query_id: u64, reply: Envelope);

    /// The subscribe connection's recv-loop stopped.
    fn on_error_subscribing(&self, _error: &TellingError) {}

    /// The request connection's recv-loop stopped; every call still
    /// awaiting a reply will never see one arrive.
    fn on_error_requesting(&self, _error: &TellingError) {}
}

struct RequestSink<H> {
    handler: Arc<H>,
}

#[async_trait::async_trait]
impl<H: ClientHandler + 'static> AsyncQuery for RequestSink<H> {
    async fn on_recv(&self, query_id: u64, envelope: Envelope) -> Result<(), TellingError> {
        self.handler.on_recv_requesting(query_id, envelope).await;
        Ok(())
    }

    fn on_error(&self, error: &TellingError) {
        self.handler.on_error_requesting(error);
    }
}

struct SubscribeSink<H> {
    handler: Arc<H>,
}

#[async_trait::async_trait]
impl<H: ClientHandler + 'static> AsyncRecv for SubscribeSink<H> {
    async fn on_recv(&self, envelope: Envelope) -> Result<(), TellingError> {
        self.handler.on_recv_subscribing(envelope).await;
        Ok(())
    }

    fn on_error(&self, error: &TellingError) {
        self.handler.on_error_subscribing(error);
    }
}

/// Drives a [`ClientHandler`] off three connections at once (spec
/// §4.9): a request connection whose replies are dispatched by query
/// id, a subscribe connection whose arrivals are dispatched directly,
/// and a push connection whose outbound sends are serialized behind
/// [`PushBox`]'s single-flight queue so callers never need to
/// coordinate pushes themselves.
pub struct ClientFacade<H: ClientHandler + 'static> {
    next_query_id: AtomicU64,
    request_send: PassiveSendChannel,
    _request_sink: LifeLocked<RequestSink<H>>,
    request_driver_task: tokio::task::JoinHandle<()>,
    subscribe_send: PassiveSendChannel,
    _subscribe_sink: LifeLocked<SubscribeSink<H>>,
    subscribe_driver_task: tokio::task::JoinHandle<()>,
    push: PushBox,
}

impl<H: ClientHandler + 'static> ClientFacade<H> {
    /// `request_io` and `subscribe_io` are expected to be distinct
    /// connections (to a request/reply and a publish/subscribe
    /// listener respectively), matching how every other communicator
    /// kind is one connection per pattern.
    pub fn new(
        handler: Arc<H>,
        request_io: Arc<dyn TransportIo>,
        subscribe_io: Arc<dyn TransportIo>,
        push_io: Arc<dyn TransportIo>,
    ) -> Self {
        let request_sink = LifeLocked::new(RequestSink { handler: handler.clone() });
        let request_driver = QueryDriver::new(request_sink.weak(), request_io.clone());
        let request_driver_task = tokio::spawn(async move { request_driver.run().await });

        let subscribe_sink = LifeLocked::new(SubscribeSink { handler });
        let subscribe_driver = RecvDriver::new(subscribe_sink.weak(), subscribe_io.clone());
        let subscribe_driver_task = tokio::spawn(async move { subscribe_driver.run().await });

        ClientFacade {
            next_query_id: AtomicU64::new(1),
            request_send: PassiveSendChannel::new(request_io),
            _request_sink: request_sink,
            request_driver_task,
            subscribe_send: PassiveSendChannel::new(subscribe_io),
            _subscribe_sink: subscribe_sink,
            subscribe_driver_task,
            push: PushBox::new(push_io),
        }
    }

    /// Tag `request` with a fresh query id and send it, returning that
    /// id immediately. The reply arrives later through
    /// [`ClientHandler::on_recv_requesting`] rather than as a future,
    /// so a caller never blocks waiting for a peer that may be slow or
    /// gone.
    pub async fn request(&self, request: Envelope) -> Result<u64, TellingError> {
        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        self.request_send.offer(tag_query_id(request, query_id)).await?;
        Ok(query_id)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), TellingError> {
        self.send_sub_control(topic, SUB_OP_SUBSCRIBE).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TellingError> {
        self.send_sub_control(topic, SUB_OP_UNSUBSCRIBE).await
    }

    async fn send_sub_control(&self, topic: &str, op: &'static str) -> Result<(), TellingError> {
        let mut writer = Writer::new();
        let envelope = writer.start_request(Method::Get, topic)?.header(SUB_OP_HEADER, op)?.release()?;
        self.subscribe_send.offer(envelope).await
    }

    /// Enqueue a push (spec §4.9: "owns a push-queue to serialize
    /// outbound pushes"); returns once sent or queued behind whatever
    /// push is already in flight.
    pub async fn push(&self, uri: &str, body: impl Into<Vec<u8>>) -> Result<(), TellingError> {
        self.push.send(uri, body).await
    }
}

impl<H: ClientHandler> Drop for ClientFacade<H> {
    fn drop(&mut self) {
        self.request_driver_task.abort();
        self.subscribe_driver_task.abort();
    }
}

type MethodFn = Box<dyn Fn(&Envelope) -> Result<Envelope, TellingError> + Send + Sync>;

/// Dispatches a request to one of a fixed set of method handlers by a
/// static match, and derives the `Allow` header for `405`/`OPTIONS`
/// responses from whichever handlers were actually registered.
pub struct Reactor {
    get: Option<MethodFn>,
    head: Option<MethodFn>,
    post: Option<MethodFn>,
    put: Option<MethodFn>,
    delete: Option<MethodFn>,
    patch: Option<MethodFn>,
}

impl Reactor {
    pub fn new() -> Self {
        Reactor { get: None, head: None, post: None, put: None, delete: None, patch: None }
    }

    pub fn get<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Envelope, TellingError> + Send + Sync + 'static,
    {
        self.get = Some(Box::new(f));
        self
    }

    pub fn head<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Envelope, TellingError> + Send + Sync + 'static,
    {
        self.head = Some(Box::new(f));
        self
    }

    pub fn post<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Envelope, TellingError> + Send + Sync + 'static,
    {
        self.post = Some(Box::new(f));
        self
    }

    pub fn put<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Envelope, TellingError> + Send + Sync + 'static,
    {
        self.put = Some(Box::new(f));
        self
    }

    pub fn delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Envelope, TellingError> + Send + Sync + 'static,
    {
        self.delete = Some(Box::new(f));
        self
    }

    pub fn patch<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Envelope, TellingError> + Send + Sync + 'static,
    {
        self.patch = Some(Box::new(f));
        self
    }

    fn allowed_methods(&self) -> Vec<&'static str> {
        let mut allowed = Vec::new();
        if self.get.is_some() {
            allowed.push("GET");
        }
        if self.head.is_some() || self.get.is_some() {
            allowed.push("HEAD");
        }
        if self.post.is_some() {
            allowed.push("POST");
        }
        if self.put.is_some() {
            allowed.push("PUT");
        }
        if self.delete.is_some() {
            allowed.push("DELETE");
        }
        if self.patch.is_some() {
            allowed.push("PATCH");
        }
        allowed.push("OPTIONS");
        allowed
    }

    fn options_response(&self) -> Envelope {
        let mut writer = Writer::new();
        writer
            .start_reply(Status::OK, None)
            .unwrap()
            .header("Allow", self.allowed_methods().join(", "))
            .unwrap()
            .release()
            .unwrap()
    }

    fn not_implemented(&self) -> Envelope {
        let mut writer = Writer::new();
        writer
            .start_reply(Status::NOT_IMPLEMENTED, None)
            .unwrap()
            .header("Allow", self.allowed_methods().join(", "))
            .unwrap()
            .release()
            .unwrap()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ServiceHandler for Reactor {
    async fn handle(&self, request: &Envelope) -> Result<Envelope, TellingError> {
        let method = match &request.start_line {
            telling_core::message::StartLine::Request { method, .. } => *method,
            _ => return Err(TellingError::state("reactor received a non-request envelope")),
        };

        let handler = match method {
            Method::Get => self.get.as_ref(),
            Method::Head => self.head.as_ref().or(self.get.as_ref()),
            Method::Post => self.post.as_ref(),
            Method::Put => self.put.as_ref(),
            Method::Delete => self.delete.as_ref(),
            Method::Patch => self.patch.as_ref(),
            Method::Options => return Ok(self.options_response()),
            Method::Connect | Method::Trace | Method::Unknown => None,
        };

        match handler {
            Some(f) => f(request),
            None => Ok(self.not_implemented()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telling_core::message::{Method as M, Writer as W};

    fn request(method: M, uri: &str) -> Envelope {
        let mut w = W::new();
        w.start_request(method, uri).unwrap().release().unwrap()
    }

    #[tokio::test]
    async fn dispatches_to_registered_method() {
        let reactor = Reactor::new().get(|_req| {
            let mut w = W::new();
            Ok(w.start_reply(Status::OK, None).unwrap().release().unwrap())
        });
        let reply = reactor.handle(&request(M::Get, "/x")).await.unwrap();
        match reply.start_line {
            telling_core::message::StartLine::Reply { status, .. } => assert_eq!(status, Status::OK),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_method_is_not_implemented() {
        let reactor = Reactor::new().get(|_req| {
            let mut w = W::new();
            Ok(w.start_reply(Status::OK, None).unwrap().release().unwrap())
        });
        let reply = reactor.handle(&request(M::Post, "/x")).await.unwrap();
        match reply.start_line {
            telling_core::message::StartLine::Reply { status, .. } => {
                assert_eq!(status, Status::NOT_IMPLEMENTED)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reply.header("Allow"), Some("GET, HEAD, OPTIONS"));
    }

    #[tokio::test]
    async fn head_falls_back_to_get_handler() {
        let reactor = Reactor::new().get(|_req| {
            let mut w = W::new();
            Ok(w.start_reply(Status::OK, None).unwrap().release().unwrap())
        });
        let reply = reactor.handle(&request(M::Head, "/x")).await.unwrap();
        match reply.start_line {
            telling_core::message::StartLine::Reply { status, .. } => assert_eq!(status, Status::OK),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn options_lists_allowed_methods() {
        let reactor = Reactor::new().get(|_req| unreachable!()).post(|_req| unreachable!());
        let reply = reactor.handle(&request(M::Options, "/x")).await.unwrap();
        assert_eq!(reply.header("Allow"), Some("GET, HEAD, POST, OPTIONS"));
    }
}

#[cfg(test)]
mod client_facade_tests {
    use super::*;
    use telling_core::prelude::{Writer as W, QUERY_ID_HEADER};
    use telling_transport::InProcRegistry;
    use tokio::sync::mpsc;

    struct RecordingHandler {
        requesting: mpsc::Sender<(u64, Envelope)>,
        subscribing: mpsc::Sender<Envelope>,
    }

    #[async_trait::async_trait]
    impl ClientHandler for RecordingHandler {
        async fn on_recv_subscribing(&self, envelope: Envelope) {
            let _ = self.subscribing.send(envelope).await;
        }

        async fn on_recv_requesting(&self, query_id: u64, reply: Envelope) {
            let _ = self.requesting.send((query_id, reply)).await;
        }
    }

    /// Binds one in-process connection per pattern, holding the
    /// request side open with a tiny echo server that tags its reply
    /// with whatever query id the request carried.
    async fn connect_idle(registry: &InProcRegistry, name: &str) -> Arc<dyn TransportIo> {
        let listener = registry.bind(name).await.unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client_io: Arc<dyn TransportIo> = Arc::new(registry.connect(name).await.unwrap());
        accept_task.await.unwrap();
        client_io
    }

    #[tokio::test]
    async fn request_reply_is_dispatched_by_query_id() {
        let registry = InProcRegistry::new();

        let request_listener = registry.bind("facade-req").await.unwrap();
        let accept_task = tokio::spawn(async move { request_listener.accept().await.unwrap() });
        let request_client_io: Arc<dyn TransportIo> = Arc::new(registry.connect("facade-req").await.unwrap());
        let request_server_io = accept_task.await.unwrap();

        let server_task = tokio::spawn(async move {
            while let Ok(request) = request_server_io.recv().await {
                let query_id: u64 = request.header(QUERY_ID_HEADER).unwrap().parse().unwrap();
                let reply = tag_query_id(W::new().start_reply(Status::OK, None).unwrap().release().unwrap(), query_id);
                if request_server_io.send(reply).await.is_err() {
                    return;
                }
            }
        });

        let subscribe_io = connect_idle(&registry, "facade-sub").await;
        let push_io = connect_idle(&registry, "facade-push").await;

        let (requesting_tx, mut requesting_rx) = mpsc::channel(4);
        let (subscribing_tx, _subscribing_rx) = mpsc::channel(4);
        let handler = Arc::new(RecordingHandler { requesting: requesting_tx, subscribing: subscribing_tx });
        let facade = ClientFacade::new(handler, request_client_io, subscribe_io, push_io);

        let request = W::new().start_request(Method::Get, "/voices").unwrap().release().unwrap();
        let query_id = facade.request(request).await.unwrap();

        let (got_id, reply) = requesting_rx.recv().await.unwrap();
        assert_eq!(got_id, query_id);
        match reply.start_line {
            telling_core::message::StartLine::Reply { status, .. } => assert_eq!(status, Status::OK),
            other => panic!("unexpected {other:?}"),
        }

        server_task.abort();
    }
}
