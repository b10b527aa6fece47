//! Publish half of publish/subscribe: fans one envelope out to every
//! subscriber whose filter set contains a prefix of the envelope's
//! URI. A subscriber's filter set starts empty (receives nothing) and
//! is mutated for the lifetime of the connection by `SUBSCRIBE`/
//! `UNSUBSCRIBE` control envelopes (spec §4.5, §8 "`unsubscribe(t)`
//! followed by `subscribe(t)` restores delivery of `t`").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use telling_core::prelude::{Envelope, Method, StartLine, TellingError, TransportIo, Writer};
use telling_transport::Listener;

use crate::communicator::{PassiveSendChannel, SUB_OP_HEADER, SUB_OP_SUBSCRIBE, SUB_OP_UNSUBSCRIBE};

struct Subscriber {
    filters: std::sync::Mutex<Vec<String>>,
    channel: PassiveSendChannel,
}

impl Subscriber {
    fn matches(&self, uri: &str) -> bool {
        self.filters.lock().unwrap().iter().any(|prefix| uri.starts_with(prefix.as_str()))
    }
}

pub struct PublishBox {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: Arc<AtomicU64>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl PublishBox {
    /// Accept subscriber connections from `listener` in the
    /// background, indefinitely. Each connection's filter set starts
    /// empty and is grown/shrunk by the control envelopes it sends.
    pub fn new(listener: Box<dyn Listener>) -> Self {
        let subscribers: Arc<DashMap<u64, Subscriber>> = Arc::new(DashMap::new());
        let next_id = Arc::new(AtomicU64::new(0));
        let accept_subscribers = subscribers.clone();
        let accept_next_id = next_id.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(io) => {
                        let subscribers = accept_subscribers.clone();
                        let id = accept_next_id.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(run_subscriber(id, io, subscribers));
                    }
                    Err(error) => {
                        warn!(?error, "publish listener stopped accepting");
                        return;
                    }
                }
            }
        });
        PublishBox { subscribers, next_id, accept_task }
    }

    /// Publish `body` at `uri` to every subscriber whose filter set
    /// contains a prefix of `uri` (spec §8 "Publish round-trip").
    pub async fn publish(&self, uri: &str, body: impl Into<Vec<u8>>) -> Result<(), TellingError> {
        let mut writer = Writer::new();
        let envelope = writer.start_request(Method::Post, uri)?.body(&body.into())?.release()?;
        self.fan_out(uri, envelope).await
    }

    /// Publish an already-built envelope, matched against `uri` rather
    /// than against the envelope's own start-line. Used for bulletin
    /// reports (spec §4.6: a `Created`/`Gone` status report on the
    /// `*services` topic), whose start-line isn't the plain request
    /// shape [`PublishBox::publish`] builds.
    pub async fn publish_envelope(&self, uri: &str, envelope: Envelope) -> Result<(), TellingError> {
        self.fan_out(uri, envelope).await
    }

    async fn fan_out(&self, uri: &str, envelope: Envelope) -> Result<(), TellingError> {
        let mut last_error = None;
        for entry in self.subscribers.iter() {
            if entry.matches(uri) {
                if let Err(error) = entry.channel.offer(envelope.clone()).await {
                    warn!(?error, subscriber = entry.key(), "dropping subscriber after send failure");
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// One subscriber connection's lifetime: register with an empty
/// filter set, then apply every control envelope it sends until the
/// connection closes, at which point it's dropped from the table.
async fn run_subscriber(id: u64, io: Arc<dyn TransportIo>, subscribers: Arc<DashMap<u64, Subscriber>>) {
    let subscriber =
        Subscriber { filters: std::sync::Mutex::new(Vec::new()), channel: PassiveSendChannel::new(io.clone()) };
    subscribers.insert(id, subscriber);
    debug!(id, "subscriber connected");

    loop {
        match io.recv().await {
            Ok(envelope) => apply_control(id, &envelope, &subscribers),
            Err(error) => {
                debug!(id, ?error, "subscriber disconnected");
                subscribers.remove(&id);
                return;
            }
        }
    }
}

fn apply_control(id: u64, envelope: &Envelope, subscribers: &DashMap<u64, Subscriber>) {
    let StartLine::Request { uri, .. } = &envelope.start_line else {
        warn!(id, "ignoring non-request control envelope from subscriber");
        return;
    };
    let Some(entry) = subscribers.get(&id) else { return };
    match envelope.header(SUB_OP_HEADER) {
        Some(op) if op == SUB_OP_SUBSCRIBE => {
            let mut filters = entry.filters.lock().unwrap();
            if !filters.iter().any(|p| p == uri) {
                filters.push(uri.clone());
            }
        }
        Some(op) if op == SUB_OP_UNSUBSCRIBE => {
            entry.filters.lock().unwrap().retain(|p| p != uri);
        }
        other => warn!(id, ?other, "unrecognized subscriber control operation"),
    }
}

impl Drop for PublishBox {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telling_transport::InProcRegistry;

    #[tokio::test]
    async fn delivers_only_to_matching_subscribers_and_respects_unsubscribe() {
        let registry = InProcRegistry::new();
        let listener = registry.bind("pub").await.unwrap();
        let publish = PublishBox::new(Box::new(listener));

        let sub_io: Arc<dyn TransportIo> = Arc::new(registry.connect("pub").await.unwrap());
        // give the accept task a chance to register the connection
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut writer = Writer::new();
        let subscribe_env =
            writer.start_request(Method::Get, "/voices").unwrap().header(SUB_OP_HEADER, SUB_OP_SUBSCRIBE).unwrap().release().unwrap();
        sub_io.send(subscribe_env).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        publish.publish("/voices/7", b"hi".to_vec()).await.unwrap();
        let delivered = sub_io.recv().await.unwrap();
        assert_eq!(&delivered.body[..], b"hi");

        publish.publish("/keyboard", b"nope".to_vec()).await.unwrap();

        let mut writer = Writer::new();
        let unsubscribe_env = writer
            .start_request(Method::Get, "/voices")
            .unwrap()
            .header(SUB_OP_HEADER, SUB_OP_UNSUBSCRIBE)
            .unwrap()
            .release()
            .unwrap();
        sub_io.send(unsubscribe_env).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        publish.publish("/voices/8", b"should not arrive".to_vec()).await.unwrap();

        // Re-subscribing restores delivery.
        let mut writer = Writer::new();
        let resubscribe_env =
            writer.start_request(Method::Get, "/voices").unwrap().header(SUB_OP_HEADER, SUB_OP_SUBSCRIBE).unwrap().release().unwrap();
        sub_io.send(resubscribe_env).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        publish.publish("/voices/9", b"back".to_vec()).await.unwrap();
        let delivered = sub_io.recv().await.unwrap();
        assert_eq!(&delivered.body[..], b"back");
    }
}
