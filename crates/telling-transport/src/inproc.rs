//! In-process transport collaborator: communicators in the same
//! process exchange envelopes over `tokio::mpsc` channels instead of
//! a socket. Used for broker-local relays and for tests that want
//! deterministic, allocation-light message passing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use telling_core::prelude::{Envelope, TellingError, TransportIo};

use crate::Listener;

const CHANNEL_CAPACITY: usize = 256;

/// A process-wide registry of named in-process endpoints. Each name
/// can be bound (listened on) once; connecting to a bound name
/// produces a paired [`InProcConnection`] on each side.
#[derive(Clone)]
pub struct InProcRegistry {
    inner: Arc<AsyncMutex<HashMap<String, mpsc::Sender<Handshake>>>>,
}

struct Handshake {
    to_listener: mpsc::Sender<Envelope>,
    reply_to: mpsc::Sender<mpsc::Sender<Envelope>>,
}

impl InProcRegistry {
    pub fn new() -> Self {
        InProcRegistry { inner: Arc::new(AsyncMutex::new(HashMap::new())) }
    }

    pub async fn bind(&self, name: &str) -> Result<InProcListener, TellingError> {
        let (handshake_tx, handshake_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut table = self.inner.lock().await;
        if table.contains_key(name) {
            return Err(TellingError::PathTaken { path: name.to_string() });
        }
        table.insert(name.to_string(), handshake_tx);
        debug!(name, "inproc endpoint bound");
        Ok(InProcListener { handshake_rx: AsyncMutex::new(handshake_rx) })
    }

    pub async fn connect(&self, name: &str) -> Result<InProcConnection, TellingError> {
        let handshake_tx = {
            let table = self.inner.lock().await;
            table
                .get(name)
                .cloned()
                .ok_or_else(|| TellingError::PathMissing { path: name.to_string() })?
        };

        let (to_listener, from_connector) = mpsc::channel(CHANNEL_CAPACITY);
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        handshake_tx
            .send(Handshake { to_listener, reply_to: reply_tx })
            .await
            .map_err(|_| TellingError::PathMissing { path: name.to_string() })?;
        let to_connector = reply_rx.recv().await.ok_or(TellingError::Closed)?;

        Ok(InProcConnection {
            outbound: AsyncMutex::new(to_connector),
            inbound: AsyncMutex::new(from_connector),
        })
    }
}

impl Default for InProcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InProcListener {
    handshake_rx: AsyncMutex<mpsc::Receiver<Handshake>>,
}

#[async_trait::async_trait]
impl Listener for InProcListener {
    async fn accept(&self) -> Result<Arc<dyn TransportIo>, TellingError> {
        let mut handshake_rx = self.handshake_rx.lock().await;
        let Handshake { to_listener, reply_to } = handshake_rx.recv().await.ok_or(TellingError::Closed)?;
        let (to_connector, from_listener) = mpsc::channel(CHANNEL_CAPACITY);
        reply_to.send(to_connector).await.map_err(|_| TellingError::Closed)?;
        Ok(Arc::new(InProcConnection {
            outbound: AsyncMutex::new(to_listener),
            inbound: AsyncMutex::new(from_listener),
        }))
    }
}

pub struct InProcConnection {
    outbound: AsyncMutex<mpsc::Sender<Envelope>>,
    inbound: AsyncMutex<mpsc::Receiver<Envelope>>,
}

#[async_trait::async_trait]
impl TransportIo for InProcConnection {
    async fn recv(&self) -> Result<Envelope, TellingError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TellingError::Closed)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TellingError> {
        let outbound = self.outbound.lock().await;
        outbound.send(envelope).await.map_err(|_| TellingError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telling_core::message::{Method, Writer};

    #[tokio::test]
    async fn connect_before_bind_reports_missing_path() {
        let registry = InProcRegistry::new();
        let err = registry.connect("nowhere").await.unwrap_err();
        assert!(matches!(err, TellingError::PathMissing { .. }));
    }

    #[tokio::test]
    async fn bound_name_cannot_be_bound_twice() {
        let registry = InProcRegistry::new();
        let _listener = registry.bind("svc").await.unwrap();
        let err = registry.bind("svc").await.unwrap_err();
        assert!(matches!(err, TellingError::PathTaken { .. }));
    }

    #[tokio::test]
    async fn connector_and_listener_exchange_envelopes() {
        let registry = InProcRegistry::new();
        let listener = registry.bind("echo").await.unwrap();

        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });
        let connector = registry.connect("echo").await.unwrap();
        let server_side = accept_task.await.unwrap();

        let mut writer = Writer::new();
        let envelope = writer.start_request(Method::Get, "/ping").unwrap().release().unwrap();
        connector.send(envelope).await.unwrap();

        let received = server_side.recv().await.unwrap();
        assert_eq!(received.header("Content-Length"), Some("0"));
    }
}
