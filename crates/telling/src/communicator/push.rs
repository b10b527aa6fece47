//! Push half of the push/pull pattern ("Push box", spec §4.5: "Push
//! ... box wraps a send queue"): fire-and-forget delivery with bounded
//! pipelining via [`SendQueue`](telling_core::prelude::SendQueue).

use std::sync::Arc;

use telling_core::prelude::{Envelope, Method, TellingError, TransportIo, Writer};

use crate::communicator::PassiveSendChannel;

pub struct PushBox {
    channel: PassiveSendChannel,
}

impl PushBox {
    pub fn new(io: Arc<dyn TransportIo>) -> Self {
        PushBox { channel: PassiveSendChannel::new(io) }
    }

    /// Enqueue `body` at `uri` for delivery. Returns as soon as the
    /// envelope is either sent or queued behind one already in
    /// flight; does not wait for the peer to consume it.
    pub async fn send(&self, uri: &str, body: impl Into<Vec<u8>>) -> Result<(), TellingError> {
        let mut writer = Writer::new();
        let envelope = writer.start_request(Method::Post, uri)?.body(&body.into())?.release()?;
        self.offer(envelope).await
    }

    pub async fn offer(&self, envelope: Envelope) -> Result<(), TellingError> {
        self.channel.offer(envelope).await
    }
}
