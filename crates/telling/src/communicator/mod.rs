//! Communicator kinds (spec §4.5): typed façades over one
//! [`telling_core::driver`] pair, one per messaging pattern. Each kind
//! pairs a transport connection with the driver state machine that
//! fits its traffic shape: request/reply correlates replies to the
//! order requests were sent in, push/pull and publish/subscribe just
//! move envelopes in one direction.

pub mod publish;
pub mod pull;
pub mod push;
pub mod reply;
pub mod request;
pub mod subscribe;

pub use publish::PublishBox;
pub use pull::PullBox;
pub use push::PushBox;
pub use reply::{Reply, ReplyBox};
pub use request::RequestBox;
pub use subscribe::SubscribeBox;

use std::sync::Arc;

use telling_core::prelude::{AsyncSend, Envelope, LifeLocked, SendDriver, TellingError, TransportIo};

/// A send-loop handler that never has anything of its own to offer;
/// every envelope it sends arrives externally through
/// [`telling_core::driver::SendDriver::offer`]. This is the shape
/// push, publish and request communicators all need: "send whatever
/// I'm handed, in order, one at a time."
pub(crate) struct PassiveSend;

#[async_trait::async_trait]
impl AsyncSend for PassiveSend {
    async fn on_prepare(&self) -> Option<Envelope> {
        None
    }
}

/// Pairs a [`SendDriver`] with the life-locked handler slot it holds
/// a weak reference into, so the two stay alive and torn down
/// together. `PassiveSend` carries no data; the life-lock here exists
/// only to give the driver the same inline-handler discipline every
/// other communicator kind uses.
pub(crate) struct PassiveSendChannel {
    _handler: LifeLocked<PassiveSend>,
    driver: SendDriver<PassiveSend>,
}

impl PassiveSendChannel {
    pub(crate) fn new(io: Arc<dyn TransportIo>) -> Self {
        let handler = LifeLocked::new(PassiveSend);
        let driver = SendDriver::new(handler.weak(), io);
        PassiveSendChannel { _handler: handler, driver }
    }

    /// Offer `envelope` to the underlying [`SendDriver`]. A recoverable
    /// transport error (a send that merely timed out) is retried once
    /// rather than failing the caller outright, matching spec §4.4's
    /// send-loop behavior of re-arming on timeout instead of
    /// terminating; any other error is fatal and propagates.
    pub(crate) async fn offer(&self, envelope: Envelope) -> Result<(), TellingError> {
        match self.driver.offer(envelope.clone()).await {
            Ok(()) => Ok(()),
            Err(error) if !send_error_is_fatal(&error) => self.driver.offer(envelope).await,
            Err(error) => Err(error),
        }
    }
}

/// Whether a send error should abort the caller's `offer` rather than
/// be retried once (spec §4.4: only a timeout is recoverable for a
/// send-loop; everything else terminates it).
pub(crate) fn send_error_is_fatal(error: &TellingError) -> bool {
    !error.is_recoverable()
}

/// Header a [`Subscribe`] client uses to mutate its own filter set on
/// the peer [`Publish`] endpoint (spec §4.5: "Subscribe sets
/// transport options `SUB_SUBSCRIBE` / `SUB_UNSUBSCRIBE`"). Telling's
/// transport has no socket-option concept, so the option is carried
/// as an ordinary envelope header instead.
pub(crate) const SUB_OP_HEADER: &str = "X-Sub-Op";
pub(crate) const SUB_OP_SUBSCRIBE: &str = "subscribe";
pub(crate) const SUB_OP_UNSUBSCRIBE: &str = "unsubscribe";
