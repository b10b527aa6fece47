//! Communicator kinds (spec §4.5) and handler façades (spec §4.9):
//! the client- and service-facing API built on top of
//! `telling-core`'s driver and `telling-transport`'s transport
//! collaborators.
//!
//! - [`communicator::RequestBox`] / [`communicator::Reply`] / [`communicator::ReplyBox`] — request/reply.
//! - [`communicator::PushBox`] / [`communicator::PullBox`] — push/pull.
//! - [`communicator::PublishBox`] / [`communicator::SubscribeBox`] — publish/subscribe.
//! - [`handler::ServiceHandler`], [`handler::ClientHandler`] / [`handler::ClientFacade`], [`handler::Reactor`] — C9.

pub mod communicator;
pub mod handler;

pub mod prelude {
    pub use crate::communicator::{PublishBox, PullBox, PushBox, Reply, ReplyBox, RequestBox, SubscribeBox};
    pub use crate::handler::{ClientFacade, ClientHandler, Reactor, ServiceHandler};
}
