//! The routing broker (spec §4.7, §6 "Broker lifecycle"): binds one
//! external socket per pattern plus a dedicated registration channel,
//! and runs the management task that is the only place the routing
//! trie is mutated.
//!
//! Client traffic enters through three listeners:
//! - the request/reply listener, where every accepted connection gets
//!   its own [`telling::communicator::Reply`] driven by [`BrokerRouter`]
//!   (the "device relay" spec §4.7 describes as a socket-level splice
//!   is implemented here as the explicit forward loop spec §4.9
//!   explicitly allows in place of a transport-native device);
//! - the push/pull listener, where every connection gets a
//!   [`telling::communicator::PullBox`] whose arrivals are dispatched by
//!   [`dispatch_push`];
//! - the publish/subscribe listener, owned directly by a
//!   [`telling::communicator::PublishBox`] that fans out both service
//!   publications (relayed by each [`Route`]) and `*services`
//!   bulletins.
//!
//! Service registration arrives on a fourth, dedicated listener
//! (spec §2 C7) handled by [`registry::run_registration_listener`].

pub mod config;
pub mod management;
pub mod registry;
pub mod router;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use telling::communicator::{PublishBox, PullBox, Reply};
use telling_core::prelude::{Address, Pattern, TellingError};
use telling_transport::Transport;

pub use config::BrokerConfig;
pub use registry::Registry;
pub use router::{BrokerRouter, Route, RoutingTable};

/// Everything the broker owns for as long as it's open: the four
/// accept loops, the management task, and the shared routing/registry
/// state they all read or mutate. Dropping a `Broker` tears all of it
/// down (spec §6 "implicit teardown on destruction").
pub struct Broker {
    routes: Arc<RoutingTable>,
    registry: Arc<Registry>,
    external_publish: Arc<PublishBox>,
    request_accept_task: tokio::task::JoinHandle<()>,
    push_accept_task: tokio::task::JoinHandle<()>,
    registration_task: tokio::task::JoinHandle<()>,
    management_task: tokio::task::JoinHandle<()>,
}

impl Broker {
    /// Bind every external listener derived from `config`'s base
    /// address and start accepting. Mirrors spec §6's "Create with
    /// logger and identifier -> `open(base)` to listen"; the logger is
    /// `tracing`'s ambient subscriber rather than an injected object,
    /// matching how every other Telling crate logs.
    ///
    /// Takes `transport` rather than constructing one internally
    /// because a registered service's dial-back address is always an
    /// in-process name (spec §4.6: "the service's base URI prefix
    /// (in-process name)") — the host process composing a broker with
    /// its own same-process services must bind those services against
    /// the identical [`Transport`]/in-process registry this broker
    /// dials through, which is only possible if both share one
    /// instance.
    pub async fn open(transport: Arc<Transport>, config: BrokerConfig) -> Result<Broker, TellingError> {
        let base = config.base().clone();
        let config = Arc::new(config);

        let request_addr = Address::derive(&base, Pattern::RequestReply);
        let push_addr = Address::derive(&base, Pattern::PushPull);
        let pub_addr = Address::derive(&base, Pattern::PublishSubscribe);
        let registration_addr = Address::registration(&base);

        let request_listener = bind(&transport, &request_addr, &config).await?;
        let push_listener = bind(&transport, &push_addr, &config).await?;
        let pub_listener = bind(&transport, &pub_addr, &config).await?;
        let registration_listener = bind(&transport, &registration_addr, &config).await?;

        info!(%request_addr, %push_addr, %pub_addr, %registration_addr, "broker listening");

        let routes = Arc::new(RoutingTable::new(config.burst_threshold()));
        let registry = Arc::new(Registry::new());
        let external_publish = Arc::new(PublishBox::new(pub_listener));

        let router_handler = Arc::new(BrokerRouter::new(routes.clone()));
        let request_accept_task = tokio::spawn(accept_requests(request_listener, router_handler));

        let push_routes = routes.clone();
        let push_accept_task = tokio::spawn(accept_pushes(push_listener, push_routes));

        let (enlist_tx, enlist_rx) = mpsc::channel(config.management_queue_capacity());
        let (departure_tx, departure_rx) = mpsc::channel(config.management_queue_capacity());
        let registration_task = tokio::spawn(registry::run_registration_listener(
            registration_listener,
            registry.clone(),
            enlist_tx,
            departure_tx.clone(),
        ));

        let management_task = tokio::spawn(management::run_management_task(
            transport,
            routes.clone(),
            registry.clone(),
            config,
            external_publish.clone(),
            enlist_rx,
            departure_rx,
        ));

        Ok(Broker {
            routes,
            registry,
            external_publish,
            request_accept_task,
            push_accept_task,
            registration_task,
            management_task,
        })
    }

    /// Number of currently enlisted services. Exposed for tests and
    /// operational introspection; not part of the wire protocol. Reads
    /// the registry rather than the trie, since every installed Route
    /// has a corresponding registry entry for at least as long as the
    /// Route exists.
    pub fn route_count(&self) -> usize {
        self.registry.len()
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn subscriber_count(&self) -> usize {
        self.external_publish.subscriber_count()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.request_accept_task.abort();
        self.push_accept_task.abort();
        self.registration_task.abort();
        self.management_task.abort();
    }
}

/// Bind one external listener, bounded by `config`'s listen timeout
/// (mirrors [`router::dial`]'s dial-timeout wrapping on the client
/// side of the same config).
async fn bind(
    transport: &Transport,
    address: &Address,
    config: &BrokerConfig,
) -> Result<Box<dyn telling_transport::Listener>, TellingError> {
    timeout(config.listen_timeout(), transport.bind(address)).await.map_err(|_| TellingError::TimedOut)?
}

async fn accept_requests(listener: Box<dyn telling_transport::Listener>, handler: Arc<BrokerRouter>) {
    loop {
        match listener.accept().await {
            Ok(io) => {
                let reply = Reply::new(io, handler.clone());
                // Run this connection's recv-loop on its own task so
                // accepting the next connection isn't blocked; the
                // task (and the Reply it owns) exits once the peer
                // disconnects.
                tokio::spawn(reply.run_until_closed());
            }
            Err(error) => {
                warn!(?error, "request listener stopped accepting");
                return;
            }
        }
    }
}

async fn accept_pushes(listener: Box<dyn telling_transport::Listener>, routes: Arc<RoutingTable>) {
    loop {
        match listener.accept().await {
            Ok(io) => {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let pull = PullBox::new(io);
                    while let Some(envelope) = pull.recv().await {
                        router::dispatch_push(&routes, envelope).await;
                    }
                });
            }
            Err(error) => {
                warn!(?error, "push listener stopped accepting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_binds_every_external_listener() {
        let base = Address::InProc { name: format!("telling-test-{}", std::process::id()) };
        let transport = Arc::new(Transport::new());
        let broker = Broker::open(transport, BrokerConfig::new(base)).await.unwrap();
        assert_eq!(broker.route_count(), 0);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
