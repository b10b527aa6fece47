//! Management task (spec §4.7): consumes `route_open`/`route_close`
//! work items and is the only place the routing trie is mutated,
//! matching spec §5's "insertion and deletion occur only on the
//! management thread, under a mutex shared with lookups." Dialing
//! happens here, never while holding the trie's lock, per spec §5's
//! deadlock-avoidance rule.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use telling::communicator::PublishBox;
use telling_core::prelude::{Status, Writer};
use telling_transport::Transport;

use crate::config::BrokerConfig;
use crate::registry::{Departure, EnlistRequest, Registry};
use crate::router::{Route, RoutingTable};

const SERVICES_URI: &str = "*services";

fn bulletin(status: Status, prefix: &str) -> telling_core::prelude::Envelope {
    let mut writer = Writer::new();
    writer.start_report(SERVICES_URI, Some(status), None).unwrap().body(prefix.as_bytes()).unwrap().release().unwrap()
}

fn synth_reply(status: Status, body: &str) -> telling_core::prelude::Envelope {
    let mut writer = Writer::new();
    writer.start_reply(status, None).unwrap().body(body.as_bytes()).unwrap().release().unwrap()
}

/// Runs until both the enlist and departure channels close, which
/// happens when every sender (the registration listener's connections
/// and the broker itself) has been dropped.
pub async fn run_management_task(
    transport: Arc<Transport>,
    routes: Arc<RoutingTable>,
    registry: Arc<Registry>,
    config: Arc<BrokerConfig>,
    external_publish: Arc<PublishBox>,
    mut enlist_rx: mpsc::Receiver<EnlistRequest>,
    mut departure_rx: mpsc::Receiver<Departure>,
) {
    loop {
        tokio::select! {
            request = enlist_rx.recv() => {
                match request {
                    Some(request) => open_route(&transport, &routes, &config, &external_publish, request).await,
                    None if departure_rx.is_closed() => return,
                    None => continue,
                }
            }
            departure = departure_rx.recv() => {
                match departure {
                    Some(departure) => close_route(&routes, &registry, &external_publish, departure).await,
                    None if enlist_rx.is_closed() => return,
                    None => continue,
                }
            }
        }
    }
}

async fn open_route(
    transport: &Arc<Transport>,
    routes: &Arc<RoutingTable>,
    config: &Arc<BrokerConfig>,
    external_publish: &Arc<PublishBox>,
    request: EnlistRequest,
) {
    match Route::open(transport, &request.prefix, external_publish.clone(), config).await {
        Ok(route) => {
            info!(prefix = %request.prefix, "service enlisted");
            routes.insert(&request.prefix, Arc::new(route));
            let reply = synth_reply(Status::CREATED, &format!("{} enrolled", request.prefix));
            let _ = request.reply_to.send(Ok(reply));
            if let Err(error) = external_publish.publish_envelope(SERVICES_URI, bulletin(Status::CREATED, &request.prefix)).await {
                warn!(?error, prefix = %request.prefix, "failed to publish Created bulletin");
            }
        }
        Err(error) => {
            warn!(?error, prefix = %request.prefix, "failed to dial newly enlisted service back");
            let _ = request.reply_to.send(Err(error));
        }
    }
}

async fn close_route(routes: &Arc<RoutingTable>, registry: &Arc<Registry>, external_publish: &Arc<PublishBox>, departure: Departure) {
    registry.release(&departure.prefix);
    if routes.remove(&departure.prefix).is_none() {
        return;
    }
    info!(prefix = %departure.prefix, "service departed");
    if let Err(error) = external_publish.publish_envelope(SERVICES_URI, bulletin(Status::GONE, &departure.prefix)).await {
        warn!(?error, prefix = %departure.prefix, "failed to publish Gone bulletin");
    }
}
