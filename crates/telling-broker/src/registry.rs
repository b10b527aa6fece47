//! Registration protocol (spec §4.6): service enlistment over
//! request/reply at the reserved URI `*services`, plus liveness
//! tracking. Handled by a bespoke recv loop rather than the generic
//! `telling::communicator::Reply`, because enlistment needs a
//! connection-closed signal (to detect a service's departure) that
//! `ServiceHandler` has no hook for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use telling_core::prelude::{Envelope, Method, StartLine, Status, TellingError, TransportIo, Writer};
use telling_transport::Listener;

const SERVICES_URI: &str = "*services";

/// A registered service's bookkeeping state (spec §3 "Registration
/// entry"). The Route handle itself lives in the `RoutingTable`; this
/// only tracks which prefixes are claimed, to reject double
/// registration before dialing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Requested,
    Enlisted,
}

/// A parsed enlistment ready for the management task to act on. The
/// registration connection blocks on `reply_to` until a Route has
/// been opened (or failed), since the enlist reply must carry the
/// real outcome, not just "accepted".
pub struct EnlistRequest {
    pub prefix: String,
    pub reply_to: oneshot::Sender<Result<Envelope, TellingError>>,
}

/// Sent when a registration connection closes, i.e. the registering
/// service's pipe goes down (spec §4.6 "Liveness": "On remove-post,
/// ... the associated route is scheduled for destruction").
pub struct Departure {
    pub prefix: String,
}

/// Tracks claimed prefixes so a second enlistment for the same prefix
/// is rejected with 409 before any dialing happens. Guarded by one
/// mutex, matching spec §5's "registration maps are guarded by the
/// same mutex" as the routing trie.
#[derive(Default)]
pub struct Registry {
    prefixes: Mutex<HashMap<String, RegistrationStatus>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { prefixes: Mutex::new(HashMap::new()) }
    }

    fn try_reserve(&self, prefix: &str) -> bool {
        let mut map = self.prefixes.lock().unwrap();
        if map.contains_key(prefix) {
            false
        } else {
            map.insert(prefix.to_string(), RegistrationStatus::Requested);
            true
        }
    }

    fn mark_enlisted(&self, prefix: &str) {
        if let Some(status) = self.prefixes.lock().unwrap().get_mut(prefix) {
            *status = RegistrationStatus::Enlisted;
        }
    }

    pub fn release(&self, prefix: &str) {
        self.prefixes.lock().unwrap().remove(prefix);
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.prefixes.lock().unwrap().contains_key(prefix)
    }

    pub fn len(&self) -> usize {
        self.prefixes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The body of an enlist request is two lines: the service's base URI
/// prefix, then reserved configuration (currently ignored).
fn parse_enlist_body(body: &[u8]) -> Result<String, TellingError> {
    let text = std::str::from_utf8(body).map_err(|_| TellingError::state("enlist body is not valid utf-8"))?;
    let prefix = text.lines().next().unwrap_or("");
    if prefix.is_empty() {
        return Err(TellingError::state("enlist body missing a URI prefix line"));
    }
    Ok(prefix.to_string())
}

fn synth_reply(status: Status, body: &str) -> Envelope {
    let mut writer = Writer::new();
    writer.start_reply(status, None).unwrap().body(body.as_bytes()).unwrap().release().unwrap()
}

/// Accepts registration connections from `listener` indefinitely. Each
/// connection gets its own recv loop; when that loop ends, any prefix
/// it enlisted is released and reported as a [`Departure`].
pub async fn run_registration_listener(
    listener: Box<dyn Listener>,
    registry: Arc<Registry>,
    enlist_tx: mpsc::Sender<EnlistRequest>,
    departure_tx: mpsc::Sender<Departure>,
) {
    loop {
        match listener.accept().await {
            Ok(io) => {
                let registry = registry.clone();
                let enlist_tx = enlist_tx.clone();
                let departure_tx = departure_tx.clone();
                tokio::spawn(run_registration_connection(io, registry, enlist_tx, departure_tx));
            }
            Err(error) => {
                warn!(?error, "registration listener stopped accepting");
                return;
            }
        }
    }
}

async fn run_registration_connection(
    io: Arc<dyn TransportIo>,
    registry: Arc<Registry>,
    enlist_tx: mpsc::Sender<EnlistRequest>,
    departure_tx: mpsc::Sender<Departure>,
) {
    let mut enlisted_prefix: Option<String> = None;

    loop {
        let envelope = match io.recv().await {
            Ok(envelope) => envelope,
            Err(error) => {
                if !matches!(error, TellingError::Closed) {
                    warn!(?error, "registration connection error");
                }
                break;
            }
        };

        let reply = handle_one(&envelope, &registry, &enlist_tx, &mut enlisted_prefix).await;
        if let Err(error) = io.send(reply).await {
            warn!(?error, "failed to send enlist reply");
            break;
        }
    }

    if let Some(prefix) = enlisted_prefix {
        registry.release(&prefix);
        let _ = departure_tx.send(Departure { prefix }).await;
    }
}

async fn handle_one(
    envelope: &Envelope,
    registry: &Arc<Registry>,
    enlist_tx: &mpsc::Sender<EnlistRequest>,
    enlisted_prefix: &mut Option<String>,
) -> Envelope {
    let (method, uri) = match &envelope.start_line {
        StartLine::Request { method, uri, .. } => (*method, uri.as_str()),
        _ => return synth_reply(Status::BAD_REQUEST, "expected a request envelope"),
    };

    if uri != SERVICES_URI {
        return synth_reply(Status::NOT_FOUND, &format!("URI not {SERVICES_URI}"));
    }
    if method != Method::Post {
        return synth_reply(Status::NOT_IMPLEMENTED, "enlistment requires POST");
    }

    let prefix = match parse_enlist_body(&envelope.body) {
        Ok(prefix) => prefix,
        Err(error) => return synth_reply(Status::BAD_REQUEST, &error.to_string()),
    };

    if !registry.try_reserve(&prefix) {
        return synth_reply(Status::CONFLICT, &format!("{prefix} already registered"));
    }

    let (reply_to, rx) = oneshot::channel();
    if enlist_tx.send(EnlistRequest { prefix: prefix.clone(), reply_to }).await.is_err() {
        registry.release(&prefix);
        return synth_reply(Status::SERVICE_UNAVAILABLE, "broker is shutting down");
    }

    match rx.await {
        Ok(Ok(reply)) => {
            registry.mark_enlisted(&prefix);
            *enlisted_prefix = Some(prefix);
            reply
        }
        Ok(Err(error)) => {
            registry.release(&prefix);
            synth_reply(Status::SERVICE_UNAVAILABLE, &format!("could not dial {prefix} back: {error}"))
        }
        Err(_) => {
            registry.release(&prefix);
            synth_reply(Status::SERVICE_UNAVAILABLE, "management task dropped the enlist request")
        }
    }
}
