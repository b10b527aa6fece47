//! Transport collaborators: the socket/context/AIO boundary spec §6
//! describes, implemented once over Tokio TCP and once over
//! in-process channels. Both hand back a [`telling_core::driver::TransportIo`],
//! which is all the driver state machines in `telling-core` know about.

pub mod inproc;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use telling_core::prelude::{Address, TellingError, TransportIo};

pub use inproc::{InProcConnection, InProcListener, InProcRegistry};
pub use tcp::TcpTransport;

/// A transport that can both dial out and accept inbound connections.
#[async_trait::async_trait]
pub trait TransportCollaborator: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn TransportIo>, TellingError>;
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TellingError>;
}

/// A bound endpoint accepting one connection per call.
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Arc<dyn TransportIo>, TellingError>;
}

/// Dials or binds a [`telling_core::address::Address`] regardless of
/// which transport variant it names, dispatching to the TCP or
/// in-process backend underneath. This is the collaborator the broker
/// and any multi-address participant (spec §4.8: "clients, services,
/// and the broker all apply the same formula") actually hold, since
/// none of them know ahead of time whether a derived address is a TCP
/// endpoint or an in-process one.
#[derive(Clone, Default)]
pub struct Transport {
    inproc: InProcRegistry,
    tcp: Arc<TcpTransport>,
}

impl Transport {
    pub fn new() -> Self {
        Transport { inproc: InProcRegistry::new(), tcp: Arc::new(TcpTransport::new()) }
    }

    pub async fn dial(&self, address: &Address) -> Result<Arc<dyn TransportIo>, TellingError> {
        match address {
            Address::Tcp { host, port } => {
                let socket_addr = parse_socket_addr(host, *port)?;
                self.tcp.connect(socket_addr).await
            }
            Address::InProc { name } | Address::Ipc { path: name } => {
                Ok(Arc::new(self.inproc.connect(name).await?))
            }
        }
    }

    pub async fn bind(&self, address: &Address) -> Result<Box<dyn Listener>, TellingError> {
        match address {
            Address::Tcp { host, port } => {
                let socket_addr = parse_socket_addr(host, *port)?;
                self.tcp.listen(socket_addr).await
            }
            Address::InProc { name } | Address::Ipc { path: name } => {
                Ok(Box::new(self.inproc.bind(name).await?))
            }
        }
    }
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, TellingError> {
    format!("{host}:{port}")
        .parse()
        .map_err(|err| TellingError::Transport(format!("invalid tcp address {host}:{port}: {err}")))
}
