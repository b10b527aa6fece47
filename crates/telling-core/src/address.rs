//! Address model: deterministic URI/endpoint derivation per transport
//! and communicator pattern (spec §4.8).

use std::fmt;

/// Which communicator pattern an address is being derived for. The
/// index within this list is what TCP addressing adds to the base
/// port; in-process and IPC addressing use it to pick a suffix
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    RequestReply,
    PublishSubscribe,
    PushPull,
}

impl Pattern {
    fn port_offset(self) -> u16 {
        match self {
            Pattern::RequestReply => 0,
            Pattern::PublishSubscribe => 1,
            Pattern::PushPull => 2,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Pattern::RequestReply => "req",
            Pattern::PublishSubscribe => "sub",
            Pattern::PushPull => "push",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    InProc { name: String },
    Ipc { path: String },
    Tcp { host: String, port: u16 },
}

impl Address {
    /// Derive the concrete address a communicator of `pattern` should
    /// bind/connect to, given a base address that names only the
    /// broker/service (no pattern-specific detail yet).
    pub fn derive(base: &Address, pattern: Pattern) -> Address {
        match base {
            Address::InProc { name } => Address::InProc { name: format!("{name}.{}", pattern.suffix()) },
            Address::Ipc { path } => Address::Ipc { path: format!("{path}.{}", pattern.suffix()) },
            Address::Tcp { host, port } => {
                Address::Tcp { host: host.clone(), port: port + pattern.port_offset() }
            }
        }
    }
}

impl Address {
    /// The broker's dedicated enlistment channel (spec §2 C7: "managing
    /// service registration over a dedicated request/reply channel").
    /// Kept separate from the client-facing request/reply address so
    /// the registration listener can tell a service's connection apart
    /// from an ordinary client's without inspecting the first request.
    pub fn registration(base: &Address) -> Address {
        match base {
            Address::InProc { name } => Address::InProc { name: format!("{name}.services") },
            Address::Ipc { path } => Address::Ipc { path: format!("{path}.services") },
            Address::Tcp { host, port } => Address::Tcp { host: host.clone(), port: port + 3 },
        }
    }

    /// Map a registered service's routing prefix onto the in-process
    /// address the broker dials to reach that service directly (spec
    /// §4.7's management thread "dials a newly enlisted service's
    /// sockets"). The registration body only carries a URI prefix, so
    /// this rewrite reuses it as the dial name: strip the leading `/`
    /// and fold the rest into a single token.
    pub fn from_prefix(prefix: &str) -> Address {
        let name = prefix.trim_start_matches('/').replace('/', "_");
        Address::InProc { name }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::InProc { name } => write!(f, "inproc://{name}"),
            Address::Ipc { path } => write!(f, "ipc://{path}"),
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_addresses_offset_by_pattern_index() {
        let base = Address::Tcp { host: "127.0.0.1".to_string(), port: 9000 };
        assert_eq!(Address::derive(&base, Pattern::RequestReply), Address::Tcp { host: "127.0.0.1".into(), port: 9000 });
        assert_eq!(Address::derive(&base, Pattern::PublishSubscribe), Address::Tcp { host: "127.0.0.1".into(), port: 9001 });
        assert_eq!(Address::derive(&base, Pattern::PushPull), Address::Tcp { host: "127.0.0.1".into(), port: 9002 });
    }

    #[test]
    fn inproc_and_ipc_addresses_use_suffixes() {
        let inproc = Address::InProc { name: "broker".to_string() };
        assert_eq!(Address::derive(&inproc, Pattern::PublishSubscribe), Address::InProc { name: "broker.sub".into() });

        let ipc = Address::Ipc { path: "/tmp/broker".to_string() };
        assert_eq!(Address::derive(&ipc, Pattern::PushPull), Address::Ipc { path: "/tmp/broker.push".into() });
    }

    #[test]
    fn registration_address_is_distinct_from_every_pattern() {
        let base = Address::Tcp { host: "127.0.0.1".into(), port: 9000 };
        let registration = Address::registration(&base);
        assert_eq!(registration, Address::Tcp { host: "127.0.0.1".into(), port: 9003 });
        for pattern in [Pattern::RequestReply, Pattern::PublishSubscribe, Pattern::PushPull] {
            assert_ne!(registration, Address::derive(&base, pattern));
        }

        let inproc = Address::InProc { name: "telling".into() };
        assert_eq!(Address::registration(&inproc), Address::InProc { name: "telling.services".into() });
    }

    #[test]
    fn from_prefix_strips_leading_slash_and_folds_segments() {
        assert_eq!(Address::from_prefix("/voices"), Address::InProc { name: "voices".into() });
        assert_eq!(Address::from_prefix("/a/b"), Address::InProc { name: "a_b".into() });
    }

    #[test]
    fn display_matches_uri_scheme() {
        assert_eq!(Address::Tcp { host: "h".into(), port: 1 }.to_string(), "tcp://h:1");
        assert_eq!(Address::InProc { name: "n".into() }.to_string(), "inproc://n");
        assert_eq!(Address::Ipc { path: "p".into() }.to_string(), "ipc://p");
    }
}
