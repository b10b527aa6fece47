//! Broker configuration (ambient stack addition; spec.md has no
//! configuration surface of its own). Builder-style, mirroring
//! `spark-transport-tcp::TcpSocketConfig`'s `with_*` shape.

use std::time::Duration;

use telling_core::prelude::Address;

/// Default trie burst threshold named in spec §4.7. This rewrite's
/// trie is a plain segment-keyed tree rather than a burst-splitting
/// radix structure, so the value is carried for API fidelity and
/// surfaced via [`BrokerConfig::burst_threshold`] but only used to
/// pre-size a route's children map — see `DESIGN.md`.
pub const DEFAULT_BURST_THRESHOLD: usize = 256;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MANAGEMENT_QUEUE_CAPACITY: usize = 256;

/// Configuration for [`crate::Broker::open`]: the base address every
/// per-pattern endpoint is derived from (spec §3, §4.8), plus the
/// timeouts and queue sizing the management task uses.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    base: Address,
    dial_timeout: Duration,
    listen_timeout: Duration,
    management_queue_capacity: usize,
    burst_threshold: usize,
}

impl BrokerConfig {
    pub fn new(base: Address) -> Self {
        BrokerConfig {
            base,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            management_queue_capacity: DEFAULT_MANAGEMENT_QUEUE_CAPACITY,
            burst_threshold: DEFAULT_BURST_THRESHOLD,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = timeout;
        self
    }

    pub fn with_management_queue_capacity(mut self, capacity: usize) -> Self {
        self.management_queue_capacity = capacity;
        self
    }

    pub fn with_burst_threshold(mut self, threshold: usize) -> Self {
        self.burst_threshold = threshold;
        self
    }

    pub fn base(&self) -> &Address {
        &self.base
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn listen_timeout(&self) -> Duration {
        self.listen_timeout
    }

    pub fn management_queue_capacity(&self) -> usize {
        self.management_queue_capacity
    }

    pub fn burst_threshold(&self) -> usize {
        self.burst_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_burst_threshold() {
        let config = BrokerConfig::new(Address::InProc { name: "telling".into() });
        assert_eq!(config.burst_threshold(), 256);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = BrokerConfig::new(Address::InProc { name: "telling".into() })
            .with_dial_timeout(Duration::from_millis(50))
            .with_burst_threshold(64);
        assert_eq!(config.dial_timeout(), Duration::from_millis(50));
        assert_eq!(config.burst_threshold(), 64);
    }
}
