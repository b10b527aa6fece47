//! Hosts the broker as a standalone process. Reads its base address
//! and timeouts from `TELLING_*` environment variables (no config file
//! format here, just env vars) and installs a `tracing_subscriber::fmt`
//! layer driven by `RUST_LOG`, matching the pattern the pack's adapter
//! test binaries use.

use std::sync::Arc;
use std::time::Duration;

use telling_broker::{Broker, BrokerConfig};
use telling_core::prelude::Address;
use telling_transport::Transport;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    install_tracing();

    let config = config_from_env();
    tracing::info!(base = %config.base(), "starting telling broker");

    let transport = Arc::new(Transport::new());
    let broker = match Broker::open(transport, config).await {
        Ok(broker) => broker,
        Err(error) => {
            tracing::error!(%error, "failed to open broker");
            std::process::exit(1);
        }
    };

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to install ctrl-c handler, broker will run until killed");
        std::future::pending::<()>().await;
    }

    tracing::info!(enlisted = broker.route_count(), "shutting down");
    drop(broker);
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `TELLING_BASE` names the broker's base address, one of:
/// - `inproc:<name>`
/// - `ipc:<path>`
/// - `tcp:<host>:<port>`
///
/// Defaults to `inproc:telling` so the binary is runnable with no
/// configuration at all. `TELLING_DIAL_TIMEOUT_MS`,
/// `TELLING_LISTEN_TIMEOUT_MS`, `TELLING_MANAGEMENT_QUEUE_CAPACITY` and
/// `TELLING_BURST_THRESHOLD` override the matching `BrokerConfig`
/// builder methods; any unset or unparseable variable falls back to
/// the builder's own default.
fn config_from_env() -> BrokerConfig {
    let base = parse_base(&env_or("TELLING_BASE", "inproc:telling"));
    let mut config = BrokerConfig::new(base);

    if let Some(ms) = env_u64("TELLING_DIAL_TIMEOUT_MS") {
        config = config.with_dial_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = env_u64("TELLING_LISTEN_TIMEOUT_MS") {
        config = config.with_listen_timeout(Duration::from_millis(ms));
    }
    if let Some(capacity) = env_usize("TELLING_MANAGEMENT_QUEUE_CAPACITY") {
        config = config.with_management_queue_capacity(capacity);
    }
    if let Some(threshold) = env_usize("TELLING_BURST_THRESHOLD") {
        config = config.with_burst_threshold(threshold);
    }
    config
}

fn parse_base(raw: &str) -> Address {
    match raw.split_once(':') {
        Some(("inproc", name)) => Address::InProc { name: name.to_string() },
        Some(("ipc", path)) => Address::Ipc { path: path.to_string() },
        Some(("tcp", rest)) => match rest.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => Address::Tcp { host: host.to_string(), port },
                Err(_) => {
                    tracing::warn!(raw, "TELLING_BASE has a non-numeric tcp port, falling back to inproc:telling");
                    Address::InProc { name: "telling".to_string() }
                }
            },
            None => {
                tracing::warn!(raw, "TELLING_BASE tcp scheme needs host:port, falling back to inproc:telling");
                Address::InProc { name: "telling".to_string() }
            }
        },
        _ => {
            tracing::warn!(raw, "unrecognized TELLING_BASE scheme, falling back to inproc:telling");
            Address::InProc { name: "telling".to_string() }
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_base_scheme() {
        assert_eq!(parse_base("inproc:broker"), Address::InProc { name: "broker".into() });
        assert_eq!(parse_base("ipc:/tmp/broker"), Address::Ipc { path: "/tmp/broker".into() });
        assert_eq!(parse_base("tcp:127.0.0.1:9000"), Address::Tcp { host: "127.0.0.1".into(), port: 9000 });
    }

    #[test]
    fn unrecognized_scheme_falls_back_to_default_inproc() {
        assert_eq!(parse_base("nonsense"), Address::InProc { name: "telling".into() });
    }
}
