//! Tokio-backed TCP transport collaborator, built the way
//! `TcpChannel` is: a socket wrapped in async mutexes so `&self` methods
//! stay cheaply cloneable, with the read half and write half each
//! under their own lock so a driver's recv-loop and send-loop never
//! contend with each other.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use telling_core::message::{self, Writer};
use telling_core::prelude::{Envelope, ParseErrorKind, TellingError, TransportIo};

use crate::{Listener, TransportCollaborator};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TransportCollaborator for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn TransportIo>, TellingError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| TellingError::Transport(err.to_string()))?;
        debug!(%addr, "tcp transport connected");
        Ok(Arc::new(TcpConnection::new(stream)))
    }

    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TellingError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TellingError::Transport(err.to_string()))?;
        debug!(%addr, "tcp transport listening");
        Ok(Box::new(TcpListenerHandle { listener }))
    }
}

struct TcpListenerHandle {
    listener: TcpListener,
}

#[async_trait::async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&self) -> Result<Arc<dyn TransportIo>, TellingError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|err| TellingError::Transport(err.to_string()))?;
        debug!(%peer, "tcp transport accepted connection");
        Ok(Arc::new(TcpConnection::new(stream)))
    }
}

/// One connected socket, framed as Telling envelopes: a header region
/// terminated by a blank line, followed by exactly `Content-Length`
/// body bytes (defaulting to zero when absent).
struct TcpConnection {
    reader: AsyncMutex<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: AsyncMutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        TcpConnection {
            reader: AsyncMutex::new(BufReader::new(read_half)),
            writer: AsyncMutex::new(write_half),
        }
    }
}

#[async_trait::async_trait]
impl TransportIo for TcpConnection {
    async fn recv(&self) -> Result<Envelope, TellingError> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        loop {
            let before = buf.len();
            let n = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|err| TellingError::Transport(err.to_string()))?;
            if n == 0 {
                return Err(TellingError::Closed);
            }
            let line = &buf[before..];
            if line == b"\r\n" || line == b"\n" {
                break;
            }
            if buf.len() > message::MAX_HEADER_REGION {
                return Err(TellingError::parse(ParseErrorKind::HeaderTooBig, 0..buf.len()));
            }
        }

        let content_length = header_content_length(&buf);
        if content_length > 0 {
            let body_start = buf.len();
            buf.resize(body_start + content_length, 0);
            reader
                .read_exact(&mut buf[body_start..])
                .await
                .map_err(|err| TellingError::Transport(err.to_string()))?;
        }

        message::parse(&buf)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TellingError> {
        let wire = Writer::encode(&envelope);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&wire)
            .await
            .map_err(|err| {
                warn!(error = %err, "tcp send failed");
                TellingError::Transport(err.to_string())
            })?;
        writer.flush().await.map_err(|err| TellingError::Transport(err.to_string()))
    }
}

fn header_content_length(header_region: &[u8]) -> usize {
    let text = String::from_utf8_lossy(header_region);
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if let Some(rest) = line
            .split_once(':')
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
            .map(|(_, value)| value.trim())
        {
            return rest.parse().unwrap_or(0);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_content_length_case_insensitively() {
        let header = b"GET / Tell/0\r\ncontent-length: 12\r\n\r\n";
        assert_eq!(header_content_length(header), 12);
    }

    #[test]
    fn missing_content_length_defaults_to_zero() {
        let header = b"GET / Tell/0\r\n\r\n";
        assert_eq!(header_content_length(header), 0);
    }
}
