//! Three-phase envelope writer: `start*` fixes the start-line, then
//! any number of `header` calls, then `body`/`release` seals the
//! message. Mirrors the original layout's single-pass buffer builder
//! (`msg_view.cpp`'s writer side) but keeps everything owned instead
//! of writing into a shared arena.

use bytes::Bytes;

use crate::error::{ParseErrorKind, TellingError};
use crate::message::method::Method;
use crate::message::parser::{Envelope, StartLine};
use crate::message::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Empty,
    StartWritten,
    HeadersWritten,
    /// `body` has been called at least once (or `release` is about to
    /// be): the header region is sealed and no further `header` calls
    /// are accepted (spec §4.2 rule 3, "thereafter headers are
    /// sealed").
    BodyWritten,
}

/// Builds one [`Envelope`] from scratch. Reusable: `release` resets
/// the writer back to `Empty` and hands back the assembled message.
pub struct Writer {
    phase: Phase,
    start_line: Option<StartLine>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    reserved_length_width: Option<usize>,
}

impl Writer {
    pub fn new() -> Self {
        Writer {
            phase: Phase::Empty,
            start_line: None,
            headers: Vec::new(),
            body: Vec::new(),
            reserved_length_width: None,
        }
    }

    /// Reserve a fixed-width decimal `Content-Length` field instead of
    /// letting `release` size it to the final body exactly (spec
    /// §4.2 "Length header"). `release` back-fills the digits at that
    /// point; if the body's decimal length needs more digits than
    /// `width`, `release` fails rather than silently growing the
    /// field.
    pub fn reserve_content_length(&mut self, width: usize) -> Result<&mut Self, TellingError> {
        if self.phase == Phase::Empty {
            return Err(TellingError::state("length reserved before start line"));
        }
        self.reserved_length_width = Some(width);
        Ok(self)
    }

    fn check_empty(&self) -> Result<(), TellingError> {
        if self.phase != Phase::Empty {
            return Err(TellingError::parse(ParseErrorKind::AlreadyWritten, 0..0));
        }
        Ok(())
    }

    pub fn start_request(&mut self, method: Method, uri: impl Into<String>) -> Result<&mut Self, TellingError> {
        self.check_empty()?;
        self.start_line = Some(StartLine::Request {
            method,
            uri: uri.into(),
            protocol: Some("Tell/0".to_string()),
        });
        self.phase = Phase::StartWritten;
        Ok(self)
    }

    pub fn start_reply(&mut self, status: Status, reason: Option<String>) -> Result<&mut Self, TellingError> {
        self.check_empty()?;
        self.start_line = Some(StartLine::Reply {
            protocol: Some("Tell/0".to_string()),
            status,
            reason: reason.or_else(|| Some(status.reason_phrase().to_string())),
        });
        self.phase = Phase::StartWritten;
        Ok(self)
    }

    pub fn start_report(
        &mut self,
        uri: impl Into<String>,
        status: Option<Status>,
        reason: Option<String>,
    ) -> Result<&mut Self, TellingError> {
        self.check_empty()?;
        self.start_line = Some(StartLine::Report {
            uri: uri.into(),
            protocol: Some("Tell/0".to_string()),
            status,
            reason,
        });
        self.phase = Phase::StartWritten;
        Ok(self)
    }

    /// Append one header. Rejects control characters that would let a
    /// caller smuggle an extra line or start-line into the header
    /// region.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<&mut Self, TellingError> {
        if self.phase == Phase::Empty {
            return Err(TellingError::state("header written before start line"));
        }
        if self.phase == Phase::BodyWritten {
            return Err(TellingError::parse(ParseErrorKind::AlreadyWritten, 0..0));
        }
        let name = name.into();
        let value = value.into();
        if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
            return Err(TellingError::parse(ParseErrorKind::HeaderMalformed, 0..0));
        }
        self.headers.push((name, value));
        self.phase = Phase::HeadersWritten;
        Ok(self)
    }

    /// Append to the body. May be called repeatedly before `release`;
    /// the first call seals the header region (spec §4.2 rule 3).
    pub fn body(&mut self, bytes: &[u8]) -> Result<&mut Self, TellingError> {
        if self.phase == Phase::Empty {
            return Err(TellingError::state("body written before start line"));
        }
        self.body.extend_from_slice(bytes);
        self.phase = Phase::BodyWritten;
        Ok(self)
    }

    /// Seal the message, inserting a `Content-Length` header sized to
    /// the final body, and reset the writer to `Empty`.
    pub fn release(&mut self) -> Result<Envelope, TellingError> {
        if self.start_line.is_none() {
            return Err(TellingError::state("release called on an empty writer"));
        }
        let length_field = match self.reserved_length_width {
            Some(width) => {
                let digits = self.body.len().to_string();
                if digits.len() > width {
                    return Err(TellingError::state(format!(
                        "no space: content-length reservation of {width} digit(s) too small for body of {} byte(s)",
                        self.body.len()
                    )));
                }
                format!("{:0width$}", self.body.len(), width = width)
            }
            None => self.body.len().to_string(),
        };

        let start_line = self.start_line.take().expect("checked above");
        let mut headers = std::mem::take(&mut self.headers);
        let body = std::mem::take(&mut self.body);
        self.reserved_length_width = None;
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("Content-Length"));
        headers.push(("Content-Length".to_string(), length_field));
        self.phase = Phase::Empty;
        Ok(Envelope { start_line, headers, body: Bytes::from(body) })
    }

    /// Serialize an already-built envelope back onto the wire, byte
    /// for byte reproducible by [`crate::message::parser::parse`].
    pub fn encode(envelope: &Envelope) -> Vec<u8> {
        let mut out = Vec::new();
        write_start_line(&mut out, &envelope.start_line);
        out.extend_from_slice(b"\r\n");
        for (name, value) in &envelope.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&envelope.body);
        out
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

fn write_start_line(out: &mut Vec<u8>, start_line: &StartLine) {
    match start_line {
        StartLine::Request { method, uri, protocol } => {
            out.extend_from_slice(method.as_str().as_bytes());
            out.push(b' ');
            out.extend_from_slice(uri.as_bytes());
            if let Some(protocol) = protocol {
                out.push(b' ');
                out.extend_from_slice(protocol.as_bytes());
            }
        }
        StartLine::Reply { protocol, status, reason } => {
            out.extend_from_slice(protocol.as_deref().unwrap_or("").as_bytes());
            out.push(b' ');
            out.extend_from_slice(format!("{:03}", status.code()).as_bytes());
            if let Some(reason) = reason {
                out.push(b' ');
                out.extend_from_slice(reason.as_bytes());
            }
        }
        StartLine::Report { uri, protocol, status, reason } => {
            out.extend_from_slice(uri.as_bytes());
            if let Some(protocol) = protocol {
                out.push(b' ');
                out.extend_from_slice(protocol.as_bytes());
            }
            if let Some(status) = status {
                out.push(b' ');
                out.extend_from_slice(format!("{:03}", status.code()).as_bytes());
                if let Some(reason) = reason {
                    out.push(b' ');
                    out.extend_from_slice(reason.as_bytes());
                }
            }
        }
    }
}
