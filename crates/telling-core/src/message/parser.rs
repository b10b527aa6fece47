//! Wire envelope parser: header-first, body-second, separated by a
//! blank line (spec §3, §4.2).
//!
//! Start-line type is auto-detected by splitting on single spaces into
//! at most four tokens (a trailing token absorbs any remaining spaces,
//! so a reason phrase like "Not Found" survives intact) and then
//! applying the same backwards-search the original parser uses: a
//! third token that parses as a known protocol literal means this is
//! a request; otherwise a second token that parses as a protocol
//! means a report; otherwise an empty or slash-bearing first token
//! means a reply; anything else is a request with no protocol token.

use bytes::Bytes;

use crate::error::{ParseErrorKind, TellingError};
use crate::message::method::Method;
use crate::message::status::Status;

/// Fits the original layout's 16-bit offset fields: header region
/// (start-line + headers + blank-line terminator) must not exceed
/// this, or parsing fails with `HeaderTooBig`.
pub const MAX_HEADER_REGION: usize = 65_535;
/// Start-line byte length (excluding its line terminator) ceiling.
pub const MAX_START_LINE: usize = 65_535;

const KNOWN_PROTOCOLS: &[&str] = &["Tell/0", "HTTP/1.0", "HTTP/1.1"];

fn is_known_protocol(token: &str) -> bool {
    KNOWN_PROTOCOLS.contains(&token)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: String, protocol: Option<String> },
    Reply { protocol: Option<String>, status: Status, reason: Option<String> },
    Report { uri: String, protocol: Option<String>, status: Option<Status>, reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub start_line: StartLine,
    /// Header entries in arrival order; duplicates are preserved
    /// (unordered multi-map per spec §3).
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Envelope {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter().filter(move |(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// Locate the next line ending (`\n`, optionally preceded by `\r`)
/// starting at `from`. Returns `(line_without_terminator_end, after_terminator)`.
fn find_line(input: &[u8], from: usize) -> Option<(usize, usize)> {
    let rel = input[from..].iter().position(|&b| b == b'\n')?;
    let nl = from + rel;
    let line_end = if nl > from && input[nl - 1] == b'\r' { nl - 1 } else { nl };
    Some((line_end, nl + 1))
}

/// Split `line` on single spaces into at most 4 tokens, recording each
/// token's start offset within `line` so the caller can recover an
/// exact (space-preserving) suffix for reason phrases.
fn split_start_line(line: &str) -> Vec<(usize, &str)> {
    const MAX_PARTS: usize = 4;
    let bytes = line.as_bytes();
    let len = bytes.len();
    let mut parts = Vec::with_capacity(MAX_PARTS);
    let mut i = 0usize;
    while i < len {
        if parts.len() == MAX_PARTS - 1 {
            parts.push((i, &line[i..]));
            return parts;
        }
        let start = i;
        while i < len && bytes[i] != b' ' {
            i += 1;
        }
        parts.push((start, &line[start..i]));
        if i < len {
            i += 1;
            if i == len && parts.len() < MAX_PARTS {
                parts.push((i, ""));
            }
        }
    }
    parts
}

enum Kind {
    Request,
    Reply,
    Report,
}

fn detect_kind(parts: &[(usize, &str)]) -> Option<Kind> {
    match parts.len() {
        0 => None,
        1 => Some(Kind::Report),
        _ => {
            if parts.len() >= 3 && is_known_protocol(parts[2].1) {
                Some(Kind::Request)
            } else if is_known_protocol(parts[1].1) {
                Some(Kind::Report)
            } else if parts[0].1.is_empty() || parts[0].1.contains('/') {
                Some(Kind::Reply)
            } else {
                Some(Kind::Request)
            }
        }
    }
}

fn remainder_from(line: &str, parts: &[(usize, &str)], index: usize) -> Option<String> {
    parts.get(index).map(|(offset, _)| line[*offset..].to_string())
}

/// Parse a complete wire envelope. `input` must contain the full
/// header region (start-line through the blank line) plus whatever
/// body bytes are expected; callers that frame on `Content-Length`
/// are responsible for buffering that much before calling this.
pub fn parse(input: &[u8]) -> Result<Envelope, TellingError> {
    let (start_line_end, after_start_line) = find_line(input, 0)
        .ok_or_else(|| TellingError::parse(ParseErrorKind::HeaderIncomplete, 0..input.len()))?;

    if start_line_end > MAX_START_LINE {
        return Err(TellingError::parse(ParseErrorKind::StartLineMalformed, 0..start_line_end));
    }

    let start_line_text = std::str::from_utf8(&input[0..start_line_end])
        .map_err(|_| TellingError::parse(ParseErrorKind::StartLineMalformed, 0..start_line_end))?;

    let parts = split_start_line(start_line_text);
    let kind = detect_kind(&parts)
        .ok_or_else(|| TellingError::parse(ParseErrorKind::StartLineMalformed, 0..start_line_end))?;

    let start_line = build_start_line(kind, start_line_text, &parts)
        .ok_or_else(|| TellingError::parse(ParseErrorKind::StartLineMalformed, 0..start_line_end))?;

    // Header block: lines from after the start-line up to (and
    // including) the blank-line terminator.
    let mut pos = after_start_line;
    let mut headers = Vec::new();
    let body_start;
    loop {
        let (line_end, after_line) = find_line(input, pos).ok_or_else(|| {
            TellingError::parse(ParseErrorKind::HeaderIncomplete, pos..input.len())
        })?;
        if line_end == pos {
            body_start = after_line;
            break;
        }
        if after_line > MAX_HEADER_REGION {
            return Err(TellingError::parse(ParseErrorKind::HeaderTooBig, 0..after_line));
        }
        let line = std::str::from_utf8(&input[pos..line_end])
            .map_err(|_| TellingError::parse(ParseErrorKind::HeaderMalformed, pos..line_end))?;
        let colon = line
            .find(':')
            .ok_or_else(|| TellingError::parse(ParseErrorKind::HeaderMalformed, pos..line_end))?;
        let name = line[..colon].trim();
        if name.is_empty() {
            return Err(TellingError::parse(ParseErrorKind::HeaderMalformed, pos..line_end));
        }
        let value = line[colon + 1..].trim_start();
        headers.push((name.to_string(), value.to_string()));
        pos = after_line;
    }

    if body_start > MAX_HEADER_REGION {
        return Err(TellingError::parse(ParseErrorKind::HeaderTooBig, 0..body_start));
    }

    let body = Bytes::copy_from_slice(&input[body_start..]);
    Ok(Envelope { start_line, headers, body })
}

fn build_start_line(kind: Kind, line: &str, parts: &[(usize, &str)]) -> Option<StartLine> {
    match kind {
        Kind::Request => {
            if parts.len() > 3 {
                return None;
            }
            let method = Method::from_token(parts[0].1);
            let uri = parts.get(1)?.1.to_string();
            let protocol = parts.get(2).map(|(_, t)| t.to_string());
            Some(StartLine::Request { method, uri, protocol })
        }
        Kind::Reply => {
            let protocol = if parts[0].1.is_empty() { None } else { Some(parts[0].1.to_string()) };
            let status_text = parts.get(1)?.1;
            let status = Status::parse(status_text)?;
            let reason = remainder_from(line, parts, 2);
            Some(StartLine::Reply { protocol, status, reason })
        }
        Kind::Report => {
            let uri = parts[0].1.to_string();
            let protocol = parts.get(1).map(|(_, t)| t.to_string());
            let status = parts.get(2).and_then(|(_, t)| Status::parse(t));
            let reason = if parts.get(2).and_then(|(_, t)| Status::parse(t)).is_some() {
                remainder_from(line, parts, 3)
            } else {
                None
            };
            Some(StartLine::Report { uri, protocol, status, reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_start_line() {
        let raw = b"GET /voices/1 Tell/0\r\nX-Trace: abc\r\n\r\nq";
        let msg = parse(raw).unwrap();
        match msg.start_line {
            StartLine::Request { method, uri, protocol } => {
                assert_eq!(method, Method::Get);
                assert_eq!(uri, "/voices/1");
                assert_eq!(protocol.as_deref(), Some("Tell/0"));
            }
            other => panic!("expected request, got {other:?}"),
        }
        assert_eq!(msg.header("X-Trace"), Some("abc"));
        assert_eq!(&msg.body[..], b"q");
    }

    #[test]
    fn parses_reply_with_multi_word_reason() {
        let raw = b"Tell/0 404 Not Found\r\n\r\n";
        let msg = parse(raw).unwrap();
        match msg.start_line {
            StartLine::Reply { protocol, status, reason } => {
                assert_eq!(protocol.as_deref(), Some("Tell/0"));
                assert_eq!(status, Status::NOT_FOUND);
                assert_eq!(reason.as_deref(), Some("Not Found"));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn parses_bare_report_uri_only() {
        let raw = b"*services\r\n\r\n/voices";
        let msg = parse(raw).unwrap();
        match msg.start_line {
            StartLine::Report { uri, protocol, status, reason } => {
                assert_eq!(uri, "*services");
                assert_eq!(protocol, None);
                assert_eq!(status, None);
                assert_eq!(reason, None);
            }
            other => panic!("expected report, got {other:?}"),
        }
        assert_eq!(&msg.body[..], b"/voices");
    }

    #[test]
    fn parses_report_with_status_and_reason() {
        let raw = b"*services Tell/0 410 Gone\r\n\r\n/voices";
        let msg = parse(raw).unwrap();
        match msg.start_line {
            StartLine::Report { uri, protocol, status, reason } => {
                assert_eq!(uri, "*services");
                assert_eq!(protocol.as_deref(), Some("Tell/0"));
                assert_eq!(status, Some(Status(410)));
                assert_eq!(reason.as_deref(), Some("Gone"));
            }
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn missing_terminator_is_header_incomplete() {
        let raw = b"GET /x Tell/0\r\nX: y\r\n";
        let err = parse(raw).unwrap_err();
        assert!(matches!(err, TellingError::Parse { kind: ParseErrorKind::HeaderIncomplete, .. }));
    }

    #[test]
    fn header_without_colon_is_malformed() {
        let raw = b"GET /x Tell/0\r\nbroken-header\r\n\r\n";
        let err = parse(raw).unwrap_err();
        assert!(matches!(err, TellingError::Parse { kind: ParseErrorKind::HeaderMalformed, .. }));
    }

    #[test]
    fn oversized_header_region_is_rejected() {
        let mut raw = b"GET /x Tell/0\r\n".to_vec();
        // One header whose value pushes the header region past the limit.
        let filler = "A".repeat(MAX_HEADER_REGION);
        raw.extend_from_slice(format!("X-Filler: {filler}\r\n\r\n").as_bytes());
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, TellingError::Parse { kind: ParseErrorKind::HeaderTooBig, .. }));
    }
}
