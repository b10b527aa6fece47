//! Error domain shared by every Telling crate.
//!
//! Mirrors the error kinds called for by the routing and messaging
//! contracts: parse failures carry the offending byte span, state
//! errors cover protocol misuse (respond before receive, double
//! start), and `timed_out`/`canceled` map directly onto transport
//! outcomes so driver callbacks can forward them without translation.

use std::fmt;
use std::ops::Range;

/// The single error type returned by Telling's public API.
#[derive(Debug, thiserror::Error)]
pub enum TellingError {
    /// A URI prefix or named resource was already registered.
    #[error("path already registered: {path}")]
    PathTaken { path: String },

    /// A lookup (routing, registration removal) found nothing at `path`.
    #[error("no route for path: {path}")]
    PathMissing { path: String },

    /// The wire envelope violated the grammar in `message::parser`.
    #[error("malformed message ({kind}) at bytes {span:?}")]
    Parse { kind: ParseErrorKind, span: Range<usize> },

    /// An operation was attempted from the wrong protocol state, e.g.
    /// responding before a query was received, or starting an
    /// already-started send/recv loop.
    #[error("invalid state: {0}")]
    State(String),

    /// The communicator or underlying transport has been closed.
    #[error("communicator closed")]
    Closed,

    /// A transport operation exceeded its deadline. Recoverable: the
    /// loop that produced this re-arms itself.
    #[error("operation timed out")]
    TimedOut,

    /// An operation was explicitly canceled; the owning loop
    /// terminates after this is observed.
    #[error("operation canceled")]
    Canceled,

    /// A dynamically-typed functor invocation received arguments
    /// that did not match its registration.
    #[error("wrong argument type for `{name}`")]
    WrongType { name: String },

    /// Catch-all for a lower transport failure that doesn't map
    /// cleanly onto the above; keeps a human-readable cause.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Sub-codes for [`TellingError::Parse`], matching spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    HeaderIncomplete,
    HeaderMalformed,
    HeaderTooBig,
    StartLineMalformed,
    AlreadyWritten,
    UnknownProtocol,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::HeaderIncomplete => "header incomplete",
            ParseErrorKind::HeaderMalformed => "header malformed",
            ParseErrorKind::HeaderTooBig => "header too big",
            ParseErrorKind::StartLineMalformed => "start line malformed",
            ParseErrorKind::AlreadyWritten => "already written",
            ParseErrorKind::UnknownProtocol => "unknown protocol",
        };
        f.write_str(s)
    }
}

impl TellingError {
    pub fn parse(kind: ParseErrorKind, span: Range<usize>) -> Self {
        TellingError::Parse { kind, span }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        TellingError::State(msg.into())
    }

    /// True for errors a recv/send loop should log and continue past
    /// (re-arm) rather than terminate on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TellingError::TimedOut)
    }
}

pub type Result<T, E = TellingError> = core::result::Result<T, E>;
