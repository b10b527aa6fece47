//! HTTP-style status codes and their class predicates.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const CREATED: Status = Status(201);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const CONFLICT: Status = Status(409);
    pub const GONE: Status = Status(410);
    pub const NOT_IMPLEMENTED: Status = Status(501);
    pub const SERVICE_UNAVAILABLE: Status = Status(503);

    pub fn parse(text: &str) -> Option<Status> {
        if text.len() != 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse::<u16>().ok().map(Status)
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.0)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.0)
    }

    pub fn is_error(&self) -> bool {
        self.is_client_error() || self.is_server_error()
    }

    /// Canonical reason phrase for the status codes this crate emits;
    /// unrecognized codes fall back to a generic phrase rather than
    /// failing, since the reason phrase is informational only.
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            400 => "Bad Request",
            404 => "Not Found",
            409 => "Conflict",
            410 => "Gone",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            _ if self.is_informational() => "Informational",
            _ if self.is_successful() => "Success",
            _ if self.is_redirection() => "Redirection",
            _ if self.is_client_error() => "Client Error",
            _ if self.is_server_error() => "Server Error",
            _ => "Unknown Status",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_hundreds_digit() {
        assert!(Status(101).is_informational());
        assert!(Status::OK.is_successful());
        assert!(Status(302).is_redirection());
        assert!(Status::NOT_FOUND.is_client_error());
        assert!(Status::SERVICE_UNAVAILABLE.is_server_error());
        assert!(Status::NOT_FOUND.is_error());
        assert!(!Status::OK.is_error());
    }

    #[test]
    fn parse_rejects_non_three_digit() {
        assert_eq!(Status::parse("20"), None);
        assert_eq!(Status::parse("abc"), None);
        assert_eq!(Status::parse("200"), Some(Status(200)));
    }
}
