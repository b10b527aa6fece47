//! Wire envelope: start-line + header multi-map + body (spec §3, §4.2).

pub mod method;
pub mod parser;
pub mod status;
pub mod writer;

pub use method::Method;
pub use parser::{parse, Envelope, StartLine, MAX_HEADER_REGION, MAX_START_LINE};
pub use status::Status;
pub use writer::Writer;
