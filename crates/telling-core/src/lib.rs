//! Shared primitives for every Telling crate: the life-lock weak
//! reference (`life_lock`), the wire message envelope (`message`),
//! single-flight send/plain-FIFO recv queues (`queue`), the async
//! driver state machines that tie a handler to a transport
//! (`driver`), and the address model (`address`).

pub mod address;
pub mod driver;
pub mod error;
pub mod life_lock;
pub mod message;
pub mod queue;

pub mod prelude {
    pub use crate::address::{Address, Pattern};
    pub use crate::driver::{
        tag_query_id, AsyncQuery, AsyncRecv, AsyncRespond, AsyncSend, QueryDriver, RecvDriver, RespondDriver,
        SendDriver, TransportIo, QUERY_ID_HEADER,
    };
    pub use crate::error::{ParseErrorKind, Result, TellingError};
    pub use crate::life_lock::{LifeLock, LifeLockGuard, LifeLockState, LifeLockWeak, LifeLocked};
    pub use crate::message::{parse, Envelope, Method, StartLine, Status, Writer};
    pub use crate::queue::{Produced, RecvQueue, SendQueue};
}
