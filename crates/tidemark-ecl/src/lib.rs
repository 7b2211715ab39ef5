//! External change log.
//!
//! The external change log presents the updates of every replicated naming
//! context as one stream. A consumer opens an [`EclSession`] with an
//! [`EclRequest`]; the session replays stored history in CSN order, then
//! (for persistent searches) follows new changes as they are applied. Every
//! [`EclEntry`] carries the cookie to resume right after it.
//!
//! A request can instead name a range of change numbers: the session then
//! reads the replica's change-number index, and entries also carry their
//! change number. [`newest_cookie`] returns the cookie positioned after
//! every change applied so far.

mod entry;
mod error;
mod filter;
mod request;
mod session;

#[cfg(test)]
mod tests;

pub use entry::{EclEntry, EclEvent};
pub use error::EclError;
pub use filter::{TargetFilter, TargetPattern};
pub use request::{
    ChangeNumberRange, DEFAULT_BATCH_SIZE, DEFAULT_CATCH_UP_TIMEOUT, EclRequest, SearchMode,
};
pub use session::{CancelHandle, EclSession, Phase, newest_cookie};
