//! Synchronisation primitives for the library database.
//!
//! Every read of the database happens under a shared hold and every write
//! under an exclusive hold of one [`ShLock`]. Holds are tracked per thread,
//! so a thread may re-acquire the mode it already holds as many times as it
//! likes, but it may never switch modes without first releasing everything:
//! upgrading (shared → exclusive) would deadlock against any other reader,
//! and downgrading through `acquire` would silently break the exclusivity
//! the caller asked for. Both are reported as errors instead.
//!
//! Background subsystems reach the database through a [`DbHandle`], which
//! never keeps it alive.

pub mod error;
mod guard;
mod handle;
mod lock;

pub use crate::guard::LockGuard;
pub use crate::handle::DbHandle;
pub use crate::lock::ShLock;
