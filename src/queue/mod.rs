//! Inter-thread handoff primitives.
//!
//! - [`MsgQueue`]: bounded blocking FIFO of typed messages
//! - [`DataQueue`]: byte ring of variable-length records
//! - [`ShareQueue`]: reference-counted fan-out to several consumer ports

mod data_queue;
mod msg_queue;
mod share_queue;

pub use data_queue::{DataQueue, WriteBuffer};
pub use msg_queue::MsgQueue;
pub use share_queue::{ReleaseFn, ShareQueue, Shared, Ticket};
