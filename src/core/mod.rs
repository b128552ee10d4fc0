//! Core building blocks
//!
//! Toroidal addressing, the double-buffered mailbox, frame throttles and the
//! tile worker pool.

pub mod double_buffer;
pub mod ring_index;
pub mod throttle;
pub mod tile_pool;

pub use double_buffer::{Mailbox, MailboxMetrics};
pub use ring_index::{floor_div, RingIndex};
pub use throttle::Throttle;
pub use tile_pool::{CancelToken, PoolStats, TilePool};
