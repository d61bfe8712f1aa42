//! Slot pool over pre-paid payment channels.
//!
//! Each slot binds one payment channel to the downstream handle that may call the
//! backend through it. The set of slots is fixed at construction; only the
//! per-slot state moves, under a single pool-wide lock:
//! - `acquire()`: round-robin scan from the cursor, Free → Busy
//! - `SlotLease` drop / `release()`: Busy → Free, exactly once per acquire

mod channel;
mod pool;

pub use channel::{ChannelId, ParseChannelIdError};
pub use pool::{SlotLease, SlotPool, SlotState};
