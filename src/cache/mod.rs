#![forbid(unsafe_code)]

//! The three cache shapes behind the service.
//!
//! They stay deliberately separate: the TTL map wants parallel readers, the
//! byte cache mutates LRU order on every read and therefore takes a single
//! writer lock, and the PO-token cache is one slot. Unifying them would force
//! the strictest locking discipline on all three.

mod bytes;
mod pot;
mod ttl;

pub use bytes::{ByteCache, MAX_ENTRY_BYTES};
pub use pot::{POT_TOKEN_TTL, PotCache};
pub use ttl::TtlCache;
