//! Oplog timestamp codec.
//!
//! MongoDB stamps every oplog entry with a BSON timestamp: 32 bits of
//! seconds since the epoch plus a 32-bit increment that orders entries
//! within the same second. The connector packs both halves into one `u64`
//! (seconds high, increment low) so that checkpoints, comparisons and the
//! `_ts` field shipped to targets are plain integers whose numeric order is
//! the oplog order.
//!
//! ```
//! use oplog_connector::timestamp::OplogTimestamp;
//!
//! let ts = OplogTimestamp::new(1_700_000_000, 7);
//! assert_eq!(OplogTimestamp::from_u64(ts.as_u64()), ts);
//! ```

use bson::Timestamp;
use std::fmt;

/// A `(seconds, increment)` oplog position.
///
/// Field order matters: the derived `Ord` compares seconds first, which is
/// exactly the order of the packed `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OplogTimestamp {
    pub seconds: u32,
    pub increment: u32,
}

impl OplogTimestamp {
    /// Smallest possible position; sorts before every real entry.
    pub const MIN: OplogTimestamp = OplogTimestamp {
        seconds: 0,
        increment: 0,
    };

    pub const fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }

    /// Pack into the 64-bit ordering key.
    pub const fn as_u64(self) -> u64 {
        ((self.seconds as u64) << 32) | self.increment as u64
    }

    /// Unpack a 64-bit ordering key.
    pub const fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            increment: value as u32,
        }
    }
}

impl From<Timestamp> for OplogTimestamp {
    fn from(ts: Timestamp) -> Self {
        Self::new(ts.time, ts.increment)
    }
}

impl From<OplogTimestamp> for Timestamp {
    fn from(ts: OplogTimestamp) -> Self {
        Timestamp {
            time: ts.seconds,
            increment: ts.increment,
        }
    }
}

impl From<u64> for OplogTimestamp {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl From<OplogTimestamp> for u64 {
    fn from(ts: OplogTimestamp) -> Self {
        ts.as_u64()
    }
}

impl fmt::Display for OplogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.increment)
    }
}
