//! Small shared types.

mod bounds;

pub use bounds::{IntervalBand, RetargetBounds};

use time::OffsetDateTime;

/// Share timestamps, in whole seconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
pub fn unix_now() -> Timestamp {
    OffsetDateTime::now_utc().unix_timestamp()
}
