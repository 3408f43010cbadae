//! Time-window bucketing
//!
//! Pure functions over epoch-aligned buckets. A bucket of width `w` starting at
//! `s` covers the half-open range `[s, s + w)`.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeWindowError {
    #[error("Window width must be positive, got {0} ms")]
    NonPositiveWidth(i64),

    #[error("Timestamp out of range")]
    OutOfRange,
}

pub type TimeWindowResult<T> = Result<T, TimeWindowError>;

fn width_ms(width: Duration) -> TimeWindowResult<i64> {
    let ms = width.num_milliseconds();
    if ms <= 0 {
        return Err(TimeWindowError::NonPositiveWidth(ms));
    }
    Ok(ms)
}

/// Start of the bucket containing `ts`
pub fn bucket_start(ts: DateTime<Utc>, width: Duration) -> TimeWindowResult<DateTime<Utc>> {
    let w = width_ms(width)?;
    let ms = ts.timestamp_millis();
    let floored = ms.div_euclid(w) * w;
    DateTime::<Utc>::from_timestamp_millis(floored).ok_or(TimeWindowError::OutOfRange)
}

/// Exclusive end of the bucket containing `ts`
pub fn bucket_end(ts: DateTime<Utc>, width: Duration) -> TimeWindowResult<DateTime<Utc>> {
    bucket_start(ts, width)?
        .checked_add_signed(width)
        .ok_or(TimeWindowError::OutOfRange)
}

/// Whether `ts` falls in the window `[start, start + width)`
///
/// A window whose end lies past the representable range is open-ended.
pub fn window_contains(start: DateTime<Utc>, width: Duration, ts: DateTime<Utc>) -> bool {
    ts >= start && start.checked_add_signed(width).map_or(true, |end| ts < end)
}

/// Every bucket start overlapping the inclusive range `[from, to]`
///
/// Empty when `to < from`.
pub fn bucket_range(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    width: Duration,
) -> TimeWindowResult<BucketRange> {
    let first = bucket_start(from, width)?;
    Ok(BucketRange {
        next: (to >= from).then_some(first),
        last: to,
        width,
    })
}

/// Iterator returned by [`bucket_range`]
#[derive(Debug, Clone)]
pub struct BucketRange {
    next: Option<DateTime<Utc>>,
    last: DateTime<Utc>,
    width: Duration,
}

impl Iterator for BucketRange {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.filter(|next| *next <= self.last)?;
        self.next = current.checked_add_signed(self.width);
        Some(current)
    }
}
