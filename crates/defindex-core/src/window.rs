//! Bucketed rolling windows.
//!
//! A [`RollingWindow`] is a fixed ring of time buckets. Recording and
//! querying are both O(buckets); expired buckets are recycled lazily when
//! their ring slot is reused, so no full rescan ever happens.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

const EMPTY: i64 = i64::MIN;

/// One time bucket: number of events and summed volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket start (Unix seconds, aligned to the bucket width).
    pub start: i64,
    pub count: u64,
    pub volume: Decimal,
}

impl Bucket {
    fn empty() -> Self {
        Self {
            start: EMPTY,
            count: 0,
            volume: Decimal::ZERO,
        }
    }
}

/// Totals over the live part of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowTotals {
    pub count: u64,
    pub volume: Decimal,
}

/// Ring of `bucket_count` buckets, each `bucket_secs` wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindow {
    bucket_secs: i64,
    buckets: Vec<Bucket>,
}

impl RollingWindow {
    pub fn new(bucket_secs: i64, bucket_count: usize) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1),
            buckets: vec![Bucket::empty(); bucket_count.max(1)],
        }
    }

    /// Window length in seconds.
    pub fn span_secs(&self) -> i64 {
        self.bucket_secs * self.buckets.len() as i64
    }

    fn bucket_start(&self, ts: i64) -> i64 {
        ts.div_euclid(self.bucket_secs) * self.bucket_secs
    }

    fn slot(&self, start: i64) -> usize {
        (start / self.bucket_secs).rem_euclid(self.buckets.len() as i64) as usize
    }

    /// Record one event at `ts` with `volume`.
    ///
    /// Returns `Ok(false)` when `ts` is older than anything the ring can
    /// still hold (the event is then only visible in cumulative totals).
    pub fn record(&mut self, ts: i64, volume: Decimal) -> Result<bool, AggregationError> {
        let start = self.bucket_start(ts);
        let slot = self.slot(start);
        let bucket = &self.buckets[slot];

        if bucket.start != EMPTY && bucket.start > start {
            return Ok(false);
        }

        let (count, base) = if bucket.start == start {
            (bucket.count, bucket.volume)
        } else {
            (0, Decimal::ZERO)
        };
        let volume = base
            .checked_add(volume)
            .ok_or_else(|| AggregationError::Overflow {
                field: "rolling volume".into(),
            })?;

        self.buckets[slot] = Bucket {
            start,
            count: count + 1,
            volume,
        };
        Ok(true)
    }

    /// Totals over buckets covering `[now - span, now]`, to bucket granularity.
    /// Volume saturates at `Decimal::MAX`.
    pub fn totals(&self, now: i64) -> WindowTotals {
        let newest = self.bucket_start(now);
        let oldest = newest - self.bucket_secs * (self.buckets.len() as i64 - 1);

        self.buckets
            .iter()
            .filter(|b| b.start != EMPTY && b.start >= oldest && b.start <= newest)
            .fold(WindowTotals::default(), |acc, b| WindowTotals {
                count: acc.count.saturating_add(b.count),
                volume: acc.volume.saturating_add(b.volume),
            })
    }

    /// Event count in the window ending at `now`.
    pub fn count(&self, now: i64) -> u64 {
        self.totals(now).count
    }

    /// Volume in the window ending at `now`.
    pub fn volume(&self, now: i64) -> Decimal {
        self.totals(now).volume
    }
}
