//! Tick-based date and duration payloads.
//!
//! Dates and time spans travel as signed 64-bit counts of 100 ns ticks,
//! the tick origin being 0001-01-01T00:00:00. A date additionally carries
//! a one-byte kind.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{WireError, WireResult};

/// Ticks per second; one tick is 100 ns.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks between 0001-01-01T00:00:00 and the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

// -----------------------------------------------------------------------------
// DateKind

/// The kind byte attached to a date payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateKind {
    Unspecified = 0,
    Utc = 1,
    Local = 2,
}

impl TryFrom<u8> for DateKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => DateKind::Unspecified,
            1 => DateKind::Utc,
            2 => DateKind::Local,
            byte => return Err(WireError::InvalidDateKind(byte)),
        })
    }
}

// -----------------------------------------------------------------------------
// WireDate

/// A point in time as it travels on the wire: a tick count and a kind.
///
/// The in-memory calendar type is [`chrono::DateTime`]; conversion is
/// lossy below tick resolution (nanoseconds are truncated to 100 ns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireDate {
    ticks: i64,
    kind: DateKind,
}

impl WireDate {
    #[inline]
    pub const fn new(ticks: i64, kind: DateKind) -> Self {
        Self { ticks, kind }
    }

    /// Converts a UTC calendar time, truncating below tick resolution.
    pub fn from_utc(value: DateTime<Utc>) -> Self {
        let ticks = value.timestamp() * TICKS_PER_SECOND
            + i64::from(value.timestamp_subsec_nanos()) / 100
            + UNIX_EPOCH_TICKS;
        Self::new(ticks, DateKind::Utc)
    }

    /// Converts back to a UTC calendar time.
    ///
    /// Fails when the tick count falls outside chrono's representable
    /// range. The kind byte does not participate: local times are
    /// interpreted on the wall clock of whoever asks.
    pub fn to_utc(self) -> WireResult<DateTime<Utc>> {
        let unix_ticks = self.ticks - UNIX_EPOCH_TICKS;
        let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos).ok_or(WireError::TicksOutOfRange(self.ticks))
    }

    #[inline(always)]
    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    #[inline(always)]
    pub const fn kind(self) -> DateKind {
        self.kind
    }
}

// -----------------------------------------------------------------------------
// TimeDelta ticks

/// A duration as a signed tick count.
pub(crate) fn delta_to_ticks(delta: TimeDelta) -> i64 {
    delta.num_seconds() * TICKS_PER_SECOND + i64::from(delta.subsec_nanos()) / 100
}

pub(crate) fn delta_from_ticks(ticks: i64) -> TimeDelta {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    TimeDelta::new(secs, nanos).expect("tick remainder is always below one second")
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};

    use super::{DateKind, WireDate, delta_from_ticks, delta_to_ticks};

    #[test]
    fn unix_epoch_ticks() {
        let epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(WireDate::from_utc(epoch).ticks(), super::UNIX_EPOCH_TICKS);
    }

    #[test]
    fn date_round_trip_truncates_to_ticks() {
        let date = Utc
            .with_ymd_and_hms(2024, 5, 17, 13, 37, 21)
            .unwrap()
            .checked_add_signed(TimeDelta::nanoseconds(123_456_789))
            .unwrap();
        let wire = WireDate::from_utc(date);
        assert_eq!(wire.kind(), DateKind::Utc);

        let back = wire.to_utc().unwrap();
        assert_eq!(back.timestamp(), date.timestamp());
        // 123_456_789 ns truncate to 123_456_700 ns.
        assert_eq!(back.timestamp_subsec_nanos(), 123_456_700);
    }

    #[test]
    fn delta_ticks_round_trip() {
        for delta in [
            TimeDelta::zero(),
            TimeDelta::seconds(90),
            TimeDelta::milliseconds(-1_500),
            TimeDelta::microseconds(31),
        ] {
            assert_eq!(delta_from_ticks(delta_to_ticks(delta)), delta);
        }
    }

    #[test]
    fn kind_byte_round_trip() {
        for kind in [DateKind::Unspecified, DateKind::Utc, DateKind::Local] {
            assert_eq!(DateKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(DateKind::try_from(3).is_err());
    }
}
