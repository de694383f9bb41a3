//! Nanosecond timestamp codec.
//!
//! FUSE carries file times as `(seconds, nanoseconds)` pairs; handlers and
//! stats naturally live in signed 64-bit nanoseconds since the Unix epoch.
//! [`TimeSpec`] converts losslessly between the two, and additionally
//! accepts the sloppier inputs real consumers produce: `SystemTime`,
//! floating-point seconds (or milliseconds, by magnitude heuristic),
//! `"<seconds>.<fraction>"` strings and ISO-8601 strings.

use std::convert::TryFrom;
use std::fmt;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::errno::Errno;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point in time as whole seconds plus a sub-second nanosecond part.
///
/// Invariant: `0 <= nsecs < 1_000_000_000`. Negative times (before the
/// epoch) put the sign in `secs`; `nsecs` always counts forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct TimeSpec {
    /// Whole seconds since the Unix epoch. May be negative.
    pub secs: i64,
    /// Nanoseconds within the second.
    pub nsecs: u32,
}

impl TimeSpec {
    /// The Unix epoch.
    pub const EPOCH: TimeSpec = TimeSpec { secs: 0, nsecs: 0 };

    /// Builds a timespec, normalizing an out-of-range nanosecond part into
    /// the seconds field.
    pub const fn new(secs: i64, nsecs: u32) -> TimeSpec {
        let carry = (nsecs as i64) / NANOS_PER_SEC;
        TimeSpec {
            secs: secs.saturating_add(carry),
            nsecs: (nsecs as i64 % NANOS_PER_SEC) as u32,
        }
    }

    /// Splits signed nanoseconds-since-epoch. Lossless for every `i64`.
    pub fn from_nanos(nanos: i64) -> TimeSpec {
        TimeSpec {
            secs: nanos.div_euclid(NANOS_PER_SEC),
            nsecs: nanos.rem_euclid(NANOS_PER_SEC) as u32,
        }
    }

    /// Recombines into signed nanoseconds. Saturates at the `i64` range for
    /// timespecs further than ±292 years from the epoch.
    pub fn as_nanos(self) -> i64 {
        self.secs
            .saturating_mul(NANOS_PER_SEC)
            .saturating_add(self.nsecs as i64)
    }

    /// Whole milliseconds since the epoch, truncated toward negative
    /// infinity.
    pub fn as_millis(self) -> i64 {
        self.as_nanos().div_euclid(1_000_000)
    }

    /// Converts a `SystemTime`, handling pre-epoch times with negative
    /// seconds and saturating outside the `i64` seconds range.
    pub fn from_system_time(t: SystemTime) -> TimeSpec {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => match i64::try_from(d.as_secs()) {
                Ok(secs) => TimeSpec {
                    secs,
                    nsecs: d.subsec_nanos(),
                },
                Err(_) => TimeSpec {
                    secs: i64::MAX,
                    nsecs: 999_999_999,
                },
            },
            Err(before) => {
                let d = before.duration();
                let (secs, nsecs) = (d.as_secs(), d.subsec_nanos());
                if (secs, nsecs) >= (i64::MAX as u64 + 1, 0) {
                    TimeSpec {
                        secs: i64::MIN,
                        nsecs: 0,
                    }
                } else if nsecs == 0 {
                    TimeSpec {
                        secs: -(secs as i64),
                        nsecs: 0,
                    }
                } else {
                    TimeSpec {
                        secs: -(secs as i64) - 1,
                        nsecs: 1_000_000_000 - nsecs,
                    }
                }
            }
        }
    }

    /// Converts back to `SystemTime`.
    pub fn to_system_time(self) -> SystemTime {
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::new(self.secs as u64, self.nsecs)
        } else if self.nsecs == 0 {
            UNIX_EPOCH - Duration::new(self.secs.unsigned_abs(), 0)
        } else {
            UNIX_EPOCH - Duration::new(self.secs.unsigned_abs() - 1, 1_000_000_000 - self.nsecs)
        }
    }

    /// Interprets a float by magnitude: values below 10^10 are seconds
    /// (fractional part kept), larger ones are milliseconds. Unix second
    /// counts stay under 10^10 until the year 2286; millisecond counts
    /// passed it in 1970.
    pub fn from_float(value: f64) -> TimeSpec {
        let nanos = if value.abs() < 1e10 {
            value * 1e9
        } else {
            value * 1e6
        };
        TimeSpec::from_nanos(clamp_f64_to_i64(nanos))
    }

    /// Parses `"<seconds>"`, `"<seconds>.<fraction>"` (fraction is decimal,
    /// up to nanosecond precision) or an ISO-8601 timestamp. ISO fractions
    /// round to whole milliseconds.
    pub fn parse(s: &str) -> Result<TimeSpec, Errno> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Errno::EINVAL);
        }
        if looks_like_iso(s) {
            return parse_iso8601(s);
        }
        let (sec_part, frac_part) = match s.split_once('.') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };
        let negative = sec_part.starts_with('-');
        let secs: i64 = sec_part.parse().map_err(|_| Errno::EINVAL)?;
        let nsecs = match frac_part {
            Some(frac) => parse_fraction_nanos(frac)?,
            None => 0,
        };
        if negative && nsecs != 0 {
            // -0.25s is 250ms before the epoch: secs -1, nsecs 750M.
            Ok(TimeSpec {
                secs: secs.checked_sub(1).ok_or(Errno::ERANGE)?,
                nsecs: 1_000_000_000 - nsecs,
            })
        } else {
            Ok(TimeSpec { secs, nsecs })
        }
    }

    /// Adds signed nanoseconds, saturating at the representable range.
    pub fn add_nanos(self, nanos: i64) -> TimeSpec {
        TimeSpec::from_nanos(self.as_nanos().saturating_add(nanos))
    }

    /// Adds signed milliseconds.
    pub fn add_millis(self, millis: i64) -> TimeSpec {
        self.add_nanos(millis.saturating_mul(1_000_000))
    }

    /// Adds signed seconds.
    pub fn add_secs(self, secs: i64) -> TimeSpec {
        self.add_nanos(secs.saturating_mul(NANOS_PER_SEC))
    }

    /// Signed difference `self - other` in nanoseconds.
    pub fn diff_nanos(self, other: TimeSpec) -> i64 {
        self.as_nanos().saturating_sub(other.as_nanos())
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nsecs)
    }
}

impl From<SystemTime> for TimeSpec {
    fn from(t: SystemTime) -> TimeSpec {
        TimeSpec::from_system_time(t)
    }
}

impl From<TimeSpec> for SystemTime {
    fn from(t: TimeSpec) -> SystemTime {
        t.to_system_time()
    }
}

/// A setattr time value: either an explicit time or "now", which the
/// kernel requests when a utimensat caller passes `UTIME_NOW`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum TimeOrNow {
    /// Set to the given time.
    SpecificTime(TimeSpec),
    /// Set to the current time, as observed by the filesystem.
    Now,
}

impl TimeOrNow {
    /// Resolves `Now` against the system clock.
    pub fn resolve(self) -> TimeSpec {
        match self {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => TimeSpec::from_system_time(SystemTime::now()),
        }
    }
}

fn clamp_f64_to_i64(v: f64) -> i64 {
    if v >= i64::MAX as f64 {
        i64::MAX
    } else if v <= i64::MIN as f64 {
        i64::MIN
    } else {
        v.round() as i64
    }
}

fn parse_fraction_nanos(frac: &str) -> Result<u32, Errno> {
    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Errno::EINVAL);
    }
    let digits: u32 = frac.parse().map_err(|_| Errno::EINVAL)?;
    Ok(digits * 10u32.pow(9 - frac.len() as u32))
}

fn looks_like_iso(s: &str) -> bool {
    // "1969-..." vs a negative epoch count: ISO dates have a '-' past the
    // leading sign position.
    s.contains('T') || s[1..].contains('-')
}

/// Days from 1970-01-01 for a proleptic Gregorian civil date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn parse_iso8601(s: &str) -> Result<TimeSpec, Errno> {
    let bytes = s.as_bytes();
    let field = |range: std::ops::Range<usize>| -> Result<i64, Errno> {
        s.get(range)
            .and_then(|f| f.parse::<i64>().ok())
            .ok_or(Errno::EINVAL)
    };

    if bytes.len() < 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return Err(Errno::EINVAL);
    }
    let year = field(0..4)?;
    let month = field(5..7)? as u32;
    let day = field(8..10)? as u32;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(Errno::EINVAL);
    }

    let mut secs_of_day = 0i64;
    let mut nsecs = 0u32;
    let mut offset_secs = 0i64;
    if bytes.len() > 10 {
        if bytes[10] != b'T' && bytes[10] != b' ' {
            return Err(Errno::EINVAL);
        }
        let rest = &s[11..];
        if rest.len() < 8 || rest.as_bytes()[2] != b':' || rest.as_bytes()[5] != b':' {
            return Err(Errno::EINVAL);
        }
        let hour: i64 = rest[0..2].parse().map_err(|_| Errno::EINVAL)?;
        let minute: i64 = rest[3..5].parse().map_err(|_| Errno::EINVAL)?;
        let second: i64 = rest[6..8].parse().map_err(|_| Errno::EINVAL)?;
        if hour > 23 || minute > 59 || second > 60 {
            return Err(Errno::EINVAL);
        }
        secs_of_day = hour * 3600 + minute * 60 + second;

        let mut tail = &rest[8..];
        if let Some(stripped) = tail.strip_prefix('.') {
            let end = stripped
                .bytes()
                .position(|b| !b.is_ascii_digit())
                .unwrap_or(stripped.len());
            if end == 0 {
                return Err(Errno::EINVAL);
            }
            let frac = &stripped[..end.min(9)];
            // ISO inputs are defined to millisecond precision here.
            nsecs = round_to_millis(parse_fraction_nanos(frac)?);
            tail = &stripped[end..];
        }
        offset_secs = match tail {
            "" | "Z" | "z" => 0,
            _ => parse_utc_offset(tail)?,
        };
    }

    let days = days_from_civil(year, month, day);
    let secs = days
        .checked_mul(86_400)
        .and_then(|d| d.checked_add(secs_of_day))
        .and_then(|d| d.checked_sub(offset_secs))
        .ok_or(Errno::ERANGE)?;
    Ok(TimeSpec { secs, nsecs })
}

fn round_to_millis(nsecs: u32) -> u32 {
    ((nsecs + 500_000) / 1_000_000).min(999) * 1_000_000
}

fn parse_utc_offset(s: &str) -> Result<i64, Errno> {
    let sign = match s.as_bytes().first() {
        Some(b'+') => 1,
        Some(b'-') => -1,
        _ => return Err(Errno::EINVAL),
    };
    let (h, m) = match s.len() {
        6 if s.as_bytes()[3] == b':' => (&s[1..3], &s[4..6]),
        5 => (&s[1..3], &s[3..5]),
        3 => (&s[1..3], "0"),
        _ => return Err(Errno::EINVAL),
    };
    let hours: i64 = h.parse().map_err(|_| Errno::EINVAL)?;
    let minutes: i64 = m.parse().map_err(|_| Errno::EINVAL)?;
    Ok(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_roundtrip_identity() {
        for n in [
            0i64,
            1,
            999_999_999,
            1_000_000_000,
            1_672_531_200_123_456_789,
            i64::MAX,
            -1,
            -1_000_000_001,
            i64::MIN,
        ] {
            assert_eq!(TimeSpec::from_nanos(n).as_nanos(), n, "roundtrip of {n}");
        }
    }

    #[test]
    fn negative_nanos_split() {
        let t = TimeSpec::from_nanos(-1);
        assert_eq!((t.secs, t.nsecs), (-1, 999_999_999));
    }

    #[test]
    fn system_time_before_epoch() {
        let before = UNIX_EPOCH - Duration::new(1, 200_000_000);
        let t = TimeSpec::from_system_time(before);
        assert_eq!((t.secs, t.nsecs), (-2, 800_000_000));
        assert_eq!(t.to_system_time(), before);
    }

    #[test]
    fn system_time_roundtrip_now() {
        let now = SystemTime::now();
        assert_eq!(TimeSpec::from_system_time(now).to_system_time(), now);
    }

    #[test]
    fn float_heuristic() {
        // 2023-01-01 as seconds.
        assert_eq!(TimeSpec::from_float(1_672_531_200.5).secs, 1_672_531_200);
        // Same instant as milliseconds.
        assert_eq!(
            TimeSpec::from_float(1_672_531_200_000.0).secs,
            1_672_531_200
        );
        assert_eq!(TimeSpec::from_float(0.25), TimeSpec::new(0, 250_000_000));
    }

    #[test]
    fn parse_decimal_strings() {
        assert_eq!(
            TimeSpec::parse("5.123456789").unwrap(),
            TimeSpec::new(5, 123_456_789)
        );
        assert_eq!(
            TimeSpec::parse("5.5").unwrap(),
            TimeSpec::new(5, 500_000_000)
        );
        assert_eq!(TimeSpec::parse("42").unwrap(), TimeSpec::new(42, 0));
        assert_eq!(
            TimeSpec::parse("-0.25").unwrap(),
            TimeSpec::from_nanos(-250_000_000)
        );
        assert!(TimeSpec::parse("").is_err());
        assert!(TimeSpec::parse("5.").is_err());
        assert!(TimeSpec::parse("abc").is_err());
    }

    #[test]
    fn parse_iso_dates() {
        assert_eq!(
            TimeSpec::parse("2023-01-01T00:00:00Z").unwrap(),
            TimeSpec::new(1_672_531_200, 0)
        );
        assert_eq!(TimeSpec::parse("1970-01-01").unwrap(), TimeSpec::EPOCH);
        assert_eq!(
            TimeSpec::parse("1969-12-31T23:59:59Z").unwrap(),
            TimeSpec::new(-1, 0)
        );
        // Offsets shift toward UTC.
        assert_eq!(
            TimeSpec::parse("2023-01-01T01:00:00+01:00").unwrap(),
            TimeSpec::new(1_672_531_200, 0)
        );
        assert!(TimeSpec::parse("2023-13-01").is_err());
        assert!(TimeSpec::parse("2023-01-01T25:00:00").is_err());
    }

    #[test]
    fn iso_fraction_rounds_to_milliseconds() {
        let t = TimeSpec::parse("2023-01-01T00:00:00.1239Z").unwrap();
        assert_eq!(t.nsecs, 124_000_000);
    }

    #[test]
    fn arithmetic_preserves_precision() {
        let t = TimeSpec::from_nanos(1_672_531_200_123_456_789);
        assert_eq!(t.add_millis(1).as_nanos(), 1_672_531_200_124_456_789);
        assert_eq!(t.add_secs(-1).as_nanos(), 1_672_531_199_123_456_789);
        assert_eq!(t.add_nanos(1).diff_nanos(t), 1);
    }

    #[test]
    fn normalizing_constructor() {
        let t = TimeSpec::new(1, 1_500_000_000);
        assert_eq!((t.secs, t.nsecs), (2, 500_000_000));
    }
}
