//! Clocks and absolute-deadline arithmetic.
//!
//! Every blocking call in the substrate accepts either an absolute time limit
//! (CLOCK_REALTIME, nanosecond precision) or a relative limit in seconds.
//! Relative limits are converted once, up front, into a [`Deadline`] so that
//! retried waits do not drift.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Number of nanoseconds per second.
pub const NANOSECONDS_PER_SECOND: i64 = 1_000_000_000;

/// Relative timeouts at least this large (in seconds) mean "wait forever".
pub const MAX_TIME_SECONDS: f64 = i64::MAX as f64;

/// Time with nanosecond resolution, as stored in shared memory.
///
/// Invariant: `0 <= nsec < 1_000_000_000` once normalized.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeSpec {
    /// Seconds.
    pub sec: i64,
    /// Nanoseconds.
    pub nsec: i64,
}

impl TimeSpec {
    /// The zero time stamp.
    pub const ZERO: TimeSpec = TimeSpec { sec: 0, nsec: 0 };

    /// Current value of the real-time clock (CLOCK_REALTIME).
    pub fn now() -> Result<TimeSpec> {
        clock_get(libc::CLOCK_REALTIME, "time_now")
    }

    /// Current value of the monotonic clock, for measuring intervals.
    pub fn monotonic() -> Result<TimeSpec> {
        clock_get(libc::CLOCK_MONOTONIC, "time_monotonic")
    }

    /// Normalize so that `nsec` lies in `[0, 1e9)`.
    pub fn normalized(mut self) -> TimeSpec {
        if self.nsec >= NANOSECONDS_PER_SECOND || self.nsec < 0 {
            self.sec += self.nsec.div_euclid(NANOSECONDS_PER_SECOND);
            self.nsec = self.nsec.rem_euclid(NANOSECONDS_PER_SECOND);
        }
        self
    }

    /// Add a duration in (possibly fractional) seconds, saturating on
    /// overflow.
    pub fn add_secs(self, secs: f64) -> TimeSpec {
        if !secs.is_finite() || secs >= MAX_TIME_SECONDS {
            return TimeSpec {
                sec: i64::MAX,
                nsec: NANOSECONDS_PER_SECOND - 1,
            };
        }
        let whole = secs.floor();
        let frac_ns = ((secs - whole) * NANOSECONDS_PER_SECOND as f64).round() as i64;
        let sec = self.sec.saturating_add(whole as i64);
        TimeSpec {
            sec,
            nsec: self.nsec + frac_ns,
        }
        .normalized()
    }

    /// Elapsed seconds since `origin` (may be negative).
    pub fn elapsed_since(self, origin: TimeSpec) -> f64 {
        (self.sec - origin.sec) as f64 + (self.nsec - origin.nsec) as f64 * 1e-9
    }

    /// Value as fractional seconds since the epoch of the clock it was read
    /// from.
    pub fn as_secs_f64(self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }

    /// Convert to the C representation used by timed system calls.
    pub fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }
}

fn clock_get(clk: libc::clockid_t, func: &'static str) -> Result<TimeSpec> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for clock_gettime.
    if unsafe { libc::clock_gettime(clk, &mut ts) } != 0 {
        return Err(Error::last_os_error(func));
    }
    Ok(TimeSpec {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as i64,
    })
}

/// Absolute time limit for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deadline {
    /// Do not block at all; equivalent to the `try_` variants.
    Immediate,
    /// Block until the CLOCK_REALTIME value reaches the limit.
    At(TimeSpec),
    /// Block without limit.
    Forever,
}

impl Deadline {
    /// Convert a relative limit in seconds into an absolute deadline.
    ///
    /// Non-positive limits do not block; limits of [`MAX_TIME_SECONDS`] or
    /// more (including infinity) block forever.
    pub fn after(secs: f64) -> Result<Deadline> {
        if secs <= 0.0 || secs.is_nan() {
            Ok(Deadline::Immediate)
        } else if secs >= MAX_TIME_SECONDS {
            Ok(Deadline::Forever)
        } else {
            Ok(Deadline::At(TimeSpec::now()?.add_secs(secs)))
        }
    }

    /// Whether the deadline has already passed.
    pub fn expired(&self) -> Result<bool> {
        match self {
            Deadline::Immediate => Ok(true),
            Deadline::Forever => Ok(false),
            Deadline::At(lim) => Ok(TimeSpec::now()? >= *lim),
        }
    }
}

/// Suspend the calling thread for (fractional) seconds.
pub fn sleep_secs(secs: f64) {
    if secs > 0.0 && secs.is_finite() {
        std::thread::sleep(std::time::Duration::from_secs_f64(secs));
    }
}
