//! The three tier sampling loops and their absolute-deadline timing.
//!
//! Each tier runs on its own thread against a deadline grid anchored at
//! the profiler's start time: sleep to the next absolute deadline with
//! `clock_nanosleep(TIMER_ABSTIME)`, sample, advance. When a tier falls
//! more than one full period behind, the missed grid slots are skipped
//! outright; catch-up bursts would break the strictly-increasing
//! interval expectation, and honest gaps in `time_s` are preferable.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ring::SampleRing;
use crate::sources::{FastSources, MediumSources, SlowSources};
use crate::trace::format::{FastSample, MediumSample, SlowSample};

/// Delay before the medium and slow tiers record their first sample, so
/// the fast tier's delta sources have primed.
pub(crate) const WARMUP_NS: u64 = 10_000_000;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Current `CLOCK_MONOTONIC` reading in nanoseconds.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// Sleeps until an absolute `CLOCK_MONOTONIC` deadline.
fn sleep_until(deadline_ns: u64) {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    ts.tv_sec = (deadline_ns / NANOS_PER_SEC) as libc::time_t;
    ts.tv_nsec = (deadline_ns % NANOS_PER_SEC) as libc::c_long;
    loop {
        let ret = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if ret != libc::EINTR {
            return;
        }
    }
}

/// Advances a deadline past `now`, skipping whole missed periods.
fn next_deadline(deadline_ns: u64, now_ns: u64, period_ns: u64) -> u64 {
    let mut next = deadline_ns;
    if now_ns >= next + period_ns {
        let missed = (now_ns - next) / period_ns;
        next += missed * period_ns;
    }
    next + period_ns
}

/// Deadline grid for one tier.
pub(crate) struct TierClock {
    period_ns: u64,
    next_ns: u64,
}

impl TierClock {
    pub fn new(hz: u32, start_ns: u64, warmup_ns: u64) -> TierClock {
        TierClock {
            period_ns: NANOS_PER_SEC / hz as u64,
            next_ns: start_ns + warmup_ns,
        }
    }

    /// Sleeps to the next deadline and returns the wake time.
    pub fn tick(&mut self) -> u64 {
        sleep_until(self.next_ns);
        let now = monotonic_ns();
        self.next_ns = next_deadline(self.next_ns, now, self.period_ns);
        now
    }
}

fn elapsed_s(start_ns: u64, now_ns: u64) -> f64 {
    (now_ns - start_ns) as f64 / 1e9
}

pub(crate) fn fast_loop(
    mut sources: FastSources,
    ring: Arc<SampleRing<FastSample>>,
    stop: Arc<AtomicBool>,
    start_ns: u64,
    hz: u32,
) {
    let mut clock = TierClock::new(hz, start_ns, 0);
    loop {
        let now = clock.tick();
        if stop.load(Ordering::Acquire) {
            return;
        }
        let mut sample = FastSample::default();
        sample.time_s = elapsed_s(start_ns, now);
        sources.read_into(&mut sample, now);
        ring.push(sample);
    }
}

pub(crate) fn medium_loop(
    mut sources: MediumSources,
    ring: Arc<SampleRing<MediumSample>>,
    stop: Arc<AtomicBool>,
    start_ns: u64,
    hz: u32,
) {
    let mut clock = TierClock::new(hz, start_ns, WARMUP_NS);
    loop {
        let now = clock.tick();
        if stop.load(Ordering::Acquire) {
            return;
        }
        let mut sample = MediumSample::default();
        sample.time_s = elapsed_s(start_ns, now);
        sources.read_into(&mut sample);
        ring.push(sample);
    }
}

pub(crate) fn slow_loop(
    mut sources: SlowSources,
    ring: Arc<SampleRing<SlowSample>>,
    stop: Arc<AtomicBool>,
    start_ns: u64,
    hz: u32,
) {
    let mut clock = TierClock::new(hz, start_ns, WARMUP_NS);
    loop {
        let now = clock.tick();
        if stop.load(Ordering::Acquire) {
            return;
        }
        let mut sample = SlowSample::default();
        sample.time_s = elapsed_s(start_ns, now);
        sources.read_into(&mut sample);
        ring.push(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn deadline_advances_by_one_period_when_on_time() {
        assert_eq!(next_deadline(10 * MS, 10 * MS + 100, MS), 11 * MS);
    }

    #[test]
    fn deadline_skips_missed_periods_without_bursts() {
        // woke 3.5 periods late: slots 11..13 are abandoned
        let next = next_deadline(10 * MS, 13 * MS + MS / 2, MS);
        assert_eq!(next, 14 * MS);
    }

    #[test]
    fn deadline_skip_lands_in_the_future() {
        for late_ns in &[0, 1, MS - 1, MS, 10 * MS + 17] {
            let now = 5 * MS + late_ns;
            let next = next_deadline(5 * MS, now, MS);
            assert!(next > now, "next {} not past now {}", next, now);
            assert_eq!((next - 5 * MS) % MS, 0, "deadline left the grid");
        }
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn sleep_until_honors_absolute_deadline() {
        let deadline = monotonic_ns() + 2 * MS;
        sleep_until(deadline);
        assert!(monotonic_ns() >= deadline);
    }

    #[test]
    fn sleep_until_past_deadline_returns_immediately() {
        let before = monotonic_ns();
        sleep_until(before.saturating_sub(MS));
        assert!(monotonic_ns() - before < 100 * MS);
    }
}
