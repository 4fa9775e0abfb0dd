//! Emulation speed tracking from sample push cadence.
//!
//! Ticks are samples, an update is one push. Averaging over a window of a few
//! tens of milliseconds smooths the cycle-level jitter that would otherwise
//! break resampling; a second window clipped to the current speed regime lets
//! the mixer react promptly while falling back to history during hitches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::atomics::AtomicF64;

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Measures the ratio between audio input cadence and wall time.
///
/// The producer thread calls [`update`](Self::update) and
/// [`cache_average_speed`](Self::cache_average_speed); the audio callback
/// reads the cached values through atomics and never touches the delta
/// window.
pub struct SpeedCounter {
    epoch: Instant,
    window: Mutex<SpeedWindow>,
    /// Expected seconds between two updates at full speed.
    target_delta: AtomicF64,
    /// Microseconds since `epoch` of the last update.
    last_time: AtomicU64,
    cached_average: AtomicF64,
    cached_average_num: AtomicU32,
    regime_cached_average: AtomicF64,
    regime_cached_average_num: AtomicU32,
    cached_last_delta: AtomicF64,
    last_paused_time: AtomicU64,
    paused: AtomicBool,
}

/// Producer-side delta window. Never touched by the callback thread.
struct SpeedWindow {
    /// Seconds elapsed between consecutive updates, oldest first.
    last_deltas: VecDeque<f64>,
    /// Max total time the window may span.
    average_time: f64,
    ticks_per_sec: f64,
    ticks_per_upd: f64,
}

impl SpeedWindow {
    /// Recompute the target delta; rescale stored deltas so the reported
    /// speed stays continuous across a cadence change.
    fn retune(&mut self, target_delta: &AtomicF64) {
        let prev = target_delta.load(Ordering::Relaxed);
        let next = self.ticks_per_upd / self.ticks_per_sec;
        target_delta.store(next, Ordering::Relaxed);
        let relative_change = next / prev;
        for delta in &mut self.last_deltas {
            *delta *= relative_change;
        }
    }

    /// Sum the newest deltas up to `max_average_time` (entire window when
    /// negative). The delta that crosses the limit is still included.
    fn tail_total(&self, max_average_time: f64) -> (f64, u32) {
        let mut total = 0.0;
        let mut num = 0u32;
        for delta in self.last_deltas.iter().rev() {
            total += delta;
            num += 1;
            if max_average_time >= 0.0 && total > max_average_time {
                break;
            }
        }
        (total, num)
    }
}

impl SpeedCounter {
    pub fn new(average_time: f64, ticks_per_sec: f64, ticks_per_upd: f64) -> Self {
        let ticks_per_sec = ticks_per_sec.max(1.0);
        let ticks_per_upd = ticks_per_upd.max(1.0);
        let counter = Self {
            epoch: Instant::now(),
            window: Mutex::new(SpeedWindow {
                last_deltas: VecDeque::new(),
                average_time,
                ticks_per_sec,
                ticks_per_upd,
            }),
            target_delta: AtomicF64::new(1.0),
            last_time: AtomicU64::new(0),
            cached_average: AtomicF64::new(0.0),
            cached_average_num: AtomicU32::new(0),
            regime_cached_average: AtomicF64::new(0.0),
            regime_cached_average_num: AtomicU32::new(0),
            cached_last_delta: AtomicF64::new(-1.0),
            last_paused_time: AtomicU64::new(0),
            paused: AtomicBool::new(false),
        };
        {
            let mut window = counter.window.lock().unwrap_or_else(|e| e.into_inner());
            window.retune(&counter.target_delta);
        }
        counter
            .last_time
            .store(counter.now_us(), Ordering::Relaxed);
        counter
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn time_delta(&self, old_time_us: u64, now_us: u64) -> f64 {
        now_us.saturating_sub(old_time_us) as f64 / MICROS_PER_SEC
    }

    /// (Re)start measuring. With `simulate_full_speed` the window is
    /// pre-filled with the target delta so the counter reads 1.0 until real
    /// cadence data arrives.
    pub fn start(&self, simulate_full_speed: bool) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        self.last_time.store(self.now_us(), Ordering::Relaxed);
        window.last_deltas.clear();
        let target_delta = self.target_delta.load(Ordering::Relaxed);
        if simulate_full_speed {
            self.cached_last_delta.store(target_delta, Ordering::Relaxed);
            let size = ((window.average_time / target_delta) as usize).max(1);
            window.last_deltas.resize(size, target_delta);
        } else {
            self.cached_last_delta.store(-1.0, Ordering::Relaxed);
        }
    }

    /// Record a push of `elapsed_ticks` samples at the current time.
    pub fn update(&self, elapsed_ticks: f64) {
        self.update_at(elapsed_ticks, self.now_us());
    }

    /// [`update`](Self::update) with an explicit timestamp (tests drive this).
    pub fn update_at(&self, elapsed_ticks: f64, now_us: u64) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if elapsed_ticks != window.ticks_per_upd {
            window.ticks_per_upd = elapsed_ticks.max(1.0);
            window.retune(&self.target_delta);
        }

        let delta = self.time_delta(self.last_time.load(Ordering::Relaxed), now_us);
        self.last_time.store(now_us, Ordering::Relaxed);
        self.cached_last_delta.store(delta, Ordering::Relaxed);

        // Drop deltas that fell out of the averaging window.
        let mut total = delta;
        let mut keep = window.last_deltas.len();
        for (kept, old) in window.last_deltas.iter().rev().enumerate() {
            total += old;
            if total > window.average_time {
                keep = kept;
                break;
            }
        }
        let excess = window.last_deltas.len() - keep.min(window.last_deltas.len());
        window.last_deltas.drain(..excess);

        window.last_deltas.push_back(delta);
    }

    /// Speed of the most recent interval. When `predict` and the last push is
    /// already late, the still-running interval is used instead and the
    /// returned flag stays `true`.
    pub fn last_speed(&self, predict: bool, simulate_full_speed: bool) -> (f64, bool) {
        self.last_speed_at(predict, simulate_full_speed, self.now_us())
    }

    pub fn last_speed_at(
        &self,
        predict: bool,
        simulate_full_speed: bool,
        now_us: u64,
    ) -> (f64, bool) {
        let target_delta = self.target_delta.load(Ordering::Relaxed);
        if predict {
            let delta = self.time_delta(self.last_time.load(Ordering::Relaxed), now_us);
            if delta > target_delta {
                return (target_delta / delta, true);
            }
        }

        let cached_last_delta = self.cached_last_delta.load(Ordering::Relaxed);
        if cached_last_delta > 0.0 {
            return (target_delta / cached_last_delta, false);
        }
        (if simulate_full_speed { 1.0 } else { 0.0 }, false)
    }

    /// Average speed over up to `max_average_time` seconds of the window
    /// (whole window when negative). Locks the window; host/test use only.
    pub fn average_speed(
        &self,
        predict: bool,
        simulate_full_speed: bool,
        max_average_time: f64,
    ) -> f64 {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let target_delta = self.target_delta.load(Ordering::Relaxed);
        let mut total = 0.0;
        let mut num = 0u32;

        if predict {
            let delta = self.time_delta(self.last_time.load(Ordering::Relaxed), self.now_us());
            if delta > target_delta {
                total += delta;
                num += 1;
            }
        }

        let (tail, tail_num) = window.tail_total(max_average_time);
        total += tail;
        num += tail_num;

        if num == 0 {
            return if simulate_full_speed { 1.0 } else { 0.0 };
        }
        target_delta / (total / num as f64)
    }

    /// Recompute one of the two cached averages from the window. `regime`
    /// selects the secondary cache clipped to `max_average_time` (the time
    /// spent at a custom speed).
    pub fn cache_average_speed(&self, regime: bool, max_average_time: f64) {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let (total, num) = window.tail_total(max_average_time);
        if regime {
            self.regime_cached_average.store(total, Ordering::Relaxed);
            self.regime_cached_average_num.store(num, Ordering::Relaxed);
        } else {
            self.cached_average.store(total, Ordering::Relaxed);
            self.cached_average_num.store(num, Ordering::Relaxed);
        }
    }

    /// Cached average speed; lock-free, callable from the callback thread.
    ///
    /// With `predict`, a late interval is merged in and the cached history
    /// loses proportional weight, as the oldest deltas cannot be dropped
    /// from here.
    pub fn cached_average_speed(
        &self,
        regime: bool,
        predict: bool,
        simulate_full_speed: bool,
    ) -> f64 {
        self.cached_average_speed_at(regime, predict, simulate_full_speed, self.now_us())
    }

    pub fn cached_average_speed_at(
        &self,
        regime: bool,
        predict: bool,
        simulate_full_speed: bool,
        now_us: u64,
    ) -> f64 {
        let (mut total, mut num) = if regime {
            (
                self.regime_cached_average.load(Ordering::Relaxed),
                self.regime_cached_average_num.load(Ordering::Relaxed) as i32,
            )
        } else {
            (
                self.cached_average.load(Ordering::Relaxed),
                self.cached_average_num.load(Ordering::Relaxed) as i32,
            )
        };
        let target_delta = self.target_delta.load(Ordering::Relaxed);

        if predict {
            let delta = self.time_delta(self.last_time.load(Ordering::Relaxed), now_us);
            if delta > target_delta {
                let times_over = (delta / target_delta) as i32;
                let kept = (num - times_over).max(1);
                total *= kept as f64 / num.max(1) as f64;
                num = kept;

                total += delta;
                num += 1;
            }
        }

        if num == 0 {
            return if simulate_full_speed { 1.0 } else { 0.0 };
        }
        target_delta / (total / num as f64)
    }

    /// Pausing freezes the reference timestamp; on resume it is shifted by
    /// the paused duration so the next delta is not inflated.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::Relaxed) == paused {
            return;
        }
        let now = self.now_us();
        if paused {
            self.last_paused_time.store(now, Ordering::Relaxed);
        } else {
            let paused_for = now.saturating_sub(self.last_paused_time.load(Ordering::Relaxed));
            let last = self.last_time.load(Ordering::Relaxed);
            self.last_time.store(last + paused_for, Ordering::Relaxed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_ticks_per_second(&self, ticks_per_sec: f64) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.ticks_per_sec = ticks_per_sec.max(1.0);
        window.retune(&self.target_delta);
    }

    /// Sets the length of time the window averages over.
    pub fn set_average_time(&self, average_time: f64) {
        // Older deltas fall out naturally on the next update.
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.average_time = average_time;
    }

    pub fn target_delta(&self) -> f64 {
        self.target_delta.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const US: u64 = 1;
    const MS: u64 = 1_000 * US;

    /// Feed `pushes` updates of `ticks` samples spaced `spacing_us` apart,
    /// starting at `start_us`. Returns the timestamp after the last push.
    fn feed(counter: &SpeedCounter, ticks: f64, pushes: u32, spacing_us: u64, start_us: u64) -> u64 {
        let mut now = start_us;
        for _ in 0..pushes {
            now += spacing_us;
            counter.update_at(ticks, now);
        }
        now
    }

    #[test]
    fn full_speed_then_half_speed() {
        let counter = SpeedCounter::new(0.425, 48_000.0, 4_800.0);

        // 48 000 samples over 1.000s: ten pushes of 4 800 every 100ms.
        let now = feed(&counter, 4_800.0, 10, 100 * MS, 0);
        counter.cache_average_speed(false, -1.0);
        let speed = counter.cached_average_speed_at(false, false, true, now);
        assert!((speed - 1.0).abs() < 0.05, "speed was {speed}");

        // Same sample count over 2.000s: half speed once the window turns over.
        let now = feed(&counter, 4_800.0, 10, 200 * MS, now);
        counter.cache_average_speed(false, -1.0);
        let speed = counter.cached_average_speed_at(false, false, true, now);
        assert!((speed - 0.5).abs() < 0.05 * 0.5, "speed was {speed}");
    }

    #[test]
    fn last_speed_predicts_when_stale() {
        let counter = SpeedCounter::new(0.425, 48_000.0, 4_800.0);
        let now = feed(&counter, 4_800.0, 5, 100 * MS, 0);

        // Fresh: reports the recorded interval, no prediction.
        let (speed, predicting) = counter.last_speed_at(true, true, now + MS);
        assert!(!predicting);
        assert!((speed - 1.0).abs() < 0.01);

        // The next push is overdue: the running interval wins.
        let (speed, predicting) = counter.last_speed_at(true, true, now + 400 * MS);
        assert!(predicting);
        assert!(speed < 0.3);
    }

    #[test]
    fn start_simulating_full_speed_reads_one() {
        let counter = SpeedCounter::new(0.425, 32_000.0, 560.0);
        counter.start(true);
        let (speed, _) = counter.last_speed_at(false, true, 0);
        assert!((speed - 1.0).abs() < 1e-9);
        // Cached averages have not been computed yet; the fallback still
        // reports full speed.
        assert_eq!(counter.cached_average_speed_at(false, false, true, 0), 1.0);
    }

    #[test]
    fn pause_does_not_inflate_the_next_delta() {
        let counter = SpeedCounter::new(0.425, 48_000.0, 4_800.0);
        let now = feed(&counter, 4_800.0, 5, 100 * MS, 0);

        counter.set_paused(true);
        assert!(counter.is_paused());
        counter.set_paused(false);

        // The resume shift is measured against the real clock, so only check
        // that the tracked reference did not fall behind the feed time.
        assert!(counter.last_time.load(Ordering::Relaxed) >= now - 500 * MS);
    }

    #[test]
    fn cadence_change_keeps_speed_continuous() {
        let counter = SpeedCounter::new(0.425, 48_000.0, 4_800.0);
        let now = feed(&counter, 4_800.0, 10, 100 * MS, 0);

        // Push half the samples twice as often: still real time.
        let now = feed(&counter, 2_400.0, 10, 50 * MS, now);
        counter.cache_average_speed(false, -1.0);
        let speed = counter.cached_average_speed_at(false, false, true, now);
        assert!((speed - 1.0).abs() < 0.05, "speed was {speed}");
    }
}
