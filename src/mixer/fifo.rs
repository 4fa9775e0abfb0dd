//! Per-source sample FIFO: a lock-free SPSC ring of interleaved stereo
//! frames with an embedded cubic resampler.
//!
//! One emulated source (DSP DMA, disc streaming, a remote-controller
//! speaker) pushes frames at whatever cadence emulation produces them; the
//! audio callback resamples them out at the backend rate. Neither side ever
//! waits: over-full pushes are clipped, and an underrun is covered by playing
//! the buffered samples backwards (constantly pushed sources) or by holding
//! the last output sample (sparse sources).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::atomics::AtomicF64;

/// Ring capacity in stereo frames. A power of two so wrap-around is a mask.
/// It is important this is high enough to leave plenty of already-played
/// frames for the backwards underrun cover during a stutter.
pub const MAX_SAMPLES: u32 = 1 << 16;

/// Channels per frame. Most of the code is channel-agnostic against this.
pub(crate) const NC: u32 = 2;

pub(crate) const INDEX_MASK: u32 = MAX_SAMPLES * NC - 1;

/// Frames reserved around the read cursor for the cubic kernel; the first
/// and last act as control points.
pub const INTERP_SAMPLES: u32 = 3;

const COEFFS: [f32; 16] = [
    -0.5, 1.0, -0.5, 0.0, //
    1.5, -2.5, 0.0, 1.0, //
    -1.5, 2.0, 0.5, 0.0, //
    0.5, -0.5, 0.0, 0.0, //
];

/// Consumer-confined cursor state. Only the audio callback touches this.
struct FifoReader {
    /// Secondary cursor used while playing buffered samples backwards.
    backwards_index_r: u32,
    backwards_fract: f64,
    /// Last produced sample per channel, in i32 because interpolation can
    /// exceed i16 before the additive clamp. Seeds the next block and is the
    /// padding value.
    last_output_samples: [i32; 2],
}

/// Lock-free single-producer/single-consumer ring with a resampling reader.
///
/// Threading contract:
/// - exactly one producer thread calls [`push`](Self::push) /
///   [`update_push`](Self::update_push);
/// - exactly one consumer thread (the audio callback, serialised by the
///   mixer's reentrancy guard) calls [`mix`](Self::mix);
/// - rate and volume setters may be called from anywhere.
///
/// `index_w` is released after the sample copy and acquired before reads, so
/// the consumer never observes unpublished slots. Everything else the two
/// sides share is an atomic scalar where a stale read is benign.
pub(crate) struct SampleFifo {
    buffer: UnsafeCell<Box<[i16]>>,
    /// Total samples written; the next slot to write is `index_w & mask`.
    /// Starts past the interpolation window so playback blends in from the
    /// initial silence.
    index_w: AtomicU32,
    /// Total samples read minus one: the slot currently under the
    /// interpolation cursor. `index_w == index_r` means drained.
    index_r: AtomicU32,
    input_sample_rate: AtomicF64,
    /// Mirrored from the mixer so free-space estimates and the resample
    /// ratio need no back-reference.
    output_sample_rate: AtomicU32,
    playback_speed: AtomicF64,
    /// Fractional read position in [0, 1), or -1 to request a reset on the
    /// next read. Written by the consumer; the producer reads it when
    /// estimating free space.
    fract: AtomicF64,
    /// 0..=256 fixed point.
    l_volume: AtomicI32,
    r_volume: AtomicI32,
    currently_pushed: AtomicBool,
    last_push_timer: AtomicF64,
    reader: UnsafeCell<FifoReader>,
    /// Sources that push continuously can be played backwards on underrun;
    /// sparse sources cannot (we do not know when their sound started).
    constantly_pushed: bool,
    /// Samples are stored verbatim as pushed; big-endian sources are swapped
    /// at read time into the consumer's scratch buffer.
    big_endian: bool,
}

// SAFETY: the `UnsafeCell` contents are partitioned by the threading
// contract above. Ring slots are written only by the single producer before
// the release store of `index_w` and read only after an acquire load of it;
// `FifoReader` is only touched under the mixer's consumer guard.
unsafe impl Send for SampleFifo {}
unsafe impl Sync for SampleFifo {}

impl SampleFifo {
    pub(crate) fn new(
        input_sample_rate: f64,
        output_sample_rate: u32,
        big_endian: bool,
        constantly_pushed: bool,
    ) -> Self {
        Self {
            buffer: UnsafeCell::new(vec![0i16; (MAX_SAMPLES * NC) as usize].into_boxed_slice()),
            index_w: AtomicU32::new((INTERP_SAMPLES + 1) * NC),
            index_r: AtomicU32::new(0),
            input_sample_rate: AtomicF64::new(input_sample_rate),
            output_sample_rate: AtomicU32::new(output_sample_rate),
            playback_speed: AtomicF64::new(1.0),
            fract: AtomicF64::new(-1.0),
            l_volume: AtomicI32::new(256),
            r_volume: AtomicI32::new(256),
            currently_pushed: AtomicBool::new(false),
            last_push_timer: AtomicF64::new(-1.0),
            reader: UnsafeCell::new(FifoReader {
                backwards_index_r: 0,
                backwards_fract: -1.0,
                last_output_samples: [0; 2],
            }),
            constantly_pushed,
            big_endian,
        }
    }

    /// Copies interleaved stereo frames into the ring. If the push exceeds
    /// the free space it is clipped and the excess is dropped; accepting new
    /// frames before the current ones have played would not make sense.
    pub(crate) fn push(&self, samples: &[i16]) {
        let mut num_samples = (samples.len() as u32) / NC;
        if num_samples == 0 {
            return;
        }

        let index_w = self.index_w.load(Ordering::Acquire);
        let fifo_samples = self.samples_difference(index_w, self.index_r.load(Ordering::Acquire));

        if num_samples * NC + fifo_samples > MAX_SAMPLES * NC {
            num_samples = MAX_SAMPLES - fifo_samples / NC;
        }

        // Raw copy only; resampling and endian handling happen on the
        // consumer side so this stays cheap for the emulation thread.
        let count = (num_samples * NC) as usize;
        // SAFETY: single producer; these slots are not published until the
        // release store below.
        let buffer = unsafe { &mut *self.buffer.get() };
        let start = (index_w & INDEX_MASK) as usize;
        let first = count.min(buffer.len() - start);
        buffer[start..start + first].copy_from_slice(&samples[..first]);
        buffer[..count - first].copy_from_slice(&samples[first..count]);

        self.index_w
            .store(index_w.wrapping_add(count as u32), Ordering::Release);
    }

    /// Pushes `frames` of silence (producer side, transitions only).
    fn push_silence(&self, frames: u32) {
        const CHUNK: usize = 256;
        let silence = [0i16; CHUNK * NC as usize];
        let mut remaining = frames as usize;
        while remaining > 0 {
            let n = remaining.min(CHUNK);
            self.push(&silence[..n * NC as usize]);
            remaining -= n;
        }
    }

    /// Adds up to `num_samples` resampled frames into `samples` (which the
    /// caller pre-zeroed or pre-mixed) and returns how many came from real
    /// data; the rest were covered by the underrun strategy. `interp` is the
    /// consumer-owned endian-swap scratch, ring-sized.
    pub(crate) fn mix(
        &self,
        samples: &mut [i16],
        num_samples: u32,
        stretching: bool,
        interp: &mut [i16],
    ) -> u32 {
        debug_assert!(samples.len() >= (num_samples * NC) as usize);
        debug_assert!(interp.len() == (MAX_SAMPLES * NC) as usize);

        // Cache the indices: we are the only writer of `index_r`, and
        // `index_w` only ever grows, so data pushed mid-mix is simply picked
        // up next time.
        let mut index_r = self.index_r.load(Ordering::Acquire);
        let index_w = self.index_w.load(Ordering::Acquire);

        let in_rate = self.input_sample_rate.load(Ordering::Relaxed);
        let out_rate = self.output_sample_rate.load(Ordering::Relaxed) as f64;
        let speed = if stretching {
            // The stretcher owns the tempo.
            1.0
        } else {
            self.playback_speed.load(Ordering::Relaxed)
        };
        // No anti-aliasing filter beyond the cubic kernel, so very high
        // ratios can alias; acceptable for the rates the console produces.
        let mut rate = in_rate * speed / out_rate;

        let l_volume = self.l_volume.load(Ordering::Relaxed);
        let r_volume = self.r_volume.load(Ordering::Relaxed);

        // SAFETY: consumer-confined state, serialised by the mixer guard.
        let reader = unsafe { &mut *self.reader.get() };
        let mut last = reader.last_output_samples;
        let mut fract = self.fract.load(Ordering::Relaxed);

        let actual_samples_count = self.cubic_interpolation(
            samples,
            num_samples,
            rate,
            &mut index_r,
            index_w,
            &mut last,
            l_volume,
            r_volume,
            true,
            &mut fract,
            interp,
        );
        reader.last_output_samples = last;

        if actual_samples_count != num_samples {
            if actual_samples_count > 0 {
                // Start the backwards cursor past the interpolation window so
                // its first frame lands as close as possible to the last
                // forward one (the cursor advances before reading).
                reader.backwards_index_r = index_r.wrapping_add(INTERP_SAMPLES * NC);
                reader.backwards_fract = 1.0 - fract;
            }
            // Park the read cursor so that when the producer catches up, the
            // first new frame sits right after the last forward-played one.
            // The sentinel also lets perfect ratios re-align fract after a
            // speed dip would have ruined an always-zero fract.
            index_r = index_w.wrapping_sub(INTERP_SAMPLES * NC);
            fract = -1.0;
        }
        self.fract.store(fract, Ordering::Relaxed);

        let behind_samples = num_samples - actual_samples_count;
        if behind_samples > 0 && self.constantly_pushed && !stretching {
            // Play the buffered samples backwards until forward data returns.
            // Ignore the emulation speed here; there is nothing to predict it
            // from while we are starved.
            rate = in_rate / out_rate;
            let back = &mut samples[(actual_samples_count * NC) as usize..];
            let mut backwards_index_r = reader.backwards_index_r;
            let mut backwards_fract = reader.backwards_fract;
            self.cubic_interpolation(
                back,
                behind_samples,
                rate,
                &mut backwards_index_r,
                index_w,
                &mut last,
                l_volume,
                r_volume,
                false,
                &mut backwards_fract,
                interp,
            );
            reader.backwards_index_r = backwards_index_r;
            reader.backwards_fract = backwards_fract;
        } else if behind_samples > 0
            && (self.constantly_pushed || self.currently_pushed.load(Ordering::Relaxed))
        {
            // Hold the last sample so the wave does not snap to zero.
            for i in actual_samples_count..num_samples {
                let base = (i * NC) as usize;
                samples[base] = clamp16(samples[base] as i32 + reader.last_output_samples[0]);
                samples[base + 1] =
                    clamp16(samples[base + 1] as i32 + reader.last_output_samples[1]);
            }
        }

        self.index_r.store(index_r, Ordering::Release);

        actual_samples_count
    }

    /// Four-point cubic resampler. Adds into `samples`, clamping after the
    /// add so opposite-sign headroom can cancel. Returns the frames actually
    /// produced. With `forwards == false` the same kernel walks the ring in
    /// reverse and may read the whole ring (already-played data).
    #[allow(clippy::too_many_arguments)]
    fn cubic_interpolation(
        &self,
        samples: &mut [i16],
        num_samples: u32,
        rate: f64,
        index_r: &mut u32,
        index_w: u32,
        last: &mut [i32; 2],
        l_volume: i32,
        r_volume: i32,
        forwards: bool,
        fract: &mut f64,
        interp: &mut [i16],
    ) -> u32 {
        let direction: i32 = if forwards { 1 } else { -1 };

        let mut available_samples = self.samples_difference_at(index_w, *index_r, rate, *fract);

        // Swap into the scratch once instead of per tap. The ring itself is
        // untouched so pushes in flight stay coherent.
        let requested_samples = (rate * num_samples as f64) as u32 * NC + NC;
        let readable_samples = if forwards {
            available_samples
        } else {
            MAX_SAMPLES * NC
        };
        let samples_to_read = (requested_samples + INTERP_SAMPLES * NC).min(readable_samples);
        // SAFETY: slots below `index_w` were published by the producer's
        // release store; backwards reads only revisit already-played slots.
        let buffer = unsafe { &*self.buffer.get() };
        let mut k = next_index(*index_r, rate, *fract, direction);
        for _ in 0..(samples_to_read / NC + 1) {
            let i0 = (k & INDEX_MASK) as usize;
            let i1 = (k.wrapping_add(1) & INDEX_MASK) as usize;
            if self.big_endian {
                interp[i0] = buffer[i0].swap_bytes();
                interp[i1] = buffer[i1].swap_bytes();
            } else {
                interp[i0] = buffer[i0];
                interp[i1] = buffer[i1];
            }
            k = k.wrapping_add_signed(direction * NC as i32);
        }

        // A reset was requested; make sure the first cycle reads at 0.
        if *fract < 0.0
            && num_samples > 0
            && (!forwards || available_samples > INTERP_SAMPLES * NC)
        {
            *fract = -rate;
        }

        let mut i = 0u32;
        let mut next_available_samples = available_samples;
        // Stop INTERP_SAMPLES from the end, they are the kernel's tail. The
        // `<= available` check catches the wrap when the cursor would pass
        // the writer.
        while i < num_samples
            && (!forwards
                || (next_available_samples > INTERP_SAMPLES * NC
                    && next_available_samples <= available_samples))
        {
            // If rate is 1 this degenerates to a copy; if 0, fract never
            // makes a whole and we effectively pad. Fract drift (0.99999…)
            // costs nothing, which is why the iteration count is not
            // precomputed.
            *fract += rate;
            let whole = *fract as u32;
            *fract -= whole as f64;
            // Advance before reading: the cursor can then never pass
            // `index_w`, and the first frame after a reset uses the current
            // position without a prior step.
            *index_r = index_r.wrapping_add_signed(direction * (NC * whole) as i32);

            available_samples = next_available_samples;
            next_available_samples = self.samples_difference_at(index_w, *index_r, rate, *fract);

            let x2 = *fract as f32; // x
            let x1 = x2 * x2; // x^2
            let x0 = x1 * x2; // x^3

            let y0 = COEFFS[0] * x0 + COEFFS[1] * x1 + COEFFS[2] * x2 + COEFFS[3];
            let y1 = COEFFS[4] * x0 + COEFFS[5] * x1 + COEFFS[6] * x2 + COEFFS[7];
            let y2 = COEFFS[8] * x0 + COEFFS[9] * x1 + COEFFS[10] * x2 + COEFFS[11];
            let y3 = COEFFS[12] * x0 + COEFFS[13] * x1 + COEFFS[14] * x2 + COEFFS[15];

            let tap = |offset: i32| -> usize {
                (index_r.wrapping_add_signed(offset) & INDEX_MASK) as usize
            };
            // Sources interleave right-then-left; the odd slot is the left
            // channel.
            let l_s_f = y0 * interp[tap(1)] as f32
                + y1 * interp[tap(2 * direction + 1)] as f32
                + y2 * interp[tap(4 * direction + 1)] as f32
                + y3 * interp[tap(6 * direction + 1)] as f32;
            let r_s_f = y0 * interp[tap(0)] as f32
                + y1 * interp[tap(2 * direction)] as f32
                + y2 * interp[tap(4 * direction)] as f32
                + y3 * interp[tap(6 * direction)] as f32;

            last[0] = (l_s_f.round() as i32 * l_volume) >> 8;
            last[1] = (r_s_f.round() as i32 * r_volume) >> 8;

            let base = (i * NC) as usize;
            samples[base] = clamp16(samples[base] as i32 + last[0]);
            samples[base + 1] = clamp16(samples[base + 1] as i32 + last[1]);

            i += 1;
        }

        i
    }

    /// Samples (not frames) between the cursors, with `W == R` meaning empty
    /// rather than full. Uses the live fract/rate to account for the
    /// pre-advance the next read will perform.
    pub(crate) fn samples_difference(&self, index_w: u32, index_r: u32) -> u32 {
        let rate = self.input_sample_rate.load(Ordering::Relaxed)
            * self.playback_speed.load(Ordering::Relaxed)
            / self.output_sample_rate.load(Ordering::Relaxed) as f64;
        self.samples_difference_at(index_w, index_r, rate, self.fract.load(Ordering::Relaxed))
    }

    fn samples_difference_at(&self, index_w: u32, index_r: u32, rate: f64, fract: f64) -> u32 {
        let diff = index_w.wrapping_sub(next_index(index_r, rate, fract, 1));
        let normalized_diff = diff & INDEX_MASK;
        if normalized_diff == 0 {
            if diff == 0 {
                0
            } else {
                MAX_SAMPLES * NC
            }
        } else {
            normalized_diff
        }
    }

    /// Buffered frame count.
    pub(crate) fn num_samples(&self) -> u32 {
        self.samples_difference(
            self.index_w.load(Ordering::Acquire),
            self.index_r.load(Ordering::Acquire),
        ) / NC
    }

    /// Frames we could produce at the output rate, discounting the
    /// interpolation window. Not exact (the fract makes it off by one) but
    /// close enough for batching decisions.
    pub(crate) fn available_samples(&self) -> u32 {
        let fifo_samples = self.num_samples();
        if fifo_samples <= INTERP_SAMPLES {
            return 0;
        }
        ((fifo_samples - INTERP_SAMPLES) as f64
            * self.output_sample_rate.load(Ordering::Relaxed) as f64
            / self.input_sample_rate.load(Ordering::Relaxed)) as u32
    }

    pub(crate) fn set_input_sample_rate(&self, rate: f64) {
        // In theory the buffered samples should still play at the old rate,
        // but real hardware never changes rate with meaningful samples
        // in flight.
        self.input_sample_rate.store(rate, Ordering::Relaxed);
    }

    pub(crate) fn input_sample_rate(&self) -> f64 {
        self.input_sample_rate.load(Ordering::Relaxed)
    }

    /// For consumers that cannot take a floating point rate.
    pub(crate) fn rounded_input_sample_rate(&self) -> u32 {
        self.input_sample_rate().round() as u32
    }

    pub(crate) fn set_output_sample_rate(&self, rate: u32) {
        self.output_sample_rate.store(rate, Ordering::Relaxed);
    }

    pub(crate) fn set_playback_speed(&self, speed: f64) {
        self.playback_speed.store(speed, Ordering::Relaxed);
    }

    /// Expects values from 0 to 255; 255 maps to full-scale 256.
    pub(crate) fn set_volume(&self, l_volume: u32, r_volume: u32) {
        self.l_volume
            .store((l_volume + (l_volume >> 7)) as i32, Ordering::Relaxed);
        self.r_volume
            .store((r_volume + (r_volume >> 7)) as i32, Ordering::Relaxed);
    }

    pub(crate) fn is_currently_pushed(&self) -> bool {
        self.currently_pushed.load(Ordering::Relaxed)
    }

    /// Tracks push activity for sparse sources. Positive `time` is credit
    /// added by this source's own pushes; negative is the drain applied on
    /// every streaming push (the heartbeat that notices this source went
    /// quiet). On the inactive→active edge the FIFO is primed with
    /// `prime_seconds` of silence so it does not immediately underrun; on
    /// active→inactive a few trailing zeros make the final read settle on
    /// silence.
    pub(crate) fn update_push(&self, time: f64, prime_seconds: f64, stretching: bool) {
        let mut timer = self.last_push_timer.load(Ordering::Relaxed);
        let currently_pushed;

        if time >= 0.0 {
            timer = timer.max(time);
            currently_pushed = timer > 0.0;
        } else if timer > 0.0 {
            // At least two negative updates must elapse before we flip off,
            // in case a single large drain overshoots the real elapsed time.
            timer += time;
            currently_pushed = true;
        } else {
            currently_pushed = false;
        }
        self.last_push_timer.store(timer, Ordering::Relaxed);

        if self.currently_pushed.load(Ordering::Relaxed) != currently_pushed {
            self.currently_pushed
                .store(currently_pushed, Ordering::Relaxed);
            if currently_pushed {
                // When stretching, latency is not tied to time, so no
                // priming is needed.
                if !stretching {
                    let frames = ((prime_seconds
                        * self.input_sample_rate.load(Ordering::Relaxed))
                        as u32)
                        .min(MAX_SAMPLES);
                    self.push_silence(frames);
                }
            } else {
                // End on zeros so the last held sample does not pin the
                // additive headroom of the other sources.
                self.push_silence(INTERP_SAMPLES + 1);
            }
        }
    }
}

#[inline]
fn clamp16(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Where the next read will land: the cursor advances by `fract + rate`
/// whole frames before interpolating, unless a reset is pending.
#[inline]
fn next_index(index_r: u32, rate: f64, fract: f64, direction: i32) -> u32 {
    if fract >= 0.0 {
        index_r.wrapping_add_signed(direction * (NC * (fract + rate) as u32) as i32)
    } else {
        index_r
    }
}
