//! Pitch-preserving tempo adaptation (WSOLA overlap-add).
//!
//! The stretcher consumes stereo shorts at the input tempo and produces them
//! at the configured output rate with the pitch unchanged. Output is emitted
//! in batches: a segment is cut from the input at the position whose overlap
//! correlates best with the tail of the previous segment, cross-faded and
//! appended, and the input cursor advances by the tempo-scaled hop.

use std::collections::VecDeque;

use tracing::trace;

/// Window lengths in milliseconds. The sequence is what one output batch
/// covers, the seek window bounds the correlation search, the overlap is the
/// cross-fade length.
const SEQUENCE_MS: u32 = 62;
const SEEK_WINDOW_MS: u32 = 28;
const OVERLAP_MS: u32 = 8;

/// Coarse step of the two-stage correlation seek.
const SEEK_COARSE_STEP: usize = 16;
/// Inner-loop decimation of the correlation sums.
const CORR_DECIMATION: usize = 4;

const CHANNELS: usize = 2;

/// Streaming WSOLA time stretcher for interleaved stereo `i16`.
pub struct TimeStretcher {
    sample_rate: u32,
    sequence_frames: usize,
    overlap_frames: usize,
    seek_frames: usize,
    tempo: f64,
    /// Tempos set between two output batches are averaged: the batch would
    /// otherwise only see the last value and miss the oscillations since the
    /// previous batch. The tempo also decides how much input a batch needs.
    tempo_sum: f64,
    tempo_count: u32,
    input: VecDeque<i16>,
    output: VecDeque<i16>,
    /// Tail of the previous batch, the correlation reference and cross-fade
    /// partner. Stereo interleaved, `overlap_frames` long.
    overlap_ref: Vec<f32>,
    have_ref: bool,
    /// Fractional remainder of the tempo-scaled input hop.
    input_skip_fract: f64,
    last_stretched_sample: [i16; 2],
}

impl TimeStretcher {
    pub fn new(sample_rate: u32) -> Self {
        let mut stretcher = Self {
            sample_rate: 0,
            sequence_frames: 0,
            overlap_frames: 0,
            seek_frames: 0,
            tempo: 1.0,
            tempo_sum: 0.0,
            tempo_count: 0,
            input: VecDeque::new(),
            output: VecDeque::new(),
            overlap_ref: Vec::new(),
            have_ref: false,
            input_skip_fract: 0.0,
            last_stretched_sample: [0; 2],
        };
        stretcher.set_sample_rate(sample_rate);
        stretcher
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if self.sample_rate == sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        let frames = |ms: u32| (sample_rate as usize * ms as usize) / 1000;
        self.sequence_frames = frames(SEQUENCE_MS).max(2);
        self.overlap_frames = frames(OVERLAP_MS).max(1);
        self.seek_frames = frames(SEEK_WINDOW_MS).max(1);
        self.overlap_ref.clear();
        self.overlap_ref.resize(self.overlap_frames * CHANNELS, 0.0);
        self.have_ref = false;
    }

    pub fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
        self.overlap_ref.iter_mut().for_each(|s| *s = 0.0);
        self.have_ref = false;
        self.input_skip_fract = 0.0;
        self.last_stretched_sample = [0; 2];
        self.tempo = 1.0;
        self.tempo_sum = 0.0;
        self.tempo_count = 0;
    }

    /// Sets the playback tempo (>1 plays faster). With `reset` the running
    /// average starts over; used when the speed estimate is a prediction and
    /// history would only dilute it.
    pub fn set_tempo(&mut self, tempo: f64, reset: bool) {
        if reset {
            self.tempo_sum = 0.0;
            self.tempo_count = 0;
        }
        self.tempo_sum += tempo;
        self.tempo_count += 1;
        self.tempo = (self.tempo_sum / self.tempo_count as f64).clamp(0.1, 10.0);
    }

    /// Feeds interleaved stereo frames and runs the overlap-add loop.
    pub fn push_samples(&mut self, samples: &[i16]) {
        let prev_processed = self.output.len();
        self.input.extend(samples.iter().copied());
        self.process();
        if self.output.len() != prev_processed {
            // A batch was produced; start a fresh tempo average for the next.
            self.tempo_sum = 0.0;
            self.tempo_count = 0;
        }
    }

    /// Pops up to `num_samples` frames. Returns the frames actually
    /// produced; with `pad` the remainder is filled with the last produced
    /// sample and the full count is returned.
    pub fn get_stretched_samples(&mut self, out: &mut [i16], num_samples: u32, pad: bool) -> u32 {
        debug_assert!(out.len() >= num_samples as usize * CHANNELS);
        let want = num_samples as usize * CHANNELS;
        let got = want.min(self.output.len());
        for slot in out.iter_mut().take(got) {
            *slot = self.output.pop_front().unwrap_or(0);
        }
        let frames_received = got / CHANNELS;

        if frames_received != 0 {
            self.last_stretched_sample = [
                out[frames_received * CHANNELS - 2],
                out[frames_received * CHANNELS - 1],
            ];
        }

        if !pad {
            return frames_received as u32;
        }

        for i in frames_received..num_samples as usize {
            out[i * CHANNELS] = self.last_stretched_sample[0];
            out[i * CHANNELS + 1] = self.last_stretched_sample[1];
        }
        num_samples
    }

    /// Seconds of processed audio queued behind the output.
    pub fn processed_latency(&self) -> f64 {
        (self.output.len() / CHANNELS) as f64 / self.sample_rate as f64
    }

    /// The smallest batch the overlap-add emits at once; latency below this
    /// cannot be sustained because batches land all at once.
    pub fn acceptable_latency(&self) -> f64 {
        (self.sequence_frames - self.overlap_frames) as f64 / self.sample_rate as f64
    }

    fn process(&mut self) {
        loop {
            let needed = (self.seek_frames + self.sequence_frames) * CHANNELS;
            if self.input.len() < needed {
                return;
            }
            self.input.make_contiguous();
            let (input, _) = self.input.as_slices();

            let emit_frames = self.sequence_frames - self.overlap_frames;
            let offset = if self.have_ref { self.best_offset(input) } else { 0 };

            // Cross-fade out of the previous batch tail.
            for k in 0..self.overlap_frames {
                let t = k as f32 / self.overlap_frames as f32;
                for ch in 0..CHANNELS {
                    let incoming = input[(offset + k) * CHANNELS + ch] as f32;
                    let value = if self.have_ref {
                        self.overlap_ref[k * CHANNELS + ch] * (1.0 - t) + incoming * t
                    } else {
                        incoming
                    };
                    self.output
                        .push_back(value.round().clamp(-32768.0, 32767.0) as i16);
                }
            }
            // Flat region.
            for k in self.overlap_frames..emit_frames {
                self.output.push_back(input[(offset + k) * CHANNELS]);
                self.output.push_back(input[(offset + k) * CHANNELS + 1]);
            }
            // The frames right after what we emitted become the next
            // reference tail.
            for k in 0..self.overlap_frames * CHANNELS {
                self.overlap_ref[k] = input[(offset + emit_frames) * CHANNELS + k] as f32;
            }
            self.have_ref = true;

            // Consume the tempo-scaled hop, carrying the fraction.
            self.input_skip_fract += emit_frames as f64 * self.tempo;
            let skip_frames =
                (self.input_skip_fract as usize).min(self.input.len() / CHANNELS);
            self.input_skip_fract -= skip_frames as f64;
            self.input.drain(..skip_frames * CHANNELS);

            trace!(
                offset,
                skip_frames,
                queued = self.output.len() / CHANNELS,
                "stretch batch"
            );
        }
    }

    /// Two-stage normalized cross-correlation seek: coarse scan over the
    /// window, then a refinement pass around the best coarse hit.
    fn best_offset(&self, input: &[i16]) -> usize {
        let mut best = 0usize;
        let mut best_corr = f64::NEG_INFINITY;
        let mut check = |offset: usize, best: &mut usize, best_corr: &mut f64| {
            let corr = self.correlation_at(input, offset);
            if corr > *best_corr {
                *best_corr = corr;
                *best = offset;
            }
        };

        for offset in (0..self.seek_frames).step_by(SEEK_COARSE_STEP) {
            check(offset, &mut best, &mut best_corr);
        }
        let refine_from = best.saturating_sub(SEEK_COARSE_STEP - 1);
        let refine_to = (best + SEEK_COARSE_STEP).min(self.seek_frames);
        for offset in refine_from..refine_to {
            check(offset, &mut best, &mut best_corr);
        }
        best
    }

    fn correlation_at(&self, input: &[i16], offset: usize) -> f64 {
        let mut corr = 0.0f64;
        let mut energy = 0.0f64;
        let len = self.overlap_frames * CHANNELS;
        let base = offset * CHANNELS;
        for k in (0..len).step_by(CORR_DECIMATION) {
            let s = input[base + k] as f64;
            corr += s * self.overlap_ref[k] as f64;
            energy += s * s;
        }
        if energy > 1e-9 {
            corr / energy.sqrt()
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frames(frames: usize, freq: f64, rate: f64) -> Vec<i16> {
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let v = (16000.0 * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin()) as i16;
            samples.push(v);
            samples.push(v);
        }
        samples
    }

    /// Push `input` in chunks and drain everything the stretcher produces.
    fn run(stretcher: &mut TimeStretcher, input: &[i16]) -> usize {
        let mut out_frames = 0usize;
        let mut sink = vec![0i16; 4096 * 2];
        for chunk in input.chunks(512 * 2) {
            stretcher.push_samples(chunk);
            loop {
                let got = stretcher.get_stretched_samples(&mut sink, 4096, false);
                out_frames += got as usize;
                if got == 0 {
                    break;
                }
            }
        }
        out_frames
    }

    #[test]
    fn unity_tempo_roughly_preserves_duration() {
        let mut stretcher = TimeStretcher::new(48_000);
        stretcher.set_tempo(1.0, true);
        let input_frames = 96_000;
        let out = run(&mut stretcher, &sine_frames(input_frames, 220.0, 48_000.0));
        let ratio = out as f64 / input_frames as f64;
        assert!((0.9..=1.05).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn double_tempo_halves_duration() {
        let mut stretcher = TimeStretcher::new(48_000);
        stretcher.set_tempo(2.0, true);
        let input_frames = 96_000;
        let out = run(&mut stretcher, &sine_frames(input_frames, 220.0, 48_000.0));
        let ratio = out as f64 / input_frames as f64;
        assert!((0.4..=0.6).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn padding_repeats_last_sample() {
        let mut stretcher = TimeStretcher::new(48_000);
        stretcher.set_tempo(1.0, true);
        stretcher.push_samples(&sine_frames(24_000, 220.0, 48_000.0));

        let mut out = vec![0i16; 256 * 2];
        assert_eq!(stretcher.get_stretched_samples(&mut out, 256, true), 256);

        // Drain, then ask for more: every frame is the held last sample.
        let mut sink = vec![0i16; 65_536 * 2];
        stretcher.get_stretched_samples(&mut sink, 65_536, false);
        let got = stretcher.get_stretched_samples(&mut out, 256, true);
        assert_eq!(got, 256);
        let held = [out[0], out[1]];
        assert!(out.chunks(2).all(|frame| frame == &held[..]));
    }

    #[test]
    fn latency_drains_to_zero() {
        let mut stretcher = TimeStretcher::new(48_000);
        stretcher.set_tempo(1.0, true);
        stretcher.push_samples(&sine_frames(24_000, 220.0, 48_000.0));
        assert!(stretcher.processed_latency() > 0.0);

        let mut sink = vec![0i16; 65_536 * 2];
        stretcher.get_stretched_samples(&mut sink, 65_536, false);
        assert_eq!(stretcher.processed_latency(), 0.0);

        stretcher.clear();
        assert_eq!(stretcher.processed_latency(), 0.0);
    }

    #[test]
    fn acceptable_latency_matches_batch_size() {
        let stretcher = TimeStretcher::new(48_000);
        let batch_seconds = (SEQUENCE_MS - OVERLAP_MS) as f64 / 1000.0;
        assert!((stretcher.acceptable_latency() - batch_seconds).abs() < 1e-3);
    }
}
