//! Block-based stereo → 5.1 decoder.
//!
//! A Dolby-style passive matrix: fronts pass through, the centre is the
//! attenuated sum, the surrounds are the low-passed, delayed difference in
//! anti-phase, and an optional LFE is synthesised from the low band of the
//! sum. Decoding is strictly block-wise: callers ask how many stereo frames
//! the decoder needs for a given surround output, push exactly that many,
//! and pull the decoded frames from the internal FIFO.

use std::collections::VecDeque;
use std::f32::consts::FRAC_1_SQRT_2;

use tracing::debug;

use crate::config::Dpl2Quality;

pub const SURROUND_CHANNELS: usize = 6;
const STEREO_CHANNELS: usize = 2;

/// Upper bound of whole blocks buffered in the decoded FIFO; raise it if a
/// backend ever legitimately pulls this far ahead.
const MAX_BLOCKS_BUFFERED: usize = 32;

/// Rear-channel delay, a classic trick to decorrelate the surrounds.
const REAR_DELAY_MS: f64 = 10.0;
/// Surround band limit.
const REAR_LOWPASS_HZ: f64 = 7_000.0;
/// LFE crossover.
const LFE_LOWPASS_HZ: f64 = 120.0;

/// Stereo → 5.1 matrix decoder with a block-exact input contract.
///
/// Output channel order is FL, FR, FC, LFE, RL, RR (what most backends
/// expect), and output is not clamped to ±1.
pub struct SurroundDecoder {
    sample_rate: u32,
    frame_block_size: u32,
    bass_redirection: bool,
    decoded_fifo: VecDeque<f32>,
    /// Pre-filled with zeros so a pop is always valid.
    rear_delay: VecDeque<f32>,
    rear_lowpass_state: f32,
    rear_lowpass_alpha: f32,
    lfe_lowpass_state: f32,
    lfe_lowpass_alpha: f32,
}

/// Block length per quality; a power of two near the quality's nominal
/// duration. Higher quality decodes longer blocks and adds latency.
fn quality_to_frame_block_size(quality: Dpl2Quality, sample_rate: u32) -> u32 {
    let frame_block =
        (sample_rate as f64 * quality.frame_block_ms() as f64 / 1000.0).round() as u32;
    debug_assert!(frame_block > 1);
    nearest_power_of_2(frame_block)
}

fn nearest_power_of_2(value: u32) -> u32 {
    1 << (value.max(1) as f64).log2().round() as u32
}

fn one_pole_alpha(cutoff_hz: f64, sample_rate: u32) -> f32 {
    (1.0 - (-2.0 * std::f64::consts::PI * cutoff_hz / sample_rate as f64).exp()) as f32
}

impl SurroundDecoder {
    pub fn new(sample_rate: u32, quality: Dpl2Quality, bass_redirection: bool) -> Self {
        let mut decoder = Self {
            sample_rate: 0,
            frame_block_size: 0,
            bass_redirection,
            decoded_fifo: VecDeque::new(),
            rear_delay: VecDeque::new(),
            rear_lowpass_state: 0.0,
            rear_lowpass_alpha: 0.0,
            lfe_lowpass_state: 0.0,
            lfe_lowpass_alpha: 0.0,
        };
        decoder.init_and_set_sample_rate(sample_rate, quality, bass_redirection);
        decoder
    }

    /// (Re)initialises at `sample_rate`. Buffered decoded frames survive a
    /// no-op call; a real change rebuilds the filters and delay line.
    pub fn init_and_set_sample_rate(
        &mut self,
        sample_rate: u32,
        quality: Dpl2Quality,
        bass_redirection: bool,
    ) {
        let frame_block_size = quality_to_frame_block_size(quality, sample_rate);
        self.bass_redirection = bass_redirection;
        if self.sample_rate == sample_rate && self.frame_block_size == frame_block_size {
            return;
        }
        self.sample_rate = sample_rate;
        self.frame_block_size = frame_block_size;

        let delay_frames = ((sample_rate as f64 * REAR_DELAY_MS / 1000.0) as usize).max(1);
        self.rear_delay.clear();
        self.rear_delay.resize(delay_frames, 0.0);
        self.rear_lowpass_state = 0.0;
        self.rear_lowpass_alpha = one_pole_alpha(REAR_LOWPASS_HZ, sample_rate);
        self.lfe_lowpass_state = 0.0;
        self.lfe_lowpass_alpha = one_pole_alpha(LFE_LOWPASS_HZ, sample_rate);

        debug!(
            sample_rate,
            block = self.frame_block_size,
            "surround decoder initialised"
        );
    }

    pub fn frame_block_size(&self) -> u32 {
        self.frame_block_size
    }

    /// Exact number of stereo input frames required before
    /// [`get_decoded_samples`](Self::get_decoded_samples) can produce
    /// `output_samples` surround frames. Always a whole number of blocks;
    /// zero when the decoded FIFO already holds enough.
    pub fn query_samples_needed_for_surround_output(&self, output_samples: u32) -> u32 {
        let buffered = (self.decoded_fifo.len() / SURROUND_CHANNELS) as u32;
        if output_samples > buffered {
            let samples_needed = output_samples - buffered;
            samples_needed + self.frame_block_size - (samples_needed % self.frame_block_size)
        } else {
            0
        }
    }

    /// Decodes `num_samples` stereo frames (must be a whole number of
    /// blocks) into the internal surround FIFO.
    pub fn push_samples(&mut self, input: &[i16], num_samples: u32) {
        debug_assert!(num_samples % self.frame_block_size == 0);
        debug_assert!(num_samples <= self.frame_block_size * MAX_BLOCKS_BUFFERED as u32);
        debug_assert!(input.len() >= num_samples as usize * STEREO_CHANNELS);

        for frame in input
            .chunks_exact(STEREO_CHANNELS)
            .take(num_samples as usize)
        {
            let l = frame[0] as f32 / i16::MAX as f32;
            let r = frame[1] as f32 / i16::MAX as f32;

            let centre = (l + r) * FRAC_1_SQRT_2 * 0.5;
            let surround = (l - r) * FRAC_1_SQRT_2;

            self.rear_lowpass_state += self.rear_lowpass_alpha * (surround - self.rear_lowpass_state);
            self.rear_delay.push_back(self.rear_lowpass_state);
            let delayed = self.rear_delay.pop_front().unwrap_or(0.0);

            // LFE off by default; most setups run their own crossover.
            let lfe = if self.bass_redirection {
                self.lfe_lowpass_state += self.lfe_lowpass_alpha * ((l + r) * 0.5 - self.lfe_lowpass_state);
                self.lfe_lowpass_state
            } else {
                0.0
            };

            self.decoded_fifo.push_back(l);
            self.decoded_fifo.push_back(r);
            self.decoded_fifo.push_back(centre);
            self.decoded_fifo.push_back(lfe);
            self.decoded_fifo.push_back(-delayed);
            self.decoded_fifo.push_back(delayed);
        }
    }

    /// Pops `num_samples` surround frames into `out` (interleaved, 6
    /// channels per frame). In steady state the block contract guarantees
    /// the FIFO holds enough; a short FIFO yields zeros.
    pub fn get_decoded_samples(&mut self, out: &mut [f32], num_samples: u32) {
        debug_assert!(out.len() >= num_samples as usize * SURROUND_CHANNELS);
        for slot in out
            .iter_mut()
            .take(num_samples as usize * SURROUND_CHANNELS)
        {
            *slot = self.decoded_fifo.pop_front().unwrap_or(0.0);
        }
    }

    /// Drops buffered frames and resets filter/delay state.
    pub fn clear(&mut self) {
        self.decoded_fifo.clear();
        let len = self.rear_delay.len();
        self.rear_delay.clear();
        self.rear_delay.resize(len, 0.0);
        self.rear_lowpass_state = 0.0;
        self.lfe_lowpass_state = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> SurroundDecoder {
        SurroundDecoder::new(48_000, Dpl2Quality::Low, false)
    }

    #[test]
    fn block_size_is_a_power_of_two_per_quality() {
        for quality in [
            Dpl2Quality::Lowest,
            Dpl2Quality::Low,
            Dpl2Quality::High,
            Dpl2Quality::Highest,
        ] {
            let decoder = SurroundDecoder::new(48_000, quality, false);
            let block = decoder.frame_block_size();
            assert!(block.is_power_of_two(), "{quality:?}: {block}");
        }
        // 20ms at 48kHz is 960 frames; the nearest power of two is 1024.
        assert_eq!(decoder().frame_block_size(), 1024);
    }

    #[test]
    fn query_then_push_then_get_yields_exactly_n() {
        let mut decoder = decoder();
        for request in [256u32, 479, 1024, 1500] {
            let needed = decoder.query_samples_needed_for_surround_output(request);
            assert_eq!(needed % decoder.frame_block_size(), 0);
            let input = vec![0i16; needed as usize * 2];
            decoder.push_samples(&input, needed);
            let mut out = vec![1.0f32; request as usize * SURROUND_CHANNELS];
            decoder.get_decoded_samples(&mut out, request);
            // Steady state: the FIFO never went short.
            assert!(out.iter().all(|&s| s == 0.0));
        }
    }

    #[test]
    fn query_returns_zero_when_buffered() {
        let mut decoder = decoder();
        let needed = decoder.query_samples_needed_for_surround_output(100);
        let input = vec![0i16; needed as usize * 2];
        decoder.push_samples(&input, needed);
        // The whole block was decoded; small follow-up requests are covered.
        assert_eq!(decoder.query_samples_needed_for_surround_output(100), 0);
    }

    #[test]
    fn centre_carries_the_sum_and_rears_the_difference() {
        let mut decoder = decoder();
        let block = decoder.frame_block_size();

        // Identical channels: centre active, rears silent.
        let mono: Vec<i16> = (0..block as usize * 2).map(|_| 12_000).collect();
        decoder.push_samples(&mono, block);
        let mut out = vec![0.0f32; block as usize * SURROUND_CHANNELS];
        decoder.get_decoded_samples(&mut out, block);
        let frame = &out[(block as usize / 2) * SURROUND_CHANNELS..][..SURROUND_CHANNELS];
        assert!(frame[2] > 0.2, "centre was {}", frame[2]);
        assert!(frame[4].abs() < 1e-3 && frame[5].abs() < 1e-3);

        // Anti-phase channels: centre silent, rears active and opposed.
        decoder.clear();
        let mut anti = Vec::with_capacity(block as usize * 2);
        for _ in 0..block {
            anti.push(12_000i16);
            anti.push(-12_000i16);
        }
        decoder.push_samples(&anti, block);
        let mut out = vec![0.0f32; block as usize * SURROUND_CHANNELS];
        decoder.get_decoded_samples(&mut out, block);
        let frame = &out[(block as usize - 1) * SURROUND_CHANNELS..][..SURROUND_CHANNELS];
        assert!(frame[2].abs() < 1e-3, "centre was {}", frame[2]);
        assert!(frame[4] < -0.1 && frame[5] > 0.1);
        assert!((frame[4] + frame[5]).abs() < 1e-3);
    }

    #[test]
    fn clear_resets_buffered_output() {
        let mut decoder = decoder();
        let needed = decoder.query_samples_needed_for_surround_output(64);
        let input = vec![1000i16; needed as usize * 2];
        decoder.push_samples(&input, needed);
        decoder.clear();
        assert_eq!(
            decoder.query_samples_needed_for_surround_output(64),
            decoder.frame_block_size()
        );
    }
}
