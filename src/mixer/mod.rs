//! Master mixer: combines the emulated audio sources into the backend's
//! pull stream.
//!
//! Architecture:
//! - Emulation threads push raw PCM into per-source sample FIFOs and feed
//!   the DMA cadence to a [`SpeedCounter`].
//! - The backend callback calls [`Mixer::mix`] (stereo) or
//!   [`Mixer::mix_surround`] (5.1); each FIFO resamples into the output at
//!   `input_rate × speed / output_rate`.
//! - The target speed follows the tracked emulation speed when the emulator
//!   cannot hold its target, and a small catch-up factor keeps the buffered
//!   latency under the configured ceiling.
//! - When stretching is enabled the FIFOs are mixed at unity speed and the
//!   [`TimeStretcher`] owns the tempo instead.

mod fifo;
pub mod speed;

#[cfg(test)]
mod tests;

use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, trace, warn};

use crate::atomics::AtomicF64;
use crate::config::AudioConfig;
use crate::stretch::TimeStretcher;
use crate::surround::{SurroundDecoder, SURROUND_CHANNELS};
use crate::wave::WaveFileWriter;

pub use fifo::{INTERP_SAMPLES, MAX_SAMPLES};
pub use speed::SpeedCounter;

use fifo::{SampleFifo, NC};

/// Catch-up factor on the direct path: big enough to recover latency, small
/// enough to stay under the audibility threshold.
const NON_STRETCHING_CATCH_UP_SPEED: f64 = 1.0175;
/// With pitch correction the change is much harder to hear, so correct
/// faster.
const STRETCHING_CATCH_UP_SPEED: f64 = 1.25;

/// Relative slowdown below which a speed dip is treated as jitter the
/// resampler already absorbs.
const BEHIND_SPEED_DELTA: f64 = 0.0;
/// Relative margin under the target at which the averaged speed counts as
/// recovered.
const RECOVERED_SPEED_DELTA: f64 = 0.001;

/// Averaging window of the DMA speed counter: a balance between
/// reactiveness and smoothness. Backend latency should stay below this.
const DMA_SPEED_AVERAGE_TIME: f64 = 0.425;

/// Default input rates; the emulated hardware reprograms them at runtime.
const DEFAULT_DMA_RATE: f64 = 32_000.0;
const DEFAULT_STREAMING_RATE: f64 = 48_000.0;
const DEFAULT_SPEAKER_RATE: f64 = 6_000.0;
/// Most common DMA push size, the counter's initial ticks-per-update.
const DEFAULT_DMA_PUSH_SAMPLES: f64 = 560.0;

pub const NUM_SPEAKERS: usize = 4;

/// Consumer-thread state: everything only the audio callback touches.
struct MixState {
    /// Stretch/surround staging buffer.
    scratch: Box<[i16]>,
    /// Stereo staging for the surround path, distinct from `scratch` which
    /// the inner mix may use.
    surround_scratch: Box<[i16]>,
    /// Endian-swap buffer shared by every FIFO's resampler.
    interp: Box<[i16]>,
    time_behind_target_speed: f64,
    behind_target_speed: bool,
    latency_catching_up: bool,
    /// True while the stretcher still holds samples, even after the user
    /// turned stretching off (it drains first).
    stretching: bool,
    stretcher: TimeStretcher,
    surround: SurroundDecoder,
}

/// The mixing engine. Shared as `Arc<Mixer>` between the host thread, the
/// emulation threads (producers) and the backend callback (consumer).
///
/// Threading contract, enforced by construction plus a reentrancy guard:
/// one producer thread per source, a single consumer calling
/// [`mix`](Self::mix) / [`mix_surround`](Self::mix_surround). A second
/// concurrent consumer call returns 0 frames instead of racing.
pub struct Mixer {
    dma_fifo: SampleFifo,
    streaming_fifo: SampleFifo,
    speaker_fifos: [SampleFifo; NUM_SPEAKERS],
    dma_speed: SpeedCounter,
    config: Arc<AudioConfig>,
    /// Only changed through [`update_settings`](Self::update_settings) while
    /// the backend is stopped.
    sample_rate: AtomicU32,
    /// Target playback speed; usually the target emulation speed. 1.0 while
    /// stretching (the stretcher owns the tempo).
    target_speed: AtomicF64,
    /// Seconds spent mixing at a tracker-derived speed; bounds the regime
    /// average window.
    time_at_custom_speed: AtomicF64,
    surround_changed: AtomicBool,
    /// Consumer reentrancy guard; CAS-held around `state` access.
    mixing: AtomicBool,
    state: UnsafeCell<MixState>,
    log_dtk_audio: AtomicBool,
    log_dsp_audio: AtomicBool,
    wave_writer_dtk: Mutex<WaveFileWriter>,
    wave_writer_dsp: Mutex<WaveFileWriter>,
}

// SAFETY: `state` is only reached while `mixing` is CAS-held (see
// `consumer_guard`), the FIFOs carry their own SPSC contract, and everything
// else is atomics or mutexes.
unsafe impl Send for Mixer {}
unsafe impl Sync for Mixer {}

/// Releases the consumer guard on drop.
struct ConsumerGuard<'a> {
    mixing: &'a AtomicBool,
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.mixing.store(false, Ordering::Release);
    }
}

impl Mixer {
    pub fn new(sample_rate: u32, config: Arc<AudioConfig>) -> Self {
        let dma_speed = SpeedCounter::new(
            DMA_SPEED_AVERAGE_TIME,
            DEFAULT_DMA_RATE,
            DEFAULT_DMA_PUSH_SAMPLES,
        );
        dma_speed.start(true);

        let mixer = Self {
            dma_fifo: SampleFifo::new(DEFAULT_DMA_RATE, sample_rate, true, true),
            streaming_fifo: SampleFifo::new(DEFAULT_STREAMING_RATE, sample_rate, true, true),
            speaker_fifos: std::array::from_fn(|_| {
                SampleFifo::new(DEFAULT_SPEAKER_RATE, sample_rate, false, false)
            }),
            dma_speed,
            sample_rate: AtomicU32::new(sample_rate),
            target_speed: AtomicF64::new(1.0),
            time_at_custom_speed: AtomicF64::new(0.0),
            surround_changed: AtomicBool::new(false),
            mixing: AtomicBool::new(false),
            state: UnsafeCell::new(MixState {
                scratch: vec![0i16; (MAX_SAMPLES * NC) as usize].into_boxed_slice(),
                surround_scratch: vec![0i16; (MAX_SAMPLES * NC) as usize].into_boxed_slice(),
                interp: vec![0i16; (MAX_SAMPLES * NC) as usize].into_boxed_slice(),
                time_behind_target_speed: 0.0,
                behind_target_speed: false,
                latency_catching_up: false,
                stretching: false,
                stretcher: TimeStretcher::new(sample_rate),
                surround: SurroundDecoder::new(
                    sample_rate,
                    config.dpl2_quality(),
                    config.dpl2_bass_redirection(),
                ),
            }),
            log_dtk_audio: AtomicBool::new(false),
            log_dsp_audio: AtomicBool::new(false),
            wave_writer_dtk: Mutex::new(WaveFileWriter::new()),
            wave_writer_dsp: Mutex::new(WaveFileWriter::new()),
            config,
        };

        info!("mixer initialised at {sample_rate} Hz");
        mixer
    }

    fn consumer_guard(&self) -> Option<ConsumerGuard<'_>> {
        self.mixing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(ConsumerGuard {
                mixing: &self.mixing,
            })
    }

    fn fifos(&self) -> impl Iterator<Item = &SampleFifo> {
        [&self.dma_fifo, &self.streaming_fifo]
            .into_iter()
            .chain(self.speaker_fifos.iter())
    }

    /// Renders `samples.len() / 2` stereo frames into `samples`. Returns the
    /// frame count, or 0 when paused or when a concurrent consumer holds the
    /// guard. Real-time safe: no locks, no allocation, no I/O.
    pub fn mix(&self, samples: &mut [i16]) -> u32 {
        let num_samples = samples.len() as u32 / NC;
        let Some(_guard) = self.consumer_guard() else {
            return 0;
        };
        // SAFETY: guard held; we are the only consumer.
        let state = unsafe { &mut *self.state.get() };
        self.mix_inner(state, samples, num_samples)
    }

    fn mix_inner(&self, state: &mut MixState, samples: &mut [i16], num_samples: u32) -> u32 {
        // Mixing while paused would read nonsense speeds from the counter.
        if num_samples == 0 || self.dma_speed.is_paused() {
            return 0;
        }

        let stretching = self.config.audio_stretch();
        let emulation_speed = self.config.emulation_speed();
        let frame_limiter = emulation_speed > 0.0 && !self.config.throttler_disabled();
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);

        // Backend latency of this request, in seconds.
        let time_delta = num_samples as f64 / sample_rate as f64;

        let average_actual_speed = self.dma_speed.cached_average_speed(false, true, true);
        let (actual_speed, predicting) = self.dma_speed.last_speed(true, true);

        let mut target_speed = emulation_speed;

        if !frame_limiter {
            // Unthrottled: the only meaningful speed is the tracked one.
            target_speed = self.dma_speed.cached_average_speed(true, true, true);
            let at_custom = self.time_at_custom_speed.load(Ordering::Relaxed);
            self.time_at_custom_speed
                .store(at_custom + time_delta, Ordering::Relaxed);
            if target_speed >= emulation_speed {
                state.time_behind_target_speed = 0.0;
                state.behind_target_speed = false;
            }
        } else {
            let audio_emu_speed_tolerance = self.config.speed_tolerance();
            let dynamic_audio_speed_allowed = audio_emu_speed_tolerance >= 0.0;
            let dynamic_audio_speed_forced = audio_emu_speed_tolerance == 0.0;

            // The instantaneous speed wobbles every frame; accumulate how far
            // we actually fell behind and only then snap to the tracked
            // speed. Losses below the tolerance are absorbed by the
            // resampler.
            let gain_time_delta = time_delta * (1.0 - actual_speed / emulation_speed);
            state.time_behind_target_speed =
                (state.time_behind_target_speed + gain_time_delta).max(0.0);

            if actual_speed / emulation_speed < 1.0 - BEHIND_SPEED_DELTA {
                if state.time_behind_target_speed > audio_emu_speed_tolerance {
                    if !state.behind_target_speed {
                        debug!(
                            behind_s = state.time_behind_target_speed,
                            "audio fell behind the target speed, following the tracked speed"
                        );
                    }
                    state.behind_target_speed = true;
                }
            } else if average_actual_speed >= emulation_speed - RECOVERED_SPEED_DELTA * emulation_speed
            {
                // The average (and its window length) decides recovery;
                // waiting for the behind-time to drain would never end, what
                // is lost is lost.
                if state.behind_target_speed {
                    debug!("audio recovered the target speed");
                }
                state.behind_target_speed = false;
                state.time_behind_target_speed = 0.0;
            }

            if dynamic_audio_speed_allowed
                && (dynamic_audio_speed_forced || state.behind_target_speed)
            {
                target_speed = self.dma_speed.cached_average_speed(true, true, true);
                trace!(actual_speed, average_actual_speed, "using tracked audio speed");
                let at_custom = self.time_at_custom_speed.load(Ordering::Relaxed);
                self.time_at_custom_speed
                    .store(at_custom + time_delta, Ordering::Relaxed);
            } else {
                self.time_at_custom_speed.store(0.0, Ordering::Relaxed);
            }
        }

        // Latency is predicted post-mix: what will be left after this
        // request. Computing it pre-mix would oscillate with every timing
        // wobble between pushes and reads, and could never target zero.
        let max_latency_config = self.config.max_latency();
        let latency;
        let catch_up_speed;
        let target_latency;
        let max_latency;
        if stretching {
            // The stretcher stacks samples forever if we read slower than
            // they arrive. Its batches land all at once, so its own minimum
            // is added on top of the configured ceiling.
            latency = state.stretcher.processed_latency();
            let acceptable_latency = state.stretcher.acceptable_latency() - time_delta;
            target_latency = acceptable_latency + max_latency_config * 0.5;
            max_latency = max_latency_config + acceptable_latency;
            catch_up_speed = STRETCHING_CATCH_UP_SPEED;
        } else {
            let rate = self.dma_fifo.input_sample_rate() * target_speed / sample_rate as f64;
            let post_mix_samples = self.dma_fifo.num_samples() as f64
                - (num_samples as f64 * rate + INTERP_SAMPLES as f64);
            latency = post_mix_samples.max(0.0) / self.dma_fifo.input_sample_rate();
            target_latency = max_latency_config * 0.5;
            max_latency = max_latency_config;
            catch_up_speed = NON_STRETCHING_CATCH_UP_SPEED;
        }

        // Latency ceiling with hysteresis: above the ceiling, play slightly
        // fast until back at the target. The only cost of the tolerance band
        // is rhythm games caring about a fixed latency.
        let latency_limit = if state.latency_catching_up {
            target_latency
        } else {
            max_latency
        };
        if latency > latency_limit {
            if !state.latency_catching_up {
                debug!(latency_ms = latency * 1000.0, "latency ceiling reached, catching up");
            }
            state.latency_catching_up = true;
            target_speed *= catch_up_speed;
        } else {
            state.latency_catching_up = false;
        }

        // While stretching, the FIFOs run at unity and the stretcher owns
        // the tempo.
        let fifo_speed = if stretching { 1.0 } else { target_speed };
        self.target_speed.store(fifo_speed, Ordering::Relaxed);
        for fifo in self.fifos() {
            fifo.set_playback_speed(fifo_speed);
        }

        if stretching {
            if !state.stretching {
                state.stretcher.clear();
                state.stretching = true;
            }
            // While predicting, history would dilute the freshest estimate.
            state.stretcher.set_tempo(target_speed, predicting);

            let mut available = self
                .dma_fifo
                .available_samples()
                .min(self.streaming_fifo.available_samples());
            for speaker in &self.speaker_fifos {
                if speaker.is_currently_pushed() {
                    available = available.min(speaker.available_samples());
                }
            }
            // A large in/out rate mismatch could push this over the scratch.
            let available = available.min(MAX_SAMPLES);

            let MixState {
                scratch,
                interp,
                stretcher,
                ..
            } = state;
            let staging = &mut scratch[..(available * NC) as usize];
            staging.fill(0);
            self.dma_fifo.mix(staging, available, true, interp);
            self.streaming_fifo.mix(staging, available, true, interp);
            for speaker in &self.speaker_fifos {
                speaker.mix(staging, available, true, interp);
            }

            stretcher.push_samples(staging);
            let out = &mut samples[..(num_samples * NC) as usize];
            out.fill(0);
            stretcher.get_stretched_samples(out, num_samples, true);
        } else {
            samples[..(num_samples * NC) as usize].fill(0);

            let mut remaining = num_samples;
            let mut offset = 0usize;
            if state.stretching {
                // Play out what the stretcher still holds; its unprocessed
                // input is lost. Toggling stretching every callback behaves
                // oddly, but it degrades gracefully.
                let received = state.stretcher.get_stretched_samples(
                    &mut samples[..(num_samples * NC) as usize],
                    remaining,
                    false,
                );
                remaining -= received;
                offset = (received * NC) as usize;
                if state.stretcher.processed_latency() <= 0.0 {
                    state.stretching = false;
                }
            }

            let out = &mut samples[offset..(num_samples * NC) as usize];
            let interp = &mut state.interp;
            self.dma_fifo.mix(out, remaining, false, interp);
            self.streaming_fifo.mix(out, remaining, false, interp);
            for speaker in &self.speaker_fifos {
                speaker.mix(out, remaining, false, interp);
            }
        }

        num_samples
    }

    /// Renders `samples.len() / 6` surround frames (FL FR FC LFE RL RR).
    /// Stretch-before-decode: the stereo mix (including stretching) feeds
    /// the decoder. Returns 0 without writing when the decoder cannot be fed
    /// its exact block.
    pub fn mix_surround(&self, samples: &mut [f32]) -> u32 {
        let num_samples = (samples.len() / SURROUND_CHANNELS) as u32;
        let Some(_guard) = self.consumer_guard() else {
            return 0;
        };
        // SAFETY: guard held; we are the only consumer.
        let state = unsafe { &mut *self.state.get() };

        samples.fill(0.0);
        if num_samples == 0 {
            return 0;
        }

        // The decoder only accepts whole blocks, so ask it for the exact
        // stereo count backing this request.
        let needed_samples = state
            .surround
            .query_samples_needed_for_surround_output(num_samples);
        let staging_len = (needed_samples * NC) as usize;
        debug_assert!(staging_len <= state.surround_scratch.len());

        let mut surround_scratch = std::mem::take(&mut state.surround_scratch);
        let available_samples = self.mix_inner(state, &mut surround_scratch[..staging_len], needed_samples);
        state.surround_scratch = surround_scratch;

        if available_samples != needed_samples {
            // Paused (the inner mix produced nothing) or starved.
            if !self.dma_speed.is_paused() {
                error!(
                    needed_samples,
                    available_samples, "could not feed the surround decoder a whole block"
                );
            }
            return 0;
        }

        if needed_samples > 0 {
            state
                .surround
                .push_samples(&state.surround_scratch[..staging_len], needed_samples);
        }
        state.surround.get_decoded_samples(samples, num_samples);

        num_samples
    }

    /// Feeds DSP DMA samples (channel-swapped big-endian stereo). Also the
    /// cadence reference for speed tracking: DMA is always present, and its
    /// batches are large enough to time reliably.
    pub fn push_dma_samples(&self, samples: &[i16]) {
        let num_samples = samples.len() as u32 / NC;
        self.dma_speed.update(num_samples as f64);
        self.dma_speed.cache_average_speed(false, -1.0);
        // Slightly stale by the time the callback reads it; the error is
        // too small to matter.
        self.dma_speed.cache_average_speed(
            true,
            self.time_at_custom_speed.load(Ordering::Relaxed),
        );

        self.dma_fifo.push(samples);

        if self.log_dsp_audio.load(Ordering::Relaxed) {
            let sample_rate = self.dma_fifo.rounded_input_sample_rate();
            let mut writer = self
                .wave_writer_dsp
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writer.add_stereo_samples_be(samples, sample_rate) {
                self.log_dsp_audio.store(false, Ordering::Relaxed);
                warn!("DSP dump failed, disabling: {e}");
            }
        }
    }

    /// Feeds streaming (disc audio) samples. Streaming pushes are the most
    /// frequent, so they double as the heartbeat that notices remote
    /// speakers going quiet.
    pub fn push_streaming_samples(&self, samples: &[i16]) {
        let num_samples = samples.len() as u32 / NC;
        self.streaming_fifo.push(samples);

        let time_delta = num_samples as f64 / self.dma_fifo.input_sample_rate();
        let prime_seconds = self.config.max_latency() * self.config.speaker_prime_ratio();
        let stretching = self.config.audio_stretch();
        for speaker in &self.speaker_fifos {
            speaker.update_push(-time_delta, prime_seconds, stretching);
        }

        if self.log_dtk_audio.load(Ordering::Relaxed) {
            let sample_rate = self.streaming_fifo.rounded_input_sample_rate();
            let mut writer = self
                .wave_writer_dtk
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writer.add_stereo_samples_be(samples, sample_rate) {
                self.log_dtk_audio.store(false, Ordering::Relaxed);
                warn!("DTK dump failed, disabling: {e}");
            }
        }
    }

    /// Feeds mono remote-speaker samples at `sample_rate`, duplicating them
    /// to both channels. `index` selects one of the four speakers.
    pub fn push_speaker_samples(&self, index: usize, samples: &[i16], sample_rate: u32) {
        let Some(fifo) = self.speaker_fifos.get(index) else {
            warn!(index, "speaker push for a speaker that does not exist");
            return;
        };
        let num_samples = samples.len().min(MAX_SAMPLES as usize);

        fifo.set_input_sample_rate(sample_rate as f64);
        let prime_seconds = self.config.max_latency() * self.config.speaker_prime_ratio();
        fifo.update_push(
            num_samples as f64 / sample_rate as f64,
            prime_seconds,
            self.config.audio_stretch(),
        );

        // Mono to interleaved stereo in bounded chunks; no allocation on the
        // producer path either.
        const CHUNK: usize = 256;
        let mut conversion = [0i16; CHUNK * NC as usize];
        for chunk in samples[..num_samples].chunks(CHUNK) {
            for (i, &sample) in chunk.iter().enumerate() {
                conversion[i * 2] = sample;
                conversion[i * 2 + 1] = sample;
            }
            fifo.push(&conversion[..chunk.len() * 2]);
        }
    }

    pub fn set_dma_input_sample_rate(&self, rate: f64) {
        self.dma_fifo.set_input_sample_rate(rate);
        self.dma_speed.set_ticks_per_second(rate);
    }

    pub fn set_streaming_input_sample_rate(&self, rate: f64) {
        self.streaming_fifo.set_input_sample_rate(rate);
    }

    /// Volumes are 0..=255 per channel.
    pub fn set_streaming_volume(&self, l_volume: u32, r_volume: u32) {
        self.streaming_fifo.set_volume(l_volume, r_volume);
    }

    pub fn set_speaker_volume(&self, index: usize, l_volume: u32, r_volume: u32) {
        if let Some(fifo) = self.speaker_fifos.get(index) {
            fifo.set_volume(l_volume, r_volume);
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.dma_speed.set_paused(paused);
    }

    /// Re-syncs output-rate dependent components. Only call while the
    /// backend callback is not running.
    pub fn update_settings(&self, sample_rate: u32) {
        let Some(_guard) = self.consumer_guard() else {
            warn!("update_settings while the callback is running; ignored");
            return;
        };
        // SAFETY: guard held.
        let state = unsafe { &mut *self.state.get() };

        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        for fifo in self.fifos() {
            fifo.set_output_sample_rate(sample_rate);
        }
        state.stretcher.set_sample_rate(sample_rate);
        if self.surround_changed.swap(false, Ordering::Relaxed) {
            state.surround.clear();
        }
        state.surround.init_and_set_sample_rate(
            sample_rate,
            self.config.dpl2_quality(),
            self.config.dpl2_bass_redirection(),
        );
    }

    /// Marks the surround decoder dirty so the next
    /// [`update_settings`](Self::update_settings) clears it; call when
    /// enabling or disabling surround.
    pub fn set_surround_changed(&self) {
        self.surround_changed.store(true, Ordering::Relaxed);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// The current target playback speed (1.0 while stretching).
    pub fn current_speed(&self) -> f64 {
        self.target_speed.load(Ordering::Relaxed)
    }

    pub fn start_log_dtk_audio(&self, file_name: &Path) {
        if self.log_dtk_audio.load(Ordering::Relaxed) {
            warn!("DTK audio logging already started");
            return;
        }
        let mut writer = self
            .wave_writer_dtk
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match writer.start(file_name, self.streaming_fifo.rounded_input_sample_rate()) {
            Ok(()) => {
                writer.set_skip_silence(false);
                self.log_dtk_audio.store(true, Ordering::Relaxed);
                info!("starting DTK audio logging");
            }
            Err(e) => {
                writer.stop();
                warn!("unable to start DTK audio logging: {e}");
            }
        }
    }

    pub fn stop_log_dtk_audio(&self) {
        if self.log_dtk_audio.swap(false, Ordering::Relaxed) {
            self.wave_writer_dtk
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .stop();
            info!("stopping DTK audio logging");
        } else {
            warn!("DTK audio logging already stopped");
        }
    }

    pub fn start_log_dsp_audio(&self, file_name: &Path) {
        if self.log_dsp_audio.load(Ordering::Relaxed) {
            warn!("DSP audio logging already started");
            return;
        }
        let mut writer = self
            .wave_writer_dsp
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match writer.start(file_name, self.dma_fifo.rounded_input_sample_rate()) {
            Ok(()) => {
                writer.set_skip_silence(false);
                self.log_dsp_audio.store(true, Ordering::Relaxed);
                info!("starting DSP audio logging");
            }
            Err(e) => {
                writer.stop();
                warn!("unable to start DSP audio logging: {e}");
            }
        }
    }

    pub fn stop_log_dsp_audio(&self) {
        if self.log_dsp_audio.swap(false, Ordering::Relaxed) {
            self.wave_writer_dsp
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .stop();
            info!("stopping DSP audio logging");
        } else {
            warn!("DSP audio logging already stopped");
        }
    }
}
