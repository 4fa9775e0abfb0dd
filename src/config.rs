//! Audio engine configuration.
//!
//! [`AudioSettings`] is the plain, serde-friendly shape a host persists.
//! [`AudioConfig`] is the live form shared between the host, emulation and
//! callback threads: every field the hot paths read is an atomic, so a
//! settings change never takes a lock the callback could block on. An
//! occasional mixed read across a change is inaudible (volumes) or
//! self-correcting (speeds).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::atomics::AtomicF64;
use crate::mixer::MAX_SAMPLES;

/// Default output sample rate when the OS mixer rate is not used.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

pub const AUDIO_VOLUME_MIN: i32 = 0;
pub const AUDIO_VOLUME_MAX: i32 = 100;

/// Output backend selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioBackend {
    /// Host audio via cpal.
    #[default]
    Cpal,
    /// No output; samples are consumed and discarded. Used by tests and
    /// headless hosts.
    Null,
}

/// Surround decoder block quality. Higher quality decodes longer blocks,
/// which also adds latency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dpl2Quality {
    Lowest = 0,
    #[default]
    Low = 1,
    High = 2,
    Highest = 3,
}

impl Dpl2Quality {
    /// Decode block length in milliseconds before rounding to a power of two.
    pub(crate) fn frame_block_ms(self) -> u32 {
        match self {
            Dpl2Quality::Lowest => 10,
            Dpl2Quality::Low => 20,
            Dpl2Quality::High => 40,
            Dpl2Quality::Highest => 80,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Dpl2Quality::Lowest,
            2 => Dpl2Quality::High,
            3 => Dpl2Quality::Highest,
            _ => Dpl2Quality::Low,
        }
    }
}

/// The largest mixer latency the ring capacity can back, in milliseconds.
pub fn max_supported_latency_ms() -> u32 {
    (MAX_SAMPLES as u64 * 1000 / DEFAULT_SAMPLE_RATE as u64) as u32
}

/// Plain settings as a host would persist them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub backend: AudioBackend,
    /// Ask the backend for the OS mixer rate instead of using
    /// [`DEFAULT_SAMPLE_RATE`].
    pub use_os_mixer_sample_rate: bool,
    /// Mixer latency ceiling, also passed to the backend as a buffer hint.
    pub target_latency_ms: u32,
    /// Negative disables dynamic audio speed, zero forces it on, positive is
    /// the time the mix must fall behind before the tracked speed takes over.
    pub audio_emu_speed_tolerance_ms: i32,
    /// Route the output through the pitch-preserving time stretcher.
    pub audio_stretch: bool,
    /// Decode stereo to 5.1 before handing it to the backend.
    pub dpl2_decoder: bool,
    pub dpl2_quality: Dpl2Quality,
    /// Synthesise an LFE channel in the surround decoder. Off by default,
    /// most setups have their own crossover.
    pub dpl2_bass_redirection: bool,
    /// Volume percent, 0..=100.
    pub volume: i32,
    pub muted: bool,
    /// Start WAV dumping as soon as the stream comes up.
    pub dump_audio: bool,
    /// Directory receiving `dtkdump.wav` / `dspdump.wav`.
    pub dump_path: PathBuf,
    /// Target emulation speed; 1.0 is real time, 0 or below means unthrottled.
    pub emulation_speed: f64,
    /// Fraction of `target_latency_ms` of silence used to prime a remote
    /// speaker FIFO when it starts pushing.
    pub speaker_prime_ratio: f64,
    /// Output device name; `None` selects the host default.
    pub output_device: Option<String>,
    /// Rate to open the named device at, when the device demands one.
    pub output_device_sample_rate: Option<u32>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            backend: AudioBackend::default(),
            use_os_mixer_sample_rate: false,
            target_latency_ms: 80,
            audio_emu_speed_tolerance_ms: 80,
            audio_stretch: false,
            dpl2_decoder: false,
            dpl2_quality: Dpl2Quality::default(),
            dpl2_bass_redirection: false,
            volume: AUDIO_VOLUME_MAX,
            muted: false,
            dump_audio: false,
            dump_path: std::env::temp_dir(),
            emulation_speed: 1.0,
            speaker_prime_ratio: 0.5,
            output_device: None,
            output_device_sample_rate: None,
        }
    }
}

/// Live configuration shared across threads.
///
/// Constructed from [`AudioSettings`] at stream init. The host mutates it
/// through the setters; producers and the callback read atomics.
pub struct AudioConfig {
    emulation_speed: AtomicF64,
    throttler_disabled: AtomicBool,
    audio_stretch: AtomicBool,
    /// Seconds; negative disables dynamic speed.
    speed_tolerance: AtomicF64,
    /// Seconds.
    max_latency: AtomicF64,
    speaker_prime_ratio: AtomicF64,
    volume: AtomicI32,
    muted: AtomicBool,
    dpl2_decoder: AtomicBool,
    dpl2_quality: AtomicU8,
    dpl2_bass_redirection: AtomicBool,
    dump_audio: AtomicBool,
    use_os_mixer_sample_rate: AtomicBool,
    /// Strings are init-time only, read under the control-surface lock.
    device: Mutex<DeviceSelection>,
}

#[derive(Clone, Default)]
pub struct DeviceSelection {
    pub name: Option<String>,
    pub sample_rate: Option<u32>,
}

impl AudioConfig {
    pub fn new(settings: &AudioSettings) -> Self {
        let target_latency = settings.target_latency_ms.min(max_supported_latency_ms());
        Self {
            emulation_speed: AtomicF64::new(settings.emulation_speed),
            throttler_disabled: AtomicBool::new(false),
            audio_stretch: AtomicBool::new(settings.audio_stretch),
            speed_tolerance: AtomicF64::new(settings.audio_emu_speed_tolerance_ms as f64 / 1000.0),
            max_latency: AtomicF64::new(target_latency as f64 / 1000.0),
            speaker_prime_ratio: AtomicF64::new(settings.speaker_prime_ratio),
            volume: AtomicI32::new(settings.volume.clamp(AUDIO_VOLUME_MIN, AUDIO_VOLUME_MAX)),
            muted: AtomicBool::new(settings.muted),
            dpl2_decoder: AtomicBool::new(settings.dpl2_decoder),
            dpl2_quality: AtomicU8::new(settings.dpl2_quality as u8),
            dpl2_bass_redirection: AtomicBool::new(settings.dpl2_bass_redirection),
            dump_audio: AtomicBool::new(settings.dump_audio),
            use_os_mixer_sample_rate: AtomicBool::new(settings.use_os_mixer_sample_rate),
            device: Mutex::new(DeviceSelection {
                name: settings.output_device.clone(),
                sample_rate: settings.output_device_sample_rate,
            }),
        }
    }

    pub fn emulation_speed(&self) -> f64 {
        self.emulation_speed.load(Ordering::Relaxed)
    }

    pub fn set_emulation_speed(&self, speed: f64) {
        self.emulation_speed.store(speed, Ordering::Relaxed);
    }

    /// True while the host has temporarily lifted the frame limiter
    /// (fast-forward hotkey and the like).
    pub fn throttler_disabled(&self) -> bool {
        self.throttler_disabled.load(Ordering::Relaxed)
    }

    pub fn set_throttler_disabled(&self, disabled: bool) {
        self.throttler_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn audio_stretch(&self) -> bool {
        self.audio_stretch.load(Ordering::Relaxed)
    }

    pub fn set_audio_stretch(&self, stretch: bool) {
        self.audio_stretch.store(stretch, Ordering::Relaxed);
    }

    pub fn speed_tolerance(&self) -> f64 {
        self.speed_tolerance.load(Ordering::Relaxed)
    }

    pub fn set_speed_tolerance_ms(&self, tolerance_ms: i32) {
        self.speed_tolerance
            .store(tolerance_ms as f64 / 1000.0, Ordering::Relaxed);
    }

    pub fn max_latency(&self) -> f64 {
        self.max_latency.load(Ordering::Relaxed)
    }

    pub fn set_target_latency_ms(&self, latency_ms: u32) {
        let latency_ms = latency_ms.min(max_supported_latency_ms());
        self.max_latency
            .store(latency_ms as f64 / 1000.0, Ordering::Relaxed);
    }

    pub fn speaker_prime_ratio(&self) -> f64 {
        self.speaker_prime_ratio.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> i32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: i32) {
        self.volume
            .store(volume.clamp(AUDIO_VOLUME_MIN, AUDIO_VOLUME_MAX), Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn toggle_muted(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn dpl2_decoder(&self) -> bool {
        self.dpl2_decoder.load(Ordering::Relaxed)
    }

    pub fn set_dpl2_decoder(&self, enabled: bool) {
        self.dpl2_decoder.store(enabled, Ordering::Relaxed);
    }

    pub fn dpl2_quality(&self) -> Dpl2Quality {
        Dpl2Quality::from_u8(self.dpl2_quality.load(Ordering::Relaxed))
    }

    pub fn set_dpl2_quality(&self, quality: Dpl2Quality) {
        self.dpl2_quality.store(quality as u8, Ordering::Relaxed);
    }

    pub fn dpl2_bass_redirection(&self) -> bool {
        self.dpl2_bass_redirection.load(Ordering::Relaxed)
    }

    pub fn dump_audio(&self) -> bool {
        self.dump_audio.load(Ordering::Relaxed)
    }

    pub fn set_dump_audio(&self, dump: bool) {
        self.dump_audio.store(dump, Ordering::Relaxed);
    }

    pub fn use_os_mixer_sample_rate(&self) -> bool {
        self.use_os_mixer_sample_rate.load(Ordering::Relaxed)
    }

    pub fn device(&self) -> DeviceSelection {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::new(&AudioSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_clamped() {
        let config = AudioConfig::default();
        config.set_volume(250);
        assert_eq!(config.volume(), AUDIO_VOLUME_MAX);
        config.set_volume(-3);
        assert_eq!(config.volume(), AUDIO_VOLUME_MIN);
    }

    #[test]
    fn target_latency_clamps_to_ring_capacity() {
        let config = AudioConfig::default();
        config.set_target_latency_ms(u32::MAX);
        assert!(config.max_latency() <= max_supported_latency_ms() as f64 / 1000.0);
    }

    #[test]
    fn quality_block_lengths_are_ordered() {
        let qualities = [
            Dpl2Quality::Lowest,
            Dpl2Quality::Low,
            Dpl2Quality::High,
            Dpl2Quality::Highest,
        ];
        let lengths: Vec<u32> = qualities.iter().map(|q| q.frame_block_ms()).collect();
        assert!(lengths.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(lengths[3], 80);
    }
}
