//! Process-wide sound stream control surface.
//!
//! One stream instance per process, owned here. The host thread drives the
//! lifecycle and settings; emulation code routes its pushes through a stable
//! mixer handle captured at init. Running-state transitions hold their own
//! lock because some backends crash on concurrent or repeated toggles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::config::{AudioBackend, AudioConfig, AudioSettings, Dpl2Quality, DEFAULT_SAMPLE_RATE};
use crate::error::AudioError;
use crate::mixer::Mixer;
use crate::stream::{CpalStream, NullStream, SoundStream, SurroundState};

static SOUND_STREAM: Mutex<Option<Box<dyn SoundStream>>> = Mutex::new(None);
/// Serialises running-state transitions. Lock order: `RUNNING` before
/// `SOUND_STREAM`, never the other way around.
static RUNNING: Mutex<bool> = Mutex::new(false);
/// Stable handles for the producer side; only swapped at init/shutdown.
static MIXER: Mutex<Option<Arc<Mixer>>> = Mutex::new(None);
static CONFIG: Mutex<Option<Arc<AudioConfig>>> = Mutex::new(None);
static AUDIO_DUMP_STARTED: AtomicBool = AtomicBool::new(false);
static DUMP_PATH: Mutex<Option<std::path::PathBuf>> = Mutex::new(None);

fn lock<T>(mutex: &'static Mutex<T>) -> std::sync::MutexGuard<'static, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn create_stream_for_backend(
    backend: AudioBackend,
    mixer: Arc<Mixer>,
    config: Arc<AudioConfig>,
) -> Box<dyn SoundStream> {
    match backend {
        AudioBackend::Cpal => Box::new(CpalStream::new(mixer, config)),
        AudioBackend::Null => Box::new(NullStream::new(mixer)),
    }
}

/// Creates the backend and mixer and starts the stream. A backend that fails
/// `init` is replaced by the null backend so the session keeps working
/// without sound.
pub fn init_sound_stream(settings: &AudioSettings) -> Result<(), AudioError> {
    let config = Arc::new(AudioConfig::new(settings));
    let mixer = Arc::new(Mixer::new(DEFAULT_SAMPLE_RATE, config.clone()));

    let mut stream = create_stream_for_backend(settings.backend, mixer.clone(), config.clone());
    if let Err(e) = stream.init() {
        warn!(
            "could not initialise the {:?} backend ({e}), using the null backend",
            settings.backend
        );
        stream = Box::new(NullStream::new(mixer.clone()));
        stream.init()?;
    }

    {
        let mut guard = lock(&SOUND_STREAM);
        *guard = Some(stream);
        *lock(&MIXER) = Some(mixer);
        *lock(&CONFIG) = Some(config);
        *lock(&DUMP_PATH) = Some(settings.dump_path.clone());
    }

    update_sound_stream_settings(true);
    // Starting can fail (e.g. device busy); the user can recover by fixing
    // the device and pausing/unpausing, so this is not fatal.
    set_sound_stream_running(true, true);

    if settings.dump_audio && !AUDIO_DUMP_STARTED.load(Ordering::Relaxed) {
        start_audio_dump();
    }
    Ok(())
}

pub fn shutdown_sound_stream() {
    info!("shutting down sound stream");

    if AUDIO_DUMP_STARTED.load(Ordering::Relaxed) {
        stop_audio_dump();
    }
    set_sound_stream_running(false, true);
    {
        *lock(&SOUND_STREAM) = None;
        *lock(&MIXER) = None;
        *lock(&CONFIG) = None;
        *lock(&DUMP_PATH) = None;
    }

    info!("done shutting down sound stream");
}

/// Starts or stops the stream. Safe to call repeatedly; a transition to the
/// current state is a no-op. Returns whether the requested state holds.
pub fn set_sound_stream_running(running: bool, report_errors: bool) -> bool {
    // A previous transition may still be in flight on another thread; most
    // backends would crash on overlap.
    let mut running_guard = lock(&RUNNING);

    if *running_guard == running {
        return true;
    }

    let mut stream_guard = lock(&SOUND_STREAM);
    let Some(stream) = stream_guard.as_mut() else {
        return true;
    };

    match stream.set_running(running) {
        Ok(()) => {
            *running_guard = running;
            true
        }
        Err(e) => {
            if report_errors {
                if running {
                    error!("error starting stream: {e}");
                } else {
                    error!("error stopping stream: {e}");
                }
            }
            false
        }
    }
}

/// Routes DSP DMA samples to the mixer (and the dump writers), polls the
/// backend's restart request, and keeps the dump toggle in sync. Called from
/// the emulation thread; DMA pushes are the least frequent, which makes this
/// the natural polling point.
pub fn send_ai_buffer(samples: &[i16]) {
    let Some(mixer) = lock(&MIXER).clone() else {
        return;
    };

    if let Some(config) = lock(&CONFIG).clone() {
        let dumping = AUDIO_DUMP_STARTED.load(Ordering::Relaxed);
        if config.dump_audio() && !dumping {
            start_audio_dump();
        } else if !config.dump_audio() && dumping {
            stop_audio_dump();
        }
    }

    mixer.push_dma_samples(samples);

    // Poll even while stopped; a lost device is re-acquired from here.
    let wants_restart = lock(&SOUND_STREAM)
        .as_mut()
        .map(|stream| stream.wants_restart())
        .unwrap_or(false);
    if wants_restart {
        info!("backend requested a restart");
        if set_sound_stream_running(false, false) {
            // The device may still be invalidated; a failed start leaves the
            // request pending and we retry on a later push.
            set_sound_stream_running(true, false);
        }
    }
}

/// The mixer handle, for hosts that push streaming/speaker samples directly.
pub fn mixer() -> Option<Arc<Mixer>> {
    lock(&MIXER).clone()
}

/// The live configuration, for hosts mutating settings at runtime.
pub fn config() -> Option<Arc<AudioConfig>> {
    lock(&CONFIG).clone()
}

pub fn surround_state() -> SurroundState {
    lock(&SOUND_STREAM)
        .as_ref()
        .map(|stream| stream.surround_state())
        .unwrap_or(SurroundState::Disabled)
}

/// Re-applies volume (and, when `volume_only` is false, any other settings a
/// backend can take at runtime).
pub fn update_sound_stream_settings(volume_only: bool) {
    let config = lock(&CONFIG).clone();
    let mut stream_guard = lock(&SOUND_STREAM);
    if let (Some(stream), Some(config)) = (stream_guard.as_mut(), config) {
        let volume = if config.muted() { 0 } else { config.volume() };
        stream.set_volume(volume);
        if !volume_only {
            // Latency, surround and device changes need a stream cycle; the
            // backend flags its restart and the periodic poll performs it.
            stream.on_settings_changed();
        }
    }
}

// These helpers release the config lock before re-entering
// `update_sound_stream_settings`, which takes it again.

pub fn increase_volume(offset: i32) {
    let Some(config) = lock(&CONFIG).clone() else {
        return;
    };
    config.set_muted(false);
    config.set_volume(config.volume() + offset);
    update_sound_stream_settings(true);
}

pub fn decrease_volume(offset: i32) {
    let Some(config) = lock(&CONFIG).clone() else {
        return;
    };
    config.set_muted(false);
    config.set_volume(config.volume() - offset);
    update_sound_stream_settings(true);
}

pub fn toggle_mute_volume() {
    let Some(config) = lock(&CONFIG).clone() else {
        return;
    };
    config.toggle_muted();
    update_sound_stream_settings(true);
}

/// Applies a new latency ceiling to the mixer and the running backend.
pub fn set_target_latency_ms(latency_ms: u32) {
    let Some(config) = lock(&CONFIG).clone() else {
        return;
    };
    config.set_target_latency_ms(latency_ms);
    update_sound_stream_settings(false);
}

/// Enables or disables the surround decoder. The decoder keeps
/// block-aligned state, so it is marked dirty and dropped on the stream
/// cycle rather than playing stale frames.
pub fn set_dpl2_decoder(enabled: bool) {
    let Some(config) = lock(&CONFIG).clone() else {
        return;
    };
    if config.dpl2_decoder() == enabled {
        return;
    }
    config.set_dpl2_decoder(enabled);
    if let Some(mixer) = lock(&MIXER).clone() {
        mixer.set_surround_changed();
    }
    update_sound_stream_settings(false);
}

/// Changes the surround decode quality (block length). Invalidates the
/// decoder's buffered blocks like a surround toggle does.
pub fn set_dpl2_quality(quality: Dpl2Quality) {
    let Some(config) = lock(&CONFIG).clone() else {
        return;
    };
    if config.dpl2_quality() == quality {
        return;
    }
    config.set_dpl2_quality(quality);
    if let Some(mixer) = lock(&MIXER).clone() {
        mixer.set_surround_changed();
    }
    update_sound_stream_settings(false);
}

/// Opens the DTK and DSP dump files next to each other in the configured
/// dump directory.
pub fn start_audio_dump() {
    let Some(mixer) = lock(&MIXER).clone() else {
        return;
    };
    let dump_path = lock(&DUMP_PATH)
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    mixer.start_log_dtk_audio(&dump_path.join("dtkdump.wav"));
    mixer.start_log_dsp_audio(&dump_path.join("dspdump.wav"));
    AUDIO_DUMP_STARTED.store(true, Ordering::Relaxed);
}

pub fn stop_audio_dump() {
    let Some(mixer) = lock(&MIXER).clone() else {
        return;
    };
    mixer.stop_log_dtk_audio();
    mixer.stop_log_dsp_audio();
    AUDIO_DUMP_STARTED.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AUDIO_VOLUME_MAX;

    /// The control surface is process-global; run every scenario under one
    /// test so they cannot race each other.
    #[test]
    fn lifecycle_volume_and_push_routing() {
        let settings = AudioSettings {
            backend: AudioBackend::Null,
            dump_path: std::env::temp_dir().join("nether-mix-control-test"),
            ..AudioSettings::default()
        };
        init_sound_stream(&settings).unwrap();

        // Repeated running transitions are no-ops, not crashes.
        assert!(set_sound_stream_running(true, true));
        assert!(set_sound_stream_running(false, true));
        assert!(set_sound_stream_running(true, true));

        // Pushes route to the mixer.
        let samples = vec![100i16; 560 * 2];
        send_ai_buffer(&samples);
        let mixer = mixer().expect("mixer registered");
        assert!(mixer.sample_rate() > 0);

        // Volume clamps and unmutes.
        let config = config().expect("config registered");
        config.set_muted(true);
        increase_volume(1000);
        assert!(!config.muted());
        assert_eq!(config.volume(), AUDIO_VOLUME_MAX);
        decrease_volume(30);
        assert_eq!(config.volume(), AUDIO_VOLUME_MAX - 30);
        toggle_mute_volume();
        assert!(config.muted());

        // Runtime settings changes land in the live config and reach the
        // backend through the settings-changed hook.
        set_target_latency_ms(40);
        assert!((config.max_latency() - 0.04).abs() < 1e-9);
        set_dpl2_decoder(true);
        assert!(config.dpl2_decoder());
        set_dpl2_quality(Dpl2Quality::High);
        assert_eq!(config.dpl2_quality(), Dpl2Quality::High);
        set_dpl2_decoder(false);
        assert!(!config.dpl2_decoder());

        // Dump toggles survive double calls.
        start_audio_dump();
        start_audio_dump();
        stop_audio_dump();
        stop_audio_dump();

        shutdown_sound_stream();
        assert!(super::mixer().is_none());
        // Shutdown twice is fine.
        shutdown_sound_stream();

        std::fs::remove_dir_all(std::env::temp_dir().join("nether-mix-control-test")).ok();
    }
}
