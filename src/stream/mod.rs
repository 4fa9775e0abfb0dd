//! Abstract sound output backends.
//!
//! A [`SoundStream`] owns the [`Mixer`] and pulls from it at the backend's
//! pace. Backends are created and driven by the control surface
//! ([`crate::control`]); `set_running` is never called re-entrantly or with
//! the current state.

mod cpal_stream;

pub use cpal_stream::CpalStream;

use std::sync::Arc;

use tracing::debug;

use crate::error::AudioError;
use crate::mixer::Mixer;

/// Surround availability, for UI; does not need to be perfectly fresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurroundState {
    /// Surround is off or the backend cannot open a 6-channel stream.
    Disabled,
    /// Requested but the backend is not running yet.
    EnabledNotRunning,
    /// The backend tried to open 6 channels and fell back to stereo.
    Failed,
    /// Running with the surround decoder active.
    Enabled,
}

/// A backend that pulls mixed audio. Implementations keep the callback
/// real-time clean: it may only call [`Mixer::mix`] / [`Mixer::mix_surround`]
/// and cheap conversions.
pub trait SoundStream: Send {
    /// The mixer this stream pulls from.
    fn mixer(&self) -> &Arc<Mixer>;

    /// Acquires the device. Failure is fatal for the session; the control
    /// surface falls back to the null backend.
    fn init(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Starts or stops the callback. Only called through the control
    /// surface, which serialises transitions and filters out repeats.
    fn set_running(&mut self, running: bool) -> Result<(), AudioError>;

    /// Volume in percent, 0..=100.
    fn set_volume(&mut self, _volume: i32) {}

    /// Applies a non-volume settings change (latency, surround, device).
    /// A backend that cannot retune a live stream requests a restart
    /// instead, which the next [`wants_restart`](Self::wants_restart) poll
    /// performs.
    fn on_settings_changed(&mut self) {}

    /// Polled periodically from the producer side. Returns true when the
    /// backend wants a stop/start cycle (device lost, settings changed); the
    /// control surface performs it, and a failed restart leaves the request
    /// pending.
    fn wants_restart(&mut self) -> bool {
        false
    }

    fn surround_state(&self) -> SurroundState {
        SurroundState::Disabled
    }
}

/// Backend that consumes nothing: the FIFOs still drain through pushes being
/// clipped, and the host keeps working without an audio device.
pub struct NullStream {
    mixer: Arc<Mixer>,
}

impl NullStream {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        Self { mixer }
    }
}

impl SoundStream for NullStream {
    fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    fn set_running(&mut self, running: bool) -> Result<(), AudioError> {
        debug!(running, "null sound stream toggled");
        Ok(())
    }
}
