//! cpal output backend.
//!
//! Opens a 2-channel i16 stream (or 6-channel f32 when surround is on) and
//! pulls the mixer from the device callback. When the 6-channel open fails
//! the stream falls back to stereo and reports it, the same strategy the
//! pulse-style backends use.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info, warn};

use crate::config::{AudioConfig, DEFAULT_SAMPLE_RATE};
use crate::error::AudioError;
use crate::mixer::Mixer;
use crate::surround::SURROUND_CHANNELS;

use super::{SoundStream, SurroundState};

/// `cpal::Stream` is conservatively `!Send`, but we only create, start and
/// drop it from host threads serialised by the control surface's running
/// lock, never from the callback.
struct StreamHolder(#[allow(dead_code)] cpal::Stream);
unsafe impl Send for StreamHolder {}

pub struct CpalStream {
    mixer: Arc<Mixer>,
    config: Arc<AudioConfig>,
    stream: Option<StreamHolder>,
    /// Percent, read by the callback.
    volume: Arc<AtomicI32>,
    /// Set by the error callback on device loss; cleared when a start
    /// succeeds.
    should_restart: Arc<AtomicBool>,
    surround_state: SurroundState,
}

impl CpalStream {
    pub fn new(mixer: Arc<Mixer>, config: Arc<AudioConfig>) -> Self {
        Self {
            mixer,
            config,
            stream: None,
            volume: Arc::new(AtomicI32::new(100)),
            should_restart: Arc::new(AtomicBool::new(false)),
            surround_state: SurroundState::Disabled,
        }
    }

    fn output_device(&self) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        let selection = self.config.device();
        if let Some(name) = selection.name {
            if let Ok(devices) = host.output_devices() {
                for device in devices {
                    if device.name().map(|n| n == name).unwrap_or(false) {
                        return Ok(device);
                    }
                }
            }
            warn!("output device '{name}' not found, using the default");
        }
        host.default_output_device().ok_or(AudioError::NoOutputDevice)
    }

    fn pick_sample_rate(&self, device: &cpal::Device) -> Result<u32, AudioError> {
        if let Some(rate) = self.config.device().sample_rate {
            return Ok(rate);
        }
        if self.config.use_os_mixer_sample_rate() {
            return Ok(device.default_output_config()?.sample_rate().0);
        }
        Ok(DEFAULT_SAMPLE_RATE)
    }

    fn buffer_size(&self, sample_rate: u32) -> cpal::BufferSize {
        let frames = (self.config.max_latency() * sample_rate as f64) as u32;
        if frames > 0 {
            cpal::BufferSize::Fixed(frames)
        } else {
            cpal::BufferSize::Default
        }
    }

    fn build_surround_stream(
        &self,
        device: &cpal::Device,
        sample_rate: u32,
    ) -> Result<cpal::Stream, AudioError> {
        let stream_config = cpal::StreamConfig {
            channels: SURROUND_CHANNELS as u16,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: self.buffer_size(sample_rate),
        };
        let mixer = self.mixer.clone();
        let volume = self.volume.clone();
        let should_restart = self.should_restart.clone();
        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mixer.mix_surround(data);
                let scale = volume.load(Ordering::Relaxed) as f32 / 100.0;
                if scale != 1.0 {
                    for sample in data.iter_mut() {
                        *sample *= scale;
                    }
                }
            },
            {
                let should_restart = should_restart.clone();
                move |err| {
                    error!("surround stream error: {err}");
                    should_restart.store(true, Ordering::Relaxed);
                }
            },
            None,
        )?;
        Ok(stream)
    }

    fn build_stereo_stream(
        &self,
        device: &cpal::Device,
        sample_rate: u32,
    ) -> Result<cpal::Stream, AudioError> {
        let supported = device.default_output_config()?;
        let stream_config = cpal::StreamConfig {
            channels: 2,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: self.buffer_size(sample_rate),
        };
        let mixer = self.mixer.clone();
        let volume = self.volume.clone();
        let error_callback = {
            let should_restart = self.should_restart.clone();
            move |err: cpal::StreamError| {
                error!("audio stream error: {err}");
                should_restart.store(true, Ordering::Relaxed);
            }
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    mixer.mix(data);
                    let volume = volume.load(Ordering::Relaxed);
                    if volume != 100 {
                        for sample in data.iter_mut() {
                            *sample = (*sample as i32 * volume / 100) as i16;
                        }
                    }
                },
                error_callback,
                None,
            )?,
            cpal::SampleFormat::F32 => {
                // Mix in i16 and convert; keeps one mixer code path.
                let mut staging: Vec<i16> = vec![0; 4096];
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if staging.len() < data.len() {
                            staging.resize(data.len(), 0);
                        }
                        mixer.mix(&mut staging[..data.len()]);
                        let scale = volume.load(Ordering::Relaxed) as f32 / (100.0 * 32768.0);
                        let len = data.len();
                        for (out, &s) in data.iter_mut().zip(&staging[..len]) {
                            *out = s as f32 * scale;
                        }
                    },
                    error_callback,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let mut staging: Vec<i16> = vec![0; 4096];
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        if staging.len() < data.len() {
                            staging.resize(data.len(), 0);
                        }
                        mixer.mix(&mut staging[..data.len()]);
                        let volume = volume.load(Ordering::Relaxed);
                        let len = data.len();
                        for (out, &s) in data.iter_mut().zip(&staging[..len]) {
                            let scaled = s as i32 * volume / 100;
                            *out = (scaled + 32768).clamp(0, 65535) as u16;
                        }
                    },
                    error_callback,
                    None,
                )?
            }
            other => {
                return Err(AudioError::UnsupportedFormat(format!("{other:?}")));
            }
        };
        Ok(stream)
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.should_restart.store(false, Ordering::Relaxed);
        let result = self.start_inner();
        if result.is_err() {
            // Leave the restart request pending; the periodic poll retries
            // until the device comes back.
            self.should_restart.store(true, Ordering::Relaxed);
        }
        result
    }

    fn start_inner(&mut self) -> Result<(), AudioError> {
        let device = self.output_device()?;
        let sample_rate = self.pick_sample_rate(&device)?;

        // The callback is not running yet; safe to re-sync everything.
        self.mixer.update_settings(sample_rate);

        let surround = self.config.dpl2_decoder();
        let stream = if surround {
            match self.build_surround_stream(&device, sample_rate) {
                Ok(stream) => {
                    self.surround_state = SurroundState::Enabled;
                    stream
                }
                Err(e) => {
                    // Same recovery as the pulse backend: reopen as stereo.
                    warn!("6-channel open failed ({e}), falling back to stereo");
                    self.surround_state = SurroundState::Failed;
                    self.build_stereo_stream(&device, sample_rate)?
                }
            }
        } else {
            self.surround_state = SurroundState::Disabled;
            self.build_stereo_stream(&device, sample_rate)?
        };

        stream.play()?;
        info!(
            sample_rate,
            device = %device.name().unwrap_or_else(|_| "<unnamed>".into()),
            "audio stream started"
        );
        self.stream = Some(StreamHolder(stream));
        Ok(())
    }
}

impl SoundStream for CpalStream {
    fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    fn init(&mut self) -> Result<(), AudioError> {
        // Probe for a device now so a missing audio stack fails the init
        // instead of the first start.
        self.output_device().map(|_| ())
    }

    fn set_running(&mut self, running: bool) -> Result<(), AudioError> {
        if running {
            self.start()
        } else {
            // Dropping the stream stops the callback; cpal guarantees the
            // callback has returned once drop completes.
            self.stream = None;
            if self.surround_state == SurroundState::Enabled {
                self.surround_state = SurroundState::EnabledNotRunning;
            }
            debug!("audio stream stopped");
            Ok(())
        }
    }

    fn set_volume(&mut self, volume: i32) {
        self.volume.store(volume.clamp(0, 100), Ordering::Relaxed);
    }

    fn on_settings_changed(&mut self) {
        // Latency, channel count and device selection are fixed at stream
        // build time; request the stop/start cycle from the periodic poll.
        // A stopped stream reads the fresh settings on its next start anyway.
        if self.stream.is_some() {
            self.should_restart.store(true, Ordering::Relaxed);
        }
    }

    fn wants_restart(&mut self) -> bool {
        self.should_restart.load(Ordering::Relaxed)
    }

    fn surround_state(&self) -> SurroundState {
        self.surround_state
    }
}
