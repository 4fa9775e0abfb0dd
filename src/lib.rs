//! nether-mix — emulator audio mixing engine.
//!
//! Receives raw PCM pushed at irregular rates by an emulated console (DSP
//! DMA, disc streaming, up to four remote-controller speakers) and delivers
//! a steady stereo or 5.1 stream to a host audio backend that pulls blocks
//! at a fixed rate.
//!
//! # Architecture
//!
//! ```text
//! Emulation Threads                   Audio Callback Thread
//!       │                                     │
//! [push_dma_samples]──►(SampleFifo)──┐        │
//! [push_streaming_*]──►(SampleFifo)──┼──►[Mixer::mix]──►(TimeStretcher?)
//! [push_speaker_*]───►(SampleFifo)───┘        │              │
//!       │                                     │        (SurroundDecoder?)
//! [SpeedCounter]◄── DMA cadence               │              │
//!                                             └──► backend buffer
//! ```
//!
//! Producers and the consumer never block each other: each source FIFO is a
//! lock-free SPSC ring, over-full pushes are clipped, and an underrun is
//! covered by playing buffered samples backwards or holding the last sample.
//! The mixer tracks the effective emulation speed from the DMA push cadence
//! and resamples accordingly, with a latency ceiling enforced by a small
//! catch-up speed-up.

mod atomics;

pub mod config;
pub mod control;
pub mod error;
pub mod mixer;
pub mod stream;
pub mod stretch;
pub mod surround;
pub mod wave;

pub use config::{AudioBackend, AudioConfig, AudioSettings, Dpl2Quality, DEFAULT_SAMPLE_RATE};
pub use error::AudioError;
pub use mixer::Mixer;
pub use stream::{CpalStream, NullStream, SoundStream, SurroundState};
pub use stretch::TimeStretcher;
pub use surround::SurroundDecoder;
