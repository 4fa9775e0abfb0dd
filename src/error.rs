//! Error types for the audio engine boundary.
//!
//! Only backend setup and dump-file handling return these. Nothing on the
//! sample path produces errors; underruns and clipped pushes are recovered
//! locally by the mixer.

use std::io;

use thiserror::Error;

/// Errors surfaced by sound-stream setup and WAV dumping.
#[derive(Debug, Error)]
pub enum AudioError {
    /// No output device could be found on the host.
    #[error("no audio output device available")]
    NoOutputDevice,

    /// The host refused to report a default output configuration.
    #[error("failed to query default output config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    /// The output stream could not be created.
    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    /// The output stream could not be started.
    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    /// The output stream could not be stopped.
    #[error("failed to stop output stream: {0}")]
    PauseStream(#[from] cpal::PauseStreamError),

    /// The device only offers a sample format we cannot feed.
    #[error("unsupported output sample format: {0}")]
    UnsupportedFormat(String),

    /// A dump file was started while one is already open.
    #[error("dump file already open: {0}")]
    DumpAlreadyOpen(String),

    /// Samples were appended to a dump that was never started.
    #[error("dump file not open")]
    DumpNotOpen,

    /// Dump file I/O failed. Dumping is disabled; playback is unaffected.
    #[error("dump I/O error: {0}")]
    Io(#[from] io::Error),
}
