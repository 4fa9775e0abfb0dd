//! WAV dump writer for the DTK/DSP audio logs.
//!
//! Standard RIFF/WAVE, PCM, two channels, 16 bits. The header is written
//! with oversized placeholder lengths so a truncated file is still readable,
//! and the real sizes are patched in on stop. Input is the console's
//! channel-swapped big-endian stereo; files are written canonical
//! little-endian LR.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::error::AudioError;

/// Placeholder chunk length written up front.
const PLACEHOLDER_SIZE: u32 = 100_000_000;

const BUFFER_SIZE: usize = 32 * 1024;

pub struct WaveFileWriter {
    file: Option<File>,
    audio_size: u32,
    current_sample_rate: u32,
    basename: String,
    directory: PathBuf,
    file_index: u32,
    skip_silence: bool,
    conv_buffer: Vec<i16>,
}

impl WaveFileWriter {
    pub fn new() -> Self {
        Self {
            file: None,
            audio_size: 0,
            current_sample_rate: 0,
            basename: String::new(),
            directory: PathBuf::new(),
            file_index: 0,
            skip_silence: false,
            conv_buffer: vec![0; BUFFER_SIZE],
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn set_skip_silence(&mut self, skip: bool) {
        self.skip_silence = skip;
    }

    /// Opens `file_name` and writes the header. Fails if a file is already
    /// open (the header of the old file would never be fixed up).
    pub fn start(&mut self, file_name: &Path, sample_rate: u32) -> Result<(), AudioError> {
        if self.file.is_some() {
            return Err(AudioError::DumpAlreadyOpen(
                file_name.display().to_string(),
            ));
        }

        if let Some(parent) = file_name.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(file_name)?;

        self.audio_size = 0;
        if self.basename.is_empty() {
            self.basename = file_name
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.directory = file_name
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
        }
        self.current_sample_rate = sample_rate;

        // Header; sizes are placeholders until stop().
        file.write_all(b"RIFF")?;
        file.write_all(&PLACEHOLDER_SIZE.to_le_bytes())?;
        file.write_all(b"WAVE")?;
        file.write_all(b"fmt ")?;
        file.write_all(&16u32.to_le_bytes())?; // fmt block size
        file.write_all(&0x0002_0001u32.to_le_bytes())?; // two channels, PCM
        file.write_all(&sample_rate.to_le_bytes())?;
        file.write_all(&(sample_rate * 2 * 2).to_le_bytes())?; // byte rate
        file.write_all(&0x0010_0004u32.to_le_bytes())?; // block align, 16 bits
        file.write_all(b"data")?;
        file.write_all(&(PLACEHOLDER_SIZE - 32).to_le_bytes())?;

        debug_assert_eq!(file.stream_position()?, 44);

        self.file = Some(file);
        Ok(())
    }

    /// Patches the real sizes into the header and closes the file.
    pub fn stop(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        let patch = |file: &mut File, audio_size: u32| -> std::io::Result<()> {
            file.seek(SeekFrom::Start(4))?;
            file.write_all(&(audio_size + 36).to_le_bytes())?;
            file.seek(SeekFrom::Start(40))?;
            file.write_all(&audio_size.to_le_bytes())?;
            Ok(())
        };
        if let Err(e) = patch(&mut file, self.audio_size) {
            error!("failed to finalise wave dump header: {e}");
        }
    }

    /// Appends channel-swapped big-endian stereo frames. If `sample_rate`
    /// differs from the open file's rate, the file is closed and a new one
    /// with an incremented suffix is started.
    pub fn add_stereo_samples_be(
        &mut self,
        sample_data: &[i16],
        sample_rate: u32,
    ) -> Result<(), AudioError> {
        if self.file.is_none() {
            return Err(AudioError::DumpNotOpen);
        }
        let count = sample_data.len() / 2;
        if count > BUFFER_SIZE / 2 {
            warn!("wave dump push larger than the conversion buffer ({count} frames), clipping");
        }
        let count = count.min(BUFFER_SIZE / 2);

        if self.skip_silence && sample_data.iter().all(|&s| s == 0) {
            return Ok(());
        }

        if sample_rate != self.current_sample_rate {
            self.stop();
            self.file_index += 1;
            let file_name = self
                .directory
                .join(format!("{}{}.wav", self.basename, self.file_index));
            // Record the rate first so a failed start is not retried every push.
            self.current_sample_rate = sample_rate;
            self.start(&file_name, sample_rate)?;
        }

        for i in 0..count {
            // Flip the channels from RL to LR and the bytes to little endian.
            self.conv_buffer[2 * i] = sample_data[2 * i + 1].swap_bytes();
            self.conv_buffer[2 * i + 1] = sample_data[2 * i].swap_bytes();
        }

        let file = self.file.as_mut().expect("checked above");
        file.write_all(bytemuck::cast_slice(&self.conv_buffer[..count * 2]))?;
        self.audio_size += count as u32 * 4;
        Ok(())
    }
}

impl Default for WaveFileWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaveFileWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn temp_path(name: &str) -> PathBuf {
        let unique = format!(
            "nether-mix-{}-{name}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        std::env::temp_dir().join(unique)
    }

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn header_declares_sizes_and_rate_after_stop() {
        let dir = temp_path("header");
        let path = dir.join("dump.wav");
        let mut writer = WaveFileWriter::new();
        writer.start(&path, 32_000).unwrap();

        // 100 frames of channel-swapped big-endian audio.
        let frames: Vec<i16> = (0..200).map(|i| (i as i16).swap_bytes()).collect();
        writer.add_stereo_samples_be(&frames, 32_000).unwrap();
        writer.stop();

        let mut bytes = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();

        let audio_size = 100 * 4;
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(&bytes, 4), audio_size + 36);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(read_u32(&bytes, 24), 32_000); // sample rate
        assert_eq!(read_u32(&bytes, 40), audio_size);
        assert_eq!(bytes.len(), 44 + audio_size as usize);

        // Round-trip: the payload is the input after byte and channel swap.
        for i in 0..100usize {
            let l = i16::from_le_bytes(bytes[44 + i * 4..][..2].try_into().unwrap());
            let r = i16::from_le_bytes(bytes[44 + i * 4 + 2..][..2].try_into().unwrap());
            assert_eq!(l, (i as i16) * 2 + 1);
            assert_eq!(r, (i as i16) * 2);
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rate_change_splits_into_a_new_file() {
        let dir = temp_path("split");
        let path = dir.join("dump.wav");
        let mut writer = WaveFileWriter::new();
        writer.start(&path, 32_000).unwrap();

        let frames = vec![0x0102i16; 64];
        writer.add_stereo_samples_be(&frames, 32_000).unwrap();
        writer.add_stereo_samples_be(&frames, 48_000).unwrap();
        writer.stop();

        assert!(path.exists());
        assert!(dir.join("dump1.wav").exists());

        let mut bytes = Vec::new();
        File::open(dir.join("dump1.wav"))
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(read_u32(&bytes, 24), 48_000);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn double_start_is_refused() {
        let dir = temp_path("double");
        let mut writer = WaveFileWriter::new();
        writer.start(&dir.join("dump.wav"), 48_000).unwrap();
        assert!(writer.start(&dir.join("other.wav"), 48_000).is_err());
        writer.stop();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn skip_silence_drops_all_zero_pushes() {
        let dir = temp_path("silence");
        let mut writer = WaveFileWriter::new();
        writer.start(&dir.join("dump.wav"), 48_000).unwrap();
        writer.set_skip_silence(true);
        writer.add_stereo_samples_be(&[0i16; 128], 48_000).unwrap();
        writer.stop();

        let mut bytes = Vec::new();
        File::open(dir.join("dump.wav"))
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(read_u32(&bytes, 40), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
