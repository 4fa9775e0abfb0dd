//! Mixer and FIFO tests.

use std::sync::Arc;

use super::fifo::{SampleFifo, INTERP_SAMPLES, MAX_SAMPLES, NC};
use super::Mixer;
use crate::config::{AudioConfig, AudioSettings};

fn interp_buffer() -> Vec<i16> {
    vec![0i16; (MAX_SAMPLES * NC) as usize]
}

/// Builds a constantly-pushed big-endian FIFO at unity playback speed, the
/// shape of the DMA/streaming sources.
fn console_fifo(input_rate: f64, output_rate: u32) -> SampleFifo {
    let fifo = SampleFifo::new(input_rate, output_rate, true, true);
    fifo.set_playback_speed(1.0);
    fifo
}

/// Encodes a logical (left, right) frame the way the console pushes it:
/// channel-swapped, big endian.
fn be_frame(l: i16, r: i16) -> [i16; 2] {
    [r.swap_bytes(), l.swap_bytes()]
}

fn push_be(fifo: &SampleFifo, frames: &[(i16, i16)]) {
    let mut buf = Vec::with_capacity(frames.len() * 2);
    for &(l, r) in frames {
        buf.extend_from_slice(&be_frame(l, r));
    }
    fifo.push(&buf);
}

fn mixer_with(tolerance_ms: i32, latency_ms: u32) -> Mixer {
    let settings = AudioSettings {
        audio_emu_speed_tolerance_ms: tolerance_ms,
        target_latency_ms: latency_ms,
        ..AudioSettings::default()
    };
    Mixer::new(48_000, Arc::new(AudioConfig::new(&settings)))
}

#[test]
fn identity_rate_reproduces_input_delayed_by_interp_window() {
    let fifo = console_fifo(48_000.0, 48_000);
    let input: Vec<(i16, i16)> = (0..48_000)
        .map(|i| {
            let v = (32_767.0
                * (2.0 * std::f64::consts::PI * 1_000.0 * i as f64 / 48_000.0).sin())
            .round() as i16;
            (v, v)
        })
        .collect();
    push_be(&fifo, &input);

    let mut interp = interp_buffer();
    let mut produced: Vec<i16> = Vec::new();
    for _ in 0..4 {
        let mut out = vec![0i16; 512 * 2];
        let mixed = fifo.mix(&mut out, 512, false, &mut interp);
        assert_eq!(mixed, 512);
        produced.extend_from_slice(&out);
    }

    let delay = INTERP_SAMPLES as usize;
    for frame in 0..4 * 512 {
        let (expected_l, expected_r) = if frame < delay {
            (0, 0)
        } else {
            input[frame - delay]
        };
        let l = produced[frame * 2];
        let r = produced[frame * 2 + 1];
        assert!(
            (l as i32 - expected_l as i32).abs() <= 1,
            "frame {frame}: left {l} vs {expected_l}"
        );
        assert!(
            (r as i32 - expected_r as i32).abs() <= 1,
            "frame {frame}: right {r} vs {expected_r}"
        );
    }
}

#[test]
fn upsample_ramp_is_monotonic_and_bracketed() {
    let fifo = console_fifo(32_000.0, 48_000);
    let input: Vec<(i16, i16)> = (0..32_000).map(|i| (i as i16, i as i16)).collect();
    push_be(&fifo, &input);

    let mut interp = interp_buffer();
    let mut produced: Vec<i16> = Vec::new();
    for _ in 0..3 {
        let mut out = vec![0i16; 500 * 2];
        assert_eq!(fifo.mix(&mut out, 500, false, &mut interp), 500);
        produced.extend_from_slice(&out);
    }

    let left: Vec<i16> = produced.chunks(2).map(|f| f[0]).collect();
    assert_eq!(left.len(), 1_500);
    for pair in left.windows(2) {
        assert!(pair[1] >= pair[0], "ramp regressed: {} -> {}", pair[0], pair[1]);
    }
    // Endpoints bracket the input endpoints.
    assert_eq!(left[0], 0);
    assert!(*left.last().unwrap() > 0);
    assert!(*left.last().unwrap() <= 31_999);
}

#[test]
fn sparse_source_underrun_pads_with_last_sample() {
    let fifo = SampleFifo::new(48_000.0, 48_000, false, false);
    fifo.set_playback_speed(1.0);
    // Mark the source active without priming silence.
    fifo.update_push(1.0, 0.0, false);
    assert!(fifo.is_currently_pushed());

    let input: Vec<i16> = (0..100).flat_map(|i| [i as i16 * 100; 2]).collect();
    fifo.push(&input);

    let mut interp = interp_buffer();
    let mut out = vec![0i16; 1024 * 2];
    let mixed = fifo.mix(&mut out, 1024, false, &mut interp);
    assert!(
        (95..=102).contains(&mixed),
        "expected ~100 real frames, got {mixed}"
    );

    let pad_l = out[(mixed as usize - 1) * 2];
    let pad_r = out[(mixed as usize - 1) * 2 + 1];
    assert!(pad_l != 0, "the pad value should be the last real sample");
    for frame in mixed as usize..1024 {
        assert_eq!(out[frame * 2], pad_l, "frame {frame}");
        assert_eq!(out[frame * 2 + 1], pad_r, "frame {frame}");
    }
}

#[test]
fn constant_source_underrun_plays_backwards() {
    let fifo = console_fifo(48_000.0, 48_000);
    let input: Vec<(i16, i16)> = (0..1_000).map(|i| (i as i16 * 30, i as i16 * 30)).collect();
    push_be(&fifo, &input);

    let mut interp = interp_buffer();
    let mut out = vec![0i16; 4096 * 2];
    let mixed = fifo.mix(&mut out, 4096, false, &mut interp);
    assert!(
        (995..=1_005).contains(&mixed),
        "expected ~1000 forward frames, got {mixed}"
    );

    // The reverse cursor starts near the write head: the first backwards
    // frames replay the top of the ramp, descending.
    let start = mixed as usize + 2;
    assert!(out[start * 2] > 25_000, "backwards start was {}", out[start * 2]);
    for frame in start..mixed as usize + 800 {
        assert!(
            out[(frame + 1) * 2] <= out[frame * 2],
            "backwards ramp regressed at frame {frame}"
        );
    }
}

#[test]
fn ring_occupancy_never_exceeds_capacity() {
    let fifo = console_fifo(48_000.0, 48_000);
    let chunk: Vec<i16> = vec![1; 4_096 * 2];

    // Grossly overfill: pushes are clipped, never wrapped over the reader.
    for _ in 0..40 {
        fifo.push(&chunk);
        assert!(fifo.num_samples() <= MAX_SAMPLES);
    }
    assert_eq!(fifo.num_samples(), MAX_SAMPLES);

    // Drain a little and keep pushing; occupancy stays bounded.
    let mut interp = interp_buffer();
    let mut out = vec![0i16; 512 * 2];
    for _ in 0..8 {
        fifo.mix(&mut out, 512, false, &mut interp);
        fifo.push(&chunk);
        assert!(fifo.num_samples() <= MAX_SAMPLES);
    }
}

#[test]
fn available_samples_rescales_to_output_rate() {
    let fifo = console_fifo(32_000.0, 48_000);
    push_be(&fifo, &vec![(100, 100); 100]);
    // 104 buffered minus the interpolation window, times 48/32.
    let available = fifo.available_samples();
    assert!(
        (150..=152).contains(&available),
        "available was {available}"
    );
}

#[test]
fn volume_scales_by_fixed_point_256() {
    let fifo = console_fifo(48_000.0, 48_000);
    fifo.set_volume(128, 255);
    push_be(&fifo, &vec![(16_384, 16_384); 64]);

    let mut interp = interp_buffer();
    let mut out = vec![0i16; 32 * 2];
    fifo.mix(&mut out, 32, false, &mut interp);

    // Frame 8 is deep in the pushed data. 128 maps to 129/256, 255 to full.
    let l = out[8 * 2] as i32;
    let r = out[8 * 2 + 1] as i32;
    assert!((l - 16_384 * 129 / 256).abs() <= 1, "left was {l}");
    assert!((r - 16_384).abs() <= 1, "right was {r}");
}

#[test]
fn speaker_activity_primes_and_settles() {
    let fifo = SampleFifo::new(6_000.0, 48_000, false, false);
    fifo.set_playback_speed(1.0);

    // Activation primes 40ms of silence at the input rate.
    fifo.update_push(0.01, 0.04, false);
    assert!(fifo.is_currently_pushed());
    let primed = fifo.num_samples();
    assert_eq!(primed, 240 + INTERP_SAMPLES + 1);

    // Streaming heartbeat drains the activity timer; the second drain flips
    // the source inactive and appends the settle-out zeros.
    fifo.update_push(-0.02, 0.04, false);
    assert!(fifo.is_currently_pushed());
    fifo.update_push(-0.02, 0.04, false);
    assert!(!fifo.is_currently_pushed());
    assert_eq!(fifo.num_samples(), primed + INTERP_SAMPLES + 1);
}

#[test]
fn paused_mixer_produces_nothing_and_leaves_output_untouched() {
    let mixer = mixer_with(-1, 80);
    mixer.push_dma_samples(&[500i16; 1120]);
    mixer.set_paused(true);

    let mut out = vec![0x55i16; 512 * 2];
    assert_eq!(mixer.mix(&mut out), 0);
    assert!(out.iter().all(|&s| s == 0x55));

    mixer.set_paused(false);
    assert_eq!(mixer.mix(&mut out), 512);
}

#[test]
fn mixing_is_additive_over_zeroed_output() {
    // Nothing pushed anywhere: the output stays silent.
    let silent = mixer_with(-1, 500);
    let mut out = vec![0i16; 256 * 2];
    assert_eq!(silent.mix(&mut out), 256);
    assert!(out.iter().all(|&s| s == 0));

    // One source pushed on a fresh mixer: the output is exactly that
    // source's contribution.
    let mixer = mixer_with(-1, 500);
    let frames: Vec<(i16, i16)> = (0..4_800).map(|i| ((i % 1_000) as i16, 400)).collect();
    let mut buf = Vec::new();
    for &(l, r) in &frames {
        buf.extend_from_slice(&be_frame(l, r));
    }
    mixer.push_streaming_samples(&buf);

    let mut out = vec![0i16; 512 * 2];
    assert_eq!(mixer.mix(&mut out), 512);
    let delay = INTERP_SAMPLES as usize;
    for frame in delay..512 {
        let (l, r) = frames[frame - delay];
        assert!((out[frame * 2] as i32 - l as i32).abs() <= 1);
        assert!((out[frame * 2 + 1] as i32 - r as i32).abs() <= 1);
    }
}

#[test]
fn latency_ceiling_engages_catch_up_until_target() {
    let mixer = mixer_with(-1, 40);

    // 200ms of DMA audio in one shot, far over the 40ms ceiling.
    let samples = vec![1000i16; 6_400 * 2];
    mixer.push_dma_samples(&samples);

    let mut out = vec![0i16; 512 * 2];
    assert_eq!(mixer.mix(&mut out), 512);
    assert!(
        mixer.current_speed() > 1.0,
        "catch-up should raise the speed, got {}",
        mixer.current_speed()
    );

    // Keep mixing: latency falls under the target and the speed settles.
    let mut settled = false;
    for _ in 0..100 {
        mixer.mix(&mut out);
        if mixer.current_speed() <= 1.0 {
            settled = true;
            break;
        }
    }
    assert!(settled, "catch-up never released");
}

#[test]
fn speaker_push_reaches_the_output() {
    let mixer = mixer_with(-1, 0);

    // Latency 0 disables priming, so the speaker data is up next.
    let mono = vec![8_000i16; 400];
    mixer.push_speaker_samples(0, &mono, 6_000);

    let mut out = vec![0i16; 512 * 2];
    assert_eq!(mixer.mix(&mut out), 512);
    let peak = out.iter().map(|&s| s as i32).max().unwrap();
    assert!(peak > 4_000, "speaker audio missing from the mix, peak {peak}");
    // Mono is duplicated, not panned: both channels match.
    for frame in out.chunks(2) {
        assert_eq!(frame[0], frame[1]);
    }
}

#[test]
fn stretch_toggle_stretches_then_drains() {
    let settings = AudioSettings {
        audio_emu_speed_tolerance_ms: -1,
        target_latency_ms: 80,
        audio_stretch: true,
        ..AudioSettings::default()
    };
    let config = Arc::new(AudioConfig::new(&settings));
    let mixer = Mixer::new(48_000, config.clone());

    let tone: Vec<i16> = (0..9_600)
        .flat_map(|i| {
            let v = (12_000.0
                * (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 32_000.0).sin())
            .round() as i16;
            be_frame(v, v)
        })
        .collect();
    for _ in 0..4 {
        mixer.push_dma_samples(&tone);
        mixer.push_streaming_samples(&tone);
    }

    let mut out = vec![0i16; 1024 * 2];
    let mut heard = false;
    for _ in 0..20 {
        assert_eq!(mixer.mix(&mut out), 1024);
        if out.iter().any(|&s| s.unsigned_abs() > 1_000) {
            heard = true;
            break;
        }
    }
    assert!(heard, "stretched audio never reached the output");

    // Turning stretching off drains the stretcher before the direct path
    // takes over; the callback keeps getting full blocks throughout.
    config.set_audio_stretch(false);
    for _ in 0..10 {
        assert_eq!(mixer.mix(&mut out), 1024);
    }
}

#[test]
fn surround_blocks_decode_exactly() {
    let settings = AudioSettings {
        audio_emu_speed_tolerance_ms: -1,
        target_latency_ms: 500,
        dpl2_decoder: true,
        ..AudioSettings::default()
    };
    let mixer = Mixer::new(48_000, Arc::new(AudioConfig::new(&settings)));

    // Plenty of source audio for the first decode blocks.
    let tone: Vec<i16> = (0..24_000).flat_map(|i| be_frame((i % 500) as i16, 300)).collect();
    mixer.push_dma_samples(&tone);
    mixer.push_streaming_samples(&tone);

    let mut out = vec![0.0f32; 512 * 6];
    assert_eq!(mixer.mix_surround(&mut out), 512);
    assert!(out.iter().any(|&s| s != 0.0));

    // Paused and needing a fresh block: no frames, output zeroed.
    mixer.set_paused(true);
    let mut out = vec![1.0f32; 2_048 * 6];
    assert_eq!(mixer.mix_surround(&mut out), 0);
    assert!(out.iter().all(|&s| s == 0.0));
    mixer.set_paused(false);
}

#[test]
fn surround_toggle_drops_buffered_decoder_output() {
    let settings = AudioSettings {
        audio_emu_speed_tolerance_ms: -1,
        target_latency_ms: 500,
        dpl2_decoder: true,
        ..AudioSettings::default()
    };
    let mixer = Mixer::new(48_000, Arc::new(AudioConfig::new(&settings)));

    let tone: Vec<i16> = (0..24_000).flat_map(|i| be_frame((i % 500) as i16, 300)).collect();
    mixer.push_dma_samples(&tone);
    mixer.push_streaming_samples(&tone);

    // Decode one block; half of it stays buffered in the decoder.
    let mut out = vec![0.0f32; 512 * 6];
    assert_eq!(mixer.mix_surround(&mut out), 512);

    // A paused mixer can still drain that buffer.
    mixer.set_paused(true);
    let mut out = vec![1.0f32; 256 * 6];
    assert_eq!(mixer.mix_surround(&mut out), 256);

    // Toggling surround marks the decoder dirty; the next settings pass
    // drops the stale frames instead of playing them.
    mixer.set_surround_changed();
    mixer.update_settings(48_000);

    let mut out = vec![1.0f32; 256 * 6];
    assert_eq!(mixer.mix_surround(&mut out), 0);
    assert!(out.iter().all(|&s| s == 0.0));
    mixer.set_paused(false);
}

#[test]
fn concurrent_push_and_mix_stay_bounded() {
    let mixer = Arc::new(mixer_with(-1, 80));

    let producer = {
        let mixer = mixer.clone();
        std::thread::spawn(move || {
            let chunk = vec![123i16; 560 * 2];
            for _ in 0..200 {
                mixer.push_dma_samples(&chunk);
                mixer.push_streaming_samples(&chunk);
            }
        })
    };

    let mut out = vec![0i16; 512 * 2];
    for _ in 0..100 {
        assert_eq!(mixer.mix(&mut out), 512);
    }
    producer.join().unwrap();

    // No panic, no runaway occupancy.
    let mut final_out = vec![0i16; 256 * 2];
    assert_eq!(mixer.mix(&mut final_out), 256);
}
