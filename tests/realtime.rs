mod common;

use common::*;
use pitchstretch::{Options, Parameters, Stretcher, TransportMode};

fn realtime_stretcher(sample_rate: u32, channels: usize) -> Stretcher {
    let params = Parameters::new(sample_rate, channels).with_options(Options {
        transport: TransportMode::RealTime,
        ..Options::default()
    });
    Stretcher::new(params).unwrap()
}

/// Streams `input` through in fixed blocks, draining as output appears.
fn stream(stretcher: &mut Stretcher, input: &[f32], block: usize) -> Vec<f32> {
    let mut output = Vec::new();
    let mut scratch = vec![0.0f32; 8192];
    let chunks: Vec<&[f32]> = input.chunks(block).collect();
    for (i, chunk) in chunks.iter().copied().enumerate() {
        let final_chunk = i + 1 == chunks.len();
        stretcher.process(&[chunk], final_chunk);
        loop {
            match stretcher.available() {
                None | Some(0) => break,
                Some(available) => {
                    let take = available.min(scratch.len());
                    let got = stretcher.retrieve(&mut [&mut scratch[..take]]);
                    if got == 0 {
                        break;
                    }
                    output.extend_from_slice(&scratch[..got]);
                }
            }
        }
    }
    output
}

#[test]
fn small_block_streaming_duration() {
    // 100 blocks of 256 samples at ratio 1.5: ~38400 samples of content
    // after the start delay.
    let sample_rate = 48000;
    let input = sine(440.0, sample_rate, 0.5, 25600);

    let mut stretcher = realtime_stretcher(sample_rate, 1);
    stretcher.set_time_ratio(1.5);
    let start_delay = stretcher.start_delay();
    assert_eq!(start_delay, 2048);

    let output = stream(&mut stretcher, &input, 256);
    let content = output.len() as isize - start_delay as isize;
    assert!(
        (content - 38400).abs() <= 512,
        "expected ~38400 content samples, got {} (total {})",
        content,
        output.len()
    );
    assert_eq!(stretcher.available(), None);
}

#[test]
fn streaming_preserves_tone() {
    let sample_rate = 48000;
    let input = sine(440.0, sample_rate, 0.5, 48000);

    let mut stretcher = realtime_stretcher(sample_rate, 1);
    stretcher.set_time_ratio(1.25);
    let start_delay = stretcher.start_delay();
    let output = stream(&mut stretcher, &input, 512);

    let mid = &output[start_delay + 8192..output.len() - 8192];
    let at_440 = spectral_energy_at(mid, sample_rate, 440.0);
    let at_550 = spectral_energy_at(mid, sample_rate, 550.0);
    let at_352 = spectral_energy_at(mid, sample_rate, 352.0);
    assert!(at_440 > 4.0 * at_550, "440 Hz should dominate 550 Hz");
    assert!(at_440 > 4.0 * at_352, "440 Hz should dominate 352 Hz");
    assert!(rms(mid) > 0.1, "streamed tone lost energy");
}

#[test]
fn ratio_change_mid_stream_takes_effect() {
    let sample_rate = 48000;
    let first = sine(440.0, sample_rate, 0.5, 24000);
    let second = sine(440.0, sample_rate, 0.5, 24000);

    let mut stretcher = realtime_stretcher(sample_rate, 1);
    stretcher.set_time_ratio(1.0);

    let mut output = Vec::new();
    let mut scratch = vec![0.0f32; 8192];
    let mut drain_ready = |stretcher: &mut Stretcher, output: &mut Vec<f32>| loop {
        match stretcher.available() {
            None | Some(0) => break,
            Some(available) => {
                let take = available.min(8192);
                let got = stretcher.retrieve(&mut [&mut scratch[..take]]);
                if got == 0 {
                    break;
                }
                output.extend_from_slice(&scratch[..got]);
            }
        }
    };

    for chunk in first.chunks(512) {
        stretcher.process(&[chunk], false);
        drain_ready(&mut stretcher, &mut output);
    }
    // The control surface accepts ratio changes while streaming.
    stretcher.set_time_ratio(2.0);
    let chunks: Vec<&[f32]> = second.chunks(512).collect();
    for (i, chunk) in chunks.iter().copied().enumerate() {
        stretcher.process(&[chunk], i + 1 == chunks.len());
        drain_ready(&mut stretcher, &mut output);
    }

    // Expected content: 24000 at 1.0 plus 24000 at 2.0, minus the
    // start-delay head. The analysis frame buffered across the switch
    // is stretched at the new ratio, so allow a frame and a half of
    // slack either way.
    let start_delay = stretcher.start_delay();
    let content = output.len() as isize - start_delay as isize;
    let expected = 24000 + 48000;
    assert!(
        (content - expected).abs() <= 6144,
        "expected ~{} content samples, got {}",
        expected,
        content
    );
}

#[test]
fn stereo_streaming_stays_balanced() {
    let sample_rate = 48000;
    let left = sine(440.0, sample_rate, 0.5, 24000);
    let right = sine(660.0, sample_rate, 0.5, 24000);

    let mut stretcher = realtime_stretcher(sample_rate, 2);
    stretcher.set_time_ratio(1.5);

    let mut out_left = Vec::new();
    let mut out_right = Vec::new();
    let mut block_l = vec![0.0f32; 8192];
    let mut block_r = vec![0.0f32; 8192];
    let chunks: Vec<(&[f32], &[f32])> = left
        .chunks(256)
        .zip(right.chunks(256))
        .collect();
    for (i, &(l, r)) in chunks.iter().enumerate() {
        stretcher.process(&[l, r], i + 1 == chunks.len());
        loop {
            match stretcher.available() {
                None | Some(0) => break,
                Some(available) => {
                    let take = available.min(8192);
                    let got =
                        stretcher.retrieve(&mut [&mut block_l[..take], &mut block_r[..take]]);
                    if got == 0 {
                        break;
                    }
                    out_left.extend_from_slice(&block_l[..got]);
                    out_right.extend_from_slice(&block_r[..got]);
                }
            }
        }
    }

    assert_eq!(out_left.len(), out_right.len());
    assert!(!out_left.is_empty());

    // Each channel keeps its own tone.
    let start = stretcher.start_delay() + 4096;
    let mid_l = &out_left[start..out_left.len() - 4096];
    let mid_r = &out_right[start..out_right.len() - 4096];
    assert!(
        spectral_energy_at(mid_l, sample_rate, 440.0)
            > 2.0 * spectral_energy_at(mid_l, sample_rate, 660.0)
    );
    assert!(
        spectral_energy_at(mid_r, sample_rate, 660.0)
            > 2.0 * spectral_energy_at(mid_r, sample_rate, 440.0)
    );
}

#[test]
fn realtime_pitch_shift_streams() {
    let sample_rate = 48000;
    let input = sine(440.0, sample_rate, 0.5, 48000);

    let mut stretcher = realtime_stretcher(sample_rate, 1);
    stretcher.set_time_ratio(1.0);
    stretcher.set_pitch_scale(0.5);

    let output = stream(&mut stretcher, &input, 512);
    assert!(!output.is_empty());

    let start = stretcher.start_delay().min(output.len() / 4);
    let mid = &output[start + 8192..output.len() - 4096];
    let at_220 = spectral_energy_at(mid, sample_rate, 220.0);
    let at_440 = spectral_energy_at(mid, sample_rate, 440.0);
    assert!(
        at_220 > 2.0 * at_440,
        "pitch shift down an octave should move 440 to 220: {} vs {}",
        at_220,
        at_440
    );
}

#[test]
fn samples_required_guides_the_caller() {
    let sample_rate = 48000;
    let mut stretcher = realtime_stretcher(sample_rate, 1);
    stretcher.set_time_ratio(1.5);

    // Nothing fed yet: a full analysis frame is required.
    assert!(stretcher.samples_required() > 0);

    let input = sine(440.0, sample_rate, 0.5, 8192);
    stretcher.process(&[&input], false);
    // With output available, nothing further is required right now.
    assert_eq!(stretcher.samples_required(), 0);
}
