mod common;

use std::collections::BTreeMap;

use common::*;
use pitchstretch::{Options, Parameters, Stretcher, TransportMode};

#[test]
fn key_frame_map_drives_piecewise_ratios() {
    // First second mapped 1:2, second second mapped 1:0.5, so the total
    // runs 0..48000 -> 0..96000 and 48000..96000 -> 96000..120000.
    let sample_rate = 48000;
    let n = 2 * sample_rate as usize;
    let mut input = sine(440.0, sample_rate, 0.5, n);
    let second_half = sine(880.0, sample_rate, 0.5, n / 2);
    input[n / 2..].copy_from_slice(&second_half);

    let mut map = BTreeMap::new();
    map.insert(0usize, 0usize);
    map.insert(48000, 96000);
    map.insert(96000, 120000);

    let mut stretcher = Stretcher::new(Parameters::new(sample_rate, 1)).unwrap();
    stretcher.set_key_frame_map(map);
    stretcher.study(&[&input], true);

    // Feed in small chunks so the ratio switch is examined often.
    let mut output = Vec::new();
    let mut scratch = vec![0.0f32; 8192];
    let chunks: Vec<&[f32]> = input.chunks(512).collect();
    for (i, chunk) in chunks.iter().copied().enumerate() {
        stretcher.process(&[chunk], i + 1 == chunks.len());
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

    assert!(
        (output.len() as isize - 120_000).abs() <= 1,
        "expected ~120000 samples, got {}",
        output.len()
    );

    // The 440->880 boundary at input sample 48000 must land near output
    // sample 96000.
    let window = 4096usize;
    let mut transition = None;
    let mut at = window;
    while at + window < output.len() {
        let slice = &output[at..at + window];
        let at_880 = spectral_energy_at(slice, sample_rate, 880.0);
        let at_440 = spectral_energy_at(slice, sample_rate, 440.0);
        if at_880 > 2.0 * at_440 {
            transition = Some(at);
            break;
        }
        at += window / 2;
    }
    let transition = transition.expect("no 880 Hz region found") as isize;
    assert!(
        (transition - 96_000).abs() <= 6144,
        "landmark should map to ~96000, found transition at {}",
        transition
    );
}

#[test]
fn key_frame_map_with_offset_first_entry() {
    // A map whose first entry is not at the origin takes its initial
    // ratio from that entry's own slope.
    let sample_rate = 48000;
    let n = sample_rate as usize;
    let input = sine(440.0, sample_rate, 0.5, n);

    let mut map = BTreeMap::new();
    map.insert(24000usize, 36000usize); // 1.5x over the first half
    map.insert(48000, 60000); // 1.0x over the second half

    let mut stretcher = Stretcher::new(Parameters::new(sample_rate, 1)).unwrap();
    stretcher.set_key_frame_map(map);
    stretcher.study(&[&input], true);

    let mut output = Vec::new();
    let mut scratch = vec![0.0f32; 8192];
    let chunks: Vec<&[f32]> = input.chunks(512).collect();
    for (i, chunk) in chunks.iter().copied().enumerate() {
        stretcher.process(&[chunk], i + 1 == chunks.len());
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

    assert!(
        (output.len() as isize - 60_000).abs() <= 1,
        "expected ~60000 samples, got {}",
        output.len()
    );
}

#[test]
fn key_frame_map_rejected_in_realtime() {
    let params = Parameters::new(48000, 1).with_options(Options {
        transport: TransportMode::RealTime,
        ..Options::default()
    });
    let mut stretcher = Stretcher::new(params).unwrap();
    let mut map = BTreeMap::new();
    map.insert(100usize, 200usize);
    stretcher.set_key_frame_map(map);

    // The map must have no effect: a plain 1.0-ratio stream keeps its
    // duration.
    let input = sine(440.0, 48000, 0.5, 16384);
    let mut output = Vec::new();
    let mut scratch = vec![0.0f32; 8192];
    let chunks: Vec<&[f32]> = input.chunks(1024).collect();
    for (i, chunk) in chunks.iter().copied().enumerate() {
        stretcher.process(&[chunk], i + 1 == chunks.len());
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

    let content = output.len() as isize - stretcher.start_delay() as isize;
    assert!(
        (content - 16384).abs() <= 512,
        "realtime output should ignore the map: {}",
        content
    );
}
