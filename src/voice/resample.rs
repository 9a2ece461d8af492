/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::error::{SkeletonCrewError, SkeletonCrewResult};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

const CHUNK_FRAMES: usize = 1024;

/// Mono resampler between the JACK rate and the recognizer rate. Equal
/// rates pass through untouched. Input arrives in arbitrary buffer sizes
/// and is chunked internally to the fixed block the resampler needs.
pub struct VoiceResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
}

impl VoiceResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> SkeletonCrewResult<Self> {
        let inner = if input_rate == output_rate {
            None
        } else {
            let ratio = f64::from(output_rate) / f64::from(input_rate);
            info!(
                "Resampling voice input {input_rate} Hz -> {output_rate} Hz (ratio {ratio:.6})"
            );
            Some(
                FastFixedIn::new(ratio, 1.0, PolynomialDegree::Septic, CHUNK_FRAMES, 1)
                    .map_err(|e| SkeletonCrewError::Other(format!("resampler setup: {e}")))?,
            )
        };
        Ok(Self {
            inner,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
            input_rate,
            output_rate,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Appends the resampled rendition of `input` to `output`. Whatever
    /// doesn't fill a whole chunk yet is kept for the next call.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> SkeletonCrewResult<()> {
        let Some(resampler) = &mut self.inner else {
            output.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        while self.pending.len() >= CHUNK_FRAMES {
            let chunk: Vec<f32> = self.pending.drain(..CHUNK_FRAMES).collect();
            let frames = resampler
                .process(&[chunk], None)
                .map_err(|e| SkeletonCrewError::Other(format!("resampling failed: {e}")))?;
            if let Some(channel) = frames.into_iter().next() {
                output.extend(channel);
            }
        }
        Ok(())
    }
}

/// f32 in [-1, 1] to the i16 PCM the recognizer contract wants.
pub fn to_i16(samples: &[f32], output: &mut Vec<i16>) {
    output.clear();
    output.extend(
        samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn equal_rates_pass_through() {
        let mut resampler = VoiceResampler::new(16_000, 16_000).expect("resampler");
        let input = sine(16_000, 440.0, 480);
        let mut output = Vec::new();
        resampler.process(&input, &mut output).expect("process");
        assert_eq!(output, input);
    }

    #[test]
    fn non_integer_ratios_produce_smooth_output() {
        // 44.1 kHz -> 16 kHz is a 2.75625 ratio.
        let mut resampler = VoiceResampler::new(44_100, 16_000).expect("resampler");
        let input = sine(44_100, 220.0, 44_100);
        let mut output = Vec::new();
        for block in input.chunks(512) {
            resampler.process(block, &mut output).expect("process");
        }

        let expected = 44_100.0 * 16_000.0 / 44_100.0;
        assert!((output.len() as f32) > expected * 0.9);
        assert!((output.len() as f32) < expected * 1.1);

        // A 220 Hz sine at 16 kHz moves by at most ~0.09 per sample; a
        // discontinuity would show up as a much larger jump.
        for pair in output.windows(2).skip(64) {
            assert!(
                (pair[1] - pair[0]).abs() < 0.2,
                "discontinuity: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn integer_downsampling_keeps_the_expected_length() {
        let mut resampler = VoiceResampler::new(48_000, 16_000).expect("resampler");
        let input = sine(48_000, 330.0, 48_000);
        let mut output = Vec::new();
        for block in input.chunks(1024) {
            resampler.process(block, &mut output).expect("process");
        }
        let expected = 16_000.0;
        assert!((output.len() as f32) > expected * 0.9);
        assert!((output.len() as f32) < expected * 1.1);
    }

    #[test]
    fn i16_conversion_clamps() {
        let mut out = Vec::new();
        to_i16(&[0.0, 1.0, -1.0, 2.0, -2.0], &mut out);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], i16::MAX);
        assert_eq!(out[3], i16::MAX);
        assert!(out[2] <= -i16::MAX + 1);
    }
}
