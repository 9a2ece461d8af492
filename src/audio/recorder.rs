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

use crate::{
    audio::RecordingSummary,
    error::{SkeletonCrewError, SkeletonCrewResult},
};
use hound::{SampleFormat, WavSpec, WavWriter};
use ringbuf::{HeapCons, traits::Consumer, traits::Observer};
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{info, warn};

const WRITE_CHUNK_FRAMES: usize = 4096;
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Running WAV writer fed from the capture rings of the armed recorder
/// ports. Finishing returns the consumers so the next recording can reuse
/// them.
pub struct WriterHandle {
    stop: Arc<AtomicBool>,
    join: thread::JoinHandle<SkeletonCrewResult<(Vec<HeapCons<f32>>, RecordingSummary)>>,
}

impl WriterHandle {
    pub fn finish(self) -> SkeletonCrewResult<(Vec<HeapCons<f32>>, RecordingSummary)> {
        self.stop.store(true, Ordering::Release);
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(SkeletonCrewError::Other(
                "recording writer thread panicked".to_owned(),
            )),
        }
    }
}

pub fn spawn_writer(
    path: PathBuf,
    sample_rate: u32,
    consumers: Vec<HeapCons<f32>>,
    overflows: Vec<Arc<AtomicU64>>,
) -> SkeletonCrewResult<WriterHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let spec = WavSpec {
        channels: consumers.len() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let writer = WavWriter::create(&path, spec)?;
    info!(
        "Recording {} channels at {sample_rate} Hz to {}",
        consumers.len(),
        path.to_string_lossy()
    );

    let overflow_baseline: u64 = overflows.iter().map(|c| c.load(Ordering::Relaxed)).sum();

    let join = thread::Builder::new()
        .name("recording-writer".to_owned())
        .spawn(move || {
            run_writer(
                path,
                writer,
                consumers,
                overflows,
                overflow_baseline,
                stop_flag,
            )
        })?;

    Ok(WriterHandle { stop, join })
}

fn run_writer(
    path: PathBuf,
    mut writer: WavWriter<std::io::BufWriter<std::fs::File>>,
    mut consumers: Vec<HeapCons<f32>>,
    overflows: Vec<Arc<AtomicU64>>,
    overflow_baseline: u64,
    stop: Arc<AtomicBool>,
) -> SkeletonCrewResult<(Vec<HeapCons<f32>>, RecordingSummary)> {
    let mut frames_written = 0u64;
    let mut chunks: Vec<Vec<f32>> = consumers
        .iter()
        .map(|_| vec![0f32; WRITE_CHUNK_FRAMES])
        .collect();

    loop {
        let available = consumers
            .iter()
            .map(|c| c.occupied_len())
            .min()
            .unwrap_or(0);

        if available == 0 {
            if stop.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let frames = available.min(WRITE_CHUNK_FRAMES);
        for (consumer, chunk) in consumers.iter_mut().zip(chunks.iter_mut()) {
            let popped = consumer.pop_slice(&mut chunk[..frames]);
            // Channels fill in lock step from the same process callback;
            // a short read still yields a consistent (zero-padded) frame.
            if popped < frames {
                chunk[popped..frames].fill(0.0);
            }
        }

        for frame in 0..frames {
            for chunk in &chunks {
                writer.write_sample(chunk[frame])?;
            }
        }
        frames_written += frames as u64;
    }

    writer.finalize()?;

    let overflow_samples = overflows
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .sum::<u64>()
        .saturating_sub(overflow_baseline);
    if overflow_samples > 0 {
        warn!("Recording dropped {overflow_samples} samples on capture overflow");
    }

    let summary = RecordingSummary {
        path: path.to_string_lossy().to_string(),
        frames_written,
        overflow_samples,
    };
    info!(
        "Recording finished: {} frames written to {}",
        summary.frames_written, summary.path
    );

    Ok((consumers, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::{HeapRb, traits::Producer, traits::Split};

    #[test]
    fn writer_drains_rings_and_reports_frames() {
        let dir = std::env::temp_dir().join("skeleton-crew-recorder-test");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("take-1.wav");

        let (mut prod_l, cons_l) = HeapRb::<f32>::new(8192).split();
        let (mut prod_r, cons_r) = HeapRb::<f32>::new(8192).split();
        let overflows = vec![
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
        ];

        let samples: Vec<f32> = (0..1024).map(|i| (i as f32) / 1024.0).collect();
        assert_eq!(prod_l.push_slice(&samples), samples.len());
        assert_eq!(prod_r.push_slice(&samples), samples.len());

        let handle =
            spawn_writer(path.clone(), 48_000, vec![cons_l, cons_r], overflows).expect("spawn");
        // Give the writer a moment to drain before stopping it.
        thread::sleep(Duration::from_millis(50));
        let (consumers, summary) = handle.finish().expect("finish");

        assert_eq!(consumers.len(), 2);
        assert_eq!(summary.frames_written, 1024);
        assert_eq!(summary.overflow_samples, 0);

        let reader = hound::WavReader::open(&path).expect("open wav");
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 48_000);
        assert_eq!(reader.duration(), 1024);

        std::fs::remove_file(&path).ok();
    }
}
