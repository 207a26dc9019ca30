//! Deterministic synthetic frame generator for tests.

use std::thread;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, bounded};

use crate::{CaptureError, Frame, FrameError, FrameFormat, FrameResult};

const BACKGROUND_LEVEL: u8 = 200;
const FRAME_INTERVAL_MS: i64 = 100;

/// Builder for a deterministic stream of grayscale frames with dark circular
/// particles on a bright background, optionally with frames marked corrupt.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frames: Vec<SyntheticFrame>,
    base_timestamp_ms: i64,
}

struct SyntheticFrame {
    disks: Vec<Disk>,
    corrupt: bool,
}

struct Disk {
    cx: f32,
    cy: f32,
    radius: f32,
    level: u8,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frame_count: usize) -> Self {
        Self {
            width,
            height,
            frames: (0..frame_count)
                .map(|_| SyntheticFrame {
                    disks: Vec::new(),
                    corrupt: false,
                })
                .collect(),
            base_timestamp_ms: 1_700_000_000_000,
        }
    }

    /// Paint a dark disk onto the given 0-based frame index.
    pub fn with_disk(mut self, frame: usize, cx: f32, cy: f32, radius: f32, level: u8) -> Self {
        self.frames[frame].disks.push(Disk {
            cx,
            cy,
            radius,
            level,
        });
        self
    }

    /// Mark the given 0-based frame index as unreadable.
    pub fn with_corrupt(mut self, frame: usize) -> Self {
        self.frames[frame].corrupt = true;
        self
    }

    /// Render every frame eagerly. Sequence ids are 1-based indices.
    pub fn frames(&self) -> Vec<FrameResult> {
        self.frames
            .iter()
            .enumerate()
            .map(|(index, layout)| {
                let seq = index as u64 + 1;
                let timestamp_ms = self.base_timestamp_ms + index as i64 * FRAME_INTERVAL_MS;
                if layout.corrupt {
                    return Err(FrameError {
                        seq,
                        timestamp_ms,
                        reason: CaptureError::Other(anyhow!("synthetic corrupt frame {seq}")),
                    });
                }
                Ok(Frame {
                    seq,
                    width: self.width,
                    height: self.height,
                    data: render(self.width, self.height, &layout.disks),
                    timestamp_ms,
                    format: FrameFormat::Gray8,
                })
            })
            .collect()
    }

    /// Deliver the rendered frames over a bounded channel, matching the
    /// contract of the directory reader.
    pub fn spawn(self) -> Receiver<FrameResult> {
        let frames = self.frames();
        let (tx, rx) = bounded(4);
        thread::spawn(move || {
            for frame in frames {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        rx
    }
}

fn render(width: u32, height: u32, disks: &[Disk]) -> Vec<u8> {
    let mut data = vec![BACKGROUND_LEVEL; (width * height) as usize];
    for disk in disks {
        let r2 = disk.radius * disk.radius;
        let x0 = (disk.cx - disk.radius).floor().max(0.0) as u32;
        let x1 = ((disk.cx + disk.radius).ceil() as u32).min(width.saturating_sub(1));
        let y0 = (disk.cy - disk.radius).floor().max(0.0) as u32;
        let y1 = ((disk.cy + disk.radius).ceil() as u32).min(height.saturating_sub(1));
        for y in y0..=y1 {
            for x in x0..=x1 {
                let dx = x as f32 - disk.cx;
                let dy = y as f32 - disk.cy;
                if dx * dx + dy * dy <= r2 {
                    data[(y * width + x) as usize] = disk.level;
                }
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_pixels_are_darker_than_background() {
        let source = SyntheticSource::new(32, 32, 1).with_disk(0, 16.0, 16.0, 5.0, 60);
        let frames = source.frames();
        let frame = frames[0].as_ref().expect("frame");
        let center = frame.data[(16 * 32 + 16) as usize];
        let corner = frame.data[0];
        assert_eq!(center, 60);
        assert_eq!(corner, BACKGROUND_LEVEL);
    }

    #[test]
    fn corrupt_frames_keep_their_sequence_slot() {
        let source = SyntheticSource::new(16, 16, 3).with_corrupt(1);
        let frames = source.frames();
        assert!(frames[0].is_ok());
        assert_eq!(frames[1].as_ref().expect_err("corrupt").seq, 2);
        assert_eq!(frames[2].as_ref().expect("frame").seq, 3);
    }
}
