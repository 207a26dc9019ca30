//! File-per-frame source backed by a sorted directory listing.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use crossbeam_channel::{Receiver, bounded};
use tracing::{debug, warn};

use crate::{CaptureError, Frame, FrameError, FrameFormat, FrameResult, timestamp};

/// Image extensions considered part of the frame stream.
const FRAME_EXTENSIONS: &[&str] = &["bmp", "jpeg", "jpg", "pgm", "png", "tif", "tiff"];

/// Channel depth; small on purpose so a slow pipeline backpressures decoding.
const READER_QUEUE_DEPTH: usize = 4;

/// Spawn a background thread that decodes every frame file under `dir` in
/// sorted-name order and forwards the results over the returned channel.
///
/// Sequence ids are 1-based positions in the sorted listing, so the same
/// directory always yields the same ids. When `resume_after` is set, files at
/// positions at or below it are not decoded or delivered; the caller is
/// expected to have committed them in a previous run. Undecodable files are
/// delivered as [`FrameError`] values so the consumer can skip them without
/// breaking its sequence accounting.
pub fn spawn_directory_reader(
    dir: &Path,
    resume_after: Option<u64>,
) -> Result<Receiver<FrameResult>> {
    let files = list_frame_files(dir)?;
    if files.is_empty() {
        bail!("no frame files found under {}", dir.display());
    }
    debug!(
        "Directory source: {} frame file(s) under {}",
        files.len(),
        dir.display()
    );

    let (tx, rx) = bounded(READER_QUEUE_DEPTH);
    let skip_to = resume_after.unwrap_or(0);

    thread::spawn(move || {
        for (position, path) in files.into_iter().enumerate() {
            let seq = position as u64 + 1;
            if seq <= skip_to {
                continue;
            }
            if tx.send(read_frame(seq, &path)).is_err() {
                // Consumer stopped pulling.
                break;
            }
        }
    });

    Ok(rx)
}

/// Sorted list of frame files under `dir`. Non-image entries are ignored.
fn list_frame_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list frame directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_frame = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_frame(seq: u64, path: &Path) -> FrameResult {
    let timestamp_ms = frame_timestamp_ms(path);
    let decoded = match image::open(path) {
        Ok(decoded) => decoded,
        Err(source) => {
            return Err(FrameError {
                seq,
                timestamp_ms,
                reason: CaptureError::Decode {
                    path: path.display().to_string(),
                    source,
                },
            });
        }
    };

    let gray = decoded.to_luma8();
    Ok(Frame {
        seq,
        width: gray.width(),
        height: gray.height(),
        data: gray.into_raw(),
        timestamp_ms,
        format: FrameFormat::Gray8,
    })
}

/// Capture timestamp for a frame file: parsed from the file name when the
/// instrument encoded one, otherwise the file modification time, otherwise
/// "now" (logged, so a stream with no usable timestamps is visible).
fn frame_timestamp_ms(path: &Path) -> i64 {
    if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
        if let Some(parsed) = timestamp::timestamp_from_filename(stem) {
            return parsed.and_utc().timestamp_millis();
        }
    }
    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => chrono::DateTime::<Utc>::from(modified).timestamp_millis(),
        Err(err) => {
            warn!(
                "No timestamp available for {} ({err}); using wall clock",
                path.display()
            );
            Utc::now().timestamp_millis()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_frame_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "frame-ingest-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn write_png(path: &Path, value: u8) {
        let img = image::GrayImage::from_pixel(8, 8, image::Luma([value]));
        img.save(path).expect("write png");
    }

    #[test]
    fn sequences_follow_sorted_order_and_resume_skips() {
        let dir = temp_frame_dir("order");
        write_png(&dir.join("b.png"), 20);
        write_png(&dir.join("a.png"), 10);
        write_png(&dir.join("c.png"), 30);

        let rx = spawn_directory_reader(&dir, Some(1)).expect("reader");
        let frames: Vec<_> = rx.into_iter().collect();
        assert_eq!(frames.len(), 2, "resume_after=1 must skip the first file");
        let first = frames[0].as_ref().expect("frame");
        assert_eq!(first.seq, 2);
        assert_eq!(first.data[0], 20, "seq 2 is b.png by sorted order");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn undecodable_file_is_delivered_as_error_with_its_seq() {
        let dir = temp_frame_dir("corrupt");
        write_png(&dir.join("a.png"), 10);
        fs::write(dir.join("b.png"), b"not an image").expect("write junk");
        write_png(&dir.join("c.png"), 30);

        let rx = spawn_directory_reader(&dir, None).expect("reader");
        let frames: Vec<_> = rx.into_iter().collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_ok());
        let err = frames[1].as_ref().expect_err("corrupt file");
        assert_eq!(err.seq, 2);
        assert!(matches!(err.reason, CaptureError::Decode { .. }));
        assert_eq!(frames[2].as_ref().expect("frame").seq, 3);

        let _ = fs::remove_dir_all(&dir);
    }
}
