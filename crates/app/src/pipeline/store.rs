//! Persistent statistics store: an append-only JSON-lines record log, a
//! cursor document, and an aggregate snapshot.
//!
//! Commit ordering is write-ahead-then-advance: records for a frame are
//! appended and fsynced *before* the cursor document is atomically replaced.
//! A crash between the two steps leaves trailing records past the cursor,
//! which resume detects and discards — the cursor is always authoritative.
//! The aggregate snapshot is advisory; on resume it is rebuilt by replaying
//! the committed portion of the log.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::data::ParticleRecord;
use super::stats::{AggregateStats, SizeBins};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failure")]
    Io(#[from] std::io::Error),
    #[error("failed to encode record")]
    Encode(#[from] serde_json::Error),
    #[error("commit for frame {frame_id} is not past cursor {cursor}")]
    OutOfOrder { frame_id: u64, cursor: u64 },
    #[error("store schema mismatch: {message}")]
    Schema { message: String },
}

#[derive(Serialize, Deserialize)]
struct CursorDoc {
    cursor: u64,
}

/// Append-only statistics store with crash-resumable semantics.
///
/// Single-writer by design: the commit writer thread owns the instance and
/// applies commits in strict frame-sequence order.
pub struct StatsStore {
    records_path: PathBuf,
    cursor_path: PathBuf,
    aggregate_path: PathBuf,
    records_file: File,
    cursor: Option<u64>,
    aggregate: AggregateStats,
}

impl StatsStore {
    /// Open (or create) the store at `prefix`.
    ///
    /// With `resume` set, an existing cursor defines the committed region:
    /// records at or below it are replayed into the aggregate, trailing
    /// records beyond it (an interrupted commit) are truncated away. Without
    /// `resume`, any existing store files are replaced.
    pub fn open(prefix: &Path, bins: SizeBins, resume: bool) -> Result<Self, StoreError> {
        let records_path = suffixed(prefix, "records.jsonl");
        let cursor_path = suffixed(prefix, "cursor.json");
        let aggregate_path = suffixed(prefix, "aggregate.json");
        if let Some(parent) = prefix.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if !resume {
            remove_if_present(&cursor_path)?;
            remove_if_present(&aggregate_path)?;
            let records_file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&records_path)?;
            return Ok(Self {
                records_path,
                cursor_path,
                aggregate_path,
                records_file,
                cursor: None,
                aggregate: AggregateStats::new(bins),
            });
        }

        let cursor = match fs::read(&cursor_path) {
            Ok(bytes) => Some(
                serde_json::from_slice::<CursorDoc>(&bytes)
                    .map_err(|err| StoreError::Schema {
                        message: format!("unreadable cursor document: {err}"),
                    })?
                    .cursor,
            ),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        // Prefer the persisted binning so a replay reproduces the aggregate
        // the log was accumulated under even if configuration changed.
        let bins = match fs::read(&aggregate_path) {
            Ok(bytes) => serde_json::from_slice::<AggregateStats>(&bytes)
                .map(|snapshot| snapshot.bins)
                .unwrap_or(bins),
            Err(_) => bins,
        };

        let (kept, valid_len) = match cursor {
            None => (Vec::new(), 0),
            Some(cursor) => scan_committed(&records_path, cursor)?,
        };

        let mut records_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&records_path)?;
        let current_len = records_file.metadata()?.len();
        if current_len > valid_len {
            warn!(
                "Discarding {} byte(s) of uncommitted records past cursor {:?}",
                current_len - valid_len,
                cursor
            );
            records_file.set_len(valid_len)?;
        }
        records_file.seek(SeekFrom::End(0))?;

        let aggregate = AggregateStats::replay(bins, kept.iter());
        debug!(
            "Store resumed at cursor {:?} with {} committed record(s)",
            cursor,
            kept.len()
        );

        Ok(Self {
            records_path,
            cursor_path,
            aggregate_path,
            records_file,
            cursor,
            aggregate,
        })
    }

    /// Sequence id of the last durably committed frame, if any.
    pub fn resume_cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn aggregate_snapshot(&self) -> &AggregateStats {
        &self.aggregate
    }

    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    /// Atomically commit all records for one frame and advance the cursor.
    ///
    /// Zero records is a valid commit (skipped or particle-free frames). The
    /// frame id must be strictly past the current cursor.
    pub fn commit(
        &mut self,
        frame_id: u64,
        records: &[ParticleRecord],
    ) -> Result<(), StoreError> {
        if let Some(cursor) = self.cursor {
            if frame_id <= cursor {
                return Err(StoreError::OutOfOrder { frame_id, cursor });
            }
        }

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        self.records_file.write_all(&buffer)?;
        self.records_file.sync_data()?;

        write_json_atomic(&self.cursor_path, &CursorDoc { cursor: frame_id })?;
        self.cursor = Some(frame_id);

        for record in records {
            self.aggregate.fold(record);
        }
        write_json_atomic(&self.aggregate_path, &self.aggregate)?;
        Ok(())
    }
}

/// Read the committed portion of a record log: every parseable record with
/// `frame_id <= cursor` up to the first uncommitted or torn line.
///
/// Committed records are fsynced before the cursor advances, so anything
/// unparseable can only be an interrupted append past the committed region;
/// a committed record *after* such a line means real corruption and fails.
fn scan_committed(
    records_path: &Path,
    cursor: u64,
) -> Result<(Vec<ParticleRecord>, u64), StoreError> {
    let mut content = String::new();
    match File::open(records_path) {
        Ok(mut file) => {
            file.read_to_string(&mut content)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Schema {
                message: format!(
                    "cursor is {cursor} but record log {} is missing",
                    records_path.display()
                ),
            });
        }
        Err(err) => return Err(err.into()),
    }

    let mut kept = Vec::new();
    let mut valid_len = 0u64;
    let mut tail_reached = false;
    for (line_number, line) in content.split_inclusive('\n').enumerate() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<ParticleRecord>(trimmed) {
            Ok(record) if record.frame_id <= cursor => {
                if tail_reached {
                    return Err(StoreError::Schema {
                        message: format!(
                            "committed record for frame {} after corrupt line {}",
                            record.frame_id,
                            line_number + 1
                        ),
                    });
                }
                kept.push(record);
                valid_len += line.len() as u64;
            }
            Ok(_) | Err(_) => {
                // Uncommitted tail from an interrupted commit.
                tail_reached = true;
            }
        }
    }
    Ok((kept, valid_len))
}

/// Outcome of an offline store verification.
#[derive(Debug)]
pub struct VerifyReport {
    pub cursor: Option<u64>,
    pub committed_records: usize,
    /// Replayed aggregate equals the persisted snapshot.
    pub matches: bool,
}

/// Replay the committed record log read-only and compare against the
/// persisted aggregate snapshot.
pub fn verify(prefix: &Path) -> Result<VerifyReport, StoreError> {
    let cursor_path = suffixed(prefix, "cursor.json");
    let aggregate_path = suffixed(prefix, "aggregate.json");
    let records_path = suffixed(prefix, "records.jsonl");

    let cursor = match fs::read(&cursor_path) {
        Ok(bytes) => Some(
            serde_json::from_slice::<CursorDoc>(&bytes)
                .map_err(|err| StoreError::Schema {
                    message: format!("unreadable cursor document: {err}"),
                })?
                .cursor,
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };

    let snapshot: AggregateStats =
        serde_json::from_slice(&fs::read(&aggregate_path)?).map_err(|err| {
            StoreError::Schema {
                message: format!("unreadable aggregate snapshot: {err}"),
            }
        })?;

    let (kept, _) = match cursor {
        None => (Vec::new(), 0),
        Some(cursor) => scan_committed(&records_path, cursor)?,
    };
    let replayed = AggregateStats::replay(snapshot.bins.clone(), kept.iter());

    Ok(VerifyReport {
        cursor,
        committed_records: kept.len(),
        matches: replayed == snapshot,
    })
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}-{}", prefix.display(), suffix))
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Write a JSON document via a temp file and rename so readers (and crashes)
/// only ever observe a complete document.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
    {
        let mut tmp = File::create(&tmp_path)?;
        serde_json::to_writer(&mut tmp, value)?;
        tmp.write_all(b"\n")?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_core::FeatureVector;
    use std::sync::atomic::{AtomicU32, Ordering};

    static STORE_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_prefix(tag: &str) -> PathBuf {
        let unique = STORE_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "particle-store-{tag}-{}-{unique}",
            std::process::id()
        ))
    }

    fn bins() -> SizeBins {
        SizeBins::logarithmic(1.0, 1000.0, 20)
    }

    fn record(frame_id: u64, region_index: u32, diameter: f32) -> ParticleRecord {
        ParticleRecord {
            frame_id,
            region_index,
            features: FeatureVector {
                area: diameter * diameter,
                equiv_diameter: diameter,
                major_axis: diameter,
                minor_axis: diameter,
                aspect_ratio: 1.0,
                solidity: 1.0,
                mean_intensity: 0.4,
                intensity_variance: 0.01,
            },
            label: "unclassified".to_string(),
            confidence: 0.0,
            truncated: false,
            timestamp_ms: 1_700_000_000_000 + frame_id as i64,
        }
    }

    #[test]
    fn commit_then_resume_restores_cursor_and_aggregate() {
        let prefix = temp_prefix("resume");
        {
            let mut store = StatsStore::open(&prefix, bins(), false).expect("open");
            store
                .commit(1, &[record(1, 0, 20.0), record(1, 1, 35.0)])
                .expect("commit 1");
            store.commit(2, &[]).expect("empty commit");
            store.commit(3, &[record(3, 0, 5.0)]).expect("commit 3");
        }

        let store = StatsStore::open(&prefix, bins(), true).expect("reopen");
        assert_eq!(store.resume_cursor(), Some(3));
        assert_eq!(store.aggregate_snapshot().total_particles, 3);
    }

    #[test]
    fn empty_commit_advances_the_cursor() {
        let prefix = temp_prefix("empty");
        let mut store = StatsStore::open(&prefix, bins(), false).expect("open");
        store.commit(1, &[]).expect("commit");
        assert_eq!(store.resume_cursor(), Some(1));
        assert_eq!(store.aggregate_snapshot().total_particles, 0);
    }

    #[test]
    fn out_of_order_commits_are_rejected() {
        let prefix = temp_prefix("order");
        let mut store = StatsStore::open(&prefix, bins(), false).expect("open");
        store.commit(5, &[record(5, 0, 10.0)]).expect("commit");
        let err = store.commit(5, &[]).expect_err("duplicate");
        assert!(matches!(err, StoreError::OutOfOrder { .. }));
        let err = store.commit(4, &[]).expect_err("regression");
        assert!(matches!(err, StoreError::OutOfOrder { .. }));
    }

    #[test]
    fn interrupted_commit_is_discarded_on_resume() {
        let prefix = temp_prefix("torn");
        {
            let mut store = StatsStore::open(&prefix, bins(), false).expect("open");
            store.commit(1, &[record(1, 0, 20.0)]).expect("commit");
        }
        // Simulate a crash between record append and cursor advance: full
        // records for frame 2 plus a torn half-line, cursor still at 1.
        let records_path = suffixed(&prefix, "records.jsonl");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&records_path)
            .expect("append");
        let mut orphan = serde_json::to_vec(&record(2, 0, 40.0)).expect("encode");
        orphan.push(b'\n');
        orphan.extend_from_slice(b"{\"frame_id\":2,\"region_in");
        file.write_all(&orphan).expect("write orphan");
        drop(file);

        let mut store = StatsStore::open(&prefix, bins(), true).expect("resume");
        assert_eq!(store.resume_cursor(), Some(1));
        assert_eq!(store.aggregate_snapshot().total_particles, 1);

        // Re-committing frame 2 after resume converges to the uninterrupted
        // outcome.
        store.commit(2, &[record(2, 0, 40.0)]).expect("recommit");

        let uninterrupted_prefix = temp_prefix("torn-ref");
        let mut reference =
            StatsStore::open(&uninterrupted_prefix, bins(), false).expect("open");
        reference.commit(1, &[record(1, 0, 20.0)]).expect("commit");
        reference.commit(2, &[record(2, 0, 40.0)]).expect("commit");
        assert_eq!(store.aggregate_snapshot(), reference.aggregate_snapshot());
    }

    #[test]
    fn snapshot_matches_replay_of_the_log() {
        let prefix = temp_prefix("replay");
        let mut store = StatsStore::open(&prefix, bins(), false).expect("open");
        store
            .commit(1, &[record(1, 0, 12.0), record(1, 1, 300.0)])
            .expect("commit");
        store.commit(2, &[record(2, 0, 7.5)]).expect("commit");

        let report = verify(&prefix).expect("verify");
        assert!(report.matches);
        assert_eq!(report.cursor, Some(2));
        assert_eq!(report.committed_records, 3);
    }

    #[test]
    fn corruption_inside_the_committed_region_is_fatal() {
        let prefix = temp_prefix("corrupt");
        {
            let mut store = StatsStore::open(&prefix, bins(), false).expect("open");
            store.commit(1, &[record(1, 0, 20.0)]).expect("commit");
            store.commit(2, &[record(2, 0, 30.0)]).expect("commit");
        }
        // Mangle the first record while the cursor still claims both frames.
        let records_path = suffixed(&prefix, "records.jsonl");
        let content = fs::read_to_string(&records_path).expect("read");
        let mangled = content.replacen("frame_id", "frame_xx", 1);
        fs::write(&records_path, mangled).expect("write");

        let err = StatsStore::open(&prefix, bins(), true)
            .err()
            .expect("opening a corrupted committed log must fail");
        assert!(matches!(err, StoreError::Schema { .. }));
    }

    #[test]
    fn fresh_open_discards_a_previous_run() {
        let prefix = temp_prefix("fresh");
        {
            let mut store = StatsStore::open(&prefix, bins(), false).expect("open");
            store.commit(1, &[record(1, 0, 20.0)]).expect("commit");
        }
        let store = StatsStore::open(&prefix, bins(), false).expect("fresh");
        assert_eq!(store.resume_cursor(), None);
        assert_eq!(store.aggregate_snapshot().total_particles, 0);
    }
}
