use std::collections::HashSet;
use std::fs;
use std::path::Path;

use super::checkpoint::CheckpointState;
use super::segment::file::{parse_segment_file_name, read_segment, segment_path};
use super::segment::{Segment, SegmentCache};
use super::state::TableState;
use crate::error::{Error, Result};
use crate::SegmentId;

/// Reinstalls `checkpoint` as the table's state: reloads the open segment
/// from disk, cuts it back to the checkpoint's last committed row and drops
/// segment files the checkpoint does not know about.
pub(crate) fn restore(
    dir: &Path,
    cache: &SegmentCache,
    state: &TableState,
    checkpoint: CheckpointState,
) -> Result<()> {
    let open_segment = load_open_segment(dir, &checkpoint)?;
    for id in remove_orphans(dir, &checkpoint)? {
        cache.remove(id)?;
    }
    cache.remove(open_segment.id())?;
    state.install(checkpoint, open_segment)
}

fn load_open_segment(dir: &Path, checkpoint: &CheckpointState) -> Result<Segment> {
    let misc = &checkpoint.misc;
    let path = segment_path(dir, misc.segment_id);
    let mut segment = if path.exists() {
        read_segment(&path)?
    } else {
        Segment::new(misc.segment_id, misc.segment_size as usize)
    };
    if segment.id() != misc.segment_id {
        return Err(Error::Corrupted(
            "open segment",
            format!("{} holds segment {}", path.display(), segment.id()),
        ));
    }

    // Rows past the checkpoint were appended by a flush that never committed.
    segment.drop_from(misc.current_row + 1);

    let expected_last = checkpoint
        .segments
        .values()
        .find(|h| h.id == misc.segment_id && !h.sealed)
        .map(|h| h.last_row);
    if segment.last_row_id() != expected_last {
        return Err(Error::Corrupted(
            "open segment",
            format!(
                "segment {} ends at row {:?}, checkpoint expects {:?}",
                misc.segment_id,
                segment.last_row_id(),
                expected_last
            ),
        ));
    }
    Ok(segment)
}

/// Deletes segment files referenced neither by the checkpoint nor as its
/// open segment, plus leftover temporary files. Returns the deleted IDs.
fn remove_orphans(dir: &Path, checkpoint: &CheckpointState) -> Result<Vec<SegmentId>> {
    let live: HashSet<SegmentId> = checkpoint
        .segments
        .values()
        .map(|h| h.id)
        .chain(std::iter::once(checkpoint.misc.segment_id))
        .collect();

    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let orphan = match parse_segment_file_name(name) {
            Some(id) if !live.contains(&id) => Some(id),
            Some(_) => None,
            None if name.starts_with("seg") && name.ends_with(".dat.tmp") => Some(0),
            None => None,
        };
        let Some(id) = orphan else { continue };
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(file = %path.display(), "Removed orphan segment file");
                if id != 0 {
                    removed.push(id);
                }
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Failed to remove orphan segment file");
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::segment::file::write_segment;
    use crate::store::state::{SegmentHandle, StoreMisc};
    use tempfile::TempDir;

    fn checkpoint(segment_id: SegmentId, current_row: i64, open_last: Option<i64>) -> CheckpointState {
        let mut cp = CheckpointState::default();
        cp.misc = StoreMisc {
            segment_size: 64,
            segment_id,
            current_row,
            ..Default::default()
        };
        if let Some(last) = open_last {
            cp.segments.insert(
                1,
                SegmentHandle {
                    id: segment_id,
                    last_row: last,
                    sealed: false,
                },
            );
            cp.row_index.insert(1, segment_id);
            cp.counters.insert(1, false);
        }
        cp
    }

    #[test]
    fn test_uncommitted_rows_are_dropped() -> Result<()> {
        let dir = TempDir::new()?;
        let mut segment = Segment::new(1, 64);
        for id in 1..=5 {
            segment.add_row(&[id as u8; 4], id)?;
        }
        write_segment(&segment_path(dir.path(), 1), &segment)?;

        let loaded = load_open_segment(dir.path(), &checkpoint(1, 3, Some(3)))?;
        assert_eq!(loaded.last_row_id(), Some(3));
        assert_eq!(loaded.used(), 12);
        Ok(())
    }

    #[test]
    fn test_missing_open_segment_starts_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let loaded = load_open_segment(dir.path(), &checkpoint(4, 0, None))?;
        assert_eq!(loaded.id(), 4);
        assert!(loaded.is_empty());

        // Rows the checkpoint expects must be on disk.
        assert!(load_open_segment(dir.path(), &checkpoint(4, 3, Some(3))).is_err());
        Ok(())
    }

    #[test]
    fn test_orphans_removed() -> Result<()> {
        let dir = TempDir::new()?;
        for id in [1, 2, 3] {
            write_segment(&segment_path(dir.path(), id), &Segment::new(id, 64))?;
        }
        fs::write(dir.path().join("seg9.dat.tmp"), b"partial")?;
        fs::write(dir.path().join("catalog"), b"table=t")?;

        let removed = remove_orphans(dir.path(), &checkpoint(2, 0, None))?;
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&1) && removed.contains(&3));
        assert!(segment_path(dir.path(), 2).exists());
        assert!(!dir.path().join("seg9.dat.tmp").exists());
        assert!(dir.path().join("catalog").exists());
        Ok(())
    }
}
