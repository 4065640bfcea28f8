//! WAL segment garbage collection.

use std::path::Path;

use super::list_segments;

/// Removes segments whose every record has been applied to a durable SST:
/// a segment spans the sequence window up to its successor's starting
/// sequence, so it can go once that successor starts at or below
/// `applied_until`. Best-effort; failures are logged and retried on the
/// next pass.
pub fn remove_applied_segments(dir: &Path, applied_until: i64) {
    let segments = match list_segments(dir) {
        Ok(segments) => segments,
        Err(e) => {
            tracing::warn!(error = %e, "error listing wal segments");
            return;
        }
    };

    let mut removed = 0;
    for pair in segments.windows(2) {
        let (successor_start, prior) = (pair[1].0, &pair[0].1);
        if successor_start <= applied_until {
            tracing::debug!(path = %prior.display(), "removing applied wal segment");
            match std::fs::remove_file(prior) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %prior.display(), error = %e, "error removing wal segment")
                }
            }
        }
    }

    if removed > 0 {
        tracing::info!(removed, "removed applied wal segments");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::segment_name;

    fn touch(dir: &Path, seq: i64) {
        std::fs::write(dir.join(segment_name(seq)), b"").unwrap();
    }

    fn remaining(dir: &Path) -> Vec<i64> {
        list_segments(dir).unwrap().into_iter().map(|(s, _)| s).collect()
    }

    #[test]
    fn test_removes_fully_applied_segments() {
        let dir = tempfile::tempdir().unwrap();
        for seq in [1, 100, 200, 300] {
            touch(dir.path(), seq);
        }

        // Segment 1 spans [1, 100); segment 100 spans [100, 200). With
        // everything through 200 applied, both can go.
        remove_applied_segments(dir.path(), 200);
        assert_eq!(remaining(dir.path()), vec![200, 300]);
    }

    #[test]
    fn test_keeps_partially_applied_segment() {
        let dir = tempfile::tempdir().unwrap();
        for seq in [1, 100] {
            touch(dir.path(), seq);
        }

        // Records [51, 100) may still be needed.
        remove_applied_segments(dir.path(), 50);
        assert_eq!(remaining(dir.path()), vec![1, 100]);
    }

    #[test]
    fn test_never_removes_last_segment() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), 1);
        remove_applied_segments(dir.path(), i64::MAX);
        assert_eq!(remaining(dir.path()), vec![1]);
    }
}
