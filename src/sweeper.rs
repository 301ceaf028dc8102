use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use log::{info, warn};

/// Outcome of one retention sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub removed: usize,
    pub kept: usize,
    pub errors: usize,
}

/// Delete every file in `dir` whose modification time is older than
/// `retention`, measured against `now`.
///
/// Operates on raw directory entries, not task rows: a `sent` task's
/// `file_path` may dangle afterwards, which is accepted: those records are
/// historical. Subdirectories are left alone.
pub fn sweep(dir: &Path, retention: Duration, now: SystemTime) -> std::io::Result<SweepStats> {
    let mut stats = SweepStats::default();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("sweep: unreadable entry in {}: {e}", dir.display());
                stats.errors += 1;
                continue;
            }
        };
        let path = entry.path();

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("sweep: no metadata for {}: {e}", path.display());
                stats.errors += 1;
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }

        let modified = match meta.modified() {
            Ok(t) => t,
            Err(e) => {
                warn!("sweep: no mtime for {}: {e}", path.display());
                stats.errors += 1;
                continue;
            }
        };

        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age <= retention {
            stats.kept += 1;
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                info!(
                    "sweep: removed {} (age {}h)",
                    path.display(),
                    age.as_secs() / 3600
                );
                stats.removed += 1;
            }
            Err(e) => {
                warn!("sweep: failed to remove {}: {e}", path.display());
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}
