//! Plugin discovery
//!
//! Every regular file with an execute bit directly inside the plugin
//! directory is a candidate. Candidates are returned sorted by file name,
//! which fixes the order of the chain.

use crate::error::{Error, Result};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// List plugin candidates in `dir`.
///
/// A missing directory yields no candidates; any other listing failure is a
/// discovery error.
pub fn plugin_candidates(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Plugin directory does not exist");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(Error::Discovery {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| Error::Discovery {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();

        // Follows symlinks, so a link to a plugin binary counts as the binary.
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if !metadata.is_file() {
            continue;
        }
        if !is_executable(&path, &metadata) {
            debug!(path = %path.display(), "Skipping non-executable file");
            continue;
        }

        candidates.push(path);
    }

    candidates.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(candidates)
}

#[cfg(unix)]
fn is_executable(_path: &Path, metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _metadata: &Metadata) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("exe"))
}
