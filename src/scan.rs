use camino::{Utf8Path, Utf8PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::error::KiraError;

const IGNORED_NAMES: [&str; 4] = [".DS_Store", "Thumbs.db", "desktop.ini", ".git"];

fn is_ignored(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| IGNORED_NAMES.contains(&name))
        .unwrap_or(false)
}

/// Every regular file under `root`, in a stable order.
///
/// Unreadable entries and paths that aren't UTF-8 are logged and skipped.
pub fn source_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    if !root.as_std_path().is_dir() {
        return Err(KiraError::Filesystem(format!("{root} is not a directory")));
    }
    let walker = WalkDir::new(root.as_std_path())
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored(entry));

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(%err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match Utf8PathBuf::from_path_buf(entry.into_path()) {
            Ok(path) => files.push(path),
            Err(path) => tracing::warn!(path = %path.display(), "skipping non UTF-8 path"),
        }
    }
    Ok(files)
}
