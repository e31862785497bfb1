//! Atomic file replacement (write temp file, fsync, rename)
//!
//! Readers of a file written through this module observe either the previous
//! complete version or the new complete version, never a torn write. The
//! temporary file lives next to the target (`<name>.tmp`) so the final
//! `rename` never crosses a filesystem boundary.

use crate::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Temporary sibling path used while writing `target`
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "unnamed".into());
    name.push(".tmp");
    target.with_file_name(name)
}

/// Atomically replace `target` with `contents`
///
/// Steps: write `<target>.tmp`, flush and fsync it, rename over `target`,
/// then fsync the parent directory (unix) so the rename itself is durable.
/// On failure the temporary file is removed and `target` is untouched.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path_for(target);
    let result = write_and_sync(&tmp, contents).and_then(|_| {
        fs::rename(&tmp, target)?;
        Ok(())
    });

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    sync_parent_dir(target);
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically write it to `target`
pub fn write_json_atomic<T: serde::Serialize>(target: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(target, &bytes)
}

fn write_and_sync(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(target: &Path) {
    if let Some(parent) = target.parent() {
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_target: &Path) {}
