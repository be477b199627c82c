//! Value file directory helpers
//!
//! Layout under the storage root:
//! - `data/<filename>`: file-backed values
//! - `data/<filename>.tmp`: in-flight writes, renamed into place
//! - `trash/<uuid>/`: retired data directories awaiting deletion

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub(crate) const TMP_SUFFIX: &str = ".tmp";

/// Reject names that would escape the data directory or collide with temp files
pub(crate) fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.ends_with(TMP_SUFFIX)
        && !name.contains(['/', '\\'])
}

/// Write `value` to `dir/name` through a temp file and rename
pub(crate) fn write_atomic(dir: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    let target = dir.join(name);
    let tmp = dir.join(format!("{}{}", name, TMP_SUFFIX));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(value)?;
        file.sync_data()?;
        fs::rename(&tmp, &target)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub(crate) fn read(dir: &Path, name: &str) -> io::Result<Vec<u8>> {
    fs::read(dir.join(name))
}

/// Delete `dir/name`; a missing file is not an error
pub(crate) fn remove(dir: &Path, name: &str) -> io::Result<()> {
    match fs::remove_file(dir.join(name)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Names of the regular files directly under `dir`
pub(crate) fn list(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Move the whole data directory into the trash and recreate it empty
pub(crate) fn move_to_trash(data: &Path, trash: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(trash)?;
    let retired = trash.join(uuid::Uuid::new_v4().to_string());
    if data.exists() {
        fs::rename(data, &retired)?;
    }
    fs::create_dir_all(data)?;
    Ok(retired)
}

/// Delete everything under the trash directory
pub(crate) fn empty_trash(trash: &Path) {
    let entries = match fs::read_dir(trash) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            tracing::debug!("Failed to empty trash entry {}: {}", path.display(), e);
        }
    }
}
