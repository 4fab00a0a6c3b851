//! On-disk naming of locked items.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::config::{FOLDER_MARKER, LOCKED_EXTENSION, TEMP_SUFFIX};
use fflocker_common::{Error, Result};

/// Whether `path` has the container extension.
pub fn is_container(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext == LOCKED_EXTENSION)
            .unwrap_or(false)
}

/// Whether `path` is a container, or a directory holding at least one.
pub fn is_locked(path: &Path) -> bool {
    if path.is_dir() {
        list_containers(path).map(|c| !c.is_empty()).unwrap_or(false)
    } else {
        is_container(path)
    }
}

/// Top-level containers of `dir`, sorted by name.
pub fn list_containers(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut containers = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if is_container(&path) {
            containers.push(path);
        }
    }
    containers.sort();
    Ok(containers)
}

/// `path` relative to `root`, joined with `/`.
///
/// # Errors
/// - [`Error::InvalidInput`] if `path` is outside `root` or not UTF-8
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::InvalidInput(format!("{} is not under {}", path.display(), root.display()))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                Error::InvalidInput(format!("{} is not valid UTF-8", path.display()))
            })?),
            _ => {
                return Err(Error::InvalidInput(format!(
                    "unexpected component in {}",
                    path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::InvalidInput(format!("{} has no file name", path.display())));
    }
    Ok(parts.join("/"))
}

/// Destination of a decrypted relative path under `root`.
///
/// Accepts `/` and `\` as separators.
///
/// # Errors
/// - [`Error::Format`] if the path is empty, absolute or escapes `root`
pub fn restore_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let reject = || Error::Format(format!("unsafe relative path in header: {:?}", relative));

    if relative.is_empty() || relative.starts_with('/') || relative.starts_with('\\') {
        return Err(reject());
    }

    let mut restored = root.to_path_buf();
    for part in relative.split(['/', '\\']) {
        if part.is_empty() || part == "." || part == ".." || part.contains(':') {
            return Err(reject());
        }
        restored.push(part);
    }
    Ok(restored)
}

/// `<path>.tmp`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// `<path>.<tag>.tmp`
pub fn tagged_temp_path(path: &Path, tag: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(tag);
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// `<dir>/<name>.ffl`
pub fn container_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, LOCKED_EXTENSION))
}

/// Folder path carrying the lock marker.
pub fn with_marker(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(FOLDER_MARKER);
    path.with_file_name(name)
}

/// Folder path with the lock marker removed, or `None` if it has none.
pub fn strip_marker(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stripped = name.strip_suffix(FOLDER_MARKER)?;
    if stripped.is_empty() {
        return None;
    }
    Some(path.with_file_name(stripped))
}
