//! Exclusive-access checks on files about to be processed.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use fflocker_common::{Error, Result};

/// A file opened for reading and held under an exclusive OS lock.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct HeldFile {
    file: File,
    path: PathBuf,
}

impl HeldFile {
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the file on disk.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Drop for HeldFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Open `path` and take a non-blocking exclusive lock on it.
///
/// # Errors
/// - [`Error::ResourceBusy`] if another handle holds a lock on the file
/// - [`Error::NotFound`] if the file does not exist
pub fn acquire(path: &Path) -> Result<HeldFile> {
    let file = OpenOptions::new().read(true).open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        ErrorKind::PermissionDenied => Error::PermissionDenied(path.display().to_string()),
        _ => Error::Io(e),
    })?;

    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                return Ok(HeldFile {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_contended(&e) => {
                return Err(Error::ResourceBusy(format!(
                    "{} is in use by another process",
                    path.display()
                )))
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Whether the file can be locked right now.
pub fn is_available(path: &Path) -> bool {
    acquire(path).is_ok()
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
