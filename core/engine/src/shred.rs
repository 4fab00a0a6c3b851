//! Secure deletion of superseded originals and containers.
//!
//! Deletion is best-effort: contents are overwritten with CSPRNG bytes,
//! then the file is removed. Transient failures are retried with a linear
//! backoff, and a permission denial triggers one elevation attempt.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::events::EventSink;
use fflocker_crypto::random;

const OVERWRITE_BLOCK: usize = 4096;

/// Retry and overwrite behaviour of [`SecureDeleter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `backoff_ms * (n + 1)`.
    pub backoff_ms: u64,
    /// Overwrite contents before removal.
    pub overwrite: bool,
    /// Try to regain write access on permission denial.
    pub elevate: bool,
}

impl DeletionPolicy {
    /// Delay after failed attempt `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64 + 1))
    }

    /// Policy without waits, for tests.
    pub fn immediate() -> Self {
        Self {
            backoff_ms: 0,
            ..Self::default()
        }
    }
}

impl Default for DeletionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 200,
            overwrite: true,
            elevate: true,
        }
    }
}

/// Hook that grants the current user full control over a path.
pub trait PermissionElevator: Send + Sync {
    fn elevate(&self, path: &Path) -> io::Result<()>;
}

/// Makes the file and its parent directory owner-writable.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerAccessElevator;

impl PermissionElevator for OwnerAccessElevator {
    #[cfg(unix)]
    fn elevate(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(perms.mode() | 0o700);
            std::fs::set_permissions(parent, perms)?;
        }
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o600);
        std::fs::set_permissions(path, perms)
    }

    #[cfg(not(unix))]
    fn elevate(&self, path: &Path) -> io::Result<()> {
        let mut perms = std::fs::metadata(path)?.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(path, perms)
    }
}

/// Result of a deletion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted,
    /// Nothing existed at the path.
    AlreadyGone,
    /// Every attempt failed; the file may still hold plaintext.
    Failed { attempts: u32, reason: String },
}

impl DeletionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeletionOutcome::Failed { .. })
    }
}

/// Overwrites and removes files according to a [`DeletionPolicy`].
pub struct SecureDeleter {
    policy: DeletionPolicy,
    elevator: Arc<dyn PermissionElevator>,
}

impl SecureDeleter {
    pub fn new(policy: DeletionPolicy) -> Self {
        Self::with_elevator(policy, Arc::new(OwnerAccessElevator))
    }

    pub fn with_elevator(policy: DeletionPolicy, elevator: Arc<dyn PermissionElevator>) -> Self {
        Self { policy, elevator }
    }

    pub fn policy(&self) -> &DeletionPolicy {
        &self.policy
    }

    /// Delete `path`, blocking through retries.
    ///
    /// Never returns an error: persistent failure is reported on `events`
    /// and in the outcome.
    pub fn delete(&self, path: &Path, events: &EventSink) -> DeletionOutcome {
        let mut elevated = false;
        let mut attempt = 0;
        let mut tries = 0;
        let mut last_error = String::new();

        while attempt < self.policy.max_attempts.max(1) {
            tries += 1;
            match self.try_delete(path) {
                Ok(()) => return DeletionOutcome::Deleted,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return if tries == 1 {
                        DeletionOutcome::AlreadyGone
                    } else {
                        DeletionOutcome::Deleted
                    };
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied && self.policy.elevate && !elevated => {
                    elevated = true;
                    events.warn(format!(
                        "Access denied deleting {}, requesting full control",
                        path.display()
                    ));
                    if let Err(elevate_err) = self.elevator.elevate(path) {
                        last_error = format!("{} (elevation failed: {})", e, elevate_err);
                        break;
                    }
                    // The elevated retry does not count against the budget.
                    continue;
                }
                Err(e) => {
                    last_error = e.to_string();
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::debug!(
                        "Delete attempt {} for {} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        path.display(),
                        e,
                        delay
                    );
                    attempt += 1;
                    if attempt < self.policy.max_attempts.max(1) && !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        events.error(format!(
            "CRITICAL: could not securely delete {}: {}. Residual data may remain",
            path.display(),
            last_error
        ));
        DeletionOutcome::Failed {
            attempts: tries,
            reason: last_error,
        }
    }

    fn try_delete(&self, path: &Path) -> io::Result<()> {
        if self.policy.overwrite {
            overwrite(path)?;
        }
        std::fs::remove_file(path)
    }
}

impl Default for SecureDeleter {
    fn default() -> Self {
        Self::new(DeletionPolicy::default())
    }
}

fn overwrite(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;

    let mut block = [0u8; OVERWRITE_BLOCK];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(OVERWRITE_BLOCK as u64) as usize;
        random::fill(&mut block[..n]);
        file.write_all(&block[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()
}
