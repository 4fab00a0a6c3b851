//! Transactional lock and unlock of files and folders.
//!
//! Every operation walks the same phases: derive the master key, process
//! all files on a bounded pool of blocking workers writing `.tmp` outputs,
//! then commit by renaming the outputs into place and securely deleting
//! what they replace. Any failure or cancellation before the commit removes
//! every output of the batch and leaves the sources untouched.
//!
//! Deleting the superseded files happens file by file after the commit;
//! a crash in that window leaves both forms on disk.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;
use zeroize::Zeroizing;

use crate::busy;
use crate::config::LockerConfig;
use crate::events::{format_size, EventSink, OperationState};
use crate::layout;
use crate::registry::LockedItemsRepository;
use crate::shred::SecureDeleter;
use fflocker_common::{Error, LockedItemRecord, Result, SecureBuffer};
use fflocker_crypto::biometric;
use fflocker_crypto::{
    derive_key, BiometricKey, BiometricSigner, FileCipher, FileHeader, MasterKey, Salt,
    SecureCrypto,
};

/// Shortest obfuscated name the orchestrator will generate.
const MIN_SECURE_NAME_LENGTH: usize = 16;

/// Random characters in the name of an unlock temp output.
const TEMP_TAG_LENGTH: usize = 16;

/// How the master key is obtained when unlocking.
pub enum Credential<'a> {
    /// Derive from a password and the item's GlobalSalt.
    Password(&'a SecureBuffer),
    /// Use an already derived key.
    MasterKey(&'a MasterKey),
    /// Unwrap the key stored in the header with a fresh biometric signature.
    Biometric(&'a dyn BiometricSigner),
}

/// Result of a successful lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOutcome {
    /// Container (file) or marked folder.
    pub locked_path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

/// Result of a successful unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    /// Restored file or folder.
    pub restored_path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

struct LockJob {
    source: PathBuf,
    relative: String,
    temp: PathBuf,
    container: PathBuf,
}

/// Temp outputs this operation created, and nothing else.
#[derive(Default)]
struct TempOutputs {
    created: Mutex<Vec<PathBuf>>,
}

impl TempOutputs {
    /// Create `path`, failing if anything already exists there.
    fn create(&self, path: &Path) -> Result<File> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        self.created
            .lock()
            .map_err(|_| Error::State("temp output list poisoned".to_string()))?
            .push(path.to_path_buf());
        Ok(file)
    }

    fn remove_all(&self) {
        let created = match self.created.lock() {
            Ok(mut created) => std::mem::take(&mut *created),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        remove_files(&created);
    }
}

struct LockContext {
    outputs: Arc<TempOutputs>,
    master_key: MasterKey,
    global_salt: Salt,
    wrapped_key: Option<Vec<u8>>,
    cipher: FileCipher,
    events: EventSink,
}

struct UnlockJob {
    container: PathBuf,
    relative: String,
    temp: PathBuf,
    destination: PathBuf,
}

struct UnlockContext {
    outputs: Arc<TempOutputs>,
    master_key: MasterKey,
    cipher: FileCipher,
    events: EventSink,
}

/// Drives lock and unlock operations.
pub struct LockOrchestrator {
    config: LockerConfig,
    registry: Arc<dyn LockedItemsRepository>,
    deleter: Arc<SecureDeleter>,
    events: EventSink,
}

impl LockOrchestrator {
    /// Create an orchestrator that reports only through `tracing`.
    pub fn new(config: LockerConfig, registry: Arc<dyn LockedItemsRepository>) -> Self {
        let deleter = Arc::new(SecureDeleter::new(config.deletion.clone()));
        Self {
            config,
            registry,
            deleter,
            events: EventSink::disabled(),
        }
    }

    /// Send progress and log events to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Replace the secure deleter.
    pub fn with_deleter(mut self, deleter: SecureDeleter) -> Self {
        self.deleter = Arc::new(deleter);
        self
    }

    pub fn config(&self) -> &LockerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn LockedItemsRepository> {
        &self.registry
    }

    /// Lock a file or folder under `password`.
    ///
    /// With a `signer`, the master key is also stored wrapped under the
    /// signer's key so the item can be unlocked without the password.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if `path` does not exist
    /// - [`Error::InvalidInput`] if the item is already locked or empty
    /// - [`Error::Aggregate`] if any file failed; nothing was changed
    /// - [`Error::Cancelled`] if `cancel` fired before commit; nothing was changed
    pub async fn lock(
        &self,
        path: &Path,
        password: &SecureBuffer,
        signer: Option<&dyn BiometricSigner>,
        cancel: &CancellationToken,
    ) -> Result<LockOutcome> {
        self.events.state(OperationState::Idle);
        match self.lock_inner(path, password, signer, cancel).await {
            Ok(outcome) => {
                self.events.state(OperationState::Done);
                Ok(outcome)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Unlock a container or a locked folder.
    ///
    /// All headers are read and every stored path is decrypted before
    /// anything on disk changes, so a wrong credential leaves the item as
    /// it was.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if `path` is missing or holds no containers
    /// - [`Error::Authentication`] if the credential is wrong
    /// - [`Error::Integrity`] if the containers do not belong to one item
    /// - [`Error::InvalidInput`] if a restored file would overwrite an existing one
    /// - [`Error::Aggregate`] if any file failed; nothing was changed
    /// - [`Error::Cancelled`] if `cancel` fired before commit; nothing was changed
    pub async fn unlock(
        &self,
        path: &Path,
        credential: Credential<'_>,
        cancel: &CancellationToken,
    ) -> Result<UnlockOutcome> {
        self.events.state(OperationState::Idle);
        match self.unlock_inner(path, credential, cancel).await {
            Ok(outcome) => {
                self.events.state(OperationState::Done);
                Ok(outcome)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn lock_inner(
        &self,
        path: &Path,
        password: &SecureBuffer,
        signer: Option<&dyn BiometricSigner>,
        cancel: &CancellationToken,
    ) -> Result<LockOutcome> {
        let target = canonical(path)?;
        if layout::is_locked(&target) {
            return Err(Error::InvalidInput(format!(
                "{} is already locked",
                target.display()
            )));
        }

        let is_folder = target.is_dir();
        let (root, sources) = if is_folder {
            (target.clone(), enumerate_files(&target)?)
        } else {
            let parent = target
                .parent()
                .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", target.display())))?
                .to_path_buf();
            (parent, vec![target.clone()])
        };
        if sources.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} contains no files to lock",
                target.display()
            )));
        }
        self.events.info(format!(
            "Locking {} ({} files)",
            target.display(),
            sources.len()
        ));
        ensure_not_cancelled(cancel)?;

        self.events.state(OperationState::DerivingKey);
        let global_salt = Salt::generate();
        let master_key = self.derive_master_key(password, &global_salt).await?;
        let wrapped_key = match signer {
            Some(signer) => {
                let biometric_key = BiometricKey::request(signer)?;
                self.events.info("Biometric unlock enabled");
                Some(biometric::wrap(&master_key, &biometric_key))
            }
            None => None,
        };
        ensure_not_cancelled(cancel)?;

        self.events.state(OperationState::Processing);
        let containers = self.plan_containers(&root, sources.len());
        let mut jobs = Vec::with_capacity(sources.len());
        for (source, container) in sources.into_iter().zip(containers) {
            jobs.push(LockJob {
                relative: layout::relative_path(&root, &source)?,
                temp: layout::temp_path(&container),
                source,
                container,
            });
        }
        let renames: Vec<(PathBuf, PathBuf)> = jobs
            .iter()
            .map(|job| (job.temp.clone(), job.container.clone()))
            .collect();
        let sources: Vec<PathBuf> = jobs.iter().map(|job| job.source.clone()).collect();

        let outputs = Arc::new(TempOutputs::default());
        let context = Arc::new(LockContext {
            outputs: Arc::clone(&outputs),
            master_key,
            global_salt,
            wrapped_key,
            cipher: FileCipher::new().with_chunk_size(self.config.chunk_size),
            events: self.events.clone(),
        });
        let batch = self
            .run_batch(jobs, cancel, move |job: LockJob, halt: &CancellationToken| {
                encrypt_file(&job, &context, halt)
            })
            .await;
        let bytes: u64 = match batch {
            Ok(sizes) => sizes.into_iter().sum(),
            Err(err) => {
                outputs.remove_all();
                return Err(err);
            }
        };
        if cancel.is_cancelled() {
            outputs.remove_all();
            return Err(Error::Cancelled);
        }

        self.events.state(OperationState::Committing);
        commit(&renames)?;

        self.events.state(OperationState::CleaningUp);
        self.shred_all(sources).await;
        let locked_path = if is_folder {
            self.remove_empty_dirs(&root);
            let marked = layout::with_marker(&root);
            match std::fs::rename(&root, &marked) {
                Ok(()) => marked,
                Err(e) => {
                    self.events.warn(format!(
                        "Could not rename {} to carry the lock marker: {}",
                        root.display(),
                        e
                    ));
                    root.clone()
                }
            }
        } else {
            renames[0].1.clone()
        };

        let record = LockedItemRecord::new(&target, &locked_path, is_folder);
        if let Err(e) = self.registry.add(&record) {
            self.events
                .warn(format!("Could not record {} as locked: {}", target.display(), e));
        }

        self.events.info(format!(
            "Locked {} files ({})",
            renames.len(),
            format_size(bytes)
        ));
        Ok(LockOutcome {
            locked_path,
            files: renames.len(),
            bytes,
        })
    }

    async fn unlock_inner(
        &self,
        path: &Path,
        credential: Credential<'_>,
        cancel: &CancellationToken,
    ) -> Result<UnlockOutcome> {
        let target = canonical(path)?;
        let is_folder = target.is_dir();
        let (root, containers) = if is_folder {
            let containers = layout::list_containers(&target)?;
            if containers.is_empty() {
                return Err(Error::NotFound(format!(
                    "no locked files in {}",
                    target.display()
                )));
            }
            (target.clone(), containers)
        } else {
            if !layout::is_container(&target) {
                return Err(Error::InvalidInput(format!(
                    "{} is not a locked file",
                    target.display()
                )));
            }
            let parent = target
                .parent()
                .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", target.display())))?
                .to_path_buf();
            (parent, vec![target.clone()])
        };
        self.events.info(format!(
            "Unlocking {} ({} files)",
            target.display(),
            containers.len()
        ));

        let headers = containers
            .iter()
            .map(|container| read_header(container))
            .collect::<Result<Vec<_>>>()?;
        let global_salt = headers[0].global_salt.clone();
        if headers.iter().any(|h| h.global_salt != global_salt) {
            return Err(Error::Integrity(
                "containers do not belong to the same locked item".to_string(),
            ));
        }
        ensure_not_cancelled(cancel)?;

        self.events.state(OperationState::DerivingKey);
        let master_key = match credential {
            Credential::Password(password) => self.derive_master_key(password, &global_salt).await?,
            Credential::MasterKey(key) => key.clone(),
            Credential::Biometric(signer) => {
                let wrapped = headers[0].biometric_key.as_deref().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "{} was not locked with biometric unlock",
                        target.display()
                    ))
                })?;
                let biometric_key = BiometricKey::request(signer)?;
                biometric::unwrap(wrapped, &biometric_key)?
            }
        };

        // Every destination and temp output is claimed in `taken`, so no
        // job's output can land on another job's path.
        let mut taken = HashSet::new();
        let mut restores = Vec::with_capacity(containers.len());
        for (container, header) in containers.iter().zip(&headers) {
            let relative = header.open_path(&master_key)?;
            let destination = layout::restore_path(&root, &relative)?;
            if !taken.insert(destination.clone()) {
                return Err(Error::Integrity(format!(
                    "two containers restore to {}",
                    relative
                )));
            }
            if occupied(&destination) {
                return Err(Error::InvalidInput(format!(
                    "{} already exists",
                    destination.display()
                )));
            }
            restores.push((container.clone(), relative, destination));
        }

        let crypto = SecureCrypto::new();
        let mut jobs = Vec::with_capacity(restores.len());
        for (container, relative, destination) in restores {
            let temp = loop {
                let candidate = layout::tagged_temp_path(
                    &destination,
                    &crypto.secure_filename(TEMP_TAG_LENGTH),
                );
                if !occupied(&candidate) && taken.insert(candidate.clone()) {
                    break candidate;
                }
            };
            jobs.push(UnlockJob {
                container,
                relative,
                temp,
                destination,
            });
        }
        ensure_not_cancelled(cancel)?;

        self.events.state(OperationState::Processing);
        let mut created_dirs = Vec::new();
        for job in &jobs {
            if let Some(parent) = job.destination.parent() {
                if let Err(e) = create_dirs(parent, &mut created_dirs) {
                    remove_dirs(&created_dirs);
                    return Err(e);
                }
            }
        }

        let renames: Vec<(PathBuf, PathBuf)> = jobs
            .iter()
            .map(|job| (job.temp.clone(), job.destination.clone()))
            .collect();

        let outputs = Arc::new(TempOutputs::default());
        let context = Arc::new(UnlockContext {
            outputs: Arc::clone(&outputs),
            master_key,
            cipher: FileCipher::new().with_chunk_size(self.config.chunk_size),
            events: self.events.clone(),
        });
        let batch = self
            .run_batch(jobs, cancel, move |job: UnlockJob, halt: &CancellationToken| {
                decrypt_file(&job, &context, halt)
            })
            .await;
        let rollback = || {
            outputs.remove_all();
            remove_dirs(&created_dirs);
        };
        let bytes: u64 = match batch {
            Ok(sizes) => sizes.into_iter().sum(),
            Err(err) => {
                rollback();
                return Err(err);
            }
        };
        if cancel.is_cancelled() {
            rollback();
            return Err(Error::Cancelled);
        }

        self.events.state(OperationState::Committing);
        if let Err(err) = commit(&renames) {
            remove_dirs(&created_dirs);
            return Err(err);
        }

        self.events.state(OperationState::CleaningUp);
        self.shred_all(containers).await;
        let restored_path = if is_folder {
            match layout::strip_marker(&target) {
                Some(original) if !original.exists() => match std::fs::rename(&target, &original) {
                    Ok(()) => original,
                    Err(e) => {
                        self.events.warn(format!(
                            "Could not remove the lock marker from {}: {}",
                            target.display(),
                            e
                        ));
                        target.clone()
                    }
                },
                Some(original) => {
                    self.events.warn(format!(
                        "{} already exists, keeping {}",
                        original.display(),
                        target.display()
                    ));
                    target.clone()
                }
                None => target.clone(),
            }
        } else {
            renames[0].1.clone()
        };

        // Folders are registered under their unmarked name even when the
        // marker could not be stripped.
        let original_path = if is_folder {
            layout::strip_marker(&target).unwrap_or_else(|| target.clone())
        } else {
            restored_path.clone()
        };
        if let Err(e) = self.registry.remove(&original_path) {
            self.events.warn(format!(
                "Could not remove {} from the registry: {}",
                original_path.display(),
                e
            ));
        }

        self.events.info(format!(
            "Unlocked {} files ({})",
            renames.len(),
            format_size(bytes)
        ));
        Ok(UnlockOutcome {
            restored_path,
            files: renames.len(),
            bytes,
        })
    }

    async fn derive_master_key(&self, password: &SecureBuffer, salt: &Salt) -> Result<MasterKey> {
        let password = Zeroizing::new(password.as_bytes()?.to_vec());
        let salt = salt.clone();
        let params = self.config.kdf.clone();
        tokio::task::spawn_blocking(move || derive_key(&password, &salt, &params))
            .await
            .map_err(join_error)?
    }

    /// Run `work` over `jobs` with at most `max_parallelism` in flight.
    ///
    /// The first failure cancels a child token so no further jobs start and
    /// in-flight ones stop at their next chunk. Returns every job's output
    /// only if all of them succeeded.
    async fn run_batch<J, T, F>(
        &self,
        jobs: Vec<J>,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<Vec<T>>
    where
        J: Send + 'static,
        T: Send + 'static,
        F: Fn(J, &CancellationToken) -> Result<T> + Send + Sync + 'static,
    {
        let total = jobs.len();
        let halt = cancel.child_token();
        let work = Arc::new(work);

        let mut results = stream::iter(jobs.into_iter().map(|job| {
            let work = Arc::clone(&work);
            let halt = halt.clone();
            async move {
                if halt.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let token = halt.clone();
                let result = tokio::task::spawn_blocking(move || (*work)(job, &token))
                    .await
                    .map_err(join_error)
                    .and_then(|r| r);
                if result.is_err() {
                    halt.cancel();
                }
                result
            }
        }))
        .buffer_unordered(self.config.parallelism());

        let mut completed = Vec::with_capacity(total);
        let mut failed = 0;
        let mut first_error = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(output) => {
                    completed.push(output);
                    self.events.progress(completed.len(), total);
                }
                Err(Error::Cancelled) => {}
                Err(err) => {
                    failed += 1;
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(source) => Err(Error::Aggregate {
                failed,
                total,
                source: Box::new(source),
            }),
            None if completed.len() < total => Err(Error::Cancelled),
            None => Ok(completed),
        }
    }

    fn plan_containers(&self, dir: &Path, count: usize) -> Vec<PathBuf> {
        let crypto = SecureCrypto::new();
        let length = self.config.secure_name_length.max(MIN_SECURE_NAME_LENGTH);
        let mut taken = HashSet::with_capacity(count);
        let mut planned = Vec::with_capacity(count);
        while planned.len() < count {
            let container = layout::container_path(dir, &crypto.secure_filename(length));
            if !occupied(&container)
                && !occupied(&layout::temp_path(&container))
                && taken.insert(container.clone())
            {
                planned.push(container);
            }
        }
        planned
    }

    async fn shred_all(&self, paths: Vec<PathBuf>) {
        let deleter = Arc::clone(&self.deleter);
        let events = self.events.clone();
        let failed = tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .filter(|path| deleter.delete(path, &events).is_failed())
                .count()
        })
        .await;

        match failed {
            Ok(0) => {}
            Ok(n) => self
                .events
                .warn(format!("{} files could not be securely deleted", n)),
            Err(e) => self
                .events
                .error(format!("Secure deletion aborted: {}", join_error(e))),
        }
    }

    /// Remove directories left empty under `root`, deepest first.
    ///
    /// Directories still holding skipped entries such as symlinks stay.
    fn remove_empty_dirs(&self, root: &Path) {
        let dirs: Vec<PathBuf> = WalkDir::new(root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .collect();

        for dir in dirs {
            let is_empty = std::fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty {
                debug!("Keeping non-empty directory {}", dir.display());
                continue;
            }
            if let Err(e) = std::fs::remove_dir(&dir) {
                self.events
                    .warn(format!("Could not remove directory {}: {}", dir.display(), e));
            }
        }
    }

    fn fail(&self, err: Error) -> Error {
        if err.is_cancelled() {
            self.events.state(OperationState::Cancelled);
            self.events.warn("Operation cancelled, no changes were made");
        } else {
            self.events.state(OperationState::Failed);
            self.events.error(format!("Operation failed: {}", err));
        }
        err
    }
}

/// Parse the header of a container.
pub fn read_header(path: &Path) -> Result<FileHeader> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(e),
    })?;
    FileHeader::read_from(&mut BufReader::new(file))
}

/// Whether a container, or the first container of a folder, carries a
/// biometric-wrapped key.
pub fn uses_biometric(path: &Path) -> Result<bool> {
    let container = if path.is_dir() {
        layout::list_containers(path)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("no locked files in {}", path.display())))?
    } else {
        path.to_path_buf()
    };
    Ok(read_header(&container)?.is_biometric())
}

fn encrypt_file(job: &LockJob, ctx: &LockContext, cancel: &CancellationToken) -> Result<u64> {
    let result = (|| -> Result<u64> {
        let mut held = busy::acquire(&job.source)?;
        let length = held.len()?;
        let file_salt = SecureCrypto::new().file_salt();
        let file_key = ctx.master_key.derive_file_key(&job.relative, &file_salt)?;

        let mut header = FileHeader::seal(
            &ctx.master_key,
            ctx.global_salt.clone(),
            file_salt,
            &job.relative,
            length as i64,
        )?;
        if let Some(wrapped) = &ctx.wrapped_key {
            header = header.with_biometric_key(wrapped.clone());
        }

        write_temp(&ctx.outputs, &job.temp, |writer| {
            ctx.cipher
                .encrypt_stream(BufReader::new(held.file()), writer, &file_key, &header, cancel)
        })
    })();

    match &result {
        Ok(bytes) => ctx
            .events
            .info(format!("Encrypted {} ({})", job.relative, format_size(*bytes))),
        Err(Error::Cancelled) => debug!("Stopped encrypting {}", job.relative),
        Err(e) => ctx
            .events
            .error(format!("Failed to encrypt {}: {}", job.relative, e)),
    }
    result
}

fn decrypt_file(job: &UnlockJob, ctx: &UnlockContext, cancel: &CancellationToken) -> Result<u64> {
    let result = (|| -> Result<u64> {
        let mut held = busy::acquire(&job.container)?;
        let mut reader = BufReader::new(held.file());
        let header = FileHeader::read_from(&mut reader)?;
        let file_key = ctx.master_key.derive_file_key(&job.relative, &header.file_salt)?;

        write_temp(&ctx.outputs, &job.temp, |writer| {
            ctx.cipher.decrypt_stream(
                &mut reader,
                writer,
                &file_key,
                header.original_length as u64,
                cancel,
            )
        })
    })();

    match &result {
        Ok(bytes) => ctx
            .events
            .info(format!("Decrypted {} ({})", job.relative, format_size(*bytes))),
        Err(Error::Cancelled) => debug!("Stopped decrypting {}", job.relative),
        Err(e) => ctx
            .events
            .error(format!("Failed to decrypt {}: {}", job.relative, e)),
    }
    result
}

/// Create `temp`, fill it through `write` and flush it to disk.
fn write_temp<F>(outputs: &TempOutputs, temp: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<u64>,
{
    let file = outputs.create(temp)?;
    let mut writer = BufWriter::new(file);
    let written = write(&mut writer)?;
    let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(written)
}

/// Rename each temp output to its final name.
///
/// On failure the already committed outputs and the remaining temps are
/// removed, so the sources are the only copy left.
fn commit(renames: &[(PathBuf, PathBuf)]) -> Result<()> {
    for (i, (temp, destination)) in renames.iter().enumerate() {
        if let Err(e) = std::fs::rename(temp, destination) {
            let committed: Vec<PathBuf> = renames[..i].iter().map(|(_, d)| d.clone()).collect();
            let pending: Vec<PathBuf> = renames[i..].iter().map(|(t, _)| t.clone()).collect();
            remove_files(&committed);
            remove_files(&pending);
            return Err(match e.kind() {
                ErrorKind::PermissionDenied => Error::PermissionDenied(format!(
                    "cannot rename {} to {}",
                    temp.display(),
                    destination.display()
                )),
                _ => Error::Io(e),
            });
        }
    }
    Ok(())
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}

/// Create `dir` and its missing ancestors, recording each one created.
fn create_dirs(dir: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(path) = current {
        if path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        current = path.parent();
    }
    for path in missing.into_iter().rev() {
        std::fs::create_dir(&path)?;
        created.push(path);
    }
    Ok(())
}

/// Remove directories in reverse creation order.
fn remove_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(e) = std::fs::remove_dir(dir) {
            tracing::warn!("Could not remove directory {}: {}", dir.display(), e);
        }
    }
}

fn enumerate_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        } else if entry.path_is_symlink() {
            debug!("Skipping symlink {}", entry.path().display());
        }
    }
    Ok(files)
}

/// Whether anything, including a dangling symlink, exists at `path`.
fn occupied(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(e),
    })
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Worker(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LockEvent;
    use crate::registry::MemoryRepository;
    use crate::shred::DeletionPolicy;
    use fflocker_crypto::KdfParams;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct FixedSigner(&'static [u8]);

    impl BiometricSigner for FixedSigner {
        fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>> {
            let mut signature = self.0.to_vec();
            signature.extend_from_slice(challenge);
            Ok(signature)
        }
    }

    fn test_config() -> LockerConfig {
        let mut config = LockerConfig::default()
            .with_kdf(KdfParams::minimal())
            .with_chunk_size(64 * 1024)
            .with_parallelism(4);
        config.deletion = DeletionPolicy::immediate();
        config
    }

    fn orchestrator() -> (LockOrchestrator, Arc<MemoryRepository>) {
        let registry = Arc::new(MemoryRepository::new());
        (LockOrchestrator::new(test_config(), registry.clone()), registry)
    }

    fn password(text: &str) -> SecureBuffer {
        SecureBuffer::from_string(text.to_string())
    }

    /// Tree with `a.txt` (10 bytes) and `sub/b.bin` (5 MB).
    fn sample_tree(temp: &TempDir) -> PathBuf {
        let root = temp.path().canonicalize().unwrap().join("docs");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"0123456789").unwrap();
        let big: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(root.join("sub").join("b.bin"), big).unwrap();
        root
    }

    /// Relative path to contents for every file under `root`.
    fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                (
                    layout::relative_path(root, e.path()).unwrap(),
                    std::fs::read(e.path()).unwrap(),
                )
            })
            .collect()
    }

    fn has_temp_files(root: &Path) -> bool {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.path().to_string_lossy().ends_with(".tmp"))
    }

    #[tokio::test]
    async fn test_folder_round_trip() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let before = snapshot(&root);
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap();
        assert_eq!(locked.files, 2);
        assert_eq!(locked.bytes, 10 + 5 * 1024 * 1024);
        assert_eq!(locked.locked_path, layout::with_marker(&root));
        assert!(!root.exists());

        // Only flat, obfuscated containers remain.
        let containers = layout::list_containers(&locked.locked_path).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(snapshot(&locked.locked_path).len(), 2);
        for container in &containers {
            let name = container.file_stem().unwrap().to_str().unwrap();
            assert_eq!(name.len(), 32);
        }

        let unlocked = locker
            .unlock(&locked.locked_path, Credential::Password(&password("P1")), &cancel)
            .await
            .unwrap();
        assert_eq!(unlocked.restored_path, root);
        assert_eq!(unlocked.files, 2);
        assert_eq!(snapshot(&root), before);
        assert!(!locked.locked_path.exists());
    }

    #[tokio::test]
    async fn test_wrong_password_changes_nothing() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let before = snapshot(&root);
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap();
        let containers = snapshot(&locked.locked_path);

        let err = locker
            .unlock(&locked.locked_path, Credential::Password(&password("P2")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Authentication(_)));
        assert_eq!(snapshot(&locked.locked_path), containers);

        locker
            .unlock(&locked.locked_path, Credential::Password(&password("P1")), &cancel)
            .await
            .unwrap();
        assert_eq!(snapshot(&root), before);
    }

    #[tokio::test]
    async fn test_busy_file_rolls_back_lock() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let before = snapshot(&root);
        let (locker, registry) = orchestrator();

        let _holder = busy::acquire(&root.join("a.txt")).unwrap();
        let err = locker
            .lock(&root, &password("P1"), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Aggregate { .. }));
        assert!(matches!(err.root(), Error::ResourceBusy(_)));
        assert_eq!(snapshot(&root), before);
        assert!(layout::list_containers(&root).unwrap().is_empty());
        assert!(!has_temp_files(&root));
        assert!(registry.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_lock_rolls_back() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let before = snapshot(&root);
        let (sink, mut rx) = EventSink::channel();
        let (locker, _) = orchestrator();
        let locker = locker.with_events(sink);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(snapshot(&root), before);
        assert!(!has_temp_files(&root));

        let mut last_state = None;
        while let Ok(event) = rx.try_recv() {
            if let LockEvent::State(state) = event {
                last_state = Some(state);
            }
        }
        assert_eq!(last_state, Some(OperationState::Cancelled));
    }

    #[tokio::test]
    async fn test_tampered_container_rolls_back_unlock() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap();
        let containers = layout::list_containers(&locked.locked_path).unwrap();
        let largest = containers
            .iter()
            .max_by_key(|c| std::fs::metadata(c).unwrap().len())
            .unwrap();
        let mut bytes = std::fs::read(largest).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x01;
        std::fs::write(largest, &bytes).unwrap();
        let tampered = snapshot(&locked.locked_path);

        let err = locker
            .unlock(&locked.locked_path, Credential::Password(&password("P1")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Authentication(_)));

        // Containers untouched, restored directories and temps removed.
        assert_eq!(snapshot(&locked.locked_path), tampered);
        assert!(!locked.locked_path.join("sub").exists());
        assert!(!locked.locked_path.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_single_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().canonicalize().unwrap();
        let file = dir.join("notes.txt");
        std::fs::write(&file, b"private notes").unwrap();
        let (locker, registry) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&file, &password("pw"), None, &cancel).await.unwrap();
        assert!(!file.exists());
        assert_eq!(locked.locked_path.parent().unwrap(), dir);
        assert!(layout::is_container(&locked.locked_path));

        let records = registry.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_path, file);
        assert!(!records[0].is_folder);

        let unlocked = locker
            .unlock(&locked.locked_path, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap();
        assert_eq!(unlocked.restored_path, file);
        assert_eq!(std::fs::read(&file).unwrap(), b"private notes");
        assert!(!locked.locked_path.exists());
        assert!(registry.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().canonicalize().unwrap().join("empty");
        std::fs::write(&file, b"").unwrap();
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&file, &password("pw"), None, &cancel).await.unwrap();
        locker
            .unlock(&locked.locked_path, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_unlock_with_master_key() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let before = snapshot(&root);
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap();
        let header = read_header(&layout::list_containers(&locked.locked_path).unwrap()[0]).unwrap();
        let key = derive_key(b"P1", &header.global_salt, &KdfParams::minimal()).unwrap();

        locker
            .unlock(&locked.locked_path, Credential::MasterKey(&key), &cancel)
            .await
            .unwrap();
        assert_eq!(snapshot(&root), before);
    }

    #[tokio::test]
    async fn test_biometric_unlock() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let before = snapshot(&root);
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();
        let signer = FixedSigner(b"device-credential");

        let locked = locker
            .lock(&root, &password("P1"), Some(&signer), &cancel)
            .await
            .unwrap();
        assert!(uses_biometric(&locked.locked_path).unwrap());

        let err = locker
            .unlock(
                &locked.locked_path,
                Credential::Biometric(&FixedSigner(b"other-credential")),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        locker
            .unlock(&locked.locked_path, Credential::Biometric(&signer), &cancel)
            .await
            .unwrap();
        assert_eq!(snapshot(&root), before);
    }

    #[tokio::test]
    async fn test_biometric_unlock_requires_wrapped_key() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap();
        assert!(!uses_biometric(&locked.locked_path).unwrap());

        let err = locker
            .unlock(
                &locked.locked_path,
                Credential::Biometric(&FixedSigner(b"device")),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_registry_tracks_folder() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let (locker, registry) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap();
        let records = registry.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_path, root);
        assert_eq!(records[0].locked_path, locked.locked_path);
        assert!(records[0].is_folder);

        locker
            .unlock(&locked.locked_path, Credential::Password(&password("P1")), &cancel)
            .await
            .unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_guards() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().canonicalize().unwrap();
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let empty = base.join("empty");
        std::fs::create_dir(&empty).unwrap();
        let err = locker.lock(&empty, &password("pw"), None, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = locker
            .unlock(&empty, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = locker
            .lock(&base.join("missing"), &password("pw"), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let file = base.join("f.txt");
        std::fs::write(&file, b"data").unwrap();
        let locked = locker.lock(&file, &password("pw"), None, &cancel).await.unwrap();
        let err = locker
            .lock(&locked.locked_path, &password("pw"), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unlock_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().canonicalize().unwrap().join("a.txt");
        std::fs::write(&file, b"original").unwrap();
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&file, &password("pw"), None, &cancel).await.unwrap();
        std::fs::write(&file, b"newer").unwrap();

        let err = locker
            .unlock(&locked.locked_path, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(std::fs::read(&file).unwrap(), b"newer");
        assert!(locked.locked_path.exists());
    }

    #[tokio::test]
    async fn test_mixed_items_are_rejected() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().canonicalize().unwrap();
        std::fs::write(dir.join("one.txt"), b"1").unwrap();
        std::fs::write(dir.join("two.txt"), b"2").unwrap();
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        // Two separate locks leave two containers with different salts.
        locker.lock(&dir.join("one.txt"), &password("pw"), None, &cancel).await.unwrap();
        locker.lock(&dir.join("two.txt"), &password("pw"), None, &cancel).await.unwrap();

        let err = locker
            .unlock(&dir, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(layout::list_containers(&dir).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_reaches_completion() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let (sink, mut rx) = EventSink::channel();
        let (locker, _) = orchestrator();
        let locker = locker.with_events(sink);

        locker
            .lock(&root, &password("P1"), None, &CancellationToken::new())
            .await
            .unwrap();

        let mut progress = Vec::new();
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                LockEvent::Progress(p) => progress.push(p),
                LockEvent::State(s) => states.push(s),
                LockEvent::Log { .. } => {}
            }
        }
        assert_eq!(progress, vec![50, 100]);
        assert_eq!(
            states,
            vec![
                OperationState::Idle,
                OperationState::DerivingKey,
                OperationState::Processing,
                OperationState::Committing,
                OperationState::CleaningUp,
                OperationState::Done,
            ]
        );
    }

    /// `count` files of `size` bytes spread over four subdirectories.
    fn many_files(temp: &TempDir, count: usize, size: usize) -> PathBuf {
        let root = temp.path().canonicalize().unwrap().join("bulk");
        for i in 0..count {
            let dir = root.join(format!("d{}", i % 4));
            std::fs::create_dir_all(&dir).unwrap();
            let data: Vec<u8> = (0..size).map(|b| ((b + i) % 253) as u8).collect();
            std::fs::write(dir.join(format!("f{}.bin", i)), data).unwrap();
        }
        root
    }

    /// Small chunks and two workers keep a batch in flight long enough to cancel.
    fn slow_orchestrator(registry: Arc<MemoryRepository>) -> LockOrchestrator {
        let config = test_config().with_chunk_size(4096).with_parallelism(2);
        LockOrchestrator::new(config, registry)
    }

    /// Cancel `cancel` as soon as the first file completes.
    fn cancel_on_first_progress(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<LockEvent>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let LockEvent::Progress(_) = event {
                    cancel.cancel();
                    break;
                }
            }
        });
    }

    fn has_containers(root: &Path) -> bool {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| layout::is_container(e.path()))
    }

    #[tokio::test]
    async fn test_unlock_leaves_user_temp_file_alone() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().canonicalize().unwrap();
        let file = dir.join("notes.txt");
        let user_temp = dir.join("notes.txt.tmp");
        std::fs::write(&file, b"private notes").unwrap();
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&file, &password("pw"), None, &cancel).await.unwrap();
        std::fs::write(&user_temp, b"USER DATA").unwrap();

        // A failed unlock rolls back only what it wrote.
        let mut bytes = std::fs::read(&locked.locked_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&locked.locked_path, &bytes).unwrap();
        let err = locker
            .unlock(&locked.locked_path, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Authentication(_)));
        assert_eq!(std::fs::read(&user_temp).unwrap(), b"USER DATA");
        assert!(!file.exists());

        bytes[last] ^= 0x01;
        std::fs::write(&locked.locked_path, &bytes).unwrap();
        locker
            .unlock(&locked.locked_path, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"private notes");
        assert_eq!(std::fs::read(&user_temp).unwrap(), b"USER DATA");
        let entries = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[tokio::test]
    async fn test_round_trip_with_temp_like_names() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap().join("names");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"AAAA").unwrap();
        std::fs::write(root.join("a.txt.tmp"), b"BBBB").unwrap();
        std::fs::write(root.join("sub").join("x"), b"CCCC").unwrap();
        std::fs::write(root.join("sub").join("x.tmp"), b"DDDD").unwrap();
        let before = snapshot(&root);
        let (locker, _) = orchestrator();
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let locked = locker.lock(&root, &password("pw"), None, &cancel).await.unwrap();
            assert_eq!(locked.files, 4);
            let unlocked = locker
                .unlock(&locked.locked_path, Credential::Password(&password("pw")), &cancel)
                .await
                .unwrap();
            assert_eq!(unlocked.restored_path, root);
            assert_eq!(snapshot(&root), before);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_cancelled_mid_batch_rolls_back() {
        let temp = TempDir::new().unwrap();
        let root = many_files(&temp, 40, 256 * 1024);
        let before = snapshot(&root);
        let (sink, rx) = EventSink::channel();
        let locker = slow_orchestrator(Arc::new(MemoryRepository::new())).with_events(sink);
        let cancel = CancellationToken::new();
        cancel_on_first_progress(rx, cancel.clone());

        let err = locker.lock(&root, &password("pw"), None, &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(snapshot(&root), before);
        assert!(!has_containers(&root));
        assert!(!has_temp_files(&root));
        assert!(!layout::with_marker(&root).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unlock_cancelled_mid_batch_rolls_back() {
        let temp = TempDir::new().unwrap();
        let root = many_files(&temp, 40, 256 * 1024);
        let registry = Arc::new(MemoryRepository::new());
        let cancel = CancellationToken::new();
        let locked = slow_orchestrator(registry.clone())
            .lock(&root, &password("pw"), None, &cancel)
            .await
            .unwrap();
        let containers = snapshot(&locked.locked_path);

        let (sink, rx) = EventSink::channel();
        let locker = slow_orchestrator(registry.clone()).with_events(sink);
        cancel_on_first_progress(rx, cancel.clone());
        let err = locker
            .unlock(&locked.locked_path, Credential::Password(&password("pw")), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(snapshot(&locked.locked_path), containers);
        assert!(!has_temp_files(&locked.locked_path));
        // No restored subdirectories survive the rollback.
        for entry in std::fs::read_dir(&locked.locked_path).unwrap() {
            assert!(entry.unwrap().file_type().unwrap().is_file());
        }
        assert!(!root.exists());
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_keeps_directories_with_skipped_entries_quietly() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().canonicalize().unwrap();
        let outside = base.join("outside.txt");
        std::fs::write(&outside, b"not locked").unwrap();
        let root = base.join("linked");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("top.txt"), b"top").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("sub").join("link")).unwrap();
        let (sink, mut rx) = EventSink::channel();
        let (locker, _) = orchestrator();
        let locker = locker.with_events(sink);

        let locked = locker
            .lock(&root, &password("pw"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(locked.files, 1);
        assert!(locked.locked_path.join("sub").join("link").is_symlink());
        assert_eq!(std::fs::read(&outside).unwrap(), b"not locked");

        while let Ok(event) = rx.try_recv() {
            if let LockEvent::Log { level, message } = event {
                assert_ne!(level, crate::events::LogLevel::Warning, "{}", message);
            }
        }
    }

    #[tokio::test]
    async fn test_unlock_clears_registry_when_name_is_taken() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let before = snapshot(&root);
        let (locker, registry) = orchestrator();
        let cancel = CancellationToken::new();

        let locked = locker.lock(&root, &password("P1"), None, &cancel).await.unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
        std::fs::create_dir(&root).unwrap();

        let unlocked = locker
            .unlock(&locked.locked_path, Credential::Password(&password("P1")), &cancel)
            .await
            .unwrap();
        assert_eq!(unlocked.restored_path, locked.locked_path);
        assert_eq!(snapshot(&locked.locked_path), before);
        assert!(std::fs::read_dir(&root).unwrap().next().is_none());
        assert!(registry.list().unwrap().is_empty());
    }
}
