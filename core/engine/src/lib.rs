//! Lock and unlock engine for FFLocker.
//!
//! [`LockOrchestrator`] turns files and folders into flat sets of
//! obfuscated, authenticated containers and back. Supporting modules cover
//! configuration, progress reporting, exclusive-access probing, secure
//! deletion and the registry of locked items.

pub mod busy;
pub mod config;
pub mod events;
pub mod layout;
pub mod orchestrator;
pub mod registry;
pub mod shred;

pub use config::{LockerConfig, FOLDER_MARKER, LOCKED_EXTENSION};
pub use events::{format_size, EventSink, LockEvent, LogLevel, OperationState};
pub use orchestrator::{
    read_header, uses_biometric, Credential, LockOrchestrator, LockOutcome, UnlockOutcome,
};
pub use registry::{LockedItemsRepository, MemoryRepository, SqliteRepository};
pub use shred::{DeletionOutcome, DeletionPolicy, PermissionElevator, SecureDeleter};
