//! Tenure Storage Module
//!
//! Storage primitives for boundary-change work units: where a unit lives,
//! who holds it, and how its storage tree moves between custody stages.
//!
//! # Modules
//!
//! - [`types`]: unit identifiers, stages, locations and actors
//! - [`locator`]: resolves a unit to its stage location ([`UnitLocator`])
//! - [`lock`]: advisory locks derived from the storage medium ([`LockManager`])
//! - [`relocation`]: moving, copying, archiving and sealing unit trees
//!   ([`StorageRelocator`])
//!
//! Locks are never recorded in a central table. A lock is an OS advisory lock
//! on a sibling lockfile, so a crashed holder releases it when the OS closes
//! the handle.

pub mod error;
pub mod locator;
pub mod lock;
pub mod relocation;
pub mod types;

#[cfg(test)]
mod types_properties;

pub use error::{IoOperation, LockOperation, StorageError, StorageResult};
pub use locator::{FsUnitLocator, UnitLocator};
pub use lock::{
    lock_path_for, FileLockManager, LockHolder, LockManager, LockOutcome, LockState, UnitLock,
};
pub use relocation::{FsRelocator, StorageRelocator};
pub use types::{Actor, Stage, StageRoots, UnitId, UnitLocation};
