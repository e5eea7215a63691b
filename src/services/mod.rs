//! Services module - the buffering, eviction and mount lifecycle logic.
//!
//! Everything here is synchronous filesystem work driven by the
//! [`Engine`](crate::engine::Engine). The only async piece is the sleep
//! between scan cycles in [`ScanLoop::run`].
//!
//! # Components
//!
//! - [`MountController`]: Creates the private memory mount, binds it over the
//!   active directory and unwinds both in order. Kernel calls go through the
//!   [`MountOps`] trait ([`NixMounts`] in production).
//!
//! - [`TreeSeeder`]: Copies the active directory into the memory mount before
//!   the bind hides it, moving pre-existing archives straight to the archive
//!   store.
//!
//! - [`ScanLoop`]: Walks the active directory every [`SCAN_INTERVAL`] and hands
//!   files at or above the threshold to the evictor.
//!
//! - [`Evictor`]: Gzips a file's current content into generation 0 of its
//!   [`RotationChain`] (at most [`MAX_GENERATIONS`] kept) and truncates the
//!   live file in place.
//!
//! - [`sync`]: Writes the memory contents back to disk on shutdown.
//!
//! # Lifecycle
//!
//! 1. `MountController::mount` → memory filesystem at a private temp dir
//! 2. `TreeSeeder::seed` → working copy of the live logs in memory
//! 3. `MountController::bind` → memory mount visible at the active path
//! 4. `ScanLoop::run` → evict until stopped
//! 5. `sync::run` → unbind, copy back, release

pub mod evict;
pub mod mount;
pub mod scan;
pub mod seed;
pub mod sync;
pub mod tree;

pub use evict::{
    ARCHIVE_SUFFIX, Evictor, MAX_GENERATIONS, RetireError, RetireOutcome, RotationChain,
};
pub use mount::{MemoryOptions, MountController, MountError, MountHandle, MountOps, NixMounts};
pub use scan::{CycleReport, SCAN_INTERVAL, ScanLoop, TrackedFile};
pub use seed::{SeedError, SeedReport, TreeSeeder};
pub use sync::ShutdownReport;
