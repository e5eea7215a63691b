use crate::models::MountState;
use camino::{Utf8Path, Utf8PathBuf};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use thiserror::Error;

/// Source name shown for the memory filesystem in `/proc/mounts`.
pub const MEMORY_FS_SOURCE: &str = "logrunner";

/// Errors raised while creating or removing mounts
#[derive(Error, Debug)]
pub enum MountError {
    #[error("Failed to create mount point: {0}")]
    MountPoint(#[source] io::Error),

    #[error("Failed to remove mount point {path}: {source}")]
    RemoveMountPoint { path: Utf8PathBuf, source: io::Error },

    #[error("Failed to mount memory filesystem at {target}: {source}")]
    Memory { target: Utf8PathBuf, source: nix::Error },

    #[error("Failed to bind {from} over {target}: {source}")]
    Bind {
        from: Utf8PathBuf,
        target: Utf8PathBuf,
        source: nix::Error,
    },

    #[error("Failed to unmount {target}: {source}")]
    Unmount { target: Utf8PathBuf, source: nix::Error },

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: MountState,
    },
}

/// Capacity and root attributes of the memory filesystem.
///
/// Once bound, the root of the memory filesystem stands in for the active
/// directory itself, so it takes over that directory's mode and ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOptions {
    pub size_bytes: u64,
    /// Permission bits of the root, including setgid/sticky
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl MemoryOptions {
    /// Options copying mode and ownership from `active_path`.
    pub fn matching(active_path: &Utf8Path, size_bytes: u64) -> io::Result<Self> {
        let metadata = fs::metadata(active_path)?;
        Ok(Self {
            size_bytes,
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
        })
    }

    /// Data string handed to `mount(2)`.
    pub fn mount_data(&self) -> String {
        format!(
            "mode={:04o},uid={},gid={},size={}",
            self.mode, self.uid, self.gid, self.size_bytes
        )
    }
}

/// Kernel mount operations used by [`MountController`].
#[cfg_attr(test, mockall::automock)]
pub trait MountOps {
    /// Mount a memory filesystem described by `options` at `target`.
    fn mount_memory(&self, target: &Utf8Path, options: &MemoryOptions) -> Result<(), MountError>;

    /// Make `source` visible at `target`.
    fn bind(&self, source: &Utf8Path, target: &Utf8Path) -> Result<(), MountError>;

    fn unmount(&self, target: &Utf8Path) -> Result<(), MountError>;
}

/// Mount operations backed by `mount(2)` / `umount2(2)`. Requires `CAP_SYS_ADMIN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixMounts;

impl MountOps for NixMounts {
    fn mount_memory(&self, target: &Utf8Path, options: &MemoryOptions) -> Result<(), MountError> {
        let data = options.mount_data();
        mount(
            Some(MEMORY_FS_SOURCE),
            target.as_std_path(),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            Some(data.as_str()),
        )
        .map_err(|source| MountError::Memory {
            target: target.to_path_buf(),
            source,
        })
    }

    fn bind(&self, source: &Utf8Path, target: &Utf8Path) -> Result<(), MountError> {
        mount::<Path, Path, str, str>(
            Some(source.as_std_path()),
            target.as_std_path(),
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| MountError::Bind {
            from: source.to_path_buf(),
            target: target.to_path_buf(),
            source: e,
        })
    }

    // Lazy detach: writers still holding descriptors would otherwise make
    // the unmount fail with EBUSY.
    fn unmount(&self, target: &Utf8Path) -> Result<(), MountError> {
        umount2(target.as_std_path(), MntFlags::MNT_DETACH).map_err(|source| {
            MountError::Unmount {
                target: target.to_path_buf(),
                source,
            }
        })
    }
}

/// The private memory mount created by [`MountController::mount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub mount_point: Utf8PathBuf,
    pub size_bytes: u64,
}

/// Owns the memory mount and its bind over the active directory.
///
/// Tracks [`MountState`] and refuses out-of-order transitions. Teardown
/// always removes the bind before anything is written back underneath it,
/// and a second teardown is a no-op.
pub struct MountController {
    mounts: Box<dyn MountOps + Send>,
    state: MountState,
    handle: Option<MountHandle>,
    bound_over: Option<Utf8PathBuf>,
}

impl MountController {
    pub fn new(mounts: Box<dyn MountOps + Send>) -> Self {
        Self {
            mounts,
            state: MountState::Unmounted,
            handle: None,
            bound_over: None,
        }
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn handle(&self) -> Option<&MountHandle> {
        self.handle.as_ref()
    }

    /// Create a private temporary directory and mount a memory filesystem
    /// described by `options` there.
    ///
    /// On failure the temporary directory is removed again.
    pub fn mount(&mut self, options: MemoryOptions) -> Result<&MountHandle, MountError> {
        if self.state != MountState::Unmounted || self.handle.is_some() {
            return Err(self.invalid("mount memory filesystem"));
        }

        let dir = tempfile::Builder::new()
            .prefix("logrunner-")
            .tempdir()
            .map_err(MountError::MountPoint)?
            .keep();
        let mount_point = Utf8PathBuf::from_path_buf(dir).map_err(|dir| {
            MountError::MountPoint(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("mount point is not UTF-8: {}", dir.display()),
            ))
        })?;

        if let Err(e) = self.mounts.mount_memory(&mount_point, &options) {
            if let Err(rm) = fs::remove_dir(&mount_point) {
                tracing::warn!("Failed to remove mount point {}: {}", mount_point, rm);
            }
            return Err(e);
        }

        tracing::info!(
            "Memory filesystem mounted at {} ({})",
            mount_point,
            options.mount_data()
        );

        self.state = MountState::MemoryMounted;
        Ok(self.handle.insert(MountHandle {
            mount_point,
            size_bytes: options.size_bytes,
        }))
    }

    /// Layer the memory mount over `active_path`.
    pub fn bind(&mut self, active_path: &Utf8Path) -> Result<(), MountError> {
        let handle = match (&self.handle, self.state) {
            (Some(handle), MountState::MemoryMounted) => handle,
            _ => return Err(self.invalid("bind over active path")),
        };

        self.mounts.bind(&handle.mount_point, active_path)?;
        tracing::info!("Bound {} over {}", handle.mount_point, active_path);

        self.bound_over = Some(active_path.to_path_buf());
        self.state = MountState::BindMounted;
        Ok(())
    }

    /// Unwind both mounts in order, running `sync(memory, active)` between
    /// removing the bind and releasing the memory filesystem.
    ///
    /// `sync` only runs when the bind was removed successfully, otherwise it
    /// would copy the memory mount onto itself. Every other step is attempted
    /// regardless of earlier failures; the failures are returned.
    pub fn restore<F>(&mut self, sync: F) -> Vec<MountError>
    where
        F: FnOnce(&Utf8Path, &Utf8Path),
    {
        let mut errors = Vec::new();

        if self.state.is_torn_down() {
            return errors;
        }

        if self.state == MountState::BindMounted {
            match self.unbind() {
                Ok(()) => {
                    if let (Some(handle), Some(active)) = (&self.handle, &self.bound_over) {
                        sync(&handle.mount_point, active);
                    }
                }
                Err(e) => {
                    tracing::error!("{}; skipping copy-back", e);
                    errors.push(e);
                }
            }
        }

        if let Err(e) = self.release() {
            errors.push(e);
        }

        self.state = MountState::TornDown;
        errors
    }

    fn unbind(&mut self) -> Result<(), MountError> {
        if let Some(active) = &self.bound_over {
            self.mounts.unmount(active)?;
            tracing::info!("Unmounted bind over {}", active);
        }
        self.state = MountState::Unmounted;
        Ok(())
    }

    fn release(&mut self) -> Result<(), MountError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.mounts.unmount(&handle.mount_point)?;
        fs::remove_dir(&handle.mount_point).map_err(|source| MountError::RemoveMountPoint {
            path: handle.mount_point.clone(),
            source,
        })?;

        tracing::info!("Released memory filesystem at {}", handle.mount_point);
        Ok(())
    }

    fn invalid(&self, operation: &'static str) -> MountError {
        MountError::InvalidState {
            operation,
            state: self.state,
        }
    }
}
