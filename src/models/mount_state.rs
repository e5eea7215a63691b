use std::fmt;

/// Lifecycle of the memory mount.
///
/// Startup moves `Unmounted → MemoryMounted → BindMounted`. Shutdown moves
/// `BindMounted → Unmounted` (bind removed, content copied back) and then
/// `→ TornDown` once the memory filesystem and its mount point are gone.
/// `TornDown` is terminal.
///
/// The scan loop only runs in [`MountState::BindMounted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountState {
    #[default]
    Unmounted,
    MemoryMounted,
    BindMounted,
    TornDown,
}

impl MountState {
    /// Whether eviction is allowed to touch the active directory.
    pub fn is_serving(self) -> bool {
        self == MountState::BindMounted
    }

    pub fn is_torn_down(self) -> bool {
        self == MountState::TornDown
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountState::Unmounted => "unmounted",
            MountState::MemoryMounted => "memory-mounted",
            MountState::BindMounted => "bind-mounted",
            MountState::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}
