//! OS-level port table bookkeeping.
//!
//! The allocator decides which ports a principal logically owns; a
//! [`PortKernel`] makes the host route those ports to the owning process.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use super::PortRange;

/// Errors raised by a [`PortKernel`].
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The requested range lies outside this process's local range.
    #[error("range {range} lies outside the local range {local}")]
    OutOfRange {
        /// Requested range.
        range: PortRange,
        /// Local range of this process.
        local: PortRange,
    },

    /// Part of the range is already assigned to another process.
    #[error("range {range} overlaps ports assigned to pid {owner}")]
    Assigned {
        /// Requested range.
        range: PortRange,
        /// Process currently holding the overlapping ports.
        owner: u64,
    },

    /// The range is not in the reserved list.
    #[error("range {0} is not reserved")]
    NotReserved(PortRange),

    /// Internal table lock was poisoned.
    #[error("port table unavailable: {0}")]
    Unavailable(String),
}

/// Capability to reserve and assign port ranges at the OS level.
///
/// Implementations must be `Send + Sync`; the registry and dispatcher
/// share one instance across tasks.
pub trait PortKernel: Send + Sync {
    /// Port range assigned to this process.
    ///
    /// # Errors
    ///
    /// Implementation-defined lookup failure.
    fn local_range(&self) -> Result<PortRange, KernelError>;

    /// Route `range` to the process `pid`.
    ///
    /// # Errors
    ///
    /// Fails if the range is outside the local range or held by another pid.
    fn reserve_range(&self, pid: u64, range: PortRange) -> Result<(), KernelError>;

    /// Withhold `range` from this process's own ephemeral use.
    ///
    /// # Errors
    ///
    /// Fails if the range is outside the local range.
    fn add_reserved(&self, range: PortRange) -> Result<(), KernelError>;

    /// Return `range` to this process and drop any child assignment on it.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotReserved`] if the range was never reserved.
    fn remove_reserved(&self, range: PortRange) -> Result<(), KernelError>;

    /// Drop every reservation and child assignment.
    ///
    /// # Errors
    ///
    /// Implementation-defined failure.
    fn clear_reserved(&self) -> Result<(), KernelError>;

    /// Whether a process with this id currently exists.
    fn process_alive(&self, pid: u64) -> bool;
}

#[derive(Debug, Default)]
struct PortTable {
    reserved: BTreeSet<PortRange>,
    children: BTreeMap<PortRange, u64>,
}

/// In-process port table.
///
/// Keeps reservations and child assignments in memory and probes
/// `/proc/<pid>` for liveness.
#[derive(Debug)]
pub struct LocalPortKernel {
    local: PortRange,
    proc_root: PathBuf,
    table: Mutex<PortTable>,
}

impl LocalPortKernel {
    /// Create a table for the given local range.
    pub fn new(local: PortRange) -> Self {
        Self {
            local,
            proc_root: PathBuf::from("/proc"),
            table: Mutex::new(PortTable::default()),
        }
    }

    /// Use a different directory in place of `/proc` for liveness checks.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Pid holding `port`, if any.
    pub fn owner_of(&self, port: u32) -> Option<u64> {
        let table = self.table.lock().ok()?;
        table
            .children
            .iter()
            .find(|(range, _)| range.contains(port))
            .map(|(_, pid)| *pid)
    }

    /// Whether `range` is currently in the reserved list.
    pub fn is_reserved(&self, range: PortRange) -> bool {
        self.table
            .lock()
            .map(|table| table.reserved.contains(&range))
            .unwrap_or(false)
    }

    fn check_local(&self, range: PortRange) -> Result<(), KernelError> {
        if range.lo < self.local.lo || range.hi > self.local.hi || range.lo >= range.hi {
            return Err(KernelError::OutOfRange {
                range,
                local: self.local,
            });
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PortTable>, KernelError> {
        self.table
            .lock()
            .map_err(|e| KernelError::Unavailable(e.to_string()))
    }
}

impl PortKernel for LocalPortKernel {
    fn local_range(&self) -> Result<PortRange, KernelError> {
        Ok(self.local)
    }

    fn reserve_range(&self, pid: u64, range: PortRange) -> Result<(), KernelError> {
        self.check_local(range)?;
        let mut table = self.lock()?;
        if let Some((_, owner)) = table
            .children
            .iter()
            .find(|(held, owner)| held.overlaps(&range) && (**owner != pid || **held != range))
        {
            return Err(KernelError::Assigned {
                range,
                owner: *owner,
            });
        }
        table.children.insert(range, pid);
        Ok(())
    }

    fn add_reserved(&self, range: PortRange) -> Result<(), KernelError> {
        self.check_local(range)?;
        self.lock()?.reserved.insert(range);
        Ok(())
    }

    fn remove_reserved(&self, range: PortRange) -> Result<(), KernelError> {
        let mut table = self.lock()?;
        table.children.remove(&range);
        if table.reserved.remove(&range) {
            Ok(())
        } else {
            Err(KernelError::NotReserved(range))
        }
    }

    fn clear_reserved(&self) -> Result<(), KernelError> {
        let mut table = self.lock()?;
        table.reserved.clear();
        table.children.clear();
        Ok(())
    }

    fn process_alive(&self, pid: u64) -> bool {
        pid != 0 && self.proc_root.join(pid.to_string()).exists()
    }
}
