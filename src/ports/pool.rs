//! Logical allocation kept in step with the OS port table.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::{IntervalAllocator, KernelError, PortError, PortKernel, PortRange};

/// Failure from a [`PortPool`] operation.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Logical allocation failed.
    #[error(transparent)]
    Ports(#[from] PortError),

    /// OS-level bookkeeping failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// An [`IntervalAllocator`] behind one mutex, paired with a [`PortKernel`].
///
/// Every successful call leaves both sides agreeing on which ranges are
/// held. Failed calls unwind whatever they acquired.
pub struct PortPool {
    allocator: Mutex<IntervalAllocator>,
    kernel: Arc<dyn PortKernel>,
}

impl PortPool {
    /// Manage the kernel's local range.
    ///
    /// # Errors
    ///
    /// Propagates the kernel's local range lookup failure.
    pub fn from_kernel(kernel: Arc<dyn PortKernel>) -> Result<Self, KernelError> {
        let local = kernel.local_range()?;
        Ok(Self {
            allocator: Mutex::new(IntervalAllocator::new(local.lo, local.hi)),
            kernel,
        })
    }

    /// The kernel backing this pool.
    pub fn kernel(&self) -> &Arc<dyn PortKernel> {
        &self.kernel
    }

    /// Allocate `count` ports and route them to `pid`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ports`] when the space is exhausted; [`PoolError::Kernel`]
    /// when the OS side refuses, in which case the logical allocation is
    /// released again.
    pub fn allocate_n_ports(&self, pid: u64, count: u32) -> Result<PortRange, PoolError> {
        let range = self.with_allocator(|alloc| alloc.allocate(count))?;

        if let Err(err) = self.bind(pid, range) {
            self.unwind(range);
            return Err(err);
        }

        debug!(pid, lo = range.lo, hi = range.hi, "allocated port range");
        Ok(range)
    }

    /// Re-take an exact range for `pid`, used during recovery.
    ///
    /// The logical claim is authoritative: once the allocator accepts the
    /// range the call succeeds, and OS-side failures are only logged.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ports`] with [`PortError::RangeConflict`] if the range is
    /// unavailable.
    pub fn claim(&self, pid: u64, range: PortRange) -> Result<(), PoolError> {
        self.with_allocator(|alloc| alloc.allocate_exact(range))?;
        if let Err(err) = self.bind(pid, range) {
            warn!(pid, lo = range.lo, hi = range.hi, error = %err, "could not re-affirm OS reservation");
        }
        Ok(())
    }

    /// Return a range previously handed out by this pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ports`] if `range.lo` is not an allocation start. A
    /// kernel failure after the logical release is logged, not returned.
    pub fn release(&self, range: PortRange) -> Result<(), PoolError> {
        self.with_allocator(|alloc| alloc.deallocate(range.lo))?;
        if let Err(err) = self.kernel.remove_reserved(range) {
            warn!(lo = range.lo, hi = range.hi, error = %err, "kernel release failed");
        }
        debug!(lo = range.lo, hi = range.hi, "released port range");
        Ok(())
    }

    /// The managed span, or `None` when it is empty.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ports`] if the allocator lock is poisoned.
    pub fn bounds(&self) -> Result<Option<PortRange>, PoolError> {
        let (low, high) = self.with_allocator(|alloc| Ok(alloc.bounds()))?;
        Ok(PortRange::try_new(low, high))
    }

    /// Whether any port of `range` is held.
    pub fn is_allocated(&self, range: PortRange) -> bool {
        self.with_allocator(|alloc| Ok(alloc.is_range_allocated(range)))
            .unwrap_or(false)
    }

    /// Number of free intervals no wider than `upto`.
    pub fn report_fragmentation(&self, upto: u32) -> usize {
        self.with_allocator(|alloc| Ok(alloc.report_fragmentation(upto)))
            .unwrap_or(0)
    }

    /// Copy of the allocator state.
    pub fn allocator_snapshot(&self) -> Option<IntervalAllocator> {
        self.allocator.lock().ok().map(|alloc| alloc.clone())
    }

    fn bind(&self, pid: u64, range: PortRange) -> Result<(), PoolError> {
        self.kernel.add_reserved(range)?;
        if let Err(err) = self.kernel.reserve_range(pid, range) {
            if let Err(undo) = self.kernel.remove_reserved(range) {
                warn!(lo = range.lo, hi = range.hi, error = %undo, "failed to undo reservation");
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn unwind(&self, range: PortRange) {
        if let Err(err) = self.with_allocator(|alloc| alloc.deallocate(range.lo)) {
            warn!(lo = range.lo, hi = range.hi, error = %err, "failed to unwind allocation");
        }
    }

    fn with_allocator<T>(
        &self,
        f: impl FnOnce(&mut IntervalAllocator) -> Result<T, PortError>,
    ) -> Result<T, PortError> {
        let mut alloc = self
            .allocator
            .lock()
            .map_err(|e| PortError::Inconsistent(format!("allocator lock poisoned: {e}")))?;
        f(&mut alloc)
    }
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool")
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}
