//! Interface to the host-OS collaborator.
//!
//! The core never calls into the surrounding kernel directly. Contiguous
//! non-paged allocations, address translation, physical reads and cross-core
//! dispatch all go through the [`Platform`] trait, so the virtualization code
//! stays independent of the driver scaffolding it is embedded in.

use core::ptr::NonNull;
use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: usize = 4096;

/// Process identifier of the surrounding OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessId(pub u64);

/// Services the core consumes from its driver collaborator.
///
/// Implementations must tolerate calls from elevated interrupt levels for the
/// translation and read operations; the allocation and dispatch operations
/// are only invoked from passive-level paths.
pub trait Platform: Sync {
    /// Allocates zeroed, page-aligned, physically contiguous, non-pageable
    /// memory. Returns `None` when the allocator cannot satisfy contiguity.
    fn allocate_contiguous(&self, size: usize) -> Option<VirtAddr>;

    /// Releases a region obtained from [`Platform::allocate_contiguous`].
    ///
    /// # Safety
    /// `address` must come from `allocate_contiguous` with the same `size`,
    /// and nothing may reference the region afterwards.
    unsafe fn free_contiguous(&self, address: VirtAddr, size: usize);

    /// Translates a kernel virtual address. `None` if the address is not
    /// currently mapped.
    fn virt_to_phys(&self, address: VirtAddr) -> Option<PhysAddr>;

    /// Reverse translation; valid only for physical memory that already has
    /// a kernel mapping.
    fn phys_to_virt(&self, address: PhysAddr) -> Option<VirtAddr>;

    /// Copies `destination.len()` bytes from physical memory. Returns `false`
    /// when the range is not backed by accessible RAM.
    fn read_physical(&self, destination: &mut [u8], source: PhysAddr) -> bool;

    fn cpu_count(&self) -> usize;

    fn cpu_index(&self) -> usize;

    /// Runs `callback` exactly once on every logical processor, at elevated
    /// priority, and returns only after every invocation has completed.
    /// Cancellation is not supported; the callback must be bounded.
    fn for_each_cpu(&self, callback: &mut dyn FnMut());

    fn current_process_id(&self) -> ProcessId;

    /// Page-table root of the process currently scheduled on this CPU.
    fn current_process_cr3(&self) -> u64;

    /// Whether `process` is still alive.
    fn process_exists(&self, process: ProcessId) -> bool;

    /// Unrecoverable condition; must not return.
    fn fatal(&self, message: &str) -> !;
}

/// Allocates a zeroed `T` from contiguous non-paged memory.
///
/// # Safety
/// The all-zero bit pattern must be a valid `T`.
pub unsafe fn allocate_object<T>(platform: &dyn Platform) -> Option<NonNull<T>> {
    let address = platform.allocate_contiguous(core::mem::size_of::<T>())?;
    NonNull::new(address.as_mut_ptr::<T>())
}

/// Frees an object obtained from [`allocate_object`].
///
/// # Safety
/// Same contract as [`Platform::free_contiguous`].
pub unsafe fn free_object<T>(platform: &dyn Platform, object: NonNull<T>) {
    platform.free_contiguous(
        VirtAddr::from_ptr(object.as_ptr()),
        core::mem::size_of::<T>(),
    );
}
