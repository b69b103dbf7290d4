//! Hook and watchpoint records and their registry.
//!
//! Mutations are serialized by the EPT-level lock; the registry itself is a
//! pair of fixed-capacity slot arrays whose pointers are published with
//! atomic stores, so the violation handler can look entries up without
//! taking any lock.

use crate::platform::{ProcessId, PAGE_SIZE};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use x86_64::{PhysAddr, VirtAddr};

pub const MAX_HOOKS: usize = 64;
pub const MAX_WATCH_POINTS: usize = 64;
pub const ACCESS_RECORD_SLOTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HookKind {
    PageHook = 0,
    CodeWatch = 1,
}

/// Opaque handle returned by installation; required for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId {
    pub kind: HookKind,
    pub sequence: u32,
    pub base_pa: PhysAddr,
}

/// A split-view page hook.
///
/// Owns the fake execute view of one physical page. Allocated from
/// contiguous non-paged memory so `fake_page` has a stable physical address
/// the execute-view PT entry can reference.
#[repr(C, align(4096))]
pub struct EptHook {
    /// Original page contents with the patch bytes overlaid; mapped
    /// execute-only.
    pub fake_page: [u8; PAGE_SIZE],
    /// Last observed contents of the real page, used to carry legitimate
    /// writes over into the fake view.
    pub diff_page: [u8; PAGE_SIZE],
    pub id: HookId,
    pub physical_base_address: PhysAddr,
    pub source_vaddr: VirtAddr,
    /// Live PT entry this hook currently controls.
    pub target_page: *const AtomicU64,
    pub original_entry: u64,
    pub execute_entry: u64,
    pub readwrite_entry: u64,
    pub source_pid: ProcessId,
    pub target_pid: ProcessId,
}

impl EptHook {
    /// Merges bytes that legitimately changed in the real page into the fake
    /// view, so everything except the patch stays coherent.
    pub fn update_fake_page(&mut self, current: &[u8; PAGE_SIZE]) {
        for i in 0..PAGE_SIZE {
            if self.diff_page[i] != current[i] {
                self.diff_page[i] = current[i];
                self.fake_page[i] = current[i];
            }
        }
    }
}

/// An execute-only watchpoint; accesses other than instruction fetches are
/// recorded instead of remapped.
pub struct CodeWatchPoint {
    pub id: HookId,
    pub physical_base_address: PhysAddr,
    pub target_page: *const AtomicU64,
    pub original_entry: u64,
    pub source_pid: ProcessId,
    pub target_pid: ProcessId,
}

/// Best-effort ring of instruction pointers that touched watched pages.
/// Oldest entries are overwritten once the ring wraps.
pub struct AccessRing {
    slots: [AtomicU64; ACCESS_RECORD_SLOTS],
    next: AtomicUsize,
}

impl AccessRing {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicU64::new(0) }; ACCESS_RECORD_SLOTS],
            next: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, rip: u64) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % ACCESS_RECORD_SLOTS;
        self.slots[index].store(rip, Ordering::Relaxed);
    }

    /// Copies the recorded instruction pointers into `out` and returns how
    /// many were written.
    pub fn snapshot(&self, out: &mut [u64]) -> usize {
        let mut count = 0;
        for slot in self.slots.iter() {
            if count == out.len() {
                break;
            }
            let value = slot.load(Ordering::Relaxed);
            if value != 0 {
                out[count] = value;
                count += 1;
            }
        }
        count
    }

    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        self.next.store(0, Ordering::Relaxed);
    }
}

/// Physical-page-keyed lookup for hooks and watchpoints.
pub struct HookRegistry {
    hooks: [AtomicPtr<EptHook>; MAX_HOOKS],
    watch_points: [AtomicPtr<CodeWatchPoint>; MAX_WATCH_POINTS],
    next_sequence: AtomicU32,
    pub access_records: AccessRing,
}

impl HookRegistry {
    pub const fn new() -> Self {
        Self {
            hooks: [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_HOOKS],
            watch_points: [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_WATCH_POINTS],
            next_sequence: AtomicU32::new(1),
            access_records: AccessRing::new(),
        }
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn find_hook(&self, base_pa: PhysAddr) -> Option<NonNull<EptHook>> {
        for slot in self.hooks.iter() {
            let pointer = slot.load(Ordering::Acquire);
            if let Some(hook) = NonNull::new(pointer) {
                if unsafe { hook.as_ref() }.physical_base_address == base_pa {
                    return Some(hook);
                }
            }
        }
        None
    }

    pub fn find_watch_point(&self, base_pa: PhysAddr) -> Option<NonNull<CodeWatchPoint>> {
        for slot in self.watch_points.iter() {
            let pointer = slot.load(Ordering::Acquire);
            if let Some(watch_point) = NonNull::new(pointer) {
                if unsafe { watch_point.as_ref() }.physical_base_address == base_pa {
                    return Some(watch_point);
                }
            }
        }
        None
    }

    /// Publishes a hook. Fails when every slot is taken. The caller must
    /// hold the mutation lock.
    pub fn insert_hook(&self, hook: NonNull<EptHook>) -> bool {
        for slot in self.hooks.iter() {
            if slot.load(Ordering::Relaxed).is_null() {
                slot.store(hook.as_ptr(), Ordering::Release);
                return true;
            }
        }
        false
    }

    pub fn insert_watch_point(&self, watch_point: NonNull<CodeWatchPoint>) -> bool {
        for slot in self.watch_points.iter() {
            if slot.load(Ordering::Relaxed).is_null() {
                slot.store(watch_point.as_ptr(), Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Unpublishes the hook matching `id` and hands ownership back to the
    /// caller. The caller must hold the mutation lock.
    pub fn take_hook(&self, id: &HookId) -> Option<NonNull<EptHook>> {
        for slot in self.hooks.iter() {
            let pointer = slot.load(Ordering::Relaxed);
            if let Some(hook) = NonNull::new(pointer) {
                if unsafe { hook.as_ref() }.id == *id {
                    slot.store(core::ptr::null_mut(), Ordering::Release);
                    return Some(hook);
                }
            }
        }
        None
    }

    pub fn take_watch_point(&self, id: &HookId) -> Option<NonNull<CodeWatchPoint>> {
        for slot in self.watch_points.iter() {
            let pointer = slot.load(Ordering::Relaxed);
            if let Some(watch_point) = NonNull::new(pointer) {
                if unsafe { watch_point.as_ref() }.id == *id {
                    slot.store(core::ptr::null_mut(), Ordering::Release);
                    return Some(watch_point);
                }
            }
        }
        None
    }

    /// Unpublishes every hook `predicate` selects and passes ownership to
    /// `action`. The caller must hold the mutation lock.
    pub fn drain_hooks(
        &self,
        mut predicate: impl FnMut(&EptHook) -> bool,
        mut action: impl FnMut(NonNull<EptHook>),
    ) -> bool {
        let mut changed = false;
        for slot in self.hooks.iter() {
            let pointer = slot.load(Ordering::Relaxed);
            if let Some(hook) = NonNull::new(pointer) {
                if predicate(unsafe { hook.as_ref() }) {
                    slot.store(core::ptr::null_mut(), Ordering::Release);
                    action(hook);
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn drain_watch_points(
        &self,
        mut predicate: impl FnMut(&CodeWatchPoint) -> bool,
        mut action: impl FnMut(NonNull<CodeWatchPoint>),
    ) -> bool {
        let mut changed = false;
        for slot in self.watch_points.iter() {
            let pointer = slot.load(Ordering::Relaxed);
            if let Some(watch_point) = NonNull::new(pointer) {
                if predicate(unsafe { watch_point.as_ref() }) {
                    slot.store(core::ptr::null_mut(), Ordering::Release);
                    action(watch_point);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Visits every live hook. The caller must hold the mutation lock.
    pub fn for_each_hook(&self, mut visitor: impl FnMut(NonNull<EptHook>)) {
        for slot in self.hooks.iter() {
            if let Some(hook) = NonNull::new(slot.load(Ordering::Relaxed)) {
                visitor(hook);
            }
        }
    }

    pub fn for_each_watch_point(&self, mut visitor: impl FnMut(NonNull<CodeWatchPoint>)) {
        for slot in self.watch_points.iter() {
            if let Some(watch_point) = NonNull::new(slot.load(Ordering::Relaxed)) {
                visitor(watch_point);
            }
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks
            .iter()
            .filter(|slot| !slot.load(Ordering::Relaxed).is_null())
            .count()
    }

    pub fn watch_point_count(&self) -> usize {
        self.watch_points
            .iter()
            .filter(|slot| !slot.load(Ordering::Relaxed).is_null())
            .count()
    }
}
