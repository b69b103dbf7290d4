//! Extended page tables.
//!
//! A single identity-mapped PML4 shared by every logical processor, built
//! from 2 MiB leaves and refined on demand to 4 KiB granularity. The
//! violation handler below implements the split-view protocol: hooked pages
//! carry one execute-only view backed by a fake page and one read/write-only
//! view backed by the original frame, and each CPU flips between them as the
//! guest's access type demands.

use crate::cpu;
use crate::hooks::{CodeWatchPoint, EptHook, HookId, HookKind, HookRegistry};
use crate::platform::{self, Platform, ProcessId, PAGE_SIZE};
use crate::vm_exit_handlers::GuestContext;
use crate::vmx::{self, InveptType};
use crate::HypervisorError;
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
const TABLE_ENTRY_COUNT: usize = 512;
const MAX_SPLITS: usize = 128;
const MAX_MTRR_RANGES: usize = 16;

pub const MEMORY_TYPE_UNCACHEABLE: u8 = 0;
pub const MEMORY_TYPE_WRITE_THROUGH: u8 = 4;
pub const MEMORY_TYPE_WRITE_BACK: u8 = 6;

pub fn page_align(address: u64) -> u64 {
    address & !0xFFF
}

pub fn page_offset(address: u64) -> u64 {
    address & 0xFFF
}

fn pt_index(address: u64) -> usize {
    ((address >> 12) & 0x1FF) as usize
}

fn pd_index(address: u64) -> usize {
    ((address >> 21) & 0x1FF) as usize
}

fn pdpt_index(address: u64) -> usize {
    ((address >> 30) & 0x1FF) as usize
}

fn pml4_index(address: u64) -> usize {
    ((address >> 39) & 0x1FF) as usize
}

/// One 8-byte EPT entry, any level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EptEntry(u64);

impl EptEntry {
    const READ: u64 = 1 << 0;
    const WRITE: u64 = 1 << 1;
    const EXECUTE: u64 = 1 << 2;
    const MEMORY_TYPE_MASK: u64 = 0x7 << 3;
    const IGNORE_PAT: u64 = 1 << 6;
    const LARGE_PAGE: u64 = 1 << 7;
    const SUPPRESS_VE: u64 = 1 << 63;
    const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn is_present(&self) -> bool {
        self.0 & (Self::READ | Self::WRITE | Self::EXECUTE) != 0
    }

    pub const fn read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub const fn write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub const fn execute(&self) -> bool {
        self.0 & Self::EXECUTE != 0
    }

    pub fn set_read(&mut self, value: bool) {
        self.set_flag(Self::READ, value);
    }

    pub fn set_write(&mut self, value: bool) {
        self.set_flag(Self::WRITE, value);
    }

    pub fn set_execute(&mut self, value: bool) {
        self.set_flag(Self::EXECUTE, value);
    }

    pub const fn large_page(&self) -> bool {
        self.0 & Self::LARGE_PAGE != 0
    }

    pub fn set_large_page(&mut self, value: bool) {
        self.set_flag(Self::LARGE_PAGE, value);
    }

    pub const fn ignore_pat(&self) -> bool {
        self.0 & Self::IGNORE_PAT != 0
    }

    pub fn set_ignore_pat(&mut self, value: bool) {
        self.set_flag(Self::IGNORE_PAT, value);
    }

    pub const fn suppress_ve(&self) -> bool {
        self.0 & Self::SUPPRESS_VE != 0
    }

    pub fn set_suppress_ve(&mut self, value: bool) {
        self.set_flag(Self::SUPPRESS_VE, value);
    }

    pub const fn memory_type(&self) -> u8 {
        ((self.0 & Self::MEMORY_TYPE_MASK) >> 3) as u8
    }

    pub fn set_memory_type(&mut self, memory_type: u8) {
        self.0 = (self.0 & !Self::MEMORY_TYPE_MASK) | ((memory_type as u64 & 0x7) << 3);
    }

    pub const fn frame(&self) -> PhysAddr {
        PhysAddr::new_truncate(self.0 & Self::FRAME_MASK)
    }

    pub fn set_frame(&mut self, frame: PhysAddr) {
        self.0 = (self.0 & !Self::FRAME_MASK) | (frame.as_u64() & Self::FRAME_MASK);
    }

    fn set_flag(&mut self, flag: u64, value: bool) {
        if value {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

bitflags! {
    /// EPT violation exit qualification.
    pub struct EptViolationQualification: u64 {
        const READ_ACCESS = 1 << 0;
        const WRITE_ACCESS = 1 << 1;
        const EXECUTE_ACCESS = 1 << 2;
        const EPT_READABLE = 1 << 3;
        const EPT_WRITABLE = 1 << 4;
        const EPT_EXECUTABLE = 1 << 5;
        const GUEST_LINEAR_ADDRESS_VALID = 1 << 7;
        const CAUSED_BY_TRANSLATION = 1 << 8;
    }
}

/// One page of EPT entries.
#[repr(C, align(4096))]
pub struct EptTable {
    pub entries: [AtomicU64; TABLE_ENTRY_COUNT],
}

/// The statically shaped part of the tree: one PML4, one PDPT, 512 page
/// directories covering 512 GiB with 2 MiB leaves.
#[repr(C, align(4096))]
struct EptTables {
    pml4: EptTable,
    pdpt: EptTable,
    pd: [EptTable; TABLE_ENTRY_COUNT],
}

/// A 4 KiB page table created when a 2 MiB leaf is refined.
#[repr(C, align(4096))]
pub struct EptSplit {
    pt: EptTable,
}

/// Snapshot of the variable-range MTRRs, read once at enable time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MtrrRange {
    pub enabled: bool,
    pub memory_type: u8,
    pub base: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MtrrSnapshot {
    pub ranges: [MtrrRange; MAX_MTRR_RANGES],
}

impl MtrrSnapshot {
    /// Reads the variable-range MTRRs of the current CPU.
    pub fn capture() -> Self {
        let mut snapshot = Self::default();
        let capabilities = unsafe { cpu::rdmsr(cpu::IA32_MTRR_CAPABILITIES) };
        let range_count = (capabilities & 0xFF) as usize;

        for (i, range) in snapshot
            .ranges
            .iter_mut()
            .enumerate()
            .take(range_count.min(MAX_MTRR_RANGES))
        {
            let base = unsafe { cpu::rdmsr(cpu::IA32_MTRR_PHYSBASE0 + i as u32 * 2) };
            let mask = unsafe { cpu::rdmsr(cpu::IA32_MTRR_PHYSMASK0 + i as u32 * 2) };

            range.memory_type = (base & 0xFF) as u8;
            range.enabled = mask & (1 << 11) != 0;
            if range.enabled {
                range.base = base & 0x000F_FFFF_FFFF_F000;
                let length = 1u64 << (mask & 0x000F_FFFF_FFFF_F000).trailing_zeros();
                range.end = range.base + length - 1;
            }
        }

        snapshot
    }

    /// Effective memory type of one 2 MiB region. Overlapping ranges resolve
    /// strongest-wins: UC beats WT beats everything else; WB is the default.
    pub fn memory_type_for(&self, large_page_base: u64) -> u8 {
        let mut memory_type = MEMORY_TYPE_WRITE_BACK;
        let region_end = large_page_base + (LARGE_PAGE_SIZE - 1);

        for range in self.ranges.iter() {
            if !range.enabled || region_end < range.base || large_page_base > range.end {
                continue;
            }

            match range.memory_type {
                MEMORY_TYPE_UNCACHEABLE => return MEMORY_TYPE_UNCACHEABLE,
                MEMORY_TYPE_WRITE_THROUGH => memory_type = MEMORY_TYPE_WRITE_THROUGH,
                other => {
                    if memory_type == MEMORY_TYPE_WRITE_BACK {
                        memory_type = other;
                    }
                }
            }
        }

        memory_type
    }
}

/// A page-content snapshot that lets a hook be installed later without
/// probing a foreign address space again.
pub struct TranslationHint {
    pub page: [u8; PAGE_SIZE],
    pub physical_base_address: PhysAddr,
    pub virtual_base_address: VirtAddr,
}

/// Walks the current address space and snapshots every page `destination`
/// spans.
pub fn generate_translation_hints(
    platform: &dyn Platform,
    destination: VirtAddr,
    length: usize,
) -> Result<Vec<TranslationHint>, HypervisorError> {
    let mut hints = Vec::new();

    let mut current = destination.as_u64();
    let mut remaining = length;

    while remaining != 0 {
        let aligned = page_align(current);
        let offset = page_offset(current) as usize;
        let chunk = remaining.min(PAGE_SIZE - offset);

        let physical_base = platform
            .virt_to_phys(VirtAddr::new_truncate(aligned))
            .ok_or(HypervisorError::AddressTranslationFailed)?;

        let mut hint = TranslationHint {
            page: [0; PAGE_SIZE],
            physical_base_address: physical_base,
            virtual_base_address: VirtAddr::new_truncate(aligned),
        };
        if !platform.read_physical(&mut hint.page, physical_base) {
            return Err(HypervisorError::AddressTranslationFailed);
        }
        hints.push(hint);

        remaining -= chunk;
        current += chunk as u64;
    }

    Ok(hints)
}

/// The EPT engine: identity tables, splits, and the hook registry.
pub struct Ept {
    platform: &'static dyn Platform,
    tables: NonNull<EptTables>,
    tables_physical: PhysAddr,
    splits: [AtomicPtr<EptSplit>; MAX_SPLITS],
    split_count: AtomicUsize,
    registry: HookRegistry,
    mutation: Mutex<()>,
}

// The tree and the registry are designed for concurrent access from every
// logical processor; all shared mutation is atomic or serialized by
// `mutation`.
unsafe impl Send for Ept {}
unsafe impl Sync for Ept {}

impl Ept {
    pub fn new(platform: &'static dyn Platform) -> Result<Self, HypervisorError> {
        let tables = unsafe { platform::allocate_object::<EptTables>(platform) }
            .ok_or(HypervisorError::AllocationFailed)?;
        let tables_physical = platform
            .virt_to_phys(VirtAddr::from_ptr(tables.as_ptr()))
            .ok_or(HypervisorError::AddressTranslationFailed)?;

        Ok(Self {
            platform,
            tables,
            tables_physical,
            splits: [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_SPLITS],
            split_count: AtomicUsize::new(0),
            registry: HookRegistry::new(),
            mutation: Mutex::new(()),
        })
    }

    fn tables(&self) -> &EptTables {
        unsafe { self.tables.as_ref() }
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// EPTP value: write-back, 4-level walk.
    pub fn pointer(&self) -> u64 {
        self.tables_physical.as_u64() | (3 << 3) | u64::from(MEMORY_TYPE_WRITE_BACK)
    }

    /// Invalidates this EPT context on the current logical processor.
    ///
    /// # Safety
    /// The CPU must be in VMX operation. In non-root mode the instruction
    /// traps and the dispatcher performs the invalidation on our behalf.
    pub unsafe fn invalidate(&self) {
        vmx::invept(InveptType::SingleContext, self.pointer());
    }

    /// (Re-)builds the identity map: every 2 MiB of the first 512 GiB mapped
    /// onto itself with MTRR-derived memory types. Existing splits are
    /// discarded; hooks must be re-armed afterwards.
    pub fn initialize(&self, mtrr: &MtrrSnapshot) {
        let _guard = self.mutation.lock();

        self.free_splits();

        let tables = self.tables();
        let base = self.tables_physical.as_u64();
        let pdpt_physical = base + PAGE_SIZE as u64;
        let pd_physical = |i: u64| base + 2 * PAGE_SIZE as u64 + i * PAGE_SIZE as u64;

        let mut pml4e = EptEntry::new();
        pml4e.set_read(true);
        pml4e.set_write(true);
        pml4e.set_execute(true);
        pml4e.set_frame(PhysAddr::new_truncate(pdpt_physical));
        tables.pml4.entries[0].store(pml4e.bits(), Ordering::Relaxed);
        for entry in tables.pml4.entries.iter().skip(1) {
            entry.store(0, Ordering::Relaxed);
        }

        for (i, entry) in tables.pdpt.entries.iter().enumerate() {
            let mut pdpte = EptEntry::new();
            pdpte.set_read(true);
            pdpte.set_write(true);
            pdpte.set_execute(true);
            pdpte.set_frame(PhysAddr::new_truncate(pd_physical(i as u64)));
            entry.store(pdpte.bits(), Ordering::Relaxed);
        }

        for (i, pd) in tables.pd.iter().enumerate() {
            for (j, entry) in pd.entries.iter().enumerate() {
                let address = (i as u64 * TABLE_ENTRY_COUNT as u64 + j as u64) * LARGE_PAGE_SIZE;

                let mut pde = EptEntry::new();
                pde.set_read(true);
                pde.set_write(true);
                pde.set_execute(true);
                pde.set_large_page(true);
                pde.set_memory_type(mtrr.memory_type_for(address));
                pde.set_frame(PhysAddr::new_truncate(address));
                entry.store(pde.bits(), Ordering::Relaxed);
            }
        }
    }

    fn free_splits(&self) {
        for slot in self.splits.iter() {
            let pointer = slot.swap(core::ptr::null_mut(), Ordering::Relaxed);
            if let Some(split) = NonNull::new(pointer) {
                unsafe { platform::free_object(self.platform, split) };
            }
        }
        self.split_count.store(0, Ordering::Relaxed);
    }

    pub fn get_pd_entry(&self, address: PhysAddr) -> Option<&AtomicU64> {
        let address = address.as_u64();
        if pml4_index(address) != 0 {
            return None;
        }
        Some(&self.tables().pd[pdpt_index(address)].entries[pd_index(address)])
    }

    /// Resolves the 4 KiB PT entry for `address`; the covering 2 MiB leaf
    /// must already be split.
    pub fn get_pt_entry(&self, address: PhysAddr) -> Option<&AtomicU64> {
        let pd_entry = self.get_pd_entry(address)?;
        let entry = EptEntry::from_bits(pd_entry.load(Ordering::Relaxed));
        if !entry.is_present() || entry.large_page() {
            return None;
        }

        let table = self.platform.phys_to_virt(entry.frame())?;
        let table = unsafe { &*table.as_ptr::<EptTable>() };
        Some(&table.entries[pt_index(address.as_u64())])
    }

    /// Refines the 2 MiB leaf covering `address` into a 4 KiB page table.
    /// Idempotent in effect: an already-split directory entry is left alone.
    /// The caller must hold the mutation lock.
    fn split_large_page(&self, address: PhysAddr) -> Result<(), HypervisorError> {
        let pd_entry = self
            .get_pd_entry(address)
            .ok_or(HypervisorError::InvalidRequest)?;
        let leaf = EptEntry::from_bits(pd_entry.load(Ordering::Relaxed));
        if !leaf.large_page() {
            return Ok(());
        }

        let index = self.split_count.load(Ordering::Relaxed);
        if index == MAX_SPLITS {
            return Err(HypervisorError::AllocationFailed);
        }

        let split = unsafe { platform::allocate_object::<EptSplit>(self.platform) }
            .ok_or(HypervisorError::AllocationFailed)?;

        // Every PT entry inherits the leaf's memory type and permissions.
        let mut template = EptEntry::new();
        template.set_read(true);
        template.set_write(true);
        template.set_execute(true);
        template.set_memory_type(leaf.memory_type());
        template.set_ignore_pat(leaf.ignore_pat());
        template.set_suppress_ve(leaf.suppress_ve());

        let table = unsafe { &split.as_ref().pt };
        for (k, entry) in table.entries.iter().enumerate() {
            let mut pte = template;
            pte.set_frame(PhysAddr::new_truncate(
                leaf.frame().as_u64() + k as u64 * PAGE_SIZE as u64,
            ));
            entry.store(pte.bits(), Ordering::Relaxed);
        }

        let table_physical = match self
            .platform
            .virt_to_phys(VirtAddr::from_ptr(split.as_ptr()))
        {
            Some(physical) => physical,
            None => {
                unsafe { platform::free_object(self.platform, split) };
                return Err(HypervisorError::AddressTranslationFailed);
            }
        };

        let mut pointer = EptEntry::new();
        pointer.set_read(true);
        pointer.set_write(true);
        pointer.set_execute(true);
        pointer.set_frame(table_physical);

        // One-shot structural replacement of the leaf.
        pd_entry.store(pointer.bits(), Ordering::Release);

        self.splits[index].store(split.as_ptr(), Ordering::Release);
        self.split_count.store(index + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Installs (or extends) the hook covering one page of `destination`'s
    /// address space. The patch must not cross the page boundary.
    pub fn install_page_hook(
        &self,
        destination: VirtAddr,
        bytes: &[u8],
        source_pid: ProcessId,
        target_pid: ProcessId,
        hint: Option<&TranslationHint>,
    ) -> Result<HookId, HypervisorError> {
        let offset = page_offset(destination.as_u64()) as usize;
        if bytes.is_empty() || bytes.len() > PAGE_SIZE - offset {
            return Err(HypervisorError::InvalidRequest);
        }
        if !self.platform.process_exists(target_pid) {
            return Err(HypervisorError::ProcessGone);
        }

        let physical = match hint {
            Some(hint) => hint.physical_base_address.as_u64() + offset as u64,
            None => self
                .platform
                .virt_to_phys(VirtAddr::new_truncate(page_align(destination.as_u64())))
                .ok_or(HypervisorError::AddressTranslationFailed)?
                .as_u64()
                + offset as u64,
        };
        let base_pa = PhysAddr::new_truncate(page_align(physical));

        let _guard = self.mutation.lock();

        if let Some(existing) = self.registry.find_hook(base_pa) {
            let hook = unsafe { &mut *existing.as_ptr() };

            // The hook may have been parked on the original view (e.g. after
            // a wake); refresh the fake page and bring the data view back.
            let entry = unsafe { &*hook.target_page };
            if entry.load(Ordering::Relaxed) == hook.original_entry {
                self.read_hooked_page(base_pa, hint, &mut hook.fake_page)?;
                hook.diff_page = hook.fake_page;
                entry.store(hook.readwrite_entry, Ordering::Release);
            }

            hook.fake_page[offset..offset + bytes.len()].copy_from_slice(bytes);
            hook.source_pid = source_pid;
            hook.target_pid = target_pid;
            return Ok(hook.id);
        }

        let hook_pointer = unsafe { platform::allocate_object::<EptHook>(self.platform) }
            .ok_or(HypervisorError::AllocationFailed)?;
        let hook = unsafe { &mut *hook_pointer.as_ptr() };

        if let Err(error) = self.split_large_page(base_pa) {
            unsafe { platform::free_object(self.platform, hook_pointer) };
            return Err(error);
        }

        if let Err(error) = self.read_hooked_page(base_pa, hint, &mut hook.fake_page) {
            unsafe { platform::free_object(self.platform, hook_pointer) };
            return Err(error);
        }
        hook.diff_page = hook.fake_page;
        hook.fake_page[offset..offset + bytes.len()].copy_from_slice(bytes);

        let entry = match self.get_pt_entry(base_pa) {
            Some(entry) => entry,
            None => {
                unsafe { platform::free_object(self.platform, hook_pointer) };
                return Err(HypervisorError::InvalidRequest);
            }
        };

        let fake_physical = match self
            .platform
            .virt_to_phys(VirtAddr::from_ptr(hook.fake_page.as_ptr()))
        {
            Some(physical) => physical,
            None => {
                unsafe { platform::free_object(self.platform, hook_pointer) };
                return Err(HypervisorError::AddressTranslationFailed);
            }
        };

        let original = EptEntry::from_bits(entry.load(Ordering::Relaxed));

        let mut readwrite = original;
        readwrite.set_read(true);
        readwrite.set_write(true);
        readwrite.set_execute(false);

        let mut execute = EptEntry::new();
        execute.set_execute(true);
        execute.set_frame(fake_physical);

        let id = HookId {
            kind: HookKind::PageHook,
            sequence: self.registry.next_sequence(),
            base_pa,
        };

        hook.id = id;
        hook.physical_base_address = base_pa;
        hook.source_vaddr = destination;
        hook.target_page = entry as *const AtomicU64;
        hook.original_entry = original.bits();
        hook.readwrite_entry = readwrite.bits();
        hook.execute_entry = execute.bits();
        hook.source_pid = source_pid;
        hook.target_pid = target_pid;

        entry.store(hook.readwrite_entry, Ordering::Release);

        if !self.registry.insert_hook(hook_pointer) {
            entry.store(hook.original_entry, Ordering::Release);
            unsafe { platform::free_object(self.platform, hook_pointer) };
            return Err(HypervisorError::AllocationFailed);
        }

        Ok(id)
    }

    fn read_hooked_page(
        &self,
        base_pa: PhysAddr,
        hint: Option<&TranslationHint>,
        destination: &mut [u8; PAGE_SIZE],
    ) -> Result<(), HypervisorError> {
        match hint {
            Some(hint) => {
                *destination = hint.page;
                Ok(())
            }
            None => {
                if self.platform.read_physical(destination, base_pa) {
                    Ok(())
                } else {
                    Err(HypervisorError::AddressTranslationFailed)
                }
            }
        }
    }

    /// Makes one physical page execute-only and records every other access.
    pub fn install_code_watch_point(
        &self,
        physical_page: PhysAddr,
        source_pid: ProcessId,
        target_pid: ProcessId,
    ) -> Result<HookId, HypervisorError> {
        let base_pa = PhysAddr::new_truncate(page_align(physical_page.as_u64()));

        let _guard = self.mutation.lock();

        if let Some(existing) = self.registry.find_watch_point(base_pa) {
            return Ok(unsafe { existing.as_ref() }.id);
        }

        self.split_large_page(base_pa)?;

        let entry = self
            .get_pt_entry(base_pa)
            .ok_or(HypervisorError::InvalidRequest)?;
        let original = EptEntry::from_bits(entry.load(Ordering::Relaxed));

        let mut execute_only = original;
        execute_only.set_read(false);
        execute_only.set_write(false);
        execute_only.set_execute(true);

        let id = HookId {
            kind: HookKind::CodeWatch,
            sequence: self.registry.next_sequence(),
            base_pa,
        };

        let watch_point = Box::new(CodeWatchPoint {
            id,
            physical_base_address: base_pa,
            target_page: entry as *const AtomicU64,
            original_entry: original.bits(),
            source_pid,
            target_pid,
        });
        let pointer = NonNull::from(Box::leak(watch_point));

        if !self.registry.insert_watch_point(pointer) {
            drop(unsafe { Box::from_raw(pointer.as_ptr()) });
            return Err(HypervisorError::AllocationFailed);
        }

        entry.store(execute_only.bits(), Ordering::Release);
        Ok(id)
    }

    /// Restores the original mapping and releases the record. The second
    /// removal of the same id reports `InvalidRequest`.
    pub fn remove(&self, id: HookId) -> Result<(), HypervisorError> {
        let _guard = self.mutation.lock();

        match id.kind {
            HookKind::PageHook => {
                let hook = self
                    .registry
                    .take_hook(&id)
                    .ok_or(HypervisorError::InvalidRequest)?;
                unsafe {
                    self.restore_hook_entry(hook.as_ref());
                    platform::free_object(self.platform, hook);
                }
                Ok(())
            }
            HookKind::CodeWatch => {
                let watch_point = self
                    .registry
                    .take_watch_point(&id)
                    .ok_or(HypervisorError::InvalidRequest)?;
                unsafe {
                    self.restore_watch_point_entry(watch_point.as_ref());
                    drop(Box::from_raw(watch_point.as_ptr()));
                }
                Ok(())
            }
        }
    }

    unsafe fn restore_hook_entry(&self, hook: &EptHook) {
        if !hook.target_page.is_null() {
            (*hook.target_page).store(hook.original_entry, Ordering::Release);
        }
    }

    unsafe fn restore_watch_point_entry(&self, watch_point: &CodeWatchPoint) {
        if !watch_point.target_page.is_null() {
            (*watch_point.target_page).store(watch_point.original_entry, Ordering::Release);
        }
    }

    /// Removes every hook and watchpoint owned by or targeting `process`.
    pub fn cleanup_process(&self, process: ProcessId) -> bool {
        let _guard = self.mutation.lock();
        let mut changed = false;

        changed |= self.registry.drain_hooks(
            |hook| hook.source_pid == process || hook.target_pid == process,
            |hook| unsafe {
                self.restore_hook_entry(hook.as_ref());
                platform::free_object(self.platform, hook);
            },
        );

        changed |= self.registry.drain_watch_points(
            |watch_point| {
                watch_point.source_pid == process || watch_point.target_pid == process
            },
            |watch_point| unsafe {
                self.restore_watch_point_entry(watch_point.as_ref());
                drop(Box::from_raw(watch_point.as_ptr()));
            },
        );

        changed
    }

    /// Removes everything.
    pub fn disable_all_hooks(&self) {
        let _guard = self.mutation.lock();

        self.registry.drain_hooks(
            |_| true,
            |hook| unsafe {
                self.restore_hook_entry(hook.as_ref());
                platform::free_object(self.platform, hook);
            },
        );
        self.registry.drain_watch_points(
            |_| true,
            |watch_point| unsafe {
                self.restore_watch_point_entry(watch_point.as_ref());
                drop(Box::from_raw(watch_point.as_ptr()));
            },
        );
    }

    /// Re-applies every registered hook and watchpoint to freshly initialized
    /// tables; used after wake, when the identity map was rebuilt.
    pub fn rearm_all(&self) -> Result<(), HypervisorError> {
        let _guard = self.mutation.lock();
        let mut result = Ok(());

        self.registry.for_each_hook(|pointer| {
            let hook = unsafe { &mut *pointer.as_ptr() };
            if result.is_err() {
                return;
            }
            result = (|| {
                self.split_large_page(hook.physical_base_address)?;
                let entry = self
                    .get_pt_entry(hook.physical_base_address)
                    .ok_or(HypervisorError::InvalidRequest)?;

                let original = EptEntry::from_bits(entry.load(Ordering::Relaxed));
                let mut readwrite = original;
                readwrite.set_read(true);
                readwrite.set_write(true);
                readwrite.set_execute(false);

                hook.target_page = entry as *const AtomicU64;
                hook.original_entry = original.bits();
                hook.readwrite_entry = readwrite.bits();
                entry.store(hook.readwrite_entry, Ordering::Release);
                Ok(())
            })();
        });

        self.registry.for_each_watch_point(|pointer| {
            let watch_point = unsafe { &mut *pointer.as_ptr() };
            if result.is_err() {
                return;
            }
            result = (|| {
                self.split_large_page(watch_point.physical_base_address)?;
                let entry = self
                    .get_pt_entry(watch_point.physical_base_address)
                    .ok_or(HypervisorError::InvalidRequest)?;

                let original = EptEntry::from_bits(entry.load(Ordering::Relaxed));
                let mut execute_only = original;
                execute_only.set_read(false);
                execute_only.set_write(false);
                execute_only.set_execute(true);

                watch_point.target_page = entry as *const AtomicU64;
                watch_point.original_entry = original.bits();
                entry.store(execute_only.bits(), Ordering::Release);
                Ok(())
            })();
        });

        result
    }

    /// EPT violation exit. Runs on the faulting CPU, interrupts disabled;
    /// allocation-free and lock-free.
    pub fn handle_violation(&self, context: &mut GuestContext) {
        let qualification =
            EptViolationQualification::from_bits_truncate(context.exit_qualification);

        if !qualification.contains(EptViolationQualification::CAUSED_BY_TRANSLATION) {
            context.exit_vm = true;
            return;
        }

        let base_pa = PhysAddr::new_truncate(page_align(context.guest_physical_address));

        // Hooks win over watchpoints on the same page.
        if let Some(hook) = self.registry.find_hook(base_pa) {
            self.handle_hook_violation(context, hook, qualification);
            return;
        }

        if let Some(watch_point) = self.registry.find_watch_point(base_pa) {
            self.handle_watch_point_violation(context, watch_point, qualification);
            return;
        }

        log::error!(
            "unmatched EPT violation at {:#x} (qualification {:#x})",
            context.guest_physical_address,
            context.exit_qualification,
        );
        context.increment_rip = false;
        context.exit_vm = true;
    }

    fn handle_hook_violation(
        &self,
        context: &mut GuestContext,
        hook: NonNull<EptHook>,
        qualification: EptViolationQualification,
    ) {
        let hook = unsafe { &mut *hook.as_ptr() };
        let entry = unsafe { &*hook.target_page };
        context.increment_rip = false;

        let fetch = qualification.contains(EptViolationQualification::EXECUTE_ACCESS);
        let data_access = qualification.intersects(
            EptViolationQualification::READ_ACCESS | EptViolationQualification::WRITE_ACCESS,
        );
        let was_executable = qualification.contains(EptViolationQualification::EPT_EXECUTABLE);

        if !was_executable && fetch {
            // Carry legitimate writes into the fake view before exposing it.
            if let Some(real) = self.platform.phys_to_virt(hook.physical_base_address) {
                let current = unsafe { &*real.as_ptr::<[u8; PAGE_SIZE]>() };
                hook.update_fake_page(current);
            }
            entry.store(hook.execute_entry, Ordering::Release);
            context.invalidate_ept = true;
        } else if was_executable && data_access {
            entry.store(hook.readwrite_entry, Ordering::Release);
            context.invalidate_ept = true;
        }
    }

    fn handle_watch_point_violation(
        &self,
        context: &mut GuestContext,
        watch_point: NonNull<CodeWatchPoint>,
        qualification: EptViolationQualification,
    ) {
        let watch_point = unsafe { watch_point.as_ref() };
        let entry = unsafe { &*watch_point.target_page };
        context.increment_rip = false;

        let original = EptEntry::from_bits(watch_point.original_entry);

        if qualification.contains(EptViolationQualification::EXECUTE_ACCESS) {
            // Execute-only pages admit fetches; this should not happen.
            log::warn!(
                "execute violation on watched page {:#x}",
                watch_point.physical_base_address.as_u64()
            );
            let mut execute_only = original;
            execute_only.set_read(false);
            execute_only.set_write(false);
            execute_only.set_execute(true);
            entry.store(execute_only.bits(), Ordering::Release);
            context.invalidate_ept = true;
            return;
        }

        self.registry.access_records.record(context.guest_rip);

        // Let the access complete under a fully permissive mapping; the
        // monitor trap flag brings us back at the next instruction boundary.
        let mut permissive = original;
        permissive.set_read(true);
        permissive.set_write(true);
        permissive.set_execute(true);
        entry.store(permissive.bits(), Ordering::Release);
        context.monitor_trap = Some(true);
        context.invalidate_ept = true;
    }

    /// Monitor-trap exit: the watched access has completed, re-arm every
    /// watchpoint as execute-only.
    pub fn handle_monitor_trap(&self, context: &mut GuestContext) {
        self.registry.for_each_watch_point(|pointer| {
            let watch_point = unsafe { pointer.as_ref() };
            let entry = unsafe { &*watch_point.target_page };

            let mut execute_only = EptEntry::from_bits(watch_point.original_entry);
            execute_only.set_read(false);
            execute_only.set_write(false);
            execute_only.set_execute(true);
            entry.store(execute_only.bits(), Ordering::Release);
        });

        context.increment_rip = false;
        context.monitor_trap = Some(false);
        context.invalidate_ept = true;
    }

    /// EPT misconfiguration is unrecoverable for the guest run.
    pub fn handle_misconfiguration(&self, context: &mut GuestContext) {
        context.increment_rip = false;
        context.exit_vm = true;
    }
}

impl Drop for Ept {
    fn drop(&mut self) {
        self.disable_all_hooks();
        self.free_splits();
        unsafe { platform::free_object(self.platform, self.tables) };
    }
}
