//! Integration tests against a simulated physical address space.
//!
//! The mock platform hands out pages from a fake physical map, so the EPT
//! engine, the registry and the violation handler run exactly as they would
//! in the driver, minus the privileged instructions.

use crate::entry::GuestRegisters;
use crate::ept::{
    page_align, Ept, EptEntry, EptViolationQualification, MtrrRange, MtrrSnapshot,
    TranslationHint, MEMORY_TYPE_UNCACHEABLE, MEMORY_TYPE_WRITE_BACK,
};
use crate::hooks::HookKind;
use crate::platform::{Platform, ProcessId, PAGE_SIZE};
use crate::vm_exit_handlers::{
    dispatch_vm_exit, GuestContext, EXIT_REASON_EPT_MISCONFIGURATION, EXIT_REASON_EPT_VIOLATION,
    EXIT_REASON_MONITOR_TRAP_FLAG,
};
use crate::HypervisorError;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use x86_64::{PhysAddr, VirtAddr};

struct Region {
    virt: u64,
    phys: u64,
    size: usize,
}

struct MockState {
    next_physical: u64,
    regions: Vec<Region>,
}

/// Driver-collaborator stand-in with a simulated physical address space.
pub struct MockPlatform {
    state: Mutex<MockState>,
    current_cpu: AtomicUsize,
    cpu_count: usize,
    dead_processes: Mutex<Vec<ProcessId>>,
}

impl MockPlatform {
    fn new(cpu_count: usize) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_physical: 0x10_0000,
                regions: Vec::new(),
            }),
            current_cpu: AtomicUsize::new(0),
            cpu_count,
            dead_processes: Mutex::new(Vec::new()),
        }
    }

    fn leak(cpu_count: usize) -> &'static Self {
        Box::leak(Box::new(Self::new(cpu_count)))
    }

    fn mark_process_dead(&self, process: ProcessId) {
        self.dead_processes.lock().push(process);
    }
}

fn round_to_pages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

impl Platform for MockPlatform {
    fn allocate_contiguous(&self, size: usize) -> Option<VirtAddr> {
        let size = round_to_pages(size);
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        let pointer = unsafe { alloc_zeroed(layout) };
        if pointer.is_null() {
            return None;
        }

        let mut state = self.state.lock();
        let phys = state.next_physical;
        state.next_physical += size as u64;
        state.regions.push(Region {
            virt: pointer as u64,
            phys,
            size,
        });
        Some(VirtAddr::from_ptr(pointer))
    }

    unsafe fn free_contiguous(&self, address: VirtAddr, size: usize) {
        let size = round_to_pages(size);
        let mut state = self.state.lock();
        if let Some(index) = state
            .regions
            .iter()
            .position(|region| region.virt == address.as_u64())
        {
            state.regions.swap_remove(index);
            let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
            dealloc(address.as_mut_ptr(), layout);
        }
    }

    fn virt_to_phys(&self, address: VirtAddr) -> Option<PhysAddr> {
        let address = address.as_u64();
        let state = self.state.lock();
        state
            .regions
            .iter()
            .find(|region| address >= region.virt && address < region.virt + region.size as u64)
            .map(|region| PhysAddr::new(region.phys + (address - region.virt)))
    }

    fn phys_to_virt(&self, address: PhysAddr) -> Option<VirtAddr> {
        let address = address.as_u64();
        let state = self.state.lock();
        state
            .regions
            .iter()
            .find(|region| address >= region.phys && address < region.phys + region.size as u64)
            .map(|region| VirtAddr::new(region.virt + (address - region.phys)))
    }

    fn read_physical(&self, destination: &mut [u8], source: PhysAddr) -> bool {
        match self.phys_to_virt(source) {
            Some(virt) => {
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        virt.as_ptr::<u8>(),
                        destination.as_mut_ptr(),
                        destination.len(),
                    );
                }
                true
            }
            None => false,
        }
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn cpu_index(&self) -> usize {
        self.current_cpu.load(Ordering::Relaxed)
    }

    fn for_each_cpu(&self, callback: &mut dyn FnMut()) {
        for index in 0..self.cpu_count {
            self.current_cpu.store(index, Ordering::Relaxed);
            callback();
        }
        self.current_cpu.store(0, Ordering::Relaxed);
    }

    fn current_process_id(&self) -> ProcessId {
        ProcessId(4)
    }

    fn current_process_cr3(&self) -> u64 {
        0x1000
    }

    fn process_exists(&self, process: ProcessId) -> bool {
        !self.dead_processes.lock().contains(&process)
    }

    fn fatal(&self, message: &str) -> ! {
        panic!("fatal: {message}");
    }
}

fn setup() -> (&'static MockPlatform, Ept) {
    let platform = MockPlatform::leak(2);
    let ept = Ept::new(platform).expect("tables allocate");
    ept.initialize(&MtrrSnapshot::default());
    (platform, ept)
}

/// Allocates one "guest" page filled with `fill` and returns its addresses.
fn guest_page(platform: &MockPlatform, fill: u8) -> (VirtAddr, PhysAddr) {
    let virt = platform.allocate_contiguous(PAGE_SIZE).unwrap();
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), fill, PAGE_SIZE) };
    let phys = platform.virt_to_phys(virt).unwrap();
    (virt, phys)
}

fn violation<'a>(
    regs: &'a mut GuestRegisters,
    physical: PhysAddr,
    qualification: EptViolationQualification,
    rip: u64,
) -> GuestContext<'a> {
    GuestContext {
        regs,
        guest_rip: rip,
        guest_rsp: 0,
        guest_rflags: 0x202,
        guest_physical_address: physical.as_u64(),
        exit_reason: EXIT_REASON_EPT_VIOLATION,
        exit_qualification: qualification.bits(),
        increment_rip: true,
        exit_vm: false,
        invalidate_ept: false,
        monitor_trap: None,
    }
}

fn execute_fetch_on_data_view() -> EptViolationQualification {
    EptViolationQualification::EXECUTE_ACCESS
        | EptViolationQualification::EPT_READABLE
        | EptViolationQualification::EPT_WRITABLE
        | EptViolationQualification::CAUSED_BY_TRANSLATION
}

fn read_on_execute_view() -> EptViolationQualification {
    EptViolationQualification::READ_ACCESS
        | EptViolationQualification::EPT_EXECUTABLE
        | EptViolationQualification::CAUSED_BY_TRANSLATION
}

const SOURCE: ProcessId = ProcessId(100);
const TARGET: ProcessId = ProcessId(200);

#[test]
fn identity_map_uses_two_mb_leaves() {
    let (_, ept) = setup();

    let entry = ept.get_pd_entry(PhysAddr::new(0x4030_0000)).unwrap();
    let entry = EptEntry::from_bits(entry.load(Ordering::Relaxed));

    assert!(entry.read() && entry.write() && entry.execute());
    assert!(entry.large_page());
    assert_eq!(entry.frame(), PhysAddr::new(0x4020_0000));
    assert_eq!(entry.memory_type(), MEMORY_TYPE_WRITE_BACK);

    // Addresses above the mapped 512 GiB walk to nothing.
    assert!(ept.get_pd_entry(PhysAddr::new(1 << 39)).is_none());
}

#[test]
fn identity_map_applies_mtrr_types() {
    let platform = MockPlatform::leak(1);
    let ept = Ept::new(platform).unwrap();

    let mut snapshot = MtrrSnapshot::default();
    snapshot.ranges[0] = MtrrRange {
        enabled: true,
        memory_type: MEMORY_TYPE_UNCACHEABLE,
        base: 0xF000_0000,
        end: 0xF7FF_FFFF,
    };
    ept.initialize(&snapshot);

    let uncached = ept.get_pd_entry(PhysAddr::new(0xF020_0000)).unwrap();
    assert_eq!(
        EptEntry::from_bits(uncached.load(Ordering::Relaxed)).memory_type(),
        MEMORY_TYPE_UNCACHEABLE
    );

    let cached = ept.get_pd_entry(PhysAddr::new(0x1000_0000)).unwrap();
    assert_eq!(
        EptEntry::from_bits(cached.load(Ordering::Relaxed)).memory_type(),
        MEMORY_TYPE_WRITE_BACK
    );
}

#[test]
fn pt_walk_requires_split() {
    let (platform, ept) = setup();
    let (_, phys) = guest_page(platform, 0x90);

    assert!(ept.get_pt_entry(phys).is_none(), "2 MiB leaf not yet split");

    ept.install_code_watch_point(phys, SOURCE, TARGET).unwrap();
    let entry = ept.get_pt_entry(phys).expect("split happened");
    let entry = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert_eq!(entry.frame(), PhysAddr::new(page_align(phys.as_u64())));
}

#[test]
fn split_inherits_leaf_attributes_and_is_one_shot() {
    let (platform, ept) = setup();
    let (_, phys_a) = guest_page(platform, 0);
    let (_, phys_b) = guest_page(platform, 0);
    assert_eq!(
        page_align(phys_a.as_u64()) >> 21,
        page_align(phys_b.as_u64()) >> 21,
        "both pages sit under the same directory entry"
    );

    ept.install_code_watch_point(phys_a, SOURCE, TARGET).unwrap();
    let pd_after_first = ept
        .get_pd_entry(phys_a)
        .unwrap()
        .load(Ordering::Relaxed);
    assert!(!EptEntry::from_bits(pd_after_first).large_page());

    // The second refinement under the same directory reuses the table.
    ept.install_code_watch_point(phys_b, SOURCE, TARGET).unwrap();
    let pd_after_second = ept.get_pd_entry(phys_b).unwrap().load(Ordering::Relaxed);
    assert_eq!(pd_after_first, pd_after_second);

    // Untouched neighbour entries inherit the identity frame and type.
    let neighbour = PhysAddr::new(page_align(phys_b.as_u64()) + 0x5000);
    let entry = EptEntry::from_bits(ept.get_pt_entry(neighbour).unwrap().load(Ordering::Relaxed));
    assert!(entry.read() && entry.write() && entry.execute());
    assert_eq!(entry.frame(), PhysAddr::new(page_align(neighbour.as_u64())));
    assert_eq!(entry.memory_type(), MEMORY_TYPE_WRITE_BACK);
}

#[test]
fn hook_installs_data_view_and_flips_on_access() {
    let (platform, ept) = setup();
    let (virt, phys) = guest_page(platform, 0x90);

    let id = ept
        .install_page_hook(virt, &[0xCC, 0xCC], SOURCE, TARGET, None)
        .unwrap();
    assert_eq!(id.kind, HookKind::PageHook);
    assert_eq!(id.base_pa, phys);

    let (fake_phys, readwrite_bits) = {
        let hook = ept.registry().find_hook(phys).expect("registered");
        let hook = unsafe { hook.as_ref() };
        assert_eq!(&hook.fake_page[..3], &[0xCC, 0xCC, 0x90]);
        assert_eq!(hook.fake_page[PAGE_SIZE - 1], 0x90);
        (
            platform
                .virt_to_phys(VirtAddr::from_ptr(hook.fake_page.as_ptr()))
                .unwrap(),
            hook.readwrite_entry,
        )
    };

    // Installed view: original frame, read/write only.
    let entry = ept.get_pt_entry(phys).unwrap();
    let installed = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert!(installed.read() && installed.write() && !installed.execute());
    assert_eq!(installed.frame(), phys);

    // Instruction fetch flips to the execute-only fake frame.
    let mut regs = GuestRegisters::default();
    let mut context = violation(&mut regs, phys, execute_fetch_on_data_view(), 0x1000);
    ept.handle_violation(&mut context);

    assert!(!context.increment_rip);
    assert!(context.invalidate_ept);
    assert!(!context.exit_vm);

    let flipped = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert!(flipped.execute() && !flipped.read() && !flipped.write());
    assert_eq!(flipped.frame(), fake_phys);

    // A read flips straight back to the data view.
    let mut context = violation(&mut regs, phys, read_on_execute_view(), 0x1008);
    ept.handle_violation(&mut context);
    let back = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert_eq!(back.bits(), readwrite_bits);
}

#[test]
fn execute_flip_carries_legitimate_writes_into_fake_page() {
    let (platform, ept) = setup();
    let (virt, phys) = guest_page(platform, 0x90);

    ept.install_page_hook(virt, &[0xCC], SOURCE, TARGET, None)
        .unwrap();

    // The guest legitimately patches a byte far away from the hook.
    unsafe { *virt.as_mut_ptr::<u8>().add(64) = 0xEB };

    let mut regs = GuestRegisters::default();
    let mut context = violation(&mut regs, phys, execute_fetch_on_data_view(), 0x1000);
    ept.handle_violation(&mut context);

    let hook = unsafe { ept.registry().find_hook(phys).unwrap().as_ref() };
    assert_eq!(hook.fake_page[0], 0xCC, "patch survives");
    assert_eq!(hook.fake_page[64], 0xEB, "legitimate write visible");
}

#[test]
fn cross_page_patch_is_rejected_without_side_effects() {
    let (platform, ept) = setup();
    let (virt, phys) = guest_page(platform, 0x90);
    let destination = VirtAddr::new(virt.as_u64() + 0xFFF);

    let result = ept.install_page_hook(destination, &[1, 2, 3], SOURCE, TARGET, None);
    assert_eq!(result.unwrap_err(), HypervisorError::InvalidRequest);

    assert_eq!(ept.registry().hook_count(), 0);
    let pd = EptEntry::from_bits(ept.get_pd_entry(phys).unwrap().load(Ordering::Relaxed));
    assert!(pd.large_page(), "no split happened");
}

#[test]
fn second_install_on_same_page_merges() {
    let (platform, ept) = setup();
    let (virt, phys) = guest_page(platform, 0x90);

    let first = ept
        .install_page_hook(virt, &[0xCC], SOURCE, TARGET, None)
        .unwrap();
    let second = ept
        .install_page_hook(
            VirtAddr::new(virt.as_u64() + 1),
            &[0xEB],
            SOURCE,
            TARGET,
            None,
        )
        .unwrap();

    assert_eq!(first, second, "same page yields the same handle");
    assert_eq!(ept.registry().hook_count(), 1);

    let hook = unsafe { ept.registry().find_hook(phys).unwrap().as_ref() };
    assert_eq!(&hook.fake_page[..3], &[0xCC, 0xEB, 0x90]);
}

#[test]
fn remove_restores_original_mapping_and_is_idempotent() {
    let (platform, ept) = setup();
    let (virt, phys) = guest_page(platform, 0x90);

    let id = ept
        .install_page_hook(virt, &[0xCC], SOURCE, TARGET, None)
        .unwrap();
    let entry = ept.get_pt_entry(phys).unwrap();

    ept.remove(id).unwrap();
    let restored = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert!(restored.read() && restored.write() && restored.execute());
    assert_eq!(restored.frame(), phys);
    assert_eq!(ept.registry().hook_count(), 0);

    assert_eq!(ept.remove(id).unwrap_err(), HypervisorError::InvalidRequest);
}

#[test]
fn cleanup_process_removes_both_kinds() {
    let (platform, ept) = setup();
    let (virt, _) = guest_page(platform, 0x90);
    let (_, watch_phys) = guest_page(platform, 0xC3);

    ept.install_page_hook(virt, &[0xCC], SOURCE, TARGET, None)
        .unwrap();
    ept.install_code_watch_point(watch_phys, SOURCE, ProcessId(777))
        .unwrap();

    assert!(ept.cleanup_process(SOURCE));
    assert_eq!(ept.registry().hook_count(), 0);
    assert_eq!(ept.registry().watch_point_count(), 0);
    assert!(!ept.cleanup_process(SOURCE), "nothing left to clean");
}

#[test]
fn install_rejects_dead_target_process() {
    let (platform, ept) = setup();
    let (virt, _) = guest_page(platform, 0x90);
    platform.mark_process_dead(TARGET);

    let result = ept.install_page_hook(virt, &[0xCC], SOURCE, TARGET, None);
    assert_eq!(result.unwrap_err(), HypervisorError::ProcessGone);
}

#[test]
fn watch_point_records_access_and_uses_monitor_trap() {
    let (platform, ept) = setup();
    let (_, phys) = guest_page(platform, 0xC3);

    let id = ept.install_code_watch_point(phys, SOURCE, TARGET).unwrap();
    assert_eq!(id.kind, HookKind::CodeWatch);

    let entry = ept.get_pt_entry(phys).unwrap();
    let armed = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert!(armed.execute() && !armed.read() && !armed.write());

    // A read trips the watchpoint: RIP recorded, page temporarily open,
    // monitor trap requested.
    let mut regs = GuestRegisters::default();
    let mut context = violation(&mut regs, phys, read_on_execute_view(), 0xFFFF_8000_1234_5678);
    dispatch_vm_exit(&mut context, &ept);

    assert!(!context.increment_rip);
    assert_eq!(context.monitor_trap, Some(true));
    assert!(context.invalidate_ept);

    let open = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert!(open.read() && open.write() && open.execute());

    let mut records = [0u64; 4];
    assert_eq!(ept.registry().access_records.snapshot(&mut records), 1);
    assert_eq!(records[0], 0xFFFF_8000_1234_5678);

    // The monitor trap exit re-arms the execute-only view.
    let mut context = violation(&mut regs, phys, read_on_execute_view(), 0);
    context.exit_reason = EXIT_REASON_MONITOR_TRAP_FLAG;
    dispatch_vm_exit(&mut context, &ept);

    assert_eq!(context.monitor_trap, Some(false));
    let rearmed = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert!(rearmed.execute() && !rearmed.read() && !rearmed.write());
}

#[test]
fn watch_point_execute_access_leaves_no_record() {
    let (platform, ept) = setup();
    let (_, phys) = guest_page(platform, 0xC3);
    ept.install_code_watch_point(phys, SOURCE, TARGET).unwrap();

    let qualification = EptViolationQualification::EXECUTE_ACCESS
        | EptViolationQualification::CAUSED_BY_TRANSLATION;
    let mut regs = GuestRegisters::default();
    let mut context = violation(&mut regs, phys, qualification, 0x9000);
    ept.handle_violation(&mut context);

    let mut records = [0u64; 4];
    assert_eq!(ept.registry().access_records.snapshot(&mut records), 0);

    let entry = EptEntry::from_bits(ept.get_pt_entry(phys).unwrap().load(Ordering::Relaxed));
    assert!(entry.execute() && !entry.read() && !entry.write());
}

#[test]
fn duplicate_watch_point_returns_existing_handle() {
    let (platform, ept) = setup();
    let (_, phys) = guest_page(platform, 0xC3);

    let first = ept.install_code_watch_point(phys, SOURCE, TARGET).unwrap();
    let second = ept.install_code_watch_point(phys, SOURCE, TARGET).unwrap();
    assert_eq!(first, second);
    assert_eq!(ept.registry().watch_point_count(), 1);
}

#[test]
fn unmatched_violation_is_fatal_for_the_guest() {
    let (_, ept) = setup();

    let mut regs = GuestRegisters::default();
    let mut context = violation(
        &mut regs,
        PhysAddr::new(0x7FFF_F000),
        read_on_execute_view(),
        0,
    );
    ept.handle_violation(&mut context);
    assert!(context.exit_vm);

    // A violation that did not come from a translation is equally fatal.
    let mut context = violation(
        &mut regs,
        PhysAddr::new(0x7FFF_F000),
        EptViolationQualification::READ_ACCESS,
        0,
    );
    ept.handle_violation(&mut context);
    assert!(context.exit_vm);
}

#[test]
fn misconfiguration_exit_tears_the_guest_down() {
    let (_, ept) = setup();

    let mut regs = GuestRegisters::default();
    let mut context = violation(&mut regs, PhysAddr::new(0), read_on_execute_view(), 0);
    context.exit_reason = EXIT_REASON_EPT_MISCONFIGURATION;
    dispatch_vm_exit(&mut context, &ept);

    assert!(context.exit_vm);
    assert!(!context.increment_rip);
}

#[test]
fn hooks_survive_reinitialization() {
    let (platform, ept) = setup();
    let (virt, phys) = guest_page(platform, 0x90);

    let id = ept
        .install_page_hook(virt, &[0xCC], SOURCE, TARGET, None)
        .unwrap();
    let execute_entry = unsafe { ept.registry().find_hook(phys).unwrap().as_ref() }.execute_entry;

    // Power transition: the identity map is rebuilt, then hooks re-armed.
    ept.initialize(&MtrrSnapshot::default());
    ept.rearm_all().unwrap();

    assert_eq!(ept.registry().hook_count(), 1);
    let entry = ept.get_pt_entry(phys).expect("page split again");
    let installed = EptEntry::from_bits(entry.load(Ordering::Relaxed));
    assert!(installed.read() && installed.write() && !installed.execute());
    assert_eq!(installed.frame(), phys);

    let hook = unsafe { ept.registry().find_hook(phys).unwrap().as_ref() };
    assert_eq!(hook.execute_entry, execute_entry, "fake view unchanged");
    assert_eq!(hook.id, id, "handle stays valid");
}

#[test]
fn translation_hints_cover_the_span() {
    let platform = MockPlatform::leak(1);
    let ept = Ept::new(platform).unwrap();
    ept.initialize(&MtrrSnapshot::default());

    let buffer = platform.allocate_contiguous(2 * PAGE_SIZE).unwrap();
    unsafe {
        core::ptr::write_bytes(buffer.as_mut_ptr::<u8>(), 0xAA, PAGE_SIZE);
        core::ptr::write_bytes(buffer.as_mut_ptr::<u8>().add(PAGE_SIZE), 0xBB, PAGE_SIZE);
    }

    let destination = VirtAddr::new(buffer.as_u64() + 0xFF0);
    let hints = crate::ept::generate_translation_hints(platform, destination, 0x20).unwrap();

    assert_eq!(hints.len(), 2);
    assert_eq!(hints[0].virtual_base_address, buffer);
    assert_eq!(
        hints[1].virtual_base_address,
        VirtAddr::new(buffer.as_u64() + PAGE_SIZE as u64)
    );
    assert_eq!(
        hints[0].physical_base_address,
        platform.virt_to_phys(buffer).unwrap()
    );
    assert_eq!(hints[0].page[0], 0xAA);
    assert_eq!(hints[1].page[0], 0xBB);
}

#[test]
fn hint_allows_install_without_translation() {
    let (platform, ept) = setup();
    let (_, phys) = guest_page(platform, 0xAB);

    // The destination address is not mapped in this address space; only the
    // hint knows where the page lives.
    let foreign = VirtAddr::new(0x7FFE_0000_0000);
    let mut hint = TranslationHint {
        page: [0xAB; PAGE_SIZE],
        physical_base_address: phys,
        virtual_base_address: foreign,
    };
    hint.page[0x10] = 0x11;

    let id = ept
        .install_page_hook(
            VirtAddr::new(foreign.as_u64() + 0x10),
            &[0xCC],
            SOURCE,
            TARGET,
            Some(&hint),
        )
        .unwrap();
    assert_eq!(id.base_pa, phys);

    let hook = unsafe { ept.registry().find_hook(phys).unwrap().as_ref() };
    assert_eq!(hook.fake_page[0x10], 0xCC, "patch applied at page offset");
    assert_eq!(hook.fake_page[0], 0xAB, "contents taken from the hint");
}

#[test]
fn parallel_installs_from_all_cpus_stay_consistent() {
    let (platform, ept) = setup();

    // One distinct page per "CPU"; drive the installs through the dispatch
    // barrier the lifecycle paths use.
    let pages: Vec<_> = (0..platform.cpu_count())
        .map(|_| guest_page(platform, 0x90))
        .collect();

    let installed = Mutex::new(Vec::new());
    platform.for_each_cpu(&mut || {
        let (virt, _) = pages[platform.cpu_index()];
        let id = ept
            .install_page_hook(virt, &[0xCC], SOURCE, TARGET, None)
            .unwrap();
        installed.lock().push(id);
    });

    let ids = installed.into_inner();
    assert_eq!(ids.len(), platform.cpu_count());
    assert_eq!(ept.registry().hook_count(), platform.cpu_count());
    for window in ids.windows(2) {
        assert_ne!(window[0].base_pa, window[1].base_pa);
    }
}

#[test]
fn guest_byte_reads_chunk_across_pages() {
    let platform = MockPlatform::leak(1);
    let buffer = platform.allocate_contiguous(2 * PAGE_SIZE).unwrap();
    unsafe {
        *buffer.as_mut_ptr::<u8>().add(PAGE_SIZE - 1) = 0x0F;
        *buffer.as_mut_ptr::<u8>().add(PAGE_SIZE) = 0x05;
    }

    let mut bytes = [0u8; 2];
    crate::vm_exit_handlers::read_guest_bytes(
        platform,
        buffer.as_u64() + PAGE_SIZE as u64 - 1,
        &mut bytes,
    )
    .unwrap();
    assert_eq!(bytes, [0x0F, 0x05]);

    // A destination outside the fake physical map faults at the exact
    // address.
    let fault = crate::vm_exit_handlers::read_guest_bytes(platform, 0xDEAD_0000, &mut bytes);
    assert_eq!(fault.unwrap_err(), 0xDEAD_0000);
}
