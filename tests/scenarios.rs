//! End-to-end scenarios exercising the crate's public modules together,
//! mirroring the testable properties a real driver would be graded against:
//! a CPU round trip, a fault-driven GTT mmap, eviction under aperture
//! pressure, request retirement, fence stealing, and wedge handling.
//!
//! Submission of GPU work itself is one of the documented collaborators
//! this crate does not implement (the physical ring command stream is
//! opaque here), so the retire/fence/wedge scenarios below drive
//! `RingTracker`/`FenceRegistry` directly rather than through `Manager` —
//! the same way a real caller's execbuffer path would before handing
//! control back to this crate.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use gem_core::backend::{CacheOps, GttWriter, PageRef, PageSource, RegisterWriter, RingBackend};
use gem_core::fence::FenceRegistry;
use gem_core::gen::{FenceWrite, Generation};
use gem_core::handle::HandleTable;
use gem_core::manager::{Manager, ManagerConfig};
use gem_core::object::{Activity, Object};
use gem_core::ring::{Cancel, RingTracker};
use gem_core::{CacheLevel, GemError, Handle, RingId, Seqno, Tiling, PAGE_SIZE};

/// Minimal stand-in for real hardware, local to this test binary (the
/// crate's own `FakeBackend` lives behind `#[cfg(test)]` in the library and
/// isn't visible from here). Unlike that fixture, `get_seqno` does not
/// auto-advance on `emit_seqno_write`, so tests can model a ring that is
/// still behind submission.
#[derive(Default)]
struct Rig {
    next_page: u64,
    seqno: Seqno,
    next_tail: u64,
    mmio_writes: Vec<FenceWrite>,
}

impl Rig {
    fn new() -> Self {
        Self::default()
    }
}

impl PageSource for Rig {
    fn acquire(&mut self, _object_id: u64, size: u64) -> io::Result<Vec<PageRef>> {
        let n = (size / PAGE_SIZE) as usize;
        Ok((0..n)
            .map(|_| {
                self.next_page += 1;
                PageRef(self.next_page)
            })
            .collect())
    }

    fn release(&mut self, _object_id: u64, _pages: &[PageRef], _dirty: bool, _drop_dirty: bool) {}

    fn purge(&mut self, _object_id: u64) {}
}

impl GttWriter for Rig {
    fn insert(&mut self, _gtt_offset: u64, _pages: &[PageRef]) {}
    fn clear(&mut self, _gtt_offset: u64, _size: u64) {}
}

impl RegisterWriter for Rig {
    fn write_mmio(&mut self, write: FenceWrite) {
        self.mmio_writes.push(write);
    }

    fn write_pipelined(&mut self, _ring: RingId, write: FenceWrite) {
        self.mmio_writes.push(write);
    }
}

impl CacheOps for Rig {
    fn clflush_pages(&mut self, _pages: &[PageRef]) {}
    fn mfence(&mut self) {}
    fn sfence(&mut self) {}
    fn revoke_mmap(&mut self, _object_id: u64) {}
}

impl RingBackend for Rig {
    fn get_seqno(&self) -> Seqno {
        self.seqno
    }

    fn emit_seqno_write(&mut self, _seqno: Seqno) -> io::Result<u64> {
        self.next_tail += 1;
        Ok(self.next_tail)
    }

    fn is_active(&self) -> bool {
        false
    }

    fn idle(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn make_manager(generation: Generation, aperture_total: u64, mappable_end: u64) -> Manager {
    let mut ring_backends: HashMap<RingId, Box<dyn RingBackend>> = HashMap::new();
    for &id in &RingId::ALL {
        ring_backends.insert(id, Box::new(Rig::new()));
    }
    Manager::new(ManagerConfig {
        generation,
        aperture_base: 0,
        aperture_total,
        mappable_end,
        pages_source: Box::new(Rig::new()),
        gtt_writer: Box::new(Rig::new()),
        register_writer: Box::new(Rig::new()),
        cache: Box::new(Rig::new()),
        ring_backends,
    })
}

#[test]
fn cpu_write_then_read_round_trips_through_the_manager() {
    let manager = make_manager(Generation::GenSandybridge, 1 << 20, 1 << 20);
    let handle = manager.create(4096, CacheLevel::None).unwrap();

    manager.pwrite(handle, 0, b"hello, gpu").unwrap();
    let mut out = [0u8; 10];
    manager.pread(handle, 0, &mut out).unwrap();

    assert_eq!(&out, b"hello, gpu");
}

#[test]
fn first_gtt_touch_faults_in_a_binding_and_later_touches_are_idempotent() {
    let manager = make_manager(Generation::GenSandybridge, 1 << 20, 1 << 20);
    let handle = manager.create(4096, CacheLevel::None).unwrap();

    manager.mmap_gtt(handle).unwrap();
    let first = manager.handle_gtt_fault(handle, 0).unwrap();
    let second = manager.handle_gtt_fault(handle, 0).unwrap();

    assert_eq!(first, second);
    assert_eq!(manager.get_aperture().1, (1 << 20) - 4096);
    // Page-aligned, within the mappable range reported to the fault.
    assert!(first < (1 << 20));
}

#[test]
fn pinning_past_the_aperture_evicts_inactive_residents_then_reports_no_memory() {
    let aperture = 4 * 1024 * 1024u64;
    let manager = make_manager(Generation::GenSandybridge, aperture, aperture);
    let obj_size = 1024 * 1024u64;

    let handles: Vec<Handle> = (0..6)
        .map(|_| manager.create(obj_size, CacheLevel::None).unwrap())
        .collect();

    // Fill the aperture with four pinned objects.
    for &h in &handles[0..4] {
        manager.pin(h, None).unwrap();
    }

    // Freeing one back to "inactive" leaves it bound but evictable.
    manager.unpin(handles[0]).unwrap();

    // A fifth pin has no free space, but does have one evictable resident.
    manager.pin(handles[4], None).unwrap();

    // The aperture is full again and every resident is pinned: nothing left
    // to evict, so a sixth pin must fail rather than block forever.
    assert!(matches!(manager.pin(handles[5], None), Err(GemError::NoMemory)));
}

#[test]
fn request_retires_only_after_its_seqno_passes() {
    let mut table = HandleTable::new();
    let handle = table.insert(Object::new(4096, CacheLevel::None));

    let mut tracker = RingTracker::new();
    let mut backend = Rig::new();
    let seqno = tracker.next_request_seqno();
    table.get_mut(handle).unwrap().activity = Activity::Active { ring: RingId::Render, last_seqno: seqno };
    tracker.active_list.push(handle);
    tracker.add_request(Some(7), &mut backend).unwrap();

    let last_seqno_of = |h: Handle| match table.get(h).map(|o| o.activity) {
        Some(Activity::Active { last_seqno, .. }) => last_seqno,
        _ => Seqno::NONE,
    };

    // The fake ring hasn't retired anything yet: still busy.
    assert!(tracker.retire(backend.get_seqno(), last_seqno_of).is_empty());
    assert!(table.get(handle).unwrap().activity.is_active());

    // The ring catches up to the submitted seqno.
    backend.seqno = seqno;
    let retired = tracker.retire(backend.get_seqno(), last_seqno_of);

    assert_eq!(retired, vec![handle]);
    assert!(tracker.request_list.is_empty());
}

#[test]
fn ninth_tiled_object_steals_the_least_recently_used_fence() {
    let mut registry = FenceRegistry::new(Generation::Gen2_830);
    let mut writer = Rig::new();
    let mut table = HandleTable::new();

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let h = table.insert(Object::new(1024 * 1024, CacheLevel::None));
        let reg = registry.find_free_or_steal(None).expect("slot available");
        registry.assign(reg, h, i * 0x10_0000, 0x10_0000, 512, Tiling::X, None, &mut writer);
        handles.push(h);
    }
    assert_eq!(registry.num_regs(), 8);
    assert!(registry.find_free_or_steal(None).is_some());

    let ninth = table.insert(Object::new(1024 * 1024, CacheLevel::None));
    let victim_slot = registry.find_free_or_steal(None).expect("a full table still steals the LRU slot");
    let stolen = registry
        .assign(victim_slot, ninth, 8 * 0x10_0000, 0x10_0000, 512, Tiling::X, None, &mut writer)
        .expect("every slot was occupied, so assigning one always dispossesses somebody");

    assert_eq!(stolen.previous_owner, handles[0]);
    assert_eq!(registry.owner(victim_slot), Some(ninth));
}

#[test]
fn waiting_while_wedged_fails_fast_instead_of_blocking_forever() {
    let mut tracker = RingTracker::new();
    let mut backend = Rig::new();
    let cancel = Cancel::new();
    let wedged = AtomicBool::new(false);

    let seqno = tracker.next_request_seqno();
    tracker.add_request(None, &mut backend).unwrap();

    // The fake ring never reaches `seqno` on its own (no write to
    // `backend.seqno` happens here), so without the wedge flag this wait
    // would block past any reasonable test timeout.
    wedged.store(true, Ordering::SeqCst);

    let result = tracker.wait(seqno, &mut backend, &cancel, &wedged, false);
    assert!(matches!(result, Err(GemError::Again)));
}

#[test]
fn cancelling_a_wait_surfaces_interrupted_rather_than_blocking() {
    let mut tracker = RingTracker::new();
    let mut backend = Rig::new();
    let cancel = Cancel::new();
    let wedged = AtomicBool::new(false);

    let seqno = tracker.next_request_seqno();
    tracker.add_request(None, &mut backend).unwrap();
    cancel.cancel();

    let result = tracker.wait(seqno, &mut backend, &cancel, &wedged, false);
    assert!(matches!(result, Err(GemError::Interrupted)));
}
