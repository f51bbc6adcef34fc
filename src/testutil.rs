//! In-memory fake implementing every `backend` trait, so the rest of the
//! crate can be exercised without real hardware. One instance can stand in
//! for any single collaborator role; callers needing two independent
//! collaborators (e.g. a page source and a GTT writer in the same call)
//! construct two instances, same as a real driver would pass two distinct
//! objects rather than alias one mutably.

use crate::backend::{CacheOps, GttWriter, PageRef, PageSource, RegisterWriter, RingBackend};
use crate::gen::FenceWrite;
use crate::{RingId, Seqno, PAGE_SIZE};
use std::collections::HashMap;
use std::io;

#[derive(Default)]
pub struct FakeBackend {
    next_page_id: u64,
    wired: HashMap<u64, Vec<PageRef>>,
    fail_next_acquire: bool,
    purged: Vec<u64>,
    clflushed: Vec<PageRef>,
    mfence_count: u32,
    sfence_count: u32,
    revoked: Vec<u64>,
    mmio_writes: Vec<FenceWrite>,
    pipelined_writes: Vec<(RingId, FenceWrite)>,
    /// Highest seqno considered retired. `emit_seqno_write` advances this
    /// immediately, modeling a GPU that keeps up with submission.
    seqno: Seqno,
    next_tail: u64,
    active: bool,
    idle_count: u32,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_acquire(&mut self) {
        self.fail_next_acquire = true;
    }

    pub fn wired_page_count(&self) -> usize {
        self.wired.values().map(|p| p.len()).sum()
    }

    pub fn purged_objects(&self) -> &[u64] {
        &self.purged
    }

    pub fn revoked_mmaps(&self) -> Vec<u64> {
        self.revoked.clone()
    }

    pub fn clflush_count(&self) -> usize {
        self.clflushed.len()
    }

    pub fn mmio_writes(&self) -> &[FenceWrite] {
        &self.mmio_writes
    }

    pub fn pipelined_writes(&self) -> &[(RingId, FenceWrite)] {
        &self.pipelined_writes
    }

    /// Advance the fake ring's retired seqno directly, bypassing
    /// `emit_seqno_write`'s immediate-retire behavior. Lets a test model a
    /// ring that is still behind.
    pub fn set_retired_seqno(&mut self, seqno: Seqno) {
        self.seqno = seqno;
    }

    /// Force `is_active()` to report outstanding work, so tests can exercise
    /// the reclaimer's idle-and-rescan escalation.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }
}

impl PageSource for FakeBackend {
    fn acquire(&mut self, object_id: u64, size: u64) -> io::Result<Vec<PageRef>> {
        if self.fail_next_acquire {
            self.fail_next_acquire = false;
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "fake page source exhausted"));
        }
        let n = (size / PAGE_SIZE) as usize;
        let pages: Vec<PageRef> = (0..n)
            .map(|_| {
                self.next_page_id += 1;
                PageRef(self.next_page_id)
            })
            .collect();
        self.wired.insert(object_id, pages.clone());
        Ok(pages)
    }

    fn release(&mut self, object_id: u64, _pages: &[PageRef], _dirty: bool, _drop_dirty: bool) {
        self.wired.remove(&object_id);
    }

    fn purge(&mut self, object_id: u64) {
        self.purged.push(object_id);
    }
}

impl GttWriter for FakeBackend {
    fn insert(&mut self, _gtt_offset: u64, _pages: &[PageRef]) {}
    fn clear(&mut self, _gtt_offset: u64, _size: u64) {}
}

impl RegisterWriter for FakeBackend {
    fn write_mmio(&mut self, write: FenceWrite) {
        self.mmio_writes.push(write);
    }

    fn write_pipelined(&mut self, ring: RingId, write: FenceWrite) {
        self.pipelined_writes.push((ring, write));
    }
}

impl CacheOps for FakeBackend {
    fn clflush_pages(&mut self, pages: &[PageRef]) {
        self.clflushed.extend_from_slice(pages);
    }

    fn mfence(&mut self) {
        self.mfence_count += 1;
    }

    fn sfence(&mut self) {
        self.sfence_count += 1;
    }

    fn revoke_mmap(&mut self, object_id: u64) {
        self.revoked.push(object_id);
    }
}

impl RingBackend for FakeBackend {
    fn get_seqno(&self) -> Seqno {
        self.seqno
    }

    fn emit_seqno_write(&mut self, seqno: Seqno) -> io::Result<u64> {
        self.seqno = seqno;
        self.next_tail += 1;
        Ok(self.next_tail)
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn idle(&mut self) -> io::Result<()> {
        self.idle_count += 1;
        self.active = false;
        Ok(())
    }
}
