//! Collaborator traits.
//!
//! Per the scope note in the specification, several subsystems are treated
//! as opaque collaborators rather than reimplemented: the chipset GTT
//! page-table writer, the ring's physical command submission, cache-control
//! instructions, and the pageable backing store. Each is a small trait here
//! so the core can be driven by a real driver or, in tests, by
//! [`crate::testutil::FakeBackend`].

use crate::gen::FenceWrite;
use crate::{RingId, Seqno};
use std::io;

/// A single physical page reference. Opaque to the core beyond its
/// identity; a real driver would back this with a `struct page *` or
/// platform equivalent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageRef(pub u64);

/// The abstract GTT page-table writer: `gtt.insert(range, pages)` /
/// `gtt.clear(range)` from the specification's "out of scope" collaborators.
pub trait GttWriter: Send {
    /// Install `pages` into the GTT starting at `gtt_offset` (a multiple of
    /// [`crate::PAGE_SIZE`]).
    fn insert(&mut self, gtt_offset: u64, pages: &[PageRef]);

    /// Remove any mapping covering `[gtt_offset, gtt_offset + size)`.
    fn clear(&mut self, gtt_offset: u64, size: u64);
}

/// The pageable backing store an object's pages are acquired from and
/// released back to.
pub trait PageSource: Send {
    /// Wire and return `size / PAGE_SIZE` pages for `object_id`. Must be
    /// atomic with respect to failure: on error, no pages are left wired.
    fn acquire(&mut self, object_id: u64, size: u64) -> io::Result<Vec<PageRef>>;

    /// Unwire previously acquired pages. `dirty` pages are flagged for
    /// writeback unless `drop_dirty` is set (the `madvise = DontNeed` case).
    fn release(&mut self, object_id: u64, pages: &[PageRef], dirty: bool, drop_dirty: bool);

    /// Discard the backing storage entirely (`madvise = Purged`).
    fn purge(&mut self, object_id: u64);
}

/// Register writes, either direct MMIO or emitted into a ring's command
/// stream so they serialize with GPU work ("pipelined").
pub trait RegisterWriter: Send {
    fn write_mmio(&mut self, write: FenceWrite);
    fn write_pipelined(&mut self, ring: RingId, write: FenceWrite);
}

/// CPU/GPU cache-control side effects driven by [`crate::domain`]
/// transitions. A real driver issues `clflush`/`mfence`/`sfence`; tests
/// merely record that the call happened.
pub trait CacheOps: Send {
    fn clflush_pages(&mut self, pages: &[PageRef]);
    fn mfence(&mut self);
    fn sfence(&mut self);
    /// Revoke any live userspace mmap of an object, forcing a refault on
    /// next touch.
    fn revoke_mmap(&mut self, object_id: u64);
}

/// A single ring's opaque command-submission surface. The core only ever
/// needs to know the ring's latest retired sequence number and to ask it to
/// emit a seqno-write.
pub trait RingBackend: Send {
    /// The highest sequence number the ring has retired so far.
    fn get_seqno(&self) -> Seqno;

    /// Emit a pipelined write of `seqno` into the ring's command stream,
    /// returning the tail position at which it was emitted.
    fn emit_seqno_write(&mut self, seqno: Seqno) -> io::Result<u64>;

    /// Whether the ring has any outstanding (unretired) GPU work.
    fn is_active(&self) -> bool;

    /// Best-effort request that the ring go idle, draining all outstanding
    /// work. Used by `evict_everything` and reclaim rescans.
    fn idle(&mut self) -> io::Result<()>;
}
