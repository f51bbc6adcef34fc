//! GPU buffer object memory manager.
//!
//! This crate implements the memory-management core of a discrete/integrated
//! GPU driver: object lifecycle, placement in a shared virtual aperture (the
//! GTT), fence-register allocation, per-ring request tracking, domain-based
//! CPU/GPU coherency, a fault-driven mmap path, and low-memory reclamation.
//!
//! Hardware access itself — writing page tables, submitting ring commands,
//! issuing cache-control instructions — is abstracted behind the traits in
//! [`backend`], so this crate can be exercised with an in-memory fake and
//! carries no platform-specific code.

pub mod backend;
pub mod binder;
pub mod domain;
pub mod error;
pub mod fault;
pub mod fence;
pub mod gen;
pub mod handle;
pub mod manager;
pub mod object;
pub mod pages;
pub mod range;
pub mod reclaim;
pub mod ring;

#[cfg(test)]
pub mod testutil;

pub use error::GemError;
pub use manager::{Manager, ManagerConfig};

use bitflags::bitflags;

/// Page size assumed throughout the crate. Real chipsets only ever used 4 KiB
/// GTT pages in this era; larger host page sizes are not modeled.
pub const PAGE_SIZE: u64 = 4096;

/// Process-scoped handle to an [`object::Object`]. Stable for the lifetime of
/// the object in the handle table; never reused while the table holds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) slotmap::DefaultKey);

impl Handle {
    /// A stable numeric identity for this handle, passed to the
    /// [`backend`] traits as `object_id` so a real driver can key its own
    /// bookkeeping (page tables, debug names) off something other than an
    /// opaque slotmap key.
    pub fn id(self) -> u64 {
        use slotmap::Key;
        self.0.data().as_ffi()
    }
}

/// A command ring. Real chipsets expose render/video/blit rings; the core
/// does not care how many there are, only that each has independent,
/// monotonically increasing sequence numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RingId {
    Render,
    Video,
    Blit,
}

impl RingId {
    pub const ALL: [RingId; 3] = [RingId::Render, RingId::Video, RingId::Blit];
}

/// A 32-bit ring sequence number. Value `0` is reserved to mean "none".
/// Comparisons must use [`passed`](ring::passed), never `<`/`>`, since the
/// counter wraps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct Seqno(pub u32);

impl Seqno {
    pub const NONE: Seqno = Seqno(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Next sequence number after `self`, skipping the reserved `0`.
    pub fn next(self) -> Seqno {
        let n = self.0.wrapping_add(1);
        Seqno(if n == 0 { 1 } else { n })
    }
}

bitflags! {
    /// Coherency domains a buffer's contents may simultaneously be readable
    /// from. At most one of these is also the write domain.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DomainSet: u8 {
        const CPU = 0b001;
        const GTT = 0b010;
        const GPU = 0b100;
    }
}

/// A single coherency domain, used for the (at most one) write domain and
/// for addressing individual transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    Cpu,
    Gtt,
    Gpu,
}

impl From<Domain> for DomainSet {
    fn from(d: Domain) -> Self {
        match d {
            Domain::Cpu => DomainSet::CPU,
            Domain::Gtt => DomainSet::GTT,
            Domain::Gpu => DomainSet::GPU,
        }
    }
}

/// Userspace hint controlling whether backing pages may be discarded under
/// memory pressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Madvise {
    WillNeed,
    DontNeed,
    Purged,
}

/// Tiled framebuffer layout. `X` and `Y` require a fence register for linear
/// CPU access on generations below Sandybridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tiling {
    None,
    X,
    Y,
}

/// Cache-coherency class for an object's backing pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLevel {
    /// No CPU cache snooping; CPU accesses must be explicitly flushed.
    None,
    /// Last-level-cache snooped (platforms with LLC only).
    Llc,
}

/// Upper bound on `pin_count` for a single object. The original kernel uses
/// this to catch runaway pin/unpin imbalance in userspace; this crate treats
/// it the same way. Chosen generously since there is no real hardware limit.
pub const MAX_PIN: u32 = 4096;
