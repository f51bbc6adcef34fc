//! [`Object`]: a reference-counted GPU buffer with pages, domain state, and
//! placement metadata. See the data model in `SPEC_FULL.md` §3.

use crate::backend::PageRef;
use crate::range::Slot;
use crate::{CacheLevel, Domain, DomainSet, Madvise, RingId, Seqno, Tiling, PAGE_SIZE};

/// Where an object currently sits with respect to the GTT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Unbound,
    Bound {
        slot: Slot,
        offset: u64,
        /// Whether the binding is large/aligned enough to be fence-capable.
        fenceable: bool,
        /// Whether the binding falls entirely within the CPU-visible
        /// mappable aperture.
        mappable: bool,
    },
}

impl Placement {
    pub fn is_bound(&self) -> bool {
        matches!(self, Placement::Bound { .. })
    }
}

/// Whether and where GPU work has touched this object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Inactive,
    Active { ring: RingId, last_seqno: Seqno },
    /// A write domain is dirty and retirement is awaiting a flush.
    Flushing,
}

impl Activity {
    pub fn is_active(&self) -> bool {
        matches!(self, Activity::Active { .. })
    }
}

/// Hardware fence-register assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    NoFence,
    Fenced {
        reg_index: usize,
        setup_seqno: Seqno,
        last_use_seqno: Seqno,
        last_use_ring: RingId,
    },
}

impl FenceState {
    pub fn is_fenced(&self) -> bool {
        matches!(self, FenceState::Fenced { .. })
    }
}

/// Which internal list an object currently belongs to, enforcing invariant
/// 10 ("each object has at most one membership in each list") by
/// construction: an object is in exactly one or none of these at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListMembership {
    None,
    Active,
    Flushing,
    Inactive,
    Pinned,
}

/// A GPU buffer object.
pub struct Object {
    pub size: u64,
    pub refcount: u32,
    pub madvise: Madvise,
    pub placement: Placement,
    pub pages: Option<Vec<PageRef>>,
    pub activity: Activity,
    pub pin_count: u32,
    pub tiling: Tiling,
    pub stride: u32,
    pub fence: FenceState,
    pub read_domains: DomainSet,
    pub write_domain: Option<Domain>,
    pub fault_mappable: bool,
    pub phys_backing: Option<Box<[u8]>>,
    pub cache_level: CacheLevel,
    pub list: ListMembership,
    /// Per-page CPU-valid bitmap used by `set_cpu_read_domain_range`.
    pub cpu_valid: Vec<bool>,
    /// Per-page bit-17 swizzle bits recorded by `PageProvider::acquire`.
    pub swizzle: Vec<u8>,
}

impl Object {
    /// Construct a freshly created object per `Manager::create`: `Unbound`,
    /// `Inactive`, `read = {CPU}`, `write = CPU`, `madvise = WillNeed`.
    pub fn new(size: u64, cache_level: CacheLevel) -> Self {
        let pages = (size / PAGE_SIZE) as usize;
        Self {
            size,
            refcount: 1,
            madvise: Madvise::WillNeed,
            placement: Placement::Unbound,
            pages: None,
            activity: Activity::Inactive,
            pin_count: 0,
            tiling: Tiling::None,
            stride: 0,
            fence: FenceState::NoFence,
            read_domains: DomainSet::CPU,
            write_domain: Some(Domain::Cpu),
            fault_mappable: false,
            phys_backing: None,
            cache_level,
            list: ListMembership::None,
            cpu_valid: vec![true; pages],
            swizzle: vec![0; pages],
        }
    }

    pub fn page_count(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }

    pub fn is_purgeable(&self) -> bool {
        matches!(self.madvise, Madvise::DontNeed)
    }

    /// Invariant 4: a write domain, if present, is also a read domain.
    pub fn check_write_domain_invariant(&self) -> bool {
        match self.write_domain {
            None => true,
            Some(d) => self.read_domains.contains(d.into()),
        }
    }
}
