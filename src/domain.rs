//! `DomainMachine`: CPU/GTT/GPU domain transitions with flush/invalidate
//! side effects. See `SPEC_FULL.md` §4.6.

use crate::backend::{CacheOps, RingBackend};
use crate::error::GemError;
use crate::fence::FenceRegistry;
use crate::object::Object;
use crate::ring::{Cancel, RingTracker};
use crate::{Domain, DomainSet, Handle, RingId};
use std::sync::atomic::AtomicBool;

/// Everything a transition needs to know about the ring currently holding
/// the object active, if any.
pub struct RingContext<'a> {
    pub id: RingId,
    pub tracker: &'a mut RingTracker,
    pub backend: &'a mut dyn RingBackend,
}

fn wait_for_rendering(
    obj: &Object,
    ring: Option<RingContext<'_>>,
    cancel: &Cancel,
    wedged: &AtomicBool,
) -> Result<(), GemError> {
    let crate::object::Activity::Active { last_seqno, .. } = obj.activity else {
        return Ok(());
    };
    let Some(ring) = ring else {
        // No ring context supplied for an active object: caller error, but
        // we fail closed rather than silently skip the wait.
        return Err(GemError::Invalid);
    };
    ring.tracker.wait(last_seqno, ring.backend, cancel, wedged, false)
}

/// Flush whichever domain currently holds the (at most one) write domain,
/// ahead of a transition away from it. Matches the table's "flush GPU/CPU/
/// GTT write if any" requirement for every transition.
fn flush_current_write_domain(obj: &mut Object, cache: &mut dyn CacheOps) {
    match obj.write_domain {
        Some(Domain::Cpu) => {
            if let Some(pages) = &obj.pages {
                cache.clflush_pages(pages);
            }
        }
        Some(Domain::Gtt) => cache.sfence(),
        Some(Domain::Gpu) => {
            // Made visible to other domains by the rendering wait that
            // precedes every transition; nothing further to flush here.
        }
        None => {}
    }
}

/// `set_to_gtt_domain(obj, write)`.
pub fn set_to_gtt_domain(
    obj: &mut Object,
    write: bool,
    cache: &mut dyn CacheOps,
    object_id: u64,
    ring: Option<RingContext<'_>>,
    cancel: &Cancel,
    wedged: &AtomicBool,
) -> Result<(), GemError> {
    log::trace!("object {object_id}: -> GTT domain (write={write})");
    let pending_gpu_write = obj.write_domain == Some(Domain::Gpu);
    if write || pending_gpu_write {
        wait_for_rendering(obj, ring, cancel, wedged)?;
    }
    flush_current_write_domain(obj, cache);

    if write {
        obj.read_domains = DomainSet::GTT;
        obj.write_domain = Some(Domain::Gtt);
    } else {
        obj.read_domains |= DomainSet::GTT;
    }
    Ok(())
}

/// `set_to_cpu_domain(obj, write)`.
pub fn set_to_cpu_domain(
    obj: &mut Object,
    write: bool,
    cache: &mut dyn CacheOps,
    object_id: u64,
    ring: Option<RingContext<'_>>,
    cancel: &Cancel,
    wedged: &AtomicBool,
) -> Result<(), GemError> {
    log::trace!("object {object_id}: -> CPU domain (write={write})");
    wait_for_rendering(obj, ring, cancel, wedged)?;
    flush_current_write_domain(obj, cache);

    if !obj.read_domains.contains(DomainSet::CPU) {
        if let Some(pages) = &obj.pages {
            cache.clflush_pages(pages);
        }
    }

    if write {
        obj.read_domains = DomainSet::CPU;
        obj.write_domain = Some(Domain::Cpu);
    } else {
        obj.read_domains |= DomainSet::CPU;
    }
    Ok(())
}

/// `set_to_gpu_domain(obj, ring, write)`. No wait is required: the ring
/// orders itself against whatever domain the object is transitioning from.
pub fn set_to_gpu_domain(obj: &mut Object, write: bool, cache: &mut dyn CacheOps, object_id: u64) {
    log::trace!("object {object_id}: -> GPU domain (write={write})");
    flush_current_write_domain(obj, cache);
    obj.read_domains |= DomainSet::GPU;
    if write {
        obj.write_domain = Some(Domain::Gpu);
    }
}

/// `set_cpu_read_domain_range(obj, off, size)`. Only clflushes the pages
/// covering `[off, off+size)` that aren't already marked CPU-valid, then
/// marks them valid.
pub fn set_cpu_read_domain_range(
    obj: &mut Object,
    off: u64,
    size: u64,
    cache: &mut dyn CacheOps,
) {
    use crate::PAGE_SIZE;
    if obj.read_domains.contains(DomainSet::CPU) && obj.cpu_valid.iter().all(|&v| v) {
        return;
    }
    let first_page = (off / PAGE_SIZE) as usize;
    let last_page = ((off + size - 1) / PAGE_SIZE) as usize;
    if let Some(pages) = &obj.pages {
        let mut dirty = Vec::new();
        for p in first_page..=last_page.min(pages.len().saturating_sub(1)) {
            if !obj.cpu_valid.get(p).copied().unwrap_or(true) {
                dirty.push(pages[p]);
            }
        }
        if !dirty.is_empty() {
            cache.clflush_pages(&dirty);
        }
    }
    for p in first_page..=last_page.min(obj.cpu_valid.len().saturating_sub(1)) {
        obj.cpu_valid[p] = true;
    }
    obj.read_domains |= DomainSet::CPU;
}

/// `finish_gtt(obj)`: full CPU fence, revoke any live mmap, drop GTT from
/// the domain set.
pub fn finish_gtt(obj: &mut Object, object_id: u64, cache: &mut dyn CacheOps) {
    cache.mfence();
    if obj.fault_mappable {
        cache.revoke_mmap(object_id);
    }
    obj.read_domains.remove(DomainSet::GTT);
    if obj.write_domain == Some(Domain::Gtt) {
        obj.write_domain = None;
    }
}

/// `put_fence(obj, reg_index)`: release a held fence register, waiting if
/// the register's last use by a ring has not yet retired.
pub fn put_fence(
    obj: &mut Object,
    owner: Handle,
    registry: &mut FenceRegistry,
    writer: &mut dyn crate::backend::RegisterWriter,
    ring: Option<RingContext<'_>>,
    cancel: &Cancel,
    wedged: &AtomicBool,
) -> Result<(), GemError> {
    let crate::object::FenceState::Fenced { reg_index, last_use_seqno, .. } = obj.fence else {
        return Ok(());
    };
    if !last_use_seqno.is_none() {
        if let Some(ring) = ring {
            ring.tracker.wait(last_use_seqno, ring.backend, cancel, wedged, false)?;
        }
    }
    registry.clear(reg_index, writer);
    let _ = owner;
    obj.fence = crate::object::FenceState::NoFence;
    Ok(())
}

/// `get_fence(obj, owner, generation, pipelined_ring)`: assign a fence
/// register, stealing the LRU unpinned one if the table is full.
#[allow(clippy::too_many_arguments)]
pub fn get_fence(
    obj: &mut Object,
    owner: Handle,
    gtt_offset: u64,
    registry: &mut FenceRegistry,
    writer: &mut dyn crate::backend::RegisterWriter,
    pipelined_ring: Option<RingId>,
) -> Result<Option<Handle>, GemError> {
    if obj.fence.is_fenced() {
        return Ok(None);
    }
    let reg_index = registry
        .find_free_or_steal(pipelined_ring)
        .ok_or(GemError::DeadLock)?;
    let stolen = registry.assign(
        reg_index,
        owner,
        gtt_offset,
        obj.size,
        obj.stride,
        obj.tiling,
        pipelined_ring,
        writer,
    );
    obj.fence = crate::object::FenceState::Fenced {
        reg_index,
        setup_seqno: crate::Seqno::NONE,
        last_use_seqno: crate::Seqno::NONE,
        last_use_ring: pipelined_ring.unwrap_or(RingId::Render),
    };
    Ok(stolen.map(|s| s.previous_owner))
}
