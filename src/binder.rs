//! `Binder`: placement of objects in the GTT aperture, pinning, and
//! eviction. See `SPEC_FULL.md` §4.7.
//!
//! Grounded on the same eviction shape as [`crate::fence`]'s
//! `FenceRegistry` (itself modeled on the teacher's `BindGroupCache`):
//! when the aperture is full, reclaim the least-recently-used unpinned,
//! inactive resident rather than failing outright.

use crate::backend::{GttWriter, PageSource, RegisterWriter};
use crate::error::GemError;
use crate::fence::FenceRegistry;
use crate::gen::Generation;
use crate::handle::HandleTable;
use crate::object::{FenceState, ListMembership, Placement};
use crate::range::GtRange;
use crate::{pages, Handle, Tiling, MAX_PIN, PAGE_SIZE};

fn tiling_color(tiling: Tiling) -> u32 {
    match tiling {
        Tiling::None => 0,
        Tiling::X => 1,
        Tiling::Y => 2,
    }
}

/// Per-call binding parameters not carried on the object itself.
pub struct BindParams {
    /// Caller-requested minimum alignment. Raised to the fence alignment
    /// automatically for tiled objects.
    pub alignment: Option<u64>,
    /// End of the CPU-visible mappable sub-range of the aperture.
    pub mappable_end: u64,
}

/// Place `handle`'s pages into the aperture. A no-op if already bound.
pub fn bind(
    handle: Handle,
    table: &mut HandleTable,
    gtt: &mut GtRange,
    generation: Generation,
    pages_source: &mut dyn PageSource,
    gtt_writer: &mut dyn GttWriter,
    params: BindParams,
) -> Result<(), GemError> {
    let object_id = handle.id();
    let object = table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
    if object.placement.is_bound() {
        return Ok(());
    }
    if object.madvise != crate::Madvise::WillNeed {
        return Err(GemError::Invalid);
    }
    if object.size == 0 || object.size > gtt.end() - gtt.base() {
        return Err(GemError::TooBig);
    }

    let fence_size = generation.fence_size(object.size);
    let color = tiling_color(object.tiling);
    let (alloc_size, align) = match object.tiling {
        Tiling::None => {
            let unfenced_alignment = generation.unfenced_alignment(fence_size);
            (object.size, params.alignment.unwrap_or(unfenced_alignment))
        }
        _ => {
            let align = generation
                .fence_alignment(fence_size)
                .max(params.alignment.unwrap_or(PAGE_SIZE));
            (fence_size, align)
        }
    };

    let start = gtt
        .search_free(alloc_size, align, color)
        .map_err(|_| GemError::NoMemory)?;

    if object.pages.is_none() {
        pages::acquire(object_id, object, pages_source)?;
    }
    let object = table.get_mut(handle).expect("handle checked valid above");
    gtt_writer.insert(start, object.pages.as_ref().expect("just acquired"));

    let slot = gtt.get_block(start, alloc_size, color);
    let fenceable = match object.tiling {
        Tiling::None => start % generation.fence_alignment(fence_size) == 0,
        _ => true,
    };
    let mappable = start + object.size <= params.mappable_end;

    object.placement = Placement::Bound {
        slot,
        offset: start,
        fenceable,
        mappable,
    };
    object.fault_mappable = false;
    object.list = if object.pin_count > 0 {
        ListMembership::Pinned
    } else {
        ListMembership::Inactive
    };
    Ok(())
}

/// Remove `handle` from the aperture. Fails with [`GemError::Busy`] if the
/// object is pinned or still has outstanding GPU work (the caller must
/// retire that work first — `Binder` has no view of the ring trackers
/// needed to wait on it). A held fence register is released here directly
/// via `fence_registry`/`register_writer`, matching the distilled spec's
/// unbind sequence (finish_gpu, finish_gtt, set_to_cpu_domain, `put_fence`,
/// clear GTT range, unwire pages) — this crate folds the fence release into
/// `unbind` itself rather than requiring every caller to remember it, since
/// every unbind site (eviction, reclaim, `set_tiling`, destroy) needs it.
pub fn unbind(
    handle: Handle,
    table: &mut HandleTable,
    gtt: &mut GtRange,
    gtt_writer: &mut dyn GttWriter,
    pages_source: &mut dyn PageSource,
    fence_registry: &mut FenceRegistry,
    register_writer: &mut dyn RegisterWriter,
) -> Result<(), GemError> {
    let object_id = handle.id();
    let object = table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
    let Placement::Bound { slot, offset, .. } = object.placement else {
        return Ok(());
    };
    if object.pin_count > 0 {
        return Err(GemError::Busy);
    }
    if object.activity.is_active() {
        return Err(GemError::Busy);
    }
    if let FenceState::Fenced { reg_index, .. } = object.fence {
        fence_registry.clear(reg_index, register_writer);
        object.fence = FenceState::NoFence;
    }

    gtt_writer.clear(offset, object.size);
    gtt.put_block(slot);
    pages::release(object_id, object, pages_source, true);
    object.placement = Placement::Unbound;
    object.fault_mappable = false;
    object.list = ListMembership::None;
    Ok(())
}

pub fn pin(handle: Handle, table: &mut HandleTable) -> Result<(), GemError> {
    let object = table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
    if !object.placement.is_bound() {
        return Err(GemError::Invalid);
    }
    if object.pin_count >= MAX_PIN {
        return Err(GemError::Invalid);
    }
    object.pin_count += 1;
    object.list = ListMembership::Pinned;
    Ok(())
}

pub fn unpin(handle: Handle, table: &mut HandleTable) -> Result<(), GemError> {
    let object = table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
    object.pin_count = object.pin_count.saturating_sub(1);
    if object.pin_count == 0 {
        object.list = if object.activity.is_active() {
            ListMembership::Active
        } else {
            ListMembership::Inactive
        };
    }
    Ok(())
}

/// Free enough aperture space for `(size, align, color)`, unbinding
/// candidates from `candidates` (expected least-recently-used first) until
/// either the request fits or candidates are exhausted. Skips any
/// candidate that is pinned, active, or no longer bound. Returns
/// [`GemError::NoMemory`] if no arrangement of evictions would fit the
/// request at all.
#[allow(clippy::too_many_arguments)]
pub fn evict_something(
    table: &mut HandleTable,
    gtt: &mut GtRange,
    gtt_writer: &mut dyn GttWriter,
    pages_source: &mut dyn PageSource,
    fence_registry: &mut FenceRegistry,
    register_writer: &mut dyn RegisterWriter,
    candidates: &[Handle],
    size: u64,
    align: u64,
    color: u32,
) -> Result<(), GemError> {
    if gtt.search_free(size, align, color).is_ok() {
        return Ok(());
    }
    for &candidate in candidates {
        let evictable = table
            .get(candidate)
            .map(|o| o.placement.is_bound() && o.pin_count == 0 && !o.activity.is_active())
            .unwrap_or(false);
        if !evictable {
            continue;
        }
        unbind(candidate, table, gtt, gtt_writer, pages_source, fence_registry, register_writer)?;
        if gtt.search_free(size, align, color).is_ok() {
            return Ok(());
        }
    }
    log::warn!("evict_something exhausted {} candidates without freeing enough space", candidates.len());
    Err(GemError::NoMemory)
}

/// Unconditionally unbind every bound, unpinned, inactive object. Used for
/// full-aperture reclaim and before a mode set. Objects still pinned or
/// active are left in place; callers that need a truly empty aperture must
/// idle the rings and drop pins first.
pub fn evict_everything(
    table: &mut HandleTable,
    gtt: &mut GtRange,
    gtt_writer: &mut dyn GttWriter,
    pages_source: &mut dyn PageSource,
    fence_registry: &mut FenceRegistry,
    register_writer: &mut dyn RegisterWriter,
) -> Result<(), GemError> {
    let bound: Vec<Handle> = table
        .iter()
        .filter(|(_, o)| o.placement.is_bound())
        .map(|(h, _)| h)
        .collect();
    for handle in bound {
        match unbind(handle, table, gtt, gtt_writer, pages_source, fence_registry, register_writer) {
            Ok(()) | Err(GemError::Busy) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
