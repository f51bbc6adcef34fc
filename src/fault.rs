//! `FaultMapper`: the fault-driven GTT mmap path. See `SPEC_FULL.md` §4.8.
//!
//! Modeled on `i915_gem_fault`: a CPU access to an object's `mmap_gtt`
//! region that isn't backed yet binds the object (evicting if the
//! mappable sub-aperture is full), sets up a fence register if the
//! surface is tiled and the generation still requires one for CPU access,
//! and only then hands back the aperture offset the real MMU fault
//! handler uses to install the page-table entry.

use crate::backend::{CacheOps, GttWriter, PageSource, RegisterWriter};
use crate::binder::{self, BindParams};
use crate::domain::{self, RingContext};
use crate::error::GemError;
use crate::fence::FenceRegistry;
use crate::gen::Generation;
use crate::handle::HandleTable;
use crate::object::Placement;
use crate::range::GtRange;
use crate::ring::Cancel;
use crate::{Handle, RingId, PAGE_SIZE};
use std::sync::atomic::AtomicBool;

/// Parameters for one fault, gathered by the real MMU fault handler before
/// calling in.
pub struct FaultParams {
    pub fault_offset: u64,
    pub mappable_end: u64,
    /// Ring to pipeline the fence write through, if the object is
    /// currently active on one (a cheaper, non-stalling fence setup).
    pub pipelined_ring: Option<RingId>,
}

/// Resolve a CPU fault on `handle`'s GTT mapping, returning the absolute
/// aperture offset to install in the page table.
#[allow(clippy::too_many_arguments)]
pub fn handle_fault(
    handle: Handle,
    table: &mut HandleTable,
    gtt: &mut GtRange,
    generation: Generation,
    pages_source: &mut dyn PageSource,
    gtt_writer: &mut dyn GttWriter,
    registry: &mut FenceRegistry,
    register_writer: &mut dyn RegisterWriter,
    cache: &mut dyn CacheOps,
    ring: Option<RingContext<'_>>,
    cancel: &Cancel,
    wedged: &AtomicBool,
    params: FaultParams,
) -> Result<u64, GemError> {
    let object = table.get(handle).ok_or(GemError::NoSuchHandle)?;
    // Not map-and-fenceable (bound, but outside the mappable sub-aperture):
    // unbind so the block below rebinds it where the fault can reach it.
    if let Placement::Bound { mappable, .. } = object.placement {
        if !mappable {
            binder::unbind(handle, table, gtt, gtt_writer, pages_source, registry, register_writer)?;
        }
    }

    let object = table.get(handle).ok_or(GemError::NoSuchHandle)?;
    let just_bound = !object.placement.is_bound();
    if just_bound {
        let candidates: Vec<Handle> = table
            .iter()
            .filter(|(h, o)| *h != handle && o.placement.is_bound())
            .map(|(h, _)| h)
            .collect();
        let size = object.size;
        let align = PAGE_SIZE;
        if gtt.search_free_in_range(size, align, 0, gtt.base(), params.mappable_end).is_err() {
            binder::evict_something(
                table,
                gtt,
                gtt_writer,
                pages_source,
                registry,
                register_writer,
                &candidates,
                size,
                align,
                0,
            )?;
        }
        binder::bind(
            handle,
            table,
            gtt,
            generation,
            pages_source,
            gtt_writer,
            BindParams {
                alignment: None,
                mappable_end: params.mappable_end,
            },
        )?;

        let object_id = handle.id();
        let object = table.get_mut(handle).expect("handle checked valid above");
        domain::set_to_gtt_domain(object, true, cache, object_id, ring, cancel, wedged)?;
    }

    let object = table.get(handle).ok_or(GemError::NoSuchHandle)?;
    let Placement::Bound { offset, mappable, .. } = object.placement else {
        unreachable!("just bound above");
    };
    if !mappable {
        return Err(GemError::NoMemory);
    }

    if object.tiling == crate::Tiling::None {
        let object = table.get_mut(handle).expect("handle checked valid above");
        domain::put_fence(object, handle, registry, register_writer, None, cancel, wedged)?;
    } else if generation.fence_required_for_mapping() && !object.fence.is_fenced() {
        let object = table.get_mut(handle).expect("handle checked valid above");
        domain::get_fence(object, handle, offset, registry, register_writer, params.pipelined_ring)?;
    }

    let object = table.get_mut(handle).expect("handle checked valid above");
    object.fault_mappable = true;
    Ok(offset + params.fault_offset)
}
