//! `Reclaimer`: low-memory page reclaim. See `SPEC_FULL.md` §4.9.
//!
//! Modeled on `i915_gem_shrink`/`i915_gem_purge`: reclaim happens in two
//! increasingly expensive passes. First, objects already marked
//! "don't need" or unbound-but-still-paged-in are released for free —
//! no aperture work, no writeback. Only if that isn't enough does the
//! shrinker fall back to unbinding LRU inactive, unpinned residents.

use crate::backend::{GttWriter, PageSource, RegisterWriter};
use crate::binder;
use crate::error::GemError;
use crate::fence::FenceRegistry;
use crate::handle::HandleTable;
use crate::object::Placement;
use crate::{pages, Handle, Madvise};

/// Result of one reclaim pass: how many bytes of page memory were
/// released back to the pageable source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reclaimed {
    pub bytes: u64,
    pub objects: u32,
}

/// Release backing pages (without touching the aperture) from any object
/// that is unbound, unpinned, inactive, and already paged in. Cheapest
/// possible reclaim: no GTT teardown, no fence release.
pub fn release_unbound_pages(table: &mut HandleTable, pages_source: &mut dyn PageSource) -> Reclaimed {
    let mut result = Reclaimed::default();
    let candidates: Vec<Handle> = table
        .iter()
        .filter(|(_, o)| {
            !o.placement.is_bound() && o.pin_count == 0 && !o.activity.is_active() && o.pages.is_some()
        })
        .map(|(h, _)| h)
        .collect();
    for handle in candidates {
        let object_id = handle.id();
        let object = table.get_mut(handle).expect("handle collected above");
        let freed = object.size;
        let dirty = object.madvise != Madvise::DontNeed;
        pages::release(object_id, object, pages_source, dirty);
        result.bytes += freed;
        result.objects += 1;
    }
    result
}

/// Discard (without writeback) the backing store of every object the
/// application has marked `DontNeed`/`Purged`, whether or not it is
/// currently bound. Matches the aggressive purge path taken when a
/// regular shrink can't keep up.
#[allow(clippy::too_many_arguments)]
pub fn purge_volatile(
    table: &mut HandleTable,
    gtt: &mut crate::range::GtRange,
    gtt_writer: &mut dyn GttWriter,
    pages_source: &mut dyn PageSource,
    fence_registry: &mut FenceRegistry,
    register_writer: &mut dyn RegisterWriter,
) -> Reclaimed {
    let mut result = Reclaimed::default();
    let candidates: Vec<Handle> = table
        .iter()
        .filter(|(_, o)| o.is_purgeable() && o.pin_count == 0 && !o.activity.is_active())
        .map(|(h, _)| h)
        .collect();
    for handle in candidates {
        let Some(object) = table.get(handle) else { continue };
        let freed = object.size;
        if object.placement.is_bound() {
            if binder::unbind(handle, table, gtt, gtt_writer, pages_source, fence_registry, register_writer).is_err() {
                continue;
            }
        } else if table.get(handle).map(|o| o.pages.is_some()).unwrap_or(false) {
            let object_id = handle.id();
            let object = table.get_mut(handle).expect("checked above");
            pages::release(object_id, object, pages_source, false);
        }
        result.bytes += freed;
        result.objects += 1;
    }
    result
}

/// Full shrinker entry point: release cheap (unbound) pages first, then
/// purge volatile objects, then fall back to unbinding LRU inactive
/// residents from `candidates` (oldest first) until `target_bytes` has
/// been reclaimed or candidates run out.
#[allow(clippy::too_many_arguments)]
pub fn run(
    table: &mut HandleTable,
    gtt: &mut crate::range::GtRange,
    gtt_writer: &mut dyn GttWriter,
    pages_source: &mut dyn PageSource,
    fence_registry: &mut FenceRegistry,
    register_writer: &mut dyn RegisterWriter,
    candidates: &[Handle],
    target_bytes: u64,
) -> Result<Reclaimed, GemError> {
    let mut total = Reclaimed::default();

    let r = release_unbound_pages(table, pages_source);
    total.bytes += r.bytes;
    total.objects += r.objects;
    if total.bytes >= target_bytes {
        return Ok(total);
    }

    let r = purge_volatile(table, gtt, gtt_writer, pages_source, fence_registry, register_writer);
    total.bytes += r.bytes;
    total.objects += r.objects;
    if total.bytes >= target_bytes {
        return Ok(total);
    }

    for &handle in candidates {
        if total.bytes >= target_bytes {
            break;
        }
        let evictable = table
            .get(handle)
            .map(|o| matches!(o.placement, Placement::Bound { .. }) && o.pin_count == 0 && !o.activity.is_active())
            .unwrap_or(false);
        if !evictable {
            continue;
        }
        let size = table.get(handle).expect("checked above").size;
        if binder::unbind(handle, table, gtt, gtt_writer, pages_source, fence_registry, register_writer).is_ok() {
            total.bytes += size;
            total.objects += 1;
        }
    }

    log::debug!(
        "reclaim pass freed {} bytes across {} objects (target {})",
        total.bytes,
        total.objects,
        target_bytes
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use crate::range::GtRange;
    use crate::testutil::FakeBackend;
    use crate::CacheLevel;

    #[test]
    fn releases_unbound_pages_without_touching_aperture() {
        let mut table = HandleTable::new();
        let mut pages_backend = FakeBackend::new();
        let handle = table.insert(Object::new(4096, CacheLevel::None));
        pages::acquire(handle.id(), table.get_mut(handle).unwrap(), &mut pages_backend).unwrap();

        let reclaimed = release_unbound_pages(&mut table, &mut pages_backend);
        assert_eq!(reclaimed.bytes, 4096);
        assert!(table.get(handle).unwrap().pages.is_none());
    }

    #[test]
    fn run_falls_back_to_unbinding_when_nothing_cheap_is_available() {
        let mut table = HandleTable::new();
        let mut gtt = GtRange::new(0, 0x10_0000);
        let mut pages_backend = FakeBackend::new();
        let mut gtt_backend = FakeBackend::new();

        let handle = table.insert(Object::new(4096, CacheLevel::None));
        binder::bind(
            handle,
            &mut table,
            &mut gtt,
            crate::gen::Generation::GenSandybridge,
            &mut pages_backend,
            &mut gtt_backend,
            crate::binder::BindParams { alignment: None, mappable_end: 0x10_0000 },
        )
        .unwrap();

        let mut fences = FenceRegistry::new(crate::gen::Generation::GenSandybridge);
        let mut reg_writer = FakeBackend::new();
        let reclaimed = run(
            &mut table,
            &mut gtt,
            &mut gtt_backend,
            &mut pages_backend,
            &mut fences,
            &mut reg_writer,
            &[handle],
            1,
        )
        .unwrap();
        assert_eq!(reclaimed.bytes, 4096);
        assert_eq!(table.get(handle).unwrap().placement, crate::object::Placement::Unbound);
    }
}
