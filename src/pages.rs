//! `PageProvider`: lazy acquisition/release of backing pages from a
//! pageable source. See `SPEC_FULL.md` §4.3.

use crate::backend::PageSource;
use crate::error::GemError;
use crate::object::Object;
use crate::{Madvise, Tiling};

/// Bit-17 boundary in bytes: pages whose physical address has this bit set
/// swizzle on tiled surfaces that require it.
const SWIZZLE_BIT: u64 = 1 << 17;

/// Acquire (and wire) every page an object needs from `source`. On any
/// failure, pages already acquired this call are unwired before returning,
/// so a failed `acquire` never leaves an object partially paged in. Tiled
/// objects additionally get a per-page bit-17 swizzle bitmap recorded,
/// consulted by the CPU bounce path when bouncing tiled pages through the
/// CPU domain on platforms that require it.
pub fn acquire(object_id: u64, object: &mut Object, source: &mut dyn PageSource) -> Result<(), GemError> {
    debug_assert!(object.pages.is_none(), "acquire called on an already-paged-in object");
    match source.acquire(object_id, object.size) {
        Ok(pages) => {
            debug_assert_eq!(pages.len(), object.page_count());
            if object.tiling != Tiling::None {
                object.swizzle = pages
                    .iter()
                    .map(|p| ((p.0 * crate::PAGE_SIZE) & SWIZZLE_BIT != 0) as u8)
                    .collect();
            }
            object.pages = Some(pages);
            Ok(())
        }
        Err(e) => {
            log::warn!("page acquisition failed for object {object_id}: {e}");
            Err(GemError::IoError(e))
        }
    }
}

/// Unwire all of an object's pages. Must be total: a partial release is an
/// invariant violation, so this always clears `object.pages` to `None`
/// regardless of the `dirty` bookkeeping outcome.
pub fn release(object_id: u64, object: &mut Object, source: &mut dyn PageSource, dirty: bool) {
    let Some(pages) = object.pages.take() else {
        return;
    };
    let drop_dirty = matches!(object.madvise, Madvise::DontNeed);
    source.release(object_id, &pages, dirty, drop_dirty);
    if matches!(object.madvise, Madvise::Purged) {
        source.purge(object_id);
    }
}
