//! `GtRange`: a first-fit free-range allocator over a contiguous integer
//! interval `[base, base + total)`, modeling the GPU's virtual aperture.
//!
//! Grounded on the teacher's `SlotMap`-keyed resource storage pattern
//! (`webgpu::Hub`): allocated blocks are handed out as generational
//! [`Slot`] keys rather than raw offsets, so a stale slot cannot alias a
//! later allocation at the same address. The free/allocated address space
//! itself is kept as a sorted list of contiguous segments — the structure a
//! first-fit allocator with coalescing and "color" adjacency rules needs —
//! rather than reusing `slotmap`'s dense-array semantics for the address
//! space itself.

use crate::error::OutOfSpace;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle to a single allocated block. Returned by [`GtRange::get_block`],
    /// consumed by [`GtRange::put_block`].
    pub struct Slot;
}

#[derive(Clone, Copy, Debug)]
struct Block {
    start: u64,
    size: u64,
    color: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SegmentKind {
    Free,
    Allocated(Slot),
}

#[derive(Clone, Copy, Debug)]
struct Segment {
    start: u64,
    size: u64,
    kind: SegmentKind,
}

/// A first-fit range allocator with colored adjacency restrictions.
pub struct GtRange {
    base: u64,
    total: u64,
    /// Segments sorted by `start`, covering `[base, base+total)` exactly
    /// with no gaps — every byte is accounted for as Free or Allocated.
    segments: Vec<Segment>,
    blocks: SlotMap<Slot, Block>,
}

impl GtRange {
    pub fn new(base: u64, total: u64) -> Self {
        Self {
            base,
            total,
            segments: vec![Segment {
                start: base,
                size: total,
                kind: SegmentKind::Free,
            }],
            blocks: SlotMap::with_key(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn end(&self) -> u64 {
        self.base + self.total
    }

    fn color_of(&self, slot: Slot) -> u32 {
        self.blocks[slot].color
    }

    /// Whether placing a block of `color` at `[start, start+size)` would
    /// abut (touch with zero gap) an allocated neighbor of a different
    /// color. The core only ever passes a nonzero color when tiling
    /// demands cache-line isolation; color `0` never conflicts with
    /// anything, matching the spec's note that the core passes `0` by
    /// default.
    fn color_conflict(&self, index: usize, start: u64, size: u64, color: u32) -> bool {
        if color == 0 {
            return false;
        }
        if index > 0 {
            let left = &self.segments[index - 1];
            if left.start + left.size == start {
                if let SegmentKind::Allocated(s) = left.kind {
                    if self.color_of(s) != color {
                        return true;
                    }
                }
            }
        }
        if let Some(right) = self.segments.get(index + 1) {
            if start + size == right.start {
                if let SegmentKind::Allocated(s) = right.kind {
                    if self.color_of(s) != color {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Locate (without committing) the first free region able to hold
    /// `size` at `align`-aligned offset, restricted to `[lo, hi)`. Returns
    /// the chosen start offset.
    pub fn search_free_in_range(
        &self,
        size: u64,
        align: u64,
        color: u32,
        lo: u64,
        hi: u64,
    ) -> Result<u64, OutOfSpace> {
        debug_assert!(align.is_power_of_two());
        for (index, seg) in self.segments.iter().enumerate() {
            if seg.kind != SegmentKind::Free {
                continue;
            }
            let seg_end = seg.start + seg.size;
            let window_start = seg.start.max(lo);
            let window_end = seg_end.min(hi);
            if window_start >= window_end {
                continue;
            }
            let aligned = align_up(window_start, align);
            if aligned + size > window_end {
                continue;
            }
            if self.color_conflict(index, aligned, size, color) {
                continue;
            }
            return Ok(aligned);
        }
        Err(OutOfSpace)
    }

    pub fn search_free(&self, size: u64, align: u64, color: u32) -> Result<u64, OutOfSpace> {
        self.search_free_in_range(size, align, color, self.base, self.end())
    }

    /// Commit a block at `start` (as returned by `search_free*`), returning
    /// its [`Slot`]. Splits the hosting free segment as needed.
    pub fn get_block(&mut self, start: u64, size: u64, color: u32) -> Slot {
        let index = self
            .segments
            .iter()
            .position(|s| s.kind == SegmentKind::Free && s.start <= start && start + size <= s.start + s.size)
            .expect("get_block called with a start not covered by a free segment");

        let seg = self.segments[index];
        let slot = self.blocks.insert(Block { start, size, color });

        let mut replacement = Vec::with_capacity(3);
        if seg.start < start {
            replacement.push(Segment {
                start: seg.start,
                size: start - seg.start,
                kind: SegmentKind::Free,
            });
        }
        replacement.push(Segment {
            start,
            size,
            kind: SegmentKind::Allocated(slot),
        });
        let seg_end = seg.start + seg.size;
        let alloc_end = start + size;
        if alloc_end < seg_end {
            replacement.push(Segment {
                start: alloc_end,
                size: seg_end - alloc_end,
                kind: SegmentKind::Free,
            });
        }
        self.segments.splice(index..=index, replacement);
        slot
    }

    /// Free a previously allocated block, coalescing with free neighbors.
    /// Returns the freed `(start, size)`.
    pub fn put_block(&mut self, slot: Slot) -> (u64, u64) {
        let block = self.blocks.remove(slot).expect("double free of GtRange slot");
        let index = self
            .segments
            .iter()
            .position(|s| s.kind == SegmentKind::Allocated(slot))
            .expect("allocated slot missing from segment list");

        let mut start = self.segments[index].start;
        let mut size = self.segments[index].size;

        // Coalesce with the following segment if free.
        if let Some(next) = self.segments.get(index + 1).copied() {
            if next.kind == SegmentKind::Free {
                size += next.size;
                self.segments.remove(index + 1);
            }
        }
        // Coalesce with the preceding segment if free.
        let mut merge_index = index;
        if index > 0 {
            if let Some(prev) = self.segments.get(index - 1).copied() {
                if prev.kind == SegmentKind::Free {
                    start = prev.start;
                    size += prev.size;
                    merge_index = index - 1;
                    self.segments.remove(index - 1);
                }
            }
        }
        self.segments[merge_index] = Segment {
            start,
            size,
            kind: SegmentKind::Free,
        };
        (block.start, block.size)
    }

    /// Total free bytes across the whole aperture.
    pub fn free_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Free)
            .map(|s| s.size)
            .sum()
    }

    pub fn slot_range(&self, slot: Slot) -> (u64, u64) {
        let b = &self.blocks[slot];
        (b.start, b.size)
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_allocates_from_start() {
        let mut r = GtRange::new(0, 0x10000);
        let start = r.search_free(0x1000, 0x1000, 0).unwrap();
        assert_eq!(start, 0);
        let slot = r.get_block(start, 0x1000, 0);
        assert_eq!(r.slot_range(slot), (0, 0x1000));
    }

    #[test]
    fn out_of_space_when_exhausted() {
        let mut r = GtRange::new(0, 0x1000);
        let s = r.search_free(0x1000, 0x1000, 0).unwrap();
        r.get_block(s, 0x1000, 0);
        assert!(r.search_free(1, 1, 0).is_err());
    }

    #[test]
    fn put_block_coalesces_neighbors() {
        let mut r = GtRange::new(0, 0x3000);
        let a = r.get_block(r.search_free(0x1000, 0x1000, 0).unwrap(), 0x1000, 0);
        let b = r.get_block(r.search_free(0x1000, 0x1000, 0).unwrap(), 0x1000, 0);
        let _c = r.get_block(r.search_free(0x1000, 0x1000, 0).unwrap(), 0x1000, 0);
        r.put_block(a);
        r.put_block(b);
        assert_eq!(r.free_bytes(), 0x2000);
        // The freed region should now be contiguous and allocatable as one block.
        let start = r.search_free(0x2000, 0x1000, 0).unwrap();
        assert_eq!(start, 0);
    }

    #[test]
    fn color_conflict_blocks_abutting_allocation() {
        let mut r = GtRange::new(0, 0x2000);
        let a_start = r.search_free(0x1000, 0x1000, 1).unwrap();
        r.get_block(a_start, 0x1000, 1);
        // A different color cannot be placed directly touching color 1.
        assert!(r.search_free_in_range(0x1000, 0x1000, 2, 0x1000, 0x2000).is_err());
        // The same color may abut.
        assert!(r.search_free_in_range(0x1000, 0x1000, 1, 0x1000, 0x2000).is_ok());
    }

    #[test]
    fn range_restricted_search_respects_bounds() {
        let r = GtRange::new(0, 0x4000);
        assert!(r.search_free_in_range(0x1000, 0x1000, 0, 0x2000, 0x2500).is_err());
        assert_eq!(
            r.search_free_in_range(0x1000, 0x1000, 0, 0x2000, 0x3000).unwrap(),
            0x2000
        );
    }
}
