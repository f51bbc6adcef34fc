//! `FenceRegistry`: a bounded, LRU-reclaimed pool of hardware fence
//! registers. See `SPEC_FULL.md` §4.4.
//!
//! Grounded on the teacher's `BindGroupCache` (`webgpu/mod.rs`): a small,
//! fixed-capacity cache with dependency-aware eviction. There the
//! dependents are bind groups keyed off buffers/views/samplers; here the
//! "cache" is the literal hardware fence table and eviction means stealing
//! the least-recently-used unpinned register rather than dropping a cached
//! bind group.

use crate::backend::RegisterWriter;
use crate::gen::{FenceParams, Generation};
use crate::{Handle, RingId, Seqno, Tiling};

#[derive(Clone, Copy, Debug)]
struct SlotState {
    obj: Option<Handle>,
    pin_count: u32,
    setup_seqno: Seqno,
    last_use_ring: Option<RingId>,
}

/// Fixed-size table of hardware fence registers. `N` is
/// [`Generation::num_fence_regs`].
pub struct FenceRegistry {
    generation: Generation,
    slots: Vec<SlotState>,
    /// LRU order of in-use slots, front = least recently used. Free slots
    /// are never in this list.
    lru: Vec<usize>,
}

/// Returned by [`FenceRegistry::assign`] when a steal happened, so the
/// caller (`domain::put_fence`) can update the dispossessed object's
/// `FenceState` to `NoFence`.
#[derive(Clone, Copy, Debug)]
pub struct Stolen {
    pub previous_owner: Handle,
}

impl FenceRegistry {
    pub fn new(generation: Generation) -> Self {
        let n = generation.num_fence_regs();
        Self {
            generation,
            slots: vec![
                SlotState {
                    obj: None,
                    pin_count: 0,
                    setup_seqno: Seqno::NONE,
                    last_use_ring: None,
                };
                n
            ],
            lru: Vec::with_capacity(n),
        }
    }

    pub fn num_regs(&self) -> usize {
        self.slots.len()
    }

    fn touch_lru(&mut self, index: usize) {
        self.lru.retain(|&i| i != index);
        self.lru.push(index);
    }

    /// Prefer a genuinely empty slot. Otherwise scan the LRU list
    /// front-to-back (oldest-used first) for the oldest slot with
    /// `pin_count == 0`, preferring one whose `last_use_ring` matches
    /// `preferred_ring` (a cheap steal needing no cross-ring sync). Returns
    /// `None` only if every slot is pinned.
    pub fn find_free_or_steal(&self, preferred_ring: Option<RingId>) -> Option<usize> {
        if let Some(index) = self.slots.iter().position(|s| s.obj.is_none()) {
            return Some(index);
        }
        let mut best: Option<usize> = None;
        for &index in &self.lru {
            let slot = &self.slots[index];
            if slot.pin_count != 0 {
                continue;
            }
            if best.is_none() {
                best = Some(index);
            }
            if preferred_ring.is_some() && slot.last_use_ring == preferred_ring {
                return Some(index);
            }
        }
        best
    }

    /// Assign `obj` to `reg_index`, writing the chipset-specific encoding.
    /// If the slot was occupied, returns the dispossessed handle so the
    /// caller can clear its `FenceState`.
    #[allow(clippy::too_many_arguments)]
    pub fn assign(
        &mut self,
        reg_index: usize,
        obj: Handle,
        gtt_offset: u64,
        size: u64,
        stride: u32,
        tiling: Tiling,
        pipelined_ring: Option<RingId>,
        writer: &mut dyn RegisterWriter,
    ) -> Option<Stolen> {
        let stolen = self.slots[reg_index].obj.map(|previous_owner| Stolen { previous_owner });

        let write = self.generation.encoder().encode(FenceParams {
            reg_index,
            gtt_offset,
            size,
            stride,
            tiling,
        });
        match pipelined_ring {
            Some(ring) => writer.write_pipelined(ring, write),
            None => writer.write_mmio(write),
        }

        self.slots[reg_index] = SlotState {
            obj: Some(obj),
            pin_count: self.slots[reg_index].pin_count,
            setup_seqno: Seqno::NONE,
            last_use_ring: pipelined_ring,
        };
        self.touch_lru(reg_index);
        stolen
    }

    /// Zero the hardware register and detach it from the LRU.
    pub fn clear(&mut self, reg_index: usize, writer: &mut dyn RegisterWriter) {
        use crate::gen::FenceWrite;
        // A zero-valued write with the valid bit clear disables the
        // register on every generation's encoding.
        writer.write_mmio(FenceWrite::Reg64 {
            offset: reg_index as u32,
            value: 0,
        });
        self.slots[reg_index] = SlotState {
            obj: None,
            pin_count: 0,
            setup_seqno: Seqno::NONE,
            last_use_ring: None,
        };
        self.lru.retain(|&i| i != reg_index);
    }

    pub fn pin(&mut self, reg_index: usize) {
        self.slots[reg_index].pin_count += 1;
    }

    pub fn unpin(&mut self, reg_index: usize) {
        self.slots[reg_index].pin_count = self.slots[reg_index].pin_count.saturating_sub(1);
    }

    pub fn owner(&self, reg_index: usize) -> Option<Handle> {
        self.slots[reg_index].obj
    }
}
