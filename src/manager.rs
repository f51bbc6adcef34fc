//! [`Manager`]: the external-facing facade tying every subsystem together
//! behind one lock. See `SPEC_FULL.md` §4.10 and the external interface
//! table in §6.
//!
//! Grounded on the teacher's `Context` (`webgpu/mod.rs`): one struct owning
//! the device, its resource hub, and every cache, with a single lock
//! serializing access. Here the "device" is the chipset generation
//! (immutable for the `Manager`'s lifetime) and the hub is
//! [`HandleTable`] plus the aperture allocator, fence table, and per-ring
//! trackers, all behind one `Mutex` — matching the original driver's
//! single `struct_mutex` rather than the teacher's finer-grained
//! `RwLock<Hub>` plus per-cache locks, since every GEM operation here
//! touches more than one of these structures at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::backend::{CacheOps, GttWriter, PageSource, RegisterWriter, RingBackend};
use crate::binder::{self, BindParams};
use crate::domain::{self, RingContext};
use crate::error::GemError;
use crate::fault::{self, FaultParams};
use crate::fence::FenceRegistry;
use crate::gen::Generation;
use crate::handle::HandleTable;
use crate::object::{Activity, FenceState, ListMembership, Placement};
use crate::pages;
use crate::range::GtRange;
use crate::ring::{Cancel, RingTracker};
use crate::reclaim;
use crate::{CacheLevel, Domain, Handle, Madvise, RingId, Seqno, Tiling, PAGE_SIZE};

/// Everything [`Manager::new`] needs from the platform: the chipset
/// generation and the real implementations of every collaborator trait in
/// [`crate::backend`].
pub struct ManagerConfig {
    pub generation: Generation,
    pub aperture_base: u64,
    pub aperture_total: u64,
    pub mappable_end: u64,
    pub pages_source: Box<dyn PageSource>,
    pub gtt_writer: Box<dyn GttWriter>,
    pub register_writer: Box<dyn RegisterWriter>,
    pub cache: Box<dyn CacheOps>,
    pub ring_backends: HashMap<RingId, Box<dyn RingBackend>>,
}

struct ManagerState {
    handle_table: HandleTable,
    gtt: GtRange,
    fence_registry: FenceRegistry,
    rings: HashMap<RingId, RingTracker>,
    ring_backends: HashMap<RingId, Box<dyn RingBackend>>,
    pages_source: Box<dyn PageSource>,
    gtt_writer: Box<dyn GttWriter>,
    register_writer: Box<dyn RegisterWriter>,
    cache: Box<dyn CacheOps>,
    /// Least-recently-touched-first order of inactive objects, consulted
    /// by the binder/fault/reclaim eviction paths.
    inactive_lru: Vec<Handle>,
    /// Handles whose last reference dropped while still bound or active.
    /// Retried by [`Manager::retire_all`] on every retire cycle rather than
    /// recursively unbinding under the device lock at unref time.
    deferred_free: Vec<Handle>,
}

/// The GEM core. Cheap to share: every mutating operation takes `&self`
/// and serializes internally on one lock, matching a single-`struct_mutex`
/// driver rather than requiring callers to hold an external lock.
pub struct Manager {
    generation: Generation,
    mappable_end: u64,
    wedged: AtomicBool,
    cancel: Cancel,
    state: Mutex<ManagerState>,
}

fn round_up_page(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn touch_lru(lru: &mut Vec<Handle>, handle: Handle) {
    lru.retain(|&h| h != handle);
    lru.push(handle);
}

fn untrack_lru(lru: &mut Vec<Handle>, handle: Handle) {
    lru.retain(|&h| h != handle);
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        let mut rings = HashMap::new();
        for &id in &RingId::ALL {
            rings.insert(id, RingTracker::new());
        }
        Manager {
            generation: config.generation,
            mappable_end: config.mappable_end,
            wedged: AtomicBool::new(false),
            cancel: Cancel::new(),
            state: Mutex::new(ManagerState {
                handle_table: HandleTable::new(),
                gtt: GtRange::new(config.aperture_base, config.aperture_total),
                fence_registry: FenceRegistry::new(config.generation),
                rings,
                ring_backends: config.ring_backends,
                pages_source: config.pages_source,
                gtt_writer: config.gtt_writer,
                register_writer: config.register_writer,
                cache: config.cache,
                inactive_lru: Vec::new(),
                deferred_free: Vec::new(),
            }),
        }
    }

    /// A fresh, never-submitted-to token an I/O-bound caller can use to
    /// interrupt any of this `Manager`'s blocking waits. Cloned cheaply;
    /// cancelling one cancels every wait holding a clone, including this
    /// `Manager`'s own internally issued waits during `destroy`.
    pub fn cancel_token(&self) -> Cancel {
        self.cancel.clone()
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::SeqCst)
    }

    /// Mark the device wedged: every blocked and future wait fails with
    /// [`GemError::Again`] until a real driver resets the hardware and
    /// clears this (not modeled here — out of scope per the specification).
    pub fn set_wedged(&self, wedged: bool) {
        self.wedged.store(wedged, Ordering::SeqCst);
    }

    /// Block until a hangcheck-triggered wedge clears, or until the 10
    /// second reset-recovery window elapses. Callers that got `Again` from a
    /// wait call this before retrying; returns `Ok(())` as soon as recovery
    /// observes `wedged` cleared, or [`GemError::IoError`] if it never does.
    pub fn wait_for_error(&self) -> Result<(), GemError> {
        const POLL: std::time::Duration = std::time::Duration::from_millis(50);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while self.wedged.load(Ordering::SeqCst) {
            if self.cancel.is_cancelled() {
                return Err(GemError::Interrupted);
            }
            if std::time::Instant::now() >= deadline {
                log::error!("wait_for_error timed out after 10s with the device still wedged");
                return Err(GemError::IoError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "reset recovery did not complete within 10 seconds",
                )));
            }
            std::thread::sleep(POLL);
        }
        Ok(())
    }

    pub fn create(&self, size: u64, cache_level: CacheLevel) -> Result<Handle, GemError> {
        if size == 0 {
            return Err(GemError::Invalid);
        }
        let size = round_up_page(size);
        let mut state = self.state.lock().unwrap();
        let handle = state
            .handle_table
            .insert(crate::object::Object::new(size, cache_level));
        touch_lru(&mut state.inactive_lru, handle);
        Ok(handle)
    }

    /// Retire every ring's completed requests and update object activity
    /// accordingly, then retry any destroy that was deferred because the
    /// object was still bound or active at its last unref. Called at the
    /// top of most operations, matching the original driver's
    /// `i915_gem_retire_requests` sweep (which itself drains
    /// `deferred_free_list` after walking the request lists).
    fn retire_all(&self, state: &mut ManagerState) {
        for &ring_id in &RingId::ALL {
            let Some(backend) = state.ring_backends.get(&ring_id) else { continue };
            let now = backend.get_seqno();
            let Some(tracker) = state.rings.get_mut(&ring_id) else { continue };
            let handle_table = &state.handle_table;
            let retired = tracker.retire(now, |h| match handle_table.get(h).map(|o| o.activity) {
                Some(Activity::Active { last_seqno, .. }) => last_seqno,
                _ => Seqno::NONE,
            });
            for handle in retired {
                if let Some(object) = state.handle_table.get_mut(handle) {
                    let dirty = object.write_domain == Some(Domain::Gpu);
                    object.activity = if dirty { Activity::Flushing } else { Activity::Inactive };
                    if !dirty {
                        object.list = ListMembership::Inactive;
                    }
                }
                touch_lru(&mut state.inactive_lru, handle);
            }
        }

        if state.deferred_free.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.deferred_free);
        for handle in pending {
            match self.finalize_destroy(state, handle) {
                Ok(()) => {}
                Err(GemError::Busy) => state.deferred_free.push(handle),
                Err(e) => {
                    log::warn!("deferred destroy of object {} failed: {e}", handle.id());
                }
            }
        }
    }

    /// The timer-driven retire worker's entry point. Like [`Manager::reclaim`],
    /// this is attempted non-blocking: if another operation currently holds
    /// the device lock, this tick is simply skipped and picked up again at
    /// the next timer fire, rather than stalling the retire worker thread.
    pub fn retire_requests(&self) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };
        self.retire_all(&mut state);
    }

    /// Delete `handle`, dropping the handle table's reference. If this was
    /// the last reference and the object is unbound, it is destroyed
    /// immediately; if it is still bound, pinned, or active, destruction is
    /// deferred onto a list drained by every subsequent retire cycle
    /// (`SPEC_FULL.md` §3/§9) rather than failing the caller.
    pub fn destroy(&self, handle: Handle) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        self.retire_all(&mut state);
        let object = state.handle_table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
        object.refcount = object.refcount.saturating_sub(1);
        if object.refcount > 0 {
            return Ok(());
        }
        match self.finalize_destroy(&mut state, handle) {
            Ok(()) => Ok(()),
            Err(GemError::Busy) => {
                log::debug!("object {} still bound/active at last unref; deferring destroy", handle.id());
                state.deferred_free.push(handle);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn finalize_destroy(&self, state: &mut ManagerState, handle: Handle) -> Result<(), GemError> {
        {
            let object = state.handle_table.get(handle).ok_or(GemError::NoSuchHandle)?;
            if object.pin_count > 0 {
                return Err(GemError::Busy);
            }
            if let FenceState::Fenced { last_use_ring, .. } = object.fence {
                let wedged = &self.wedged;
                let cancel = self.cancel.clone();
                if let Some(tracker) = state.rings.get_mut(&last_use_ring) {
                    if let Some(backend) = state.ring_backends.get_mut(&last_use_ring) {
                        domain::put_fence(
                            state.handle_table.get_mut(handle).unwrap(),
                            handle,
                            &mut state.fence_registry,
                            state.register_writer.as_mut(),
                            Some(RingContext { id: last_use_ring, tracker, backend: backend.as_mut() }),
                            &cancel,
                            wedged,
                        )?;
                    }
                }
            }
        }
        binder::unbind(
            handle,
            &mut state.handle_table,
            &mut state.gtt,
            state.gtt_writer.as_mut(),
            state.pages_source.as_mut(),
            &mut state.fence_registry,
            state.register_writer.as_mut(),
        )?;
        untrack_lru(&mut state.inactive_lru, handle);
        state.handle_table.remove(handle);
        Ok(())
    }

    pub fn pread(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        self.set_domain_locked(&mut state, handle, Domain::Cpu, false)?;
        let object = state.handle_table.get(handle).ok_or(GemError::NoSuchHandle)?;
        if offset + buf.len() as u64 > object.size {
            return Err(GemError::Invalid);
        }
        if let Some(phys) = &object.phys_backing {
            let start = offset as usize;
            buf.copy_from_slice(&phys[start..start + buf.len()]);
        }
        // Without a real CPU mapping there's nothing further to copy from;
        // `phys_backing` (set for pread/pwrite-only test doubles) stands
        // in for the page cache a real driver would read through.
        Ok(())
    }

    pub fn pwrite(&self, handle: Handle, offset: u64, buf: &[u8]) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        self.set_domain_locked(&mut state, handle, Domain::Cpu, true)?;
        let object = state.handle_table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
        if offset + buf.len() as u64 > object.size {
            return Err(GemError::Invalid);
        }
        let size = object.size;
        let phys = object
            .phys_backing
            .get_or_insert_with(|| vec![0u8; size as usize].into_boxed_slice());
        let start = offset as usize;
        phys[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Ensure the object is backed by pages and readable from the CPU.
    /// Real drivers return a user-space pointer here; this core only
    /// guarantees the domain transition and page residency a caller would
    /// build a mapping on top of.
    pub fn mmap(&self, handle: Handle) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        let object = state.handle_table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
        if object.pages.is_none() {
            pages::acquire(handle.id(), object, state.pages_source.as_mut())?;
        }
        Ok(())
    }

    /// Mark the object eligible for fault-driven GTT mmap; the actual
    /// binding happens lazily in [`Manager::handle_gtt_fault`].
    pub fn mmap_gtt(&self, handle: Handle) -> Result<(), GemError> {
        let state = self.state.lock().unwrap();
        if !state.handle_table.contains(handle) {
            return Err(GemError::NoSuchHandle);
        }
        Ok(())
    }

    pub fn handle_gtt_fault(&self, handle: Handle, fault_offset: u64) -> Result<u64, GemError> {
        let mut state = self.state.lock().unwrap();
        self.retire_all(&mut state);
        let ring_id = state.handle_table.get(handle).and_then(|o| match o.activity {
            Activity::Active { ring, .. } => Some(ring),
            _ => None,
        });
        let cancel = self.cancel.clone();
        let params = FaultParams {
            fault_offset,
            mappable_end: self.mappable_end,
            pipelined_ring: None,
        };
        let result = if let Some(ring) = ring_id {
            let tracker = state.rings.get_mut(&ring).expect("active ring has a tracker");
            let backend = state.ring_backends.get_mut(&ring).expect("active ring has a backend");
            fault::handle_fault(
                handle,
                &mut state.handle_table,
                &mut state.gtt,
                self.generation,
                state.pages_source.as_mut(),
                state.gtt_writer.as_mut(),
                &mut state.fence_registry,
                state.register_writer.as_mut(),
                state.cache.as_mut(),
                Some(RingContext { id: ring, tracker, backend: backend.as_mut() }),
                &cancel,
                &self.wedged,
                params,
            )
        } else {
            fault::handle_fault(
                handle,
                &mut state.handle_table,
                &mut state.gtt,
                self.generation,
                state.pages_source.as_mut(),
                state.gtt_writer.as_mut(),
                &mut state.fence_registry,
                state.register_writer.as_mut(),
                state.cache.as_mut(),
                None,
                &cancel,
                &self.wedged,
                params,
            )
        };
        if result.is_ok() {
            touch_lru(&mut state.inactive_lru, handle);
        }
        result
    }

    fn set_domain_locked(
        &self,
        state: &mut ManagerState,
        handle: Handle,
        domain: Domain,
        write: bool,
    ) -> Result<(), GemError> {
        self.retire_all(state);
        if state.handle_table.get(handle).map(|o| o.pages.is_none()).unwrap_or(true) {
            let object = state.handle_table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
            pages::acquire(handle.id(), object, state.pages_source.as_mut())?;
        }

        let ring_ctx = state.handle_table.get(handle).and_then(|o| match o.activity {
            Activity::Active { ring, .. } => Some(ring),
            _ => None,
        });

        let cancel = self.cancel.clone();
        let object = state.handle_table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
        let object_id = handle.id();
        match (domain, ring_ctx) {
            (Domain::Cpu, Some(ring)) => {
                let tracker = state.rings.get_mut(&ring).expect("active ring has a tracker");
                let backend = state.ring_backends.get_mut(&ring).expect("active ring has a backend");
                domain::set_to_cpu_domain(
                    object,
                    write,
                    state.cache.as_mut(),
                    object_id,
                    Some(RingContext { id: ring, tracker, backend: backend.as_mut() }),
                    &cancel,
                    &self.wedged,
                )
            }
            (Domain::Cpu, None) => domain::set_to_cpu_domain(object, write, state.cache.as_mut(), object_id, None, &cancel, &self.wedged),
            (Domain::Gtt, Some(ring)) => {
                let tracker = state.rings.get_mut(&ring).expect("active ring has a tracker");
                let backend = state.ring_backends.get_mut(&ring).expect("active ring has a backend");
                domain::set_to_gtt_domain(
                    object,
                    write,
                    state.cache.as_mut(),
                    object_id,
                    Some(RingContext { id: ring, tracker, backend: backend.as_mut() }),
                    &cancel,
                    &self.wedged,
                )
            }
            (Domain::Gtt, None) => domain::set_to_gtt_domain(object, write, state.cache.as_mut(), object_id, None, &cancel, &self.wedged),
            (Domain::Gpu, _) => {
                domain::set_to_gpu_domain(object, write, state.cache.as_mut(), object_id);
                Ok(())
            }
        }
    }

    pub fn set_domain(&self, handle: Handle, domain: Domain, write: bool) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        self.set_domain_locked(&mut state, handle, domain, write)
    }

    /// `sw_finish`: the userspace CPU access just completed. Only flushes
    /// the GTT domain (forcing a later refault) if the object is currently
    /// pinned — an unpinned object will go through a full domain
    /// transition on its next use anyway, so the flush here would be
    /// wasted work. This pin-count gate is reproduced as-is rather than
    /// "fixed", per the resolved open question in `SPEC_FULL.md` §9.
    pub fn sw_finish(&self, handle: Handle) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        let object = state.handle_table.get(handle).ok_or(GemError::NoSuchHandle)?;
        if object.pin_count == 0 {
            return Ok(());
        }
        let object_id = handle.id();
        let object = state.handle_table.get_mut(handle).unwrap();
        domain::finish_gtt(object, object_id, state.cache.as_mut());
        Ok(())
    }

    pub fn set_tiling(&self, handle: Handle, tiling: Tiling, stride: u32) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        {
            let object = state.handle_table.get(handle).ok_or(GemError::NoSuchHandle)?;
            if object.pin_count > 0 {
                return Err(GemError::Busy);
            }
        }
        if state.handle_table.get(handle).map(|o| o.placement.is_bound()).unwrap_or(false) {
            binder::unbind(
                handle,
                &mut state.handle_table,
                &mut state.gtt,
                state.gtt_writer.as_mut(),
                state.pages_source.as_mut(),
                &mut state.fence_registry,
                state.register_writer.as_mut(),
            )?;
        }
        let object = state.handle_table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
        object.tiling = tiling;
        object.stride = stride;
        Ok(())
    }

    pub fn get_tiling(&self, handle: Handle) -> Result<(Tiling, u32), GemError> {
        let state = self.state.lock().unwrap();
        let object = state.handle_table.get(handle).ok_or(GemError::NoSuchHandle)?;
        Ok((object.tiling, object.stride))
    }

    pub fn busy(&self, handle: Handle) -> Result<bool, GemError> {
        let mut state = self.state.lock().unwrap();
        self.retire_all(&mut state);
        let object = state.handle_table.get(handle).ok_or(GemError::NoSuchHandle)?;
        Ok(object.activity.is_active() || matches!(object.activity, Activity::Flushing))
    }

    pub fn madvise(&self, handle: Handle, advice: Madvise) -> Result<bool, GemError> {
        let mut state = self.state.lock().unwrap();
        let object = state.handle_table.get_mut(handle).ok_or(GemError::NoSuchHandle)?;
        object.madvise = advice;
        Ok(object.pages.is_some())
    }

    pub fn pin(&self, handle: Handle, alignment: Option<u64>) -> Result<u64, GemError> {
        let mut state = self.state.lock().unwrap();
        if !state.handle_table.get(handle).map(|o| o.placement.is_bound()).unwrap_or(false) {
            let size = state.handle_table.get(handle).ok_or(GemError::NoSuchHandle)?.size;
            let color = 0;
            let align = alignment.unwrap_or(PAGE_SIZE);
            if state.gtt.search_free(size, align, color).is_err() {
                let candidates = state.inactive_lru.clone();
                binder::evict_something(
                    &mut state.handle_table,
                    &mut state.gtt,
                    state.gtt_writer.as_mut(),
                    state.pages_source.as_mut(),
                    &mut state.fence_registry,
                    state.register_writer.as_mut(),
                    &candidates,
                    size,
                    align,
                    color,
                )?;
            }
            binder::bind(
                handle,
                &mut state.handle_table,
                &mut state.gtt,
                self.generation,
                state.pages_source.as_mut(),
                state.gtt_writer.as_mut(),
                BindParams { alignment, mappable_end: self.mappable_end },
            )?;
        }
        binder::pin(handle, &mut state.handle_table)?;
        untrack_lru(&mut state.inactive_lru, handle);
        let object = state.handle_table.get(handle).unwrap();
        match object.placement {
            Placement::Bound { offset, .. } => Ok(offset),
            Placement::Unbound => unreachable!("just bound above"),
        }
    }

    pub fn unpin(&self, handle: Handle) -> Result<(), GemError> {
        let mut state = self.state.lock().unwrap();
        binder::unpin(handle, &mut state.handle_table)?;
        if state.handle_table.get(handle).map(|o| o.pin_count == 0 && !o.activity.is_active()).unwrap_or(false) {
            touch_lru(&mut state.inactive_lru, handle);
        }
        Ok(())
    }

    /// Block the calling client until it has no more than one outstanding
    /// request per ring, the classic `I915_IOCTL_GEM_THROTTLE` behavior
    /// that keeps a misbehaving client from queuing unbounded work.
    pub fn throttle(&self, client: u64) -> Result<(), GemError> {
        let cancel = self.cancel.clone();
        loop {
            let mut state = self.state.lock().unwrap();
            self.retire_all(&mut state);
            let mut oldest: Option<(RingId, Seqno)> = None;
            for &ring_id in &RingId::ALL {
                let Some(tracker) = state.rings.get(&ring_id) else { continue };
                let mut seen = 0usize;
                for request in &tracker.request_list {
                    if request.client == Some(client) {
                        seen += 1;
                        if seen > 1 {
                            oldest = Some((ring_id, request.seqno));
                            break;
                        }
                    }
                }
                if oldest.is_some() {
                    break;
                }
            }
            let Some((ring_id, seqno)) = oldest else {
                return Ok(());
            };
            let tracker = state.rings.get_mut(&ring_id).unwrap();
            let backend = state.ring_backends.get_mut(&ring_id).unwrap();
            tracker.wait(seqno, backend.as_mut(), &cancel, &self.wedged, false)?;
        }
    }

    pub fn get_aperture(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.gtt.end() - state.gtt.base(), state.gtt.free_bytes())
    }

    /// Low-memory hook: reclaim at least `target_bytes` of page memory.
    ///
    /// Invoked from arbitrary allocation sites (per `SPEC_FULL.md` §5), so
    /// this tries the device lock rather than blocking on it, bailing with
    /// [`GemError::Busy`] if another operation currently holds it. If the
    /// first pass falls more than 1% short of `target_bytes` and some ring
    /// still has outstanding work, idles every active ring and rescans once
    /// — the original shrinker's "idle and retry" escalation.
    pub fn reclaim(&self, target_bytes: u64) -> Result<reclaim::Reclaimed, GemError> {
        let mut state = self.state.try_lock().map_err(|_| GemError::Busy)?;
        self.retire_all(&mut state);
        let candidates = state.inactive_lru.clone();
        let first = reclaim::run(
            &mut state.handle_table,
            &mut state.gtt,
            state.gtt_writer.as_mut(),
            state.pages_source.as_mut(),
            &mut state.fence_registry,
            state.register_writer.as_mut(),
            &candidates,
            target_bytes,
        )?;
        if first.bytes >= target_bytes {
            return Ok(first);
        }
        let shortfall = target_bytes - first.bytes;
        if shortfall * 100 <= target_bytes {
            // Within 1% of the target: not worth idling the GPU over.
            return Ok(first);
        }
        let any_active = state.ring_backends.values().any(|b| b.is_active());
        if !any_active {
            return Ok(first);
        }
        log::warn!(
            "reclaim short by {shortfall} bytes of {target_bytes} target; idling active rings and rescanning"
        );
        for backend in state.ring_backends.values_mut() {
            if backend.is_active() {
                let _ = backend.idle();
            }
        }
        self.retire_all(&mut state);
        let candidates = state.inactive_lru.clone();
        let second = reclaim::run(
            &mut state.handle_table,
            &mut state.gtt,
            state.gtt_writer.as_mut(),
            state.pages_source.as_mut(),
            &mut state.fence_registry,
            state.register_writer.as_mut(),
            &candidates,
            target_bytes - first.bytes,
        )?;
        Ok(reclaim::Reclaimed {
            bytes: first.bytes + second.bytes,
            objects: first.objects + second.objects,
        })
    }
}
