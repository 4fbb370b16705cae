// Kernel Registry - arena of kernel-launch records forming a parent/child DAG
// Records are created when a grid is first observed (parents synthesized for
// dynamic launches), marked launched once present on hardware, and removed
// when absent again, children before parents.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info, trace};

use crate::coords::{Coords, Dim3, Field, Focus};
use crate::state::StateCache;
use crate::transport::{GridInfo, GridStatus, KernelOrigin, KernelType};
use crate::SymbolResolver;

/// Stable index into the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(usize);

#[derive(Debug)]
pub struct KernelRecord {
    /// Session-scoped, monotonically assigned.
    pub id: u64,
    pub dev: u32,
    /// Unique per device while the grid lives.
    pub grid_id: u64,
    pub entry_pc: u64,
    pub module_id: u64,
    pub context_id: u64,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub kind: KernelType,
    pub origin: KernelOrigin,
    pub parent: Option<KernelHandle>,
    pub children: Vec<KernelHandle>,
    /// Seen present on hardware at least once.
    pub launched: bool,
    /// Grid status as of the current stop; dropped when the device is
    /// invalidated.
    pub grid_status: Option<GridStatus>,
    pub name: Option<String>,
    /// Best-effort formatted launch arguments.
    pub args: Option<String>,
    /// Nesting depth: 0 for host launches, parent + 1 below.
    pub depth: u32,
    disasm: HashMap<u64, String>,
}

impl KernelRecord {
    pub fn dimensions(&self) -> String {
        format!("<<<{},{}>>>", self.grid_dim, self.block_dim)
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("??")
    }
}

pub struct KernelRegistry {
    arena: Vec<Option<KernelRecord>>,
    next_kernel_id: u64,
    /// Announce launches/terminations through the log.
    announce: bool,
    announce_system: bool,
    /// Kernels nested deeper than this are not announced.
    announce_max_depth: Option<u32>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            next_kernel_id: 0,
            announce: true,
            announce_system: false,
            announce_max_depth: None,
        }
    }

    pub fn configure_announcements(
        &mut self,
        announce: bool,
        announce_system: bool,
        max_depth: Option<u32>,
    ) {
        self.announce = announce;
        self.announce_system = announce_system;
        self.announce_max_depth = max_depth;
    }

    pub fn record(&self, handle: KernelHandle) -> &KernelRecord {
        self.arena[handle.0].as_ref().unwrap_or_else(|| panic!("stale kernel handle {:?}", handle))
    }

    pub fn record_mut(&mut self, handle: KernelHandle) -> &mut KernelRecord {
        self.arena[handle.0].as_mut().unwrap_or_else(|| panic!("stale kernel handle {:?}", handle))
    }

    pub fn contains(&self, handle: KernelHandle) -> bool {
        self.arena.get(handle.0).map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn handles(&self) -> Vec<KernelHandle> {
        (0..self.arena.len()).filter(|&i| self.arena[i].is_some()).map(KernelHandle).collect()
    }

    pub fn len(&self) -> usize {
        self.arena.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_grid_id(&self, dev: u32, grid_id: u64) -> Option<KernelHandle> {
        self.arena
            .iter()
            .position(|s| s.as_ref().map(|k| k.dev == dev && k.grid_id == grid_id).unwrap_or(false))
            .map(KernelHandle)
    }

    pub fn find_by_kernel_id(&self, id: u64) -> Option<KernelHandle> {
        self.arena
            .iter()
            .position(|s| s.as_ref().map(|k| k.id == id).unwrap_or(false))
            .map(KernelHandle)
    }

    pub fn depth(&self, handle: KernelHandle) -> u32 {
        self.record(handle).depth
    }

    /// Registers one grid launch. Idempotent per (device, grid id). A
    /// GPU-origin launch whose parent is not yet known gets the parent
    /// synthesized first, so the DAG is connected before the child exists.
    pub fn start_kernel(
        &mut self,
        cache: &mut StateCache,
        resolver: &dyn SymbolResolver,
        dev: u32,
        grid_id: u64,
        entry_pc: u64,
        context_id: u64,
        module_id: u64,
        grid_dim: Dim3,
        block_dim: Dim3,
        kind: KernelType,
        origin: KernelOrigin,
        parent_grid_id: Option<u64>,
    ) -> Result<KernelHandle> {
        if let Some(existing) = self.find_by_grid_id(dev, grid_id) {
            return Ok(existing);
        }

        let parent = match parent_grid_id {
            Some(pg) => match self.find_by_grid_id(dev, pg) {
                Some(h) => Some(h),
                None if origin == KernelOrigin::Gpu => self.synthesize_parent(cache, resolver, dev, pg)?,
                None => None,
            },
            None => None,
        };

        let depth = parent.map(|p| self.record(p).depth + 1).unwrap_or(0);
        let id = self.next_kernel_id;
        self.next_kernel_id += 1;

        let record = KernelRecord {
            id,
            dev,
            grid_id,
            entry_pc,
            module_id,
            context_id,
            grid_dim,
            block_dim,
            kind,
            origin,
            parent,
            children: Vec::new(),
            launched: false,
            grid_status: None,
            name: resolver.kernel_name(entry_pc),
            args: None,
            depth,
            disasm: HashMap::new(),
        };

        let handle = self.insert(record);
        if let Some(p) = parent {
            self.record_mut(p).children.push(handle);
        }
        self.announce_launch(handle);
        Ok(handle)
    }

    /// Convenience entry point when the launch details come straight from a
    /// grid info query or a kernel-ready event.
    pub fn start_kernel_from_info(
        &mut self,
        cache: &mut StateCache,
        resolver: &dyn SymbolResolver,
        info: &GridInfo,
    ) -> Result<KernelHandle> {
        self.start_kernel(
            cache,
            resolver,
            info.dev,
            info.grid_id,
            info.entry_pc,
            info.context_id,
            info.module_id,
            info.grid_dim,
            info.block_dim,
            info.kind,
            info.origin,
            info.parent_grid_id,
        )
    }

    fn synthesize_parent(
        &mut self,
        cache: &mut StateCache,
        resolver: &dyn SymbolResolver,
        dev: u32,
        parent_grid_id: u64,
    ) -> Result<Option<KernelHandle>> {
        let status = cache.client_mut().grid_status(dev, parent_grid_id)?;
        if matches!(status, GridStatus::Invalid | GridStatus::Terminated) {
            trace!("not synthesizing parent grid {} on device {}: {:?}", parent_grid_id, dev, status);
            return Ok(None);
        }
        let info = cache.client_mut().grid_info(dev, parent_grid_id)?;
        debug!("synthesizing record for parent grid {} on device {}", parent_grid_id, dev);
        let handle = self.start_kernel_from_info(cache, resolver, &info)?;
        Ok(Some(handle))
    }

    fn insert(&mut self, record: KernelRecord) -> KernelHandle {
        if let Some(i) = self.arena.iter().position(|s| s.is_none()) {
            self.arena[i] = Some(record);
            KernelHandle(i)
        } else {
            self.arena.push(Some(record));
            KernelHandle(self.arena.len() - 1)
        }
    }

    /// Removes a kernel, unless children still exist: removal is deferred
    /// until the last child has gone. Returns whether the record was removed.
    pub fn terminate(&mut self, handle: KernelHandle) -> bool {
        if !self.record(handle).children.is_empty() {
            trace!(
                "deferring termination of kernel {}: {} live child(ren)",
                self.record(handle).id,
                self.record(handle).children.len()
            );
            return false;
        }
        self.announce_termination(handle);
        if let Some(parent) = self.record(handle).parent {
            self.record_mut(parent).children.retain(|&c| c != handle);
        }
        self.arena[handle.0] = None;
        true
    }

    /// Whether the grid is resident on hardware, via the per-stop cached
    /// status.
    pub fn is_present(&mut self, cache: &mut StateCache, handle: KernelHandle) -> Result<bool> {
        if self.record(handle).grid_status.is_none() {
            let (dev, grid_id) = {
                let r = self.record(handle);
                (r.dev, r.grid_id)
            };
            let status = cache.client_mut().grid_status(dev, grid_id)?;
            self.record_mut(handle).grid_status = Some(status);
        }
        Ok(self.record(handle).grid_status.map(|s| s.is_present()).unwrap_or(false))
    }

    /// Grid statuses only hold for one stop; the controller drops them before
    /// each termination sweep.
    pub fn invalidate_grid_statuses(&mut self) {
        for slot in self.arena.iter_mut().flatten() {
            slot.grid_status = None;
        }
    }

    /// One sweep per stop event: presence marks `launched`; a previously
    /// launched kernel that went absent is terminated. Deepest first, so
    /// parents see their children leave before they are considered.
    pub fn update_terminated(&mut self, cache: &mut StateCache) -> Result<()> {
        let mut handles = self.handles();
        handles.sort_by_key(|&h| std::cmp::Reverse(self.record(h).depth));
        for handle in handles {
            if !self.contains(handle) {
                continue;
            }
            let present = self.is_present(cache, handle)?;
            if present {
                self.record_mut(handle).launched = true;
            } else if self.record(handle).launched {
                self.terminate(handle);
            }
        }
        Ok(())
    }

    /// Best-effort argument capture: focus briefly moves to a valid lane of
    /// each kernel missing its args, the frame layer formats them, and focus
    /// is restored. Failure leaves the args unset and is not an error.
    pub fn update_args(
        &mut self,
        cache: &mut StateCache,
        focus: &mut Focus,
        resolver: &dyn SymbolResolver,
    ) -> Result<()> {
        let saved = *focus;
        for handle in self.handles() {
            let (dev, grid_id, wants_args) = {
                let r = self.record(handle);
                (r.dev, r.grid_id, r.args.is_none() && r.launched)
            };
            if !wants_args {
                continue;
            }
            if !self.is_present(cache, handle)? {
                continue;
            }
            if let Some(coords) = find_valid_lane(cache, dev, grid_id)? {
                focus.set_device(coords);
                if let Some(args) = resolver.format_args(&coords) {
                    self.record_mut(handle).args = Some(args);
                }
            }
        }
        *focus = saved;
        Ok(())
    }

    /// Decoded instruction at `pc`, cached for the kernel's lifetime.
    pub fn disassembly(
        &mut self,
        cache: &mut StateCache,
        handle: KernelHandle,
        pc: u64,
    ) -> Result<String> {
        if let Some(text) = self.record(handle).disasm.get(&pc) {
            return Ok(text.clone());
        }
        let dev = self.record(handle).dev;
        let text = cache.client_mut().disassemble(dev, pc)?;
        self.record_mut(handle).disasm.insert(pc, text.clone());
        Ok(text)
    }

    /// Dropped on every resume; device code can be unloaded while running.
    pub fn flush_disasm_caches(&mut self) {
        for slot in self.arena.iter_mut().flatten() {
            slot.disasm.clear();
        }
    }

    /// Mask of SMs on which the kernel currently has valid warps.
    pub fn compute_sms_mask(&self, cache: &mut StateCache, handle: KernelHandle) -> Result<u64> {
        let (dev, grid_id) = {
            let r = self.record(handle);
            (r.dev, r.grid_id)
        };
        let mut mask = 0u64;
        let num_sms = cache.num_sms(dev)?;
        for sm in 0..num_sms {
            let warps = cache.sm_valid_warps_mask(dev, sm)?;
            for wp in warps.iter() {
                if cache.warp_grid_id(dev, sm, wp)? == grid_id {
                    mask |= 1u64 << sm;
                    break;
                }
            }
        }
        Ok(mask)
    }

    /// Resolves (and memoizes on the warp slot) the kernel a warp belongs to.
    pub fn kernel_for_warp(
        &self,
        cache: &mut StateCache,
        dev: u32,
        sm: u32,
        wp: u32,
    ) -> Result<Option<KernelHandle>> {
        if let Some(h) = cache.warp_kernel(dev, sm, wp) {
            if self.contains(h) {
                return Ok(Some(h));
            }
        }
        let grid_id = cache.warp_grid_id(dev, sm, wp)?;
        let handle = self.find_by_grid_id(dev, grid_id);
        if let Some(h) = handle {
            cache.warp_set_kernel(dev, sm, wp, h);
        }
        Ok(handle)
    }

    fn announce_launch(&self, handle: KernelHandle) {
        let r = self.record(handle);
        if !self.should_announce(r) {
            return;
        }
        info!(
            "[launch of kernel {} ({}{}) on device {}]",
            r.id,
            r.display_name(),
            r.dimensions(),
            r.dev
        );
    }

    fn announce_termination(&self, handle: KernelHandle) {
        let r = self.record(handle);
        if !self.should_announce(r) {
            return;
        }
        info!(
            "[termination of kernel {} ({}{}) on device {}]",
            r.id,
            r.display_name(),
            r.dimensions(),
            r.dev
        );
    }

    fn should_announce(&self, r: &KernelRecord) -> bool {
        if !self.announce {
            return false;
        }
        if r.kind == KernelType::System && !self.announce_system {
            return false;
        }
        match self.announce_max_depth {
            Some(max) => r.depth <= max,
            None => true,
        }
    }
}

/// Scans for any valid lane of the given grid. Direct walk instead of the
/// coordinate iterator so the registry can run while holding `&mut self`.
fn find_valid_lane(cache: &mut StateCache, dev: u32, grid_id: u64) -> Result<Option<Coords>> {
    let num_sms = cache.num_sms(dev)?;
    for sm in 0..num_sms {
        let warps = cache.sm_valid_warps_mask(dev, sm)?;
        for wp in warps.iter() {
            if cache.warp_grid_id(dev, sm, wp)? != grid_id {
                continue;
            }
            if let Some(ln) = cache.warp_valid_lanes_mask(dev, sm, wp)?.lowest() {
                let mut coords = Coords::physical(dev, sm, wp, ln);
                coords.grid_id = Field::At(grid_id);
                coords.block_idx = Field::At(cache.warp_block_idx(dev, sm, wp)?);
                coords.thread_idx = Field::At(cache.lane_thread_idx(dev, sm, wp, ln)?);
                return Ok(Some(coords));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DebugClient;
    use crate::sim::SimDevice;
    use crate::FixedSymbols;
    use pretty_assertions::assert_eq;

    fn setup() -> (SimDevice, StateCache, KernelRegistry, FixedSymbols) {
        let sim = SimDevice::new(1, 2, 4, 32);
        let cache = StateCache::new(DebugClient::new(Box::new(sim.clone())));
        (sim, cache, KernelRegistry::new(), FixedSymbols::default())
    }

    fn info(dev: u32, grid_id: u64, parent: Option<u64>, origin: KernelOrigin) -> GridInfo {
        GridInfo {
            dev,
            grid_id,
            parent_grid_id: parent,
            entry_pc: 0x1000 + grid_id * 0x100,
            context_id: 1,
            module_id: 1,
            grid_dim: Dim3::new(4, 1, 1),
            block_dim: Dim3::new(64, 1, 1),
            kind: KernelType::Application,
            origin,
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let (_sim, mut cache, mut reg, syms) = setup();
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        let b = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_known_parent_is_linked_not_synthesized() {
        let (sim, mut cache, mut reg, syms) = setup();
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        let b = reg
            .start_kernel_from_info(&mut cache, &syms, &info(0, 11, Some(10), KernelOrigin::Gpu))
            .unwrap();
        assert_eq!(reg.record(b).parent, Some(a));
        assert_eq!(reg.record(a).children, vec![b]);
        assert_eq!(reg.depth(b), reg.depth(a) + 1);
        // no grid queries: the parent pre-existed
        assert_eq!(sim.call_count("query_grid_status"), 0);
        assert_eq!(sim.call_count("query_grid_info"), 0);
    }

    #[test]
    fn test_unknown_parent_synthesized_recursively() {
        let (sim, mut cache, mut reg, syms) = setup();
        sim.script(|s| {
            s.add_grid(info(0, 20, None, KernelOrigin::Cpu), GridStatus::Active);
            s.add_grid(info(0, 21, Some(20), KernelOrigin::Gpu), GridStatus::Active);
        });
        let c = reg
            .start_kernel_from_info(&mut cache, &syms, &info(0, 22, Some(21), KernelOrigin::Gpu))
            .unwrap();
        assert_eq!(reg.len(), 3);
        let b = reg.record(c).parent.unwrap();
        let a = reg.record(b).parent.unwrap();
        assert_eq!(reg.record(a).grid_id, 20);
        assert_eq!(reg.record(a).parent, None);
        assert_eq!(reg.depth(c), 2);
    }

    #[test]
    fn test_terminate_defers_while_children_live() {
        let (_sim, mut cache, mut reg, syms) = setup();
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        let b = reg
            .start_kernel_from_info(&mut cache, &syms, &info(0, 11, Some(10), KernelOrigin::Gpu))
            .unwrap();
        assert!(!reg.terminate(a));
        assert!(reg.contains(a));
        assert!(reg.terminate(b));
        assert!(reg.terminate(a));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_update_terminated_lifecycle() {
        let (sim, mut cache, mut reg, syms) = setup();
        sim.script(|s| s.add_grid(info(0, 10, None, KernelOrigin::Cpu), GridStatus::Active));
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        reg.update_terminated(&mut cache).unwrap();
        assert!(reg.record(a).launched);

        sim.script(|s| s.set_grid_status(0, 10, GridStatus::Terminated));
        reg.invalidate_grid_statuses();
        reg.update_terminated(&mut cache).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_never_launched_kernel_survives_absence() {
        let (sim, mut cache, mut reg, syms) = setup();
        sim.script(|s| s.add_grid(info(0, 10, None, KernelOrigin::Cpu), GridStatus::Pending));
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        reg.update_terminated(&mut cache).unwrap();
        assert!(reg.contains(a));
        assert!(!reg.record(a).launched);
    }

    #[test]
    fn test_monotonic_ids() {
        let (_sim, mut cache, mut reg, syms) = setup();
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        let b = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 11, None, KernelOrigin::Cpu))
            .unwrap();
        assert!(reg.record(b).id > reg.record(a).id);
    }

    #[test]
    fn test_disassembly_cached_until_flush() {
        let (sim, mut cache, mut reg, syms) = setup();
        sim.script(|s| s.set_disasm(0x1000, "BRA 0x40"));
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        assert_eq!(reg.disassembly(&mut cache, a, 0x1000).unwrap(), "BRA 0x40");
        reg.disassembly(&mut cache, a, 0x1000).unwrap();
        assert_eq!(sim.call_count("disassemble"), 1);
        reg.flush_disasm_caches();
        reg.disassembly(&mut cache, a, 0x1000).unwrap();
        assert_eq!(sim.call_count("disassemble"), 2);
    }

    #[test]
    fn test_update_args_restores_focus() {
        let (sim, mut cache, mut reg, mut syms) = setup();
        syms.args = Some("(n=1024, data=0x7f00)".into());
        sim.script(|s| {
            s.add_grid(info(0, 10, None, KernelOrigin::Cpu), GridStatus::Active);
            s.set_valid_warps(0, 0, 0b1);
            s.set_warp(0, 0, 0, 10, Dim3::new(0, 0, 0), 0xF, 0xF);
        });
        let a = reg.start_kernel_from_info(&mut cache, &syms, &info(0, 10, None, KernelOrigin::Cpu))
            .unwrap();
        reg.update_terminated(&mut cache).unwrap();
        let mut focus = Focus::Host;
        reg.update_args(&mut cache, &mut focus, &syms).unwrap();
        assert_eq!(focus, Focus::Host);
        assert_eq!(reg.record(a).args.as_deref(), Some("(n=1024, data=0x7f00)"));
    }
}
