// Device State Cache - lazy System/Device/SM/Warp/Lane state with precise invalidation
// Every cached attribute is an Option slot: Some means populated, None means
// the next read goes through the transport. Invalidation clears slots and
// bumps a generation counter; it never eagerly refetches. Hardware topology
// (counts, type strings) is fetched once per device and survives invalidation.

use anyhow::{ensure, Result};
use tracing::{debug, trace, warn};

use crate::api::DebugClient;
use crate::coords::Dim3;
use crate::exceptions::ExceptionKind;
use crate::kernels::KernelHandle;
use crate::masks::{LaneMask, WarpMask};
use crate::transport::DeviceSpec;

/// Lane registers cached per lane; reads above the window bypass the cache.
pub const LANE_REG_WINDOW: u32 = 256;
/// Registers are fetched in aligned ranges of this many to amortize round trips.
pub const REG_FETCH_ALIGN: u32 = 32;
/// Uniform registers cached per warp.
pub const WARP_UREG_WINDOW: u32 = 64;

#[derive(Debug, Clone, Copy, Default)]
struct LaneState {
    pc: Option<u64>,
    virtual_pc: Option<u64>,
    thread_idx: Option<Dim3>,
    exception: Option<Option<ExceptionKind>>,
    timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct WarpState {
    grid_id: Option<u64>,
    block_idx: Option<Dim3>,
    kernel: Option<KernelHandle>,
    valid_lanes: Option<LaneMask>,
    active_lanes: Option<LaneMask>,
    error_pc: Option<Option<u64>>,
    timestamp: Option<u64>,
    lanes: Vec<LaneState>,
}

#[derive(Debug, Clone, Default)]
struct SmState {
    valid_warps: Option<WarpMask>,
    broken_warps: Option<WarpMask>,
    warps: Vec<WarpState>,
}

#[derive(Debug, Clone, Default)]
struct DeviceState {
    spec: Option<DeviceSpec>,
    valid: Option<bool>,
    suspended: bool,
    exception_mask: Option<Vec<u64>>,
    sms: Vec<SmState>,
}

#[derive(Debug)]
struct LaneRegEntry {
    dev: u32,
    sm: u32,
    wp: u32,
    ln: u32,
    regs: Vec<u32>,
    valid: [u64; 4],
    preds: Option<Vec<bool>>,
    cc: Option<u32>,
}

impl LaneRegEntry {
    fn new(dev: u32, sm: u32, wp: u32, ln: u32) -> Self {
        Self {
            dev,
            sm,
            wp,
            ln,
            regs: vec![0; LANE_REG_WINDOW as usize],
            valid: [0; 4],
            preds: None,
            cc: None,
        }
    }

    fn has(&self, regno: u32) -> bool {
        self.valid[(regno / 64) as usize] & (1u64 << (regno % 64)) != 0
    }

    fn mark(&mut self, regno: u32) {
        self.valid[(regno / 64) as usize] |= 1u64 << (regno % 64);
    }
}

#[derive(Debug)]
struct WarpUregEntry {
    dev: u32,
    sm: u32,
    wp: u32,
    regs: Vec<u32>,
    valid: u64,
    upreds: Option<Vec<bool>>,
}

impl WarpUregEntry {
    fn new(dev: u32, sm: u32, wp: u32) -> Self {
        Self { dev, sm, wp, regs: vec![0; WARP_UREG_WINDOW as usize], valid: 0, upreds: None }
    }
}

/// The session-wide device state cache. Exclusively owned and mutated by the
/// main thread; the transport client it wraps is the only path to hardware.
pub struct StateCache {
    client: DebugClient,
    num_devices: Option<u32>,
    devices: Vec<DeviceState>,
    lane_regs: Vec<LaneRegEntry>,
    warp_uregs: Vec<WarpUregEntry>,
    generation: u64,
    clock: u64,
    software_preemption: bool,
}

impl StateCache {
    pub fn new(client: DebugClient) -> Self {
        Self {
            client,
            num_devices: None,
            devices: Vec::new(),
            lane_regs: Vec::new(),
            warp_uregs: Vec::new(),
            generation: 0,
            clock: 0,
            software_preemption: false,
        }
    }

    /// Software preemption can migrate warps on a step; when set, unexpected
    /// stepped warps invalidate the whole device instead of just themselves.
    pub fn set_software_preemption(&mut self, on: bool) {
        self.software_preemption = on;
    }

    pub fn client_mut(&mut self) -> &mut DebugClient {
        &mut self.client
    }

    /// Bumped on every invalidation; iterators use it to notice staleness.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Session clock: incremented once per resume, stamped onto state as it
    /// is populated.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn tick(&mut self) {
        self.clock += 1;
    }

    // ---- system level ----

    pub fn num_devices(&mut self) -> Result<u32> {
        self.ensure_devices()?;
        Ok(self.num_devices.unwrap_or(0))
    }

    pub fn system_invalidate(&mut self) {
        trace!("system invalidate");
        for dev in 0..self.devices.len() as u32 {
            self.invalidate_device(dev);
        }
    }

    pub fn suspend_all_devices(&mut self) -> Result<()> {
        let n = self.num_devices()?;
        for dev in 0..n {
            self.suspend_device(dev)?;
        }
        Ok(())
    }

    pub fn suspended_devices_mask(&self) -> u64 {
        let mut mask = 0u64;
        for (i, d) in self.devices.iter().enumerate() {
            if d.suspended {
                mask |= 1u64 << i;
            }
        }
        mask
    }

    // ---- device level ----

    fn ensure_devices(&mut self) -> Result<()> {
        if self.num_devices.is_none() {
            let n = self.client.num_devices()?;
            self.num_devices = Some(n);
            self.devices = (0..n).map(|_| DeviceState::default()).collect();
            debug!("{} device(s) reported", n);
        }
        Ok(())
    }

    fn ensure_spec(&mut self, dev: u32) -> Result<()> {
        self.ensure_devices()?;
        let idx = dev as usize;
        ensure!(idx < self.devices.len(), "device {} out of range", dev);
        if self.devices[idx].spec.is_none() {
            let spec = self.client.device_spec(dev)?;
            self.apply_spec(idx, spec);
        }
        Ok(())
    }

    fn apply_spec(&mut self, idx: usize, spec: DeviceSpec) {
        let lanes = vec![LaneState::default(); spec.num_lanes as usize];
        let warp = WarpState { lanes, ..WarpState::default() };
        let sm = SmState { warps: vec![warp; spec.num_warps as usize], ..SmState::default() };
        self.devices[idx].sms = vec![sm; spec.num_sms as usize];
        self.devices[idx].spec = Some(spec);
    }

    /// Out-of-band spec population for remote sessions where the topology is
    /// delivered ahead of the first query.
    pub fn set_device_spec(&mut self, dev: u32, spec: DeviceSpec) -> Result<()> {
        self.ensure_devices()?;
        let idx = dev as usize;
        ensure!(idx < self.devices.len(), "device {} out of range", dev);
        self.apply_spec(idx, spec);
        Ok(())
    }

    pub fn device_spec(&mut self, dev: u32) -> Result<DeviceSpec> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.clone().unwrap_or_else(|| unreachable!()))
    }

    pub fn num_sms(&mut self, dev: u32) -> Result<u32> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.as_ref().map(|s| s.num_sms).unwrap_or(0))
    }

    pub fn num_warps(&mut self, dev: u32) -> Result<u32> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.as_ref().map(|s| s.num_warps).unwrap_or(0))
    }

    pub fn num_lanes(&mut self, dev: u32) -> Result<u32> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.as_ref().map(|s| s.num_lanes).unwrap_or(0))
    }

    pub fn num_registers(&mut self, dev: u32) -> Result<u32> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.as_ref().map(|s| s.num_registers).unwrap_or(0))
    }

    pub fn num_predicates(&mut self, dev: u32) -> Result<u32> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.as_ref().map(|s| s.num_predicates).unwrap_or(0))
    }

    pub fn insn_size(&mut self, dev: u32) -> Result<u32> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.as_ref().map(|s| s.insn_size).unwrap_or(8))
    }

    pub fn sm_type(&mut self, dev: u32) -> Result<String> {
        self.ensure_spec(dev)?;
        Ok(self.devices[dev as usize].spec.as_ref().map(|s| s.sm_type.clone()).unwrap_or_default())
    }

    /// True when any SM on the device hosts a valid warp.
    pub fn device_is_valid(&mut self, dev: u32) -> Result<bool> {
        self.ensure_spec(dev)?;
        if let Some(v) = self.devices[dev as usize].valid {
            return Ok(v);
        }
        let num_sms = self.num_sms(dev)?;
        let mut valid = false;
        for sm in 0..num_sms {
            if !self.sm_valid_warps_mask(dev, sm)?.is_empty() {
                valid = true;
                break;
            }
        }
        self.devices[dev as usize].valid = Some(valid);
        Ok(valid)
    }

    pub fn device_is_suspended(&mut self, dev: u32) -> Result<bool> {
        self.ensure_devices()?;
        ensure!((dev as usize) < self.devices.len(), "device {} out of range", dev);
        Ok(self.devices[dev as usize].suspended)
    }

    pub fn suspend_device(&mut self, dev: u32) -> Result<()> {
        self.ensure_devices()?;
        ensure!((dev as usize) < self.devices.len(), "device {} out of range", dev);
        if self.devices[dev as usize].suspended {
            return Ok(());
        }
        trace!("suspending device {}", dev);
        self.client.suspend_device(dev)?;
        self.devices[dev as usize].suspended = true;
        Ok(())
    }

    /// Invalidates the device, then lets it run. The invalidate comes first
    /// so nothing read during this stop survives into the next one.
    pub fn resume_device(&mut self, dev: u32) -> Result<()> {
        self.ensure_devices()?;
        ensure!((dev as usize) < self.devices.len(), "device {} out of range", dev);
        if !self.devices[dev as usize].suspended {
            return Ok(());
        }
        trace!("resuming device {}", dev);
        self.invalidate_device(dev);
        self.client.resume_device(dev)?;
        self.devices[dev as usize].suspended = false;
        Ok(())
    }

    /// Bitmask words flagging SMs with a pending exception.
    pub fn device_exception_mask(&mut self, dev: u32) -> Result<Vec<u64>> {
        self.ensure_spec(dev)?;
        if self.devices[dev as usize].exception_mask.is_none() {
            let mask = self.client.device_exception_state(dev)?;
            self.devices[dev as usize].exception_mask = Some(mask);
        }
        Ok(self.devices[dev as usize].exception_mask.clone().unwrap_or_default())
    }

    pub fn invalidate_device(&mut self, dev: u32) {
        let idx = dev as usize;
        if idx >= self.devices.len() {
            return;
        }
        trace!("invalidate device {}", dev);
        let num_sms = self.devices[idx].sms.len() as u32;
        for sm in 0..num_sms {
            self.invalidate_sm(dev, sm, true);
        }
        self.devices[idx].valid = None;
        self.devices[idx].exception_mask = None;
        self.generation += 1;
    }

    // ---- SM level ----

    pub fn sm_valid_warps_mask(&mut self, dev: u32, sm: u32) -> Result<WarpMask> {
        self.ensure_spec(dev)?;
        ensure!((sm as usize) < self.devices[dev as usize].sms.len(), "sm {} out of range", sm);
        if let Some(m) = self.devices[dev as usize].sms[sm as usize].valid_warps {
            return Ok(m);
        }
        let mask = WarpMask(self.client.valid_warps(dev, sm)?);
        self.devices[dev as usize].sms[sm as usize].valid_warps = Some(mask);
        Ok(mask)
    }

    pub fn sm_broken_warps_mask(&mut self, dev: u32, sm: u32) -> Result<WarpMask> {
        self.ensure_spec(dev)?;
        ensure!((sm as usize) < self.devices[dev as usize].sms.len(), "sm {} out of range", sm);
        if let Some(m) = self.devices[dev as usize].sms[sm as usize].broken_warps {
            return Ok(m);
        }
        let mask = WarpMask(self.client.broken_warps(dev, sm)?);
        self.devices[dev as usize].sms[sm as usize].broken_warps = Some(mask);
        Ok(mask)
    }

    pub fn invalidate_sm(&mut self, dev: u32, sm: u32, recursive: bool) {
        let (didx, sidx) = (dev as usize, sm as usize);
        if didx >= self.devices.len() || sidx >= self.devices[didx].sms.len() {
            return;
        }
        trace!("invalidate device {} sm {} (recursive={})", dev, sm, recursive);
        if recursive {
            let num_warps = self.devices[didx].sms[sidx].warps.len() as u32;
            for wp in 0..num_warps {
                self.invalidate_warp(dev, sm, wp);
            }
        }
        let state = &mut self.devices[didx].sms[sidx];
        state.valid_warps = None;
        state.broken_warps = None;
        self.devices[didx].valid = None;
        self.generation += 1;
    }

    // ---- warp level ----

    fn warp_slot(&self, dev: u32, sm: u32, wp: u32) -> Option<&WarpState> {
        self.devices
            .get(dev as usize)
            .and_then(|d| d.sms.get(sm as usize))
            .and_then(|s| s.warps.get(wp as usize))
    }

    fn warp_slot_mut(&mut self, dev: u32, sm: u32, wp: u32) -> Result<&mut WarpState> {
        self.ensure_spec(dev)?;
        self.devices
            .get_mut(dev as usize)
            .and_then(|d| d.sms.get_mut(sm as usize))
            .and_then(|s| s.warps.get_mut(wp as usize))
            .ok_or_else(|| anyhow::anyhow!("warp ({}, {}, {}) out of range", dev, sm, wp))
    }

    /// Batch-populates the warp and all of its valid lanes from one warp
    /// state block, stamped with the current clock. The timestamp is the
    /// block-populated marker: single-field setters never stamp it, so a
    /// partially refreshed warp still fetches the full block on demand.
    fn ensure_warp_state(&mut self, dev: u32, sm: u32, wp: u32) -> Result<()> {
        self.ensure_spec(dev)?;
        if self.warp_slot(dev, sm, wp).map(|w| w.timestamp.is_some()).unwrap_or(false) {
            return Ok(());
        }
        let block = self.client.warp_state(dev, sm, wp)?;
        let clock = self.clock;
        let slot = self.warp_slot_mut(dev, sm, wp)?;
        slot.grid_id = Some(block.grid_id);
        slot.block_idx = Some(block.block_idx);
        slot.valid_lanes = Some(LaneMask(block.valid_lanes));
        slot.active_lanes = Some(LaneMask(block.active_lanes));
        slot.error_pc = Some(block.error_pc);
        slot.timestamp = Some(clock);
        for lane in &block.lanes {
            if let Some(ls) = slot.lanes.get_mut(lane.ln as usize) {
                ls.pc = Some(lane.pc);
                ls.virtual_pc = Some(lane.virtual_pc);
                ls.thread_idx = Some(lane.thread_idx);
                ls.exception = Some(lane.exception);
                ls.timestamp = Some(clock);
            }
        }
        Ok(())
    }

    pub fn warp_is_valid(&mut self, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        Ok(self.sm_valid_warps_mask(dev, sm)?.contains(wp))
    }

    pub fn warp_is_broken(&mut self, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        Ok(self.sm_broken_warps_mask(dev, sm)?.contains(wp))
    }

    pub fn warp_grid_id(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        // the batched refresh populates this field alone
        if let Some(grid_id) = self.warp_slot(dev, sm, wp).and_then(|w| w.grid_id) {
            return Ok(grid_id);
        }
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.warp_slot(dev, sm, wp).and_then(|w| w.grid_id).unwrap_or(0))
    }

    pub fn warp_block_idx(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Dim3> {
        if let Some(block_idx) = self.warp_slot(dev, sm, wp).and_then(|w| w.block_idx) {
            return Ok(block_idx);
        }
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.warp_slot(dev, sm, wp).and_then(|w| w.block_idx).unwrap_or_default())
    }

    pub fn warp_valid_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.warp_slot(dev, sm, wp).and_then(|w| w.valid_lanes).unwrap_or(LaneMask::EMPTY))
    }

    pub fn warp_active_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.warp_slot(dev, sm, wp).and_then(|w| w.active_lanes).unwrap_or(LaneMask::EMPTY))
    }

    /// Lanes that entered the warp but sit out the current branch.
    pub fn warp_divergent_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        let valid = self.warp_valid_lanes_mask(dev, sm, wp)?;
        let active = self.warp_active_lanes_mask(dev, sm, wp)?;
        Ok(valid.and_not(active))
    }

    pub fn warp_lowest_active_lane(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Option<u32>> {
        Ok(self.warp_active_lanes_mask(dev, sm, wp)?.lowest())
    }

    /// PC of the warp's lowest active lane, or None while all lanes diverge.
    pub fn warp_active_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Option<u64>> {
        match self.warp_lowest_active_lane(dev, sm, wp)? {
            Some(ln) => Ok(Some(self.lane_pc(dev, sm, wp, ln)?)),
            None => Ok(None),
        }
    }

    pub fn warp_error_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Option<u64>> {
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.warp_slot(dev, sm, wp).and_then(|w| w.error_pc).flatten())
    }

    pub fn warp_timestamp(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.warp_slot(dev, sm, wp).and_then(|w| w.timestamp).unwrap_or(0))
    }

    /// Registry-resolved kernel handle for this warp; a plain slot, filled by
    /// the kernel layer and dropped on invalidation.
    pub fn warp_kernel(&self, dev: u32, sm: u32, wp: u32) -> Option<KernelHandle> {
        self.warp_slot(dev, sm, wp).and_then(|w| w.kernel)
    }

    pub fn warp_set_kernel(&mut self, dev: u32, sm: u32, wp: u32, kernel: KernelHandle) {
        if let Ok(slot) = self.warp_slot_mut(dev, sm, wp) {
            slot.kernel = Some(kernel);
        }
    }

    pub fn invalidate_warp(&mut self, dev: u32, sm: u32, wp: u32) {
        let (didx, sidx, widx) = (dev as usize, sm as usize, wp as usize);
        let Some(slot) = self
            .devices
            .get_mut(didx)
            .and_then(|d| d.sms.get_mut(sidx))
            .and_then(|s| s.warps.get_mut(widx))
        else {
            return;
        };
        trace!("invalidate warp ({}, {}, {})", dev, sm, wp);
        *slot = WarpState { lanes: vec![LaneState::default(); slot.lanes.len()], ..WarpState::default() };
        self.lane_regs.retain(|e| !(e.dev == dev && e.sm == sm && e.wp == wp));
        self.warp_uregs.retain(|e| !(e.dev == dev && e.sm == sm && e.wp == wp));
        self.generation += 1;
    }

    pub fn invalidate_lane(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) {
        let Some(slot) = self
            .devices
            .get_mut(dev as usize)
            .and_then(|d| d.sms.get_mut(sm as usize))
            .and_then(|s| s.warps.get_mut(wp as usize))
            .and_then(|w| w.lanes.get_mut(ln as usize))
        else {
            return;
        };
        trace!("invalidate lane ({}, {}, {}, {})", dev, sm, wp, ln);
        *slot = LaneState::default();
        self.lane_regs.retain(|e| !(e.dev == dev && e.sm == sm && e.wp == wp && e.ln == ln));
        self.generation += 1;
    }

    /// Write-through setters used by the batched remote refresh path.
    pub fn warp_set_grid_id(&mut self, dev: u32, sm: u32, wp: u32, grid_id: u64) -> Result<()> {
        self.warp_slot_mut(dev, sm, wp)?.grid_id = Some(grid_id);
        Ok(())
    }

    pub fn warp_set_block_idx(&mut self, dev: u32, sm: u32, wp: u32, block_idx: Dim3) -> Result<()> {
        self.warp_slot_mut(dev, sm, wp)?.block_idx = Some(block_idx);
        Ok(())
    }

    pub fn lane_set_thread_idx(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        thread_idx: Dim3,
    ) -> Result<()> {
        let slot = self.warp_slot_mut(dev, sm, wp)?;
        if let Some(ls) = slot.lanes.get_mut(ln as usize) {
            ls.thread_idx = Some(thread_idx);
        }
        Ok(())
    }

    /// One round trip refreshes the grid id of every valid warp in the SM.
    pub fn refresh_grid_ids(&mut self, dev: u32, sm: u32) -> Result<()> {
        let pairs = self.client.update_grid_id_in_sm(dev, sm)?;
        for (wp, grid_id) in pairs {
            self.warp_set_grid_id(dev, sm, wp, grid_id)?;
        }
        Ok(())
    }

    pub fn refresh_block_idxs(&mut self, dev: u32, sm: u32) -> Result<()> {
        let pairs = self.client.update_block_idx_in_sm(dev, sm)?;
        for (wp, block_idx) in pairs {
            self.warp_set_block_idx(dev, sm, wp, block_idx)?;
        }
        Ok(())
    }

    pub fn refresh_thread_idxs(&mut self, dev: u32, sm: u32, wp: u32) -> Result<()> {
        let pairs = self.client.update_thread_idx_in_warp(dev, sm, wp)?;
        for (ln, thread_idx) in pairs {
            self.lane_set_thread_idx(dev, sm, wp, ln, thread_idx)?;
        }
        Ok(())
    }

    /// Steps one warp, invalidating every warp the hardware reports as
    /// stepped. The mask can exceed the requested warp; that is worth a
    /// warning, and under software preemption the whole device state is
    /// suspect afterwards.
    pub fn single_step_warp(&mut self, dev: u32, sm: u32, wp: u32, nsteps: u32) -> Result<WarpMask> {
        let stepped = WarpMask(self.client.single_step_warp(dev, sm, wp, nsteps)?);
        for w in stepped.iter() {
            self.invalidate_warp(dev, sm, w);
        }
        let expected = {
            let mut m = WarpMask::EMPTY;
            m.set(wp);
            m
        };
        if !stepped.and_not(expected).is_empty() {
            warn!(
                "single-stepping warp ({}, {}, {}) also stepped warps {}",
                dev,
                sm,
                wp,
                stepped.and_not(expected)
            );
            if self.software_preemption {
                self.invalidate_device(dev);
            }
        }
        // masks on this SM are stale either way
        self.invalidate_sm(dev, sm, false);
        Ok(stepped)
    }

    // ---- lane level ----

    pub fn lane_is_valid(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        Ok(self.warp_valid_lanes_mask(dev, sm, wp)?.contains(ln))
    }

    pub fn lane_is_active(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        Ok(self.warp_active_lanes_mask(dev, sm, wp)?.contains(ln))
    }

    fn lane_slot(&self, dev: u32, sm: u32, wp: u32, ln: u32) -> Option<&LaneState> {
        self.warp_slot(dev, sm, wp).and_then(|w| w.lanes.get(ln as usize))
    }

    pub fn lane_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.ensure_warp_state(dev, sm, wp)?;
        if let Some(pc) = self.lane_slot(dev, sm, wp, ln).and_then(|l| l.pc) {
            return Ok(pc);
        }
        let pc = self.client.read_pc(dev, sm, wp, ln)?;
        let clock = self.clock;
        // active lanes share one PC, so one read populates them all
        let active = self.warp_active_lanes_mask(dev, sm, wp)?;
        let slot = self.warp_slot_mut(dev, sm, wp)?;
        if active.contains(ln) {
            for l in active.iter() {
                if let Some(ls) = slot.lanes.get_mut(l as usize) {
                    ls.pc = Some(pc);
                    ls.timestamp = Some(clock);
                }
            }
        } else if let Some(ls) = slot.lanes.get_mut(ln as usize) {
            ls.pc = Some(pc);
            ls.timestamp = Some(clock);
        }
        Ok(pc)
    }

    pub fn lane_virtual_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.ensure_warp_state(dev, sm, wp)?;
        if let Some(pc) = self.lane_slot(dev, sm, wp, ln).and_then(|l| l.virtual_pc) {
            return Ok(pc);
        }
        let pc = self.client.read_virtual_pc(dev, sm, wp, ln)?;
        let slot = self.warp_slot_mut(dev, sm, wp)?;
        if let Some(ls) = slot.lanes.get_mut(ln as usize) {
            ls.virtual_pc = Some(pc);
        }
        Ok(pc)
    }

    pub fn lane_thread_idx(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<Dim3> {
        if let Some(thread_idx) = self.lane_slot(dev, sm, wp, ln).and_then(|l| l.thread_idx) {
            return Ok(thread_idx);
        }
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.lane_slot(dev, sm, wp, ln).and_then(|l| l.thread_idx).unwrap_or_default())
    }

    pub fn lane_exception(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
    ) -> Result<Option<ExceptionKind>> {
        self.ensure_warp_state(dev, sm, wp)?;
        if let Some(exc) = self.lane_slot(dev, sm, wp, ln).and_then(|l| l.exception) {
            return Ok(exc);
        }
        let exc = self.client.lane_exception(dev, sm, wp, ln)?;
        let slot = self.warp_slot_mut(dev, sm, wp)?;
        if let Some(ls) = slot.lanes.get_mut(ln as usize) {
            ls.exception = Some(exc);
        }
        Ok(exc)
    }

    pub fn lane_timestamp(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.ensure_warp_state(dev, sm, wp)?;
        Ok(self.lane_slot(dev, sm, wp, ln).and_then(|l| l.timestamp).unwrap_or(0))
    }

    // ---- register caches ----

    fn lane_reg_index(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> usize {
        if let Some(i) = self
            .lane_regs
            .iter()
            .position(|e| e.dev == dev && e.sm == sm && e.wp == wp && e.ln == ln)
        {
            return i;
        }
        self.lane_regs.push(LaneRegEntry::new(dev, sm, wp, ln));
        self.lane_regs.len() - 1
    }

    fn warp_ureg_index(&mut self, dev: u32, sm: u32, wp: u32) -> usize {
        if let Some(i) = self.warp_uregs.iter().position(|e| e.dev == dev && e.sm == sm && e.wp == wp)
        {
            return i;
        }
        self.warp_uregs.push(WarpUregEntry::new(dev, sm, wp));
        self.warp_uregs.len() - 1
    }

    pub fn lane_register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32) -> Result<u32> {
        let num_regs = self.num_registers(dev)?;
        ensure!(regno < num_regs, "register {} out of range ({} available)", regno, num_regs);
        if regno >= LANE_REG_WINDOW {
            // beyond the cached window: uncached single-register read
            let vals = self.client.read_register_range(dev, sm, wp, ln, regno, 1)?;
            return Ok(vals.first().copied().unwrap_or(0));
        }
        let idx = self.lane_reg_index(dev, sm, wp, ln);
        if !self.lane_regs[idx].has(regno) {
            let first = regno & !(REG_FETCH_ALIGN - 1);
            let count = REG_FETCH_ALIGN.min(num_regs - first).min(LANE_REG_WINDOW - first);
            let vals = self.client.read_register_range(dev, sm, wp, ln, first, count)?;
            let entry = &mut self.lane_regs[idx];
            for (i, v) in vals.iter().enumerate() {
                entry.regs[first as usize + i] = *v;
                entry.mark(first + i as u32);
            }
        }
        Ok(self.lane_regs[idx].regs[regno as usize])
    }

    pub fn lane_register_write(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        regno: u32,
        value: u32,
    ) -> Result<()> {
        let num_regs = self.num_registers(dev)?;
        ensure!(regno < num_regs, "register {} out of range ({} available)", regno, num_regs);
        self.client.write_register(dev, sm, wp, ln, regno, value)?;
        if regno < LANE_REG_WINDOW {
            let idx = self.lane_reg_index(dev, sm, wp, ln);
            let entry = &mut self.lane_regs[idx];
            entry.regs[regno as usize] = value;
            entry.mark(regno);
        }
        Ok(())
    }

    pub fn lane_predicate(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, pred: u32) -> Result<bool> {
        let num_preds = self.num_predicates(dev)?;
        ensure!(pred < num_preds, "predicate {} out of range ({} available)", pred, num_preds);
        let idx = self.lane_reg_index(dev, sm, wp, ln);
        if self.lane_regs[idx].preds.is_none() {
            let preds = self.client.read_predicates(dev, sm, wp, ln)?;
            self.lane_regs[idx].preds = Some(preds);
        }
        Ok(self.lane_regs[idx]
            .preds
            .as_ref()
            .and_then(|p| p.get(pred as usize).copied())
            .unwrap_or(false))
    }

    pub fn lane_set_predicate(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        pred: u32,
        value: bool,
    ) -> Result<()> {
        // predicates travel as a whole array: read-modify-write
        self.lane_predicate(dev, sm, wp, ln, pred)?;
        let idx = self.lane_reg_index(dev, sm, wp, ln);
        let mut preds = self.lane_regs[idx].preds.clone().unwrap_or_default();
        if let Some(p) = preds.get_mut(pred as usize) {
            *p = value;
        }
        self.client.write_predicates(dev, sm, wp, ln, preds.clone())?;
        self.lane_regs[idx].preds = Some(preds);
        Ok(())
    }

    pub fn lane_cc_register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u32> {
        let idx = self.lane_reg_index(dev, sm, wp, ln);
        if let Some(cc) = self.lane_regs[idx].cc {
            return Ok(cc);
        }
        let cc = self.client.read_cc_register(dev, sm, wp, ln)?;
        self.lane_regs[idx].cc = Some(cc);
        Ok(cc)
    }

    pub fn lane_cc_register_write(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        value: u32,
    ) -> Result<()> {
        self.client.write_cc_register(dev, sm, wp, ln, value)?;
        let idx = self.lane_reg_index(dev, sm, wp, ln);
        self.lane_regs[idx].cc = Some(value);
        Ok(())
    }

    pub fn warp_uregister(&mut self, dev: u32, sm: u32, wp: u32, regno: u32) -> Result<u32> {
        if regno >= WARP_UREG_WINDOW {
            let vals = self.client.read_uregister_range(dev, sm, wp, regno, 1)?;
            return Ok(vals.first().copied().unwrap_or(0));
        }
        let idx = self.warp_ureg_index(dev, sm, wp);
        if self.warp_uregs[idx].valid & (1u64 << regno) == 0 {
            let first = regno & !(REG_FETCH_ALIGN - 1);
            let count = REG_FETCH_ALIGN.min(WARP_UREG_WINDOW - first);
            let vals = self.client.read_uregister_range(dev, sm, wp, first, count)?;
            let entry = &mut self.warp_uregs[idx];
            for (i, v) in vals.iter().enumerate() {
                entry.regs[first as usize + i] = *v;
                entry.valid |= 1u64 << (first + i as u32);
            }
        }
        Ok(self.warp_uregs[idx].regs[regno as usize])
    }

    pub fn warp_uregister_write(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        regno: u32,
        value: u32,
    ) -> Result<()> {
        self.client.write_uregister(dev, sm, wp, regno, value)?;
        if regno < WARP_UREG_WINDOW {
            let idx = self.warp_ureg_index(dev, sm, wp);
            let entry = &mut self.warp_uregs[idx];
            entry.regs[regno as usize] = value;
            entry.valid |= 1u64 << regno;
        }
        Ok(())
    }

    pub fn warp_upredicate(&mut self, dev: u32, sm: u32, wp: u32, pred: u32) -> Result<bool> {
        let idx = self.warp_ureg_index(dev, sm, wp);
        if self.warp_uregs[idx].upreds.is_none() {
            let upreds = self.client.read_upredicates(dev, sm, wp)?;
            self.warp_uregs[idx].upreds = Some(upreds);
        }
        Ok(self.warp_uregs[idx]
            .upreds
            .as_ref()
            .and_then(|p| p.get(pred as usize).copied())
            .unwrap_or(false))
    }

    pub fn warp_set_upredicate(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        pred: u32,
        value: bool,
    ) -> Result<()> {
        self.warp_upredicate(dev, sm, wp, pred)?;
        let idx = self.warp_ureg_index(dev, sm, wp);
        let mut upreds = self.warp_uregs[idx].upreds.clone().unwrap_or_default();
        if let Some(p) = upreds.get_mut(pred as usize) {
            *p = value;
        }
        self.client.write_upredicates(dev, sm, wp, upreds.clone())?;
        self.warp_uregs[idx].upreds = Some(upreds);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use crate::transport::Request;
    use pretty_assertions::assert_eq;

    fn cache_with(sim: &SimDevice) -> StateCache {
        StateCache::new(DebugClient::new(Box::new(sim.clone())))
    }

    fn basic_sim() -> SimDevice {
        let sim = SimDevice::new(1, 2, 4, 32);
        sim.script(|s| {
            s.set_valid_warps(0, 0, 0b0101);
            s.set_warp(0, 0, 0, 7, Dim3::new(0, 0, 0), 0xFFFF, 0x00FF);
            s.set_warp(0, 0, 2, 7, Dim3::new(1, 0, 0), 0xF, 0xF);
        });
        sim
    }

    #[test]
    fn test_counts_fetched_once() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        assert_eq!(cache.num_sms(0).unwrap(), 2);
        assert_eq!(cache.num_lanes(0).unwrap(), 32);
        let before = sim.call_count("query_device_spec");
        cache.invalidate_device(0);
        assert_eq!(cache.num_sms(0).unwrap(), 2);
        assert_eq!(sim.call_count("query_device_spec"), before);
    }

    #[test]
    fn test_valid_mask_cached_until_invalidate() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        assert_eq!(cache.sm_valid_warps_mask(0, 0).unwrap(), WarpMask(0b0101));
        assert_eq!(cache.sm_valid_warps_mask(0, 0).unwrap(), WarpMask(0b0101));
        assert_eq!(sim.call_count("read_valid_warps"), 1);
        cache.invalidate_sm(0, 0, false);
        cache.sm_valid_warps_mask(0, 0).unwrap();
        assert_eq!(sim.call_count("read_valid_warps"), 2);
    }

    #[test]
    fn test_divergent_lanes_mask() {
        // valid lanes 0-15, active 0-7: lanes 8-15 diverge
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        assert_eq!(cache.warp_divergent_lanes_mask(0, 0, 0).unwrap(), LaneMask(0xFF00));
    }

    #[test]
    fn test_batched_refresh_does_not_mark_the_block_fetched() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        cache.refresh_grid_ids(0, 0).unwrap();
        // the refreshed field is served without a block fetch
        assert_eq!(cache.warp_grid_id(0, 0, 0).unwrap(), 7);
        assert_eq!(sim.call_count("read_warp_state"), 0);
        // but everything else still needs the real block
        assert_eq!(cache.warp_valid_lanes_mask(0, 0, 0).unwrap(), LaneMask(0xFFFF));
        assert_eq!(cache.lane_thread_idx(0, 0, 0, 3).unwrap(), Dim3::new(3, 0, 0));
        assert_eq!(sim.call_count("read_warp_state"), 1);
    }

    #[test]
    fn test_warp_state_is_one_round_trip() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        cache.warp_grid_id(0, 0, 0).unwrap();
        cache.warp_block_idx(0, 0, 0).unwrap();
        cache.warp_valid_lanes_mask(0, 0, 0).unwrap();
        cache.lane_thread_idx(0, 0, 0, 3).unwrap();
        assert_eq!(sim.call_count("read_warp_state"), 1);
    }

    #[test]
    fn test_register_range_fetch() {
        let sim = basic_sim();
        sim.script(|s| {
            for r in 0..64 {
                s.set_register(0, 0, 0, 0, r, r * 10);
            }
        });
        let mut cache = cache_with(&sim);
        assert_eq!(cache.lane_register(0, 0, 0, 0, 5).unwrap(), 50);
        // whole aligned range came in with the first read
        assert_eq!(cache.lane_register(0, 0, 0, 0, 31).unwrap(), 310);
        assert_eq!(sim.call_count("read_register_range"), 1);
        // next range is a second fetch
        assert_eq!(cache.lane_register(0, 0, 0, 0, 32).unwrap(), 320);
        assert_eq!(sim.call_count("read_register_range"), 2);
    }

    #[test]
    fn test_register_write_through() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        cache.lane_register_write(0, 0, 0, 0, 4, 0xDEAD).unwrap();
        assert_eq!(sim.call_count("write_register"), 1);
        // cached: no read round trip needed
        assert_eq!(cache.lane_register(0, 0, 0, 0, 4).unwrap(), 0xDEAD);
        assert_eq!(sim.call_count("read_register_range"), 0);
    }

    #[test]
    fn test_invalidate_warp_drops_registers() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        cache.lane_register(0, 0, 0, 0, 0).unwrap();
        cache.invalidate_warp(0, 0, 0);
        cache.lane_register(0, 0, 0, 0, 0).unwrap();
        assert_eq!(sim.call_count("read_register_range"), 2);
    }

    #[test]
    fn test_generation_bumps_on_invalidate() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        let g0 = cache.generation();
        cache.invalidate_warp(0, 0, 0);
        let g1 = cache.generation();
        assert!(g1 > g0);
        cache.invalidate_device(0);
        assert!(cache.generation() > g1);
    }

    #[test]
    fn test_single_step_invalidates_stepped_warps() {
        let sim = basic_sim();
        sim.script(|s| s.set_step_extra_warps(0, 0, 0b0100));
        let mut cache = cache_with(&sim);
        cache.warp_grid_id(0, 0, 2).unwrap();
        let stepped = cache.single_step_warp(0, 0, 0, 1).unwrap();
        assert_eq!(stepped, WarpMask(0b0101));
        // warp 2 was stepped too, so its state must be refetched
        cache.warp_grid_id(0, 0, 2).unwrap();
        assert_eq!(sim.call_count("read_warp_state"), 2);
    }

    #[test]
    fn test_suspend_resume_bookkeeping() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        cache.suspend_device(0).unwrap();
        assert_eq!(cache.suspended_devices_mask(), 0b1);
        // second suspend is a no-op round-trip-wise
        cache.suspend_device(0).unwrap();
        assert_eq!(sim.call_count("suspend_device"), 1);
        cache.resume_device(0).unwrap();
        assert_eq!(cache.suspended_devices_mask(), 0);
        assert_eq!(sim.call_count("resume_device"), 1);
    }

    #[test]
    fn test_resume_invalidates_before_running() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        cache.suspend_device(0).unwrap();
        cache.warp_grid_id(0, 0, 0).unwrap();
        cache.resume_device(0).unwrap();
        cache.suspend_device(0).unwrap();
        cache.warp_grid_id(0, 0, 0).unwrap();
        assert_eq!(sim.call_count("read_warp_state"), 2);
    }

    #[test]
    fn test_transport_failure_leaves_slot_unpopulated() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        cache.num_sms(0).unwrap();
        sim.script(|s| s.fail_next(Request::ReadValidWarps { dev: 0, sm: 0 }));
        assert!(cache.sm_valid_warps_mask(0, 0).is_err());
        // the failed read cached nothing: the retry goes to the wire again
        assert_eq!(cache.sm_valid_warps_mask(0, 0).unwrap(), WarpMask(0b0101));
        assert_eq!(sim.call_count("read_valid_warps"), 2);
    }

    #[test]
    fn test_lane_pc_backfills_active_lanes() {
        let sim = basic_sim();
        let mut cache = cache_with(&sim);
        // drop the lane slots that the warp block populated
        cache.warp_grid_id(0, 0, 0).unwrap();
        for ln in 0..32 {
            cache.invalidate_lane(0, 0, 0, ln);
        }
        cache.lane_pc(0, 0, 0, 0).unwrap();
        let reads_after_first = sim.call_count("read_pc");
        cache.lane_pc(0, 0, 0, 5).unwrap();
        assert_eq!(sim.call_count("read_pc"), reads_after_first);
    }
}
