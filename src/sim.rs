// Device Simulator - scriptable in-process backend for the debug transport
// Stands in for real hardware in tests and offline development: topology,
// masks, registers, grids, exceptions, and stepping behavior are all set up
// through the script() hook, and every opcode dispatched is counted.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::coords::Dim3;
use crate::events::DeviceEvent;
use crate::exceptions::ExceptionKind;
use crate::transport::{
    DebugTransport, DeviceSpec, GridInfo, GridStatus, LaneStateBlock, Request, Response,
    TransportError, WarpStateBlock, PROTOCOL_REVISION,
};

const DEFAULT_PC: u64 = 0x1000;

#[derive(Debug, Default, Clone, Copy)]
struct SimSm {
    valid_warps: u64,
    broken_warps: u64,
}

#[derive(Debug, Clone, Default)]
struct SimWarp {
    grid_id: u64,
    block_idx: Dim3,
    valid_lanes: u64,
    active_lanes: u64,
    error_pc: Option<u64>,
    lane_pcs: HashMap<u32, u64>,
    thread_idxs: HashMap<u32, Dim3>,
    exceptions: HashMap<u32, ExceptionKind>,
    steps_taken: u32,
}

/// Mutable simulator state, shared by every clone of the owning `SimDevice`.
pub struct SimState {
    revision: u32,
    specs: Vec<DeviceSpec>,
    sms: HashMap<(u32, u32), SimSm>,
    warps: HashMap<(u32, u32, u32), SimWarp>,
    regs: HashMap<(u32, u32, u32, u32), HashMap<u32, u32>>,
    uregs: HashMap<(u32, u32, u32), HashMap<u32, u32>>,
    preds: HashMap<(u32, u32, u32, u32), Vec<bool>>,
    upreds: HashMap<(u32, u32, u32), Vec<bool>>,
    ccs: HashMap<(u32, u32, u32, u32), u32>,
    local_mem: HashMap<u64, u8>,
    pinned_mem: HashMap<u64, u8>,
    breakpoints: HashSet<(u32, u64)>,
    grids: HashMap<(u32, u64), (GridInfo, GridStatus)>,
    disasm: HashMap<u64, String>,
    sync_events: VecDeque<DeviceEvent>,
    async_events: VecDeque<DeviceEvent>,
    ack_count: usize,
    notification_pending: bool,
    sigint_pending: bool,
    step_extra: HashMap<(u32, u32), u64>,
    exit_after: HashMap<(u32, u32, u32), u32>,
    fail_queue: Vec<Request>,
    calls: HashMap<&'static str, usize>,
    suspended: HashSet<u32>,
}

impl SimState {
    fn new(devices: u32, sms: u32, warps: u32, lanes: u32) -> Self {
        let spec = DeviceSpec {
            num_sms: sms,
            num_warps: warps,
            num_lanes: lanes,
            num_registers: 256,
            num_predicates: 8,
            num_uregisters: 64,
            num_upredicates: 8,
            dev_type: "gpu".into(),
            sm_type: "sm_80".into(),
            dev_name: "SimGPU".into(),
            insn_size: 8,
        };
        Self {
            revision: PROTOCOL_REVISION,
            specs: (0..devices).map(|_| spec.clone()).collect(),
            sms: HashMap::new(),
            warps: HashMap::new(),
            regs: HashMap::new(),
            uregs: HashMap::new(),
            preds: HashMap::new(),
            upreds: HashMap::new(),
            ccs: HashMap::new(),
            local_mem: HashMap::new(),
            pinned_mem: HashMap::new(),
            breakpoints: HashSet::new(),
            grids: HashMap::new(),
            disasm: HashMap::new(),
            sync_events: VecDeque::new(),
            async_events: VecDeque::new(),
            ack_count: 0,
            notification_pending: false,
            sigint_pending: false,
            step_extra: HashMap::new(),
            exit_after: HashMap::new(),
            fail_queue: Vec::new(),
            calls: HashMap::new(),
            suspended: HashSet::new(),
        }
    }

    // ---- scripting API ----

    pub fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    pub fn set_sm_type(&mut self, dev: u32, sm_type: &str) {
        if let Some(spec) = self.specs.get_mut(dev as usize) {
            spec.sm_type = sm_type.into();
        }
    }

    pub fn set_valid_warps(&mut self, dev: u32, sm: u32, mask: u64) {
        self.sms.entry((dev, sm)).or_default().valid_warps = mask;
    }

    pub fn set_broken_warps(&mut self, dev: u32, sm: u32, mask: u64) {
        self.sms.entry((dev, sm)).or_default().broken_warps = mask;
    }

    /// Installs a warp with the given logical state; all valid lanes start at
    /// the default PC with thread index (lane, 0, 0).
    pub fn set_warp(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        grid_id: u64,
        block_idx: Dim3,
        valid_lanes: u64,
        active_lanes: u64,
    ) {
        let mut warp = SimWarp {
            grid_id,
            block_idx,
            valid_lanes,
            active_lanes,
            ..SimWarp::default()
        };
        for ln in 0..64u32 {
            if valid_lanes & (1u64 << ln) != 0 {
                warp.lane_pcs.insert(ln, DEFAULT_PC);
                warp.thread_idxs.insert(ln, Dim3::new(ln, 0, 0));
            }
        }
        self.warps.insert((dev, sm, wp), warp);
    }

    pub fn set_warp_pc(&mut self, dev: u32, sm: u32, wp: u32, pc: u64) {
        if let Some(warp) = self.warps.get_mut(&(dev, sm, wp)) {
            for v in warp.lane_pcs.values_mut() {
                *v = pc;
            }
        }
    }

    pub fn set_lane_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, pc: u64) {
        if let Some(warp) = self.warps.get_mut(&(dev, sm, wp)) {
            warp.lane_pcs.insert(ln, pc);
        }
    }

    pub fn set_active_lanes(&mut self, dev: u32, sm: u32, wp: u32, mask: u64) {
        if let Some(warp) = self.warps.get_mut(&(dev, sm, wp)) {
            warp.active_lanes = mask;
        }
    }

    pub fn set_error_pc(&mut self, dev: u32, sm: u32, wp: u32, pc: u64) {
        if let Some(warp) = self.warps.get_mut(&(dev, sm, wp)) {
            warp.error_pc = Some(pc);
        }
    }

    pub fn set_lane_exception(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, exc: ExceptionKind) {
        if let Some(warp) = self.warps.get_mut(&(dev, sm, wp)) {
            warp.exceptions.insert(ln, exc);
        }
    }

    pub fn set_register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32, value: u32) {
        self.regs.entry((dev, sm, wp, ln)).or_default().insert(regno, value);
    }

    pub fn set_uregister(&mut self, dev: u32, sm: u32, wp: u32, regno: u32, value: u32) {
        self.uregs.entry((dev, sm, wp)).or_default().insert(regno, value);
    }

    pub fn add_grid(&mut self, info: GridInfo, status: GridStatus) {
        self.grids.insert((info.dev, info.grid_id), (info, status));
    }

    pub fn set_grid_status(&mut self, dev: u32, grid_id: u64, status: GridStatus) {
        if let Some(entry) = self.grids.get_mut(&(dev, grid_id)) {
            entry.1 = status;
        }
    }

    pub fn set_disasm(&mut self, addr: u64, text: &str) {
        self.disasm.insert(addr, text.into());
    }

    pub fn push_sync_event(&mut self, event: DeviceEvent) {
        self.sync_events.push_back(event);
    }

    pub fn push_async_event(&mut self, event: DeviceEvent) {
        self.async_events.push_back(event);
    }

    pub fn set_notification_pending(&mut self, pending: bool) {
        self.notification_pending = pending;
    }

    pub fn set_sigint_pending(&mut self, pending: bool) {
        self.sigint_pending = pending;
    }

    /// Extra warps the hardware "accidentally" steps along with any request
    /// on this SM.
    pub fn set_step_extra_warps(&mut self, dev: u32, sm: u32, mask: u64) {
        self.step_extra.insert((dev, sm), mask);
    }

    /// The warp exits (drops out of the valid mask) once it has been stepped
    /// this many times.
    pub fn set_warp_exit_after(&mut self, dev: u32, sm: u32, wp: u32, steps: u32) {
        self.exit_after.insert((dev, sm, wp), steps);
    }

    /// The next request equal to `req` fails with a backend error.
    pub fn fail_next(&mut self, req: Request) {
        self.fail_queue.push(req);
    }

    pub fn ack_count(&self) -> usize {
        self.ack_count
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_suspended(&self, dev: u32) -> bool {
        self.suspended.contains(&dev)
    }

    // ---- dispatch ----

    fn step_warp(&mut self, dev: u32, sm: u32, wp: u32, nsteps: u32) -> u64 {
        let mut mask = 1u64 << wp;
        mask |= self.step_extra.get(&(dev, sm)).copied().unwrap_or(0);
        let insn_size = self.specs.get(dev as usize).map(|s| s.insn_size).unwrap_or(8) as u64;
        for w in 0..64u32 {
            if mask & (1u64 << w) == 0 {
                continue;
            }
            let exited = if let Some(warp) = self.warps.get_mut(&(dev, sm, w)) {
                warp.steps_taken += nsteps;
                for pc in warp.lane_pcs.values_mut() {
                    *pc += insn_size * nsteps as u64;
                }
                self.exit_after
                    .get(&(dev, sm, w))
                    .map(|&limit| warp.steps_taken >= limit)
                    .unwrap_or(false)
            } else {
                false
            };
            if exited {
                if let Some(state) = self.sms.get_mut(&(dev, sm)) {
                    state.valid_warps &= !(1u64 << w);
                    state.broken_warps &= !(1u64 << w);
                }
                if let Some(warp) = self.warps.remove(&(dev, sm, w)) {
                    // last warp of the grid gone: the grid has terminated
                    let grid_alive = self
                        .warps
                        .iter()
                        .any(|((d, s, w2), v)| {
                            *d == dev
                                && v.grid_id == warp.grid_id
                                && self
                                    .sms
                                    .get(&(*d, *s))
                                    .map(|sm| sm.valid_warps & (1u64 << *w2) != 0)
                                    .unwrap_or(false)
                        });
                    if !grid_alive {
                        if let Some(entry) = self.grids.get_mut(&(dev, warp.grid_id)) {
                            entry.1 = GridStatus::Terminated;
                        }
                    }
                }
            }
        }
        mask
    }

    fn warp_block(&self, dev: u32, sm: u32, wp: u32) -> WarpStateBlock {
        match self.warps.get(&(dev, sm, wp)) {
            Some(warp) => WarpStateBlock {
                grid_id: warp.grid_id,
                block_idx: warp.block_idx,
                valid_lanes: warp.valid_lanes,
                active_lanes: warp.active_lanes,
                error_pc: warp.error_pc,
                lanes: (0..64u32)
                    .filter(|ln| warp.valid_lanes & (1u64 << ln) != 0)
                    .map(|ln| LaneStateBlock {
                        ln,
                        pc: warp.lane_pcs.get(&ln).copied().unwrap_or(DEFAULT_PC),
                        virtual_pc: warp.lane_pcs.get(&ln).copied().unwrap_or(DEFAULT_PC),
                        thread_idx: warp.thread_idxs.get(&ln).copied().unwrap_or_default(),
                        exception: warp.exceptions.get(&ln).copied(),
                    })
                    .collect(),
            },
            None => WarpStateBlock {
                grid_id: 0,
                block_idx: Dim3::default(),
                valid_lanes: 0,
                active_lanes: 0,
                error_pc: None,
                lanes: Vec::new(),
            },
        }
    }

    fn dispatch(&mut self, req: Request) -> Result<Response, TransportError> {
        if let Some(pos) = self.fail_queue.iter().position(|r| *r == req) {
            self.fail_queue.remove(pos);
            return Err(TransportError::Backend("scripted failure".into()));
        }
        let resp = match req {
            Request::Initialize { .. } => Response::Initialized { revision: self.revision },
            Request::Finalize => Response::Ok,
            Request::QueryNumDevices => Response::Count(self.specs.len() as u32),
            Request::QueryDeviceSpec { dev } => Response::DeviceSpec(
                self.specs
                    .get(dev as usize)
                    .cloned()
                    .ok_or_else(|| TransportError::Backend(format!("no device {dev}")))?,
            ),
            Request::ReadValidWarps { dev, sm } => {
                Response::WarpMask(self.sms.get(&(dev, sm)).map(|s| s.valid_warps).unwrap_or(0))
            }
            Request::ReadBrokenWarps { dev, sm } => {
                Response::WarpMask(self.sms.get(&(dev, sm)).map(|s| s.broken_warps).unwrap_or(0))
            }
            Request::ReadWarpState { dev, sm, wp } => Response::WarpState(self.warp_block(dev, sm, wp)),
            Request::ReadRegisterRange { dev, sm, wp, ln, first, count } => {
                let bank = self.regs.get(&(dev, sm, wp, ln));
                Response::Registers(
                    (first..first + count)
                        .map(|r| bank.and_then(|b| b.get(&r)).copied().unwrap_or(0))
                        .collect(),
                )
            }
            Request::WriteRegister { dev, sm, wp, ln, regno, value } => {
                self.set_register(dev, sm, wp, ln, regno, value);
                Response::Ok
            }
            Request::ReadUniformRegisterRange { dev, sm, wp, first, count } => {
                let bank = self.uregs.get(&(dev, sm, wp));
                Response::Registers(
                    (first..first + count)
                        .map(|r| bank.and_then(|b| b.get(&r)).copied().unwrap_or(0))
                        .collect(),
                )
            }
            Request::WriteUniformRegister { dev, sm, wp, regno, value } => {
                self.set_uregister(dev, sm, wp, regno, value);
                Response::Ok
            }
            Request::ReadPredicates { dev, sm, wp, ln } => Response::Predicates(
                self.preds.get(&(dev, sm, wp, ln)).cloned().unwrap_or_else(|| vec![false; 8]),
            ),
            Request::WritePredicates { dev, sm, wp, ln, values } => {
                self.preds.insert((dev, sm, wp, ln), values);
                Response::Ok
            }
            Request::ReadUniformPredicates { dev, sm, wp } => Response::Predicates(
                self.upreds.get(&(dev, sm, wp)).cloned().unwrap_or_else(|| vec![false; 8]),
            ),
            Request::WriteUniformPredicates { dev, sm, wp, values } => {
                self.upreds.insert((dev, sm, wp), values);
                Response::Ok
            }
            Request::ReadCcRegister { dev, sm, wp, ln } => {
                Response::CcRegister(self.ccs.get(&(dev, sm, wp, ln)).copied().unwrap_or(0))
            }
            Request::WriteCcRegister { dev, sm, wp, ln, value } => {
                self.ccs.insert((dev, sm, wp, ln), value);
                Response::Ok
            }
            Request::ReadPc { dev, sm, wp, ln } | Request::ReadVirtualPc { dev, sm, wp, ln } => {
                Response::Pc(
                    self.warps
                        .get(&(dev, sm, wp))
                        .and_then(|w| w.lane_pcs.get(&ln))
                        .copied()
                        .unwrap_or(DEFAULT_PC),
                )
            }
            Request::ReadLaneException { dev, sm, wp, ln } => Response::LaneException(
                self.warps.get(&(dev, sm, wp)).and_then(|w| w.exceptions.get(&ln)).copied(),
            ),
            Request::ReadDeviceExceptionState { dev } => {
                let mut word = 0u64;
                for ((d, sm, _), warp) in &self.warps {
                    if *d == dev && !warp.exceptions.is_empty() {
                        word |= 1u64 << sm;
                    }
                }
                Response::ExceptionMask(vec![word])
            }
            Request::ReadLocalMemory { addr, len, .. } => Response::Memory(
                (addr..addr + len as u64)
                    .map(|a| self.local_mem.get(&a).copied().unwrap_or(0))
                    .collect(),
            ),
            Request::WriteLocalMemory { addr, data, .. } => {
                for (i, b) in data.iter().enumerate() {
                    self.local_mem.insert(addr + i as u64, *b);
                }
                Response::Ok
            }
            Request::ReadPinnedMemory { addr, len } => Response::Memory(
                (addr..addr + len as u64)
                    .map(|a| self.pinned_mem.get(&a).copied().unwrap_or(0))
                    .collect(),
            ),
            Request::WritePinnedMemory { addr, data } => {
                for (i, b) in data.iter().enumerate() {
                    self.pinned_mem.insert(addr + i as u64, *b);
                }
                Response::Ok
            }
            Request::SetBreakpoint { dev, addr } => {
                self.breakpoints.insert((dev, addr));
                Response::Ok
            }
            Request::UnsetBreakpoint { dev, addr } => {
                self.breakpoints.remove(&(dev, addr));
                Response::Ok
            }
            Request::SuspendDevice { dev } => {
                self.suspended.insert(dev);
                Response::Ok
            }
            Request::ResumeDevice { dev } => {
                self.suspended.remove(&dev);
                Response::Ok
            }
            Request::SingleStepWarp { dev, sm, wp, nsteps } => {
                Response::SteppedWarpMask(self.step_warp(dev, sm, wp, nsteps))
            }
            Request::ResumeWarpsUntilPc { dev, sm, warp_mask, pc } => {
                for w in 0..64u32 {
                    if warp_mask & (1u64 << w) != 0 {
                        if let Some(warp) = self.warps.get_mut(&(dev, sm, w)) {
                            for v in warp.lane_pcs.values_mut() {
                                *v = pc;
                            }
                        }
                    }
                }
                Response::Ok
            }
            Request::Disassemble { addr, .. } => Response::Instruction(
                self.disasm.get(&addr).cloned().unwrap_or_else(|| "NOP".into()),
            ),
            Request::NextSyncEvent => Response::Event(self.sync_events.pop_front()),
            Request::AckSyncEvents => {
                self.ack_count += 1;
                Response::Ok
            }
            Request::NextAsyncEvent => Response::Event(self.async_events.pop_front()),
            Request::QueryGridStatus { dev, grid_id } => Response::GridStatus(
                self.grids.get(&(dev, grid_id)).map(|(_, s)| *s).unwrap_or(GridStatus::Invalid),
            ),
            Request::QueryGridInfo { dev, grid_id } => Response::GridInfo(
                self.grids
                    .get(&(dev, grid_id))
                    .map(|(i, _)| i.clone())
                    .ok_or_else(|| TransportError::Backend(format!("unknown grid {grid_id}")))?,
            ),
            Request::NotificationPending => Response::Bool(self.notification_pending),
            Request::CheckPendingSigint => {
                let pending = self.sigint_pending;
                self.sigint_pending = false;
                Response::Bool(pending)
            }
            Request::UpdateGridIdInSm { dev, sm } => {
                let valid = self.sms.get(&(dev, sm)).map(|s| s.valid_warps).unwrap_or(0);
                Response::GridIds(
                    (0..64u32)
                        .filter(|w| valid & (1u64 << w) != 0)
                        .filter_map(|w| self.warps.get(&(dev, sm, w)).map(|warp| (w, warp.grid_id)))
                        .collect(),
                )
            }
            Request::UpdateBlockIdxInSm { dev, sm } => {
                let valid = self.sms.get(&(dev, sm)).map(|s| s.valid_warps).unwrap_or(0);
                Response::BlockIdxs(
                    (0..64u32)
                        .filter(|w| valid & (1u64 << w) != 0)
                        .filter_map(|w| self.warps.get(&(dev, sm, w)).map(|warp| (w, warp.block_idx)))
                        .collect(),
                )
            }
            Request::UpdateThreadIdxInWarp { dev, sm, wp } => Response::ThreadIdxs(
                self.warps
                    .get(&(dev, sm, wp))
                    .map(|warp| {
                        (0..64u32)
                            .filter(|ln| warp.valid_lanes & (1u64 << ln) != 0)
                            .filter_map(|ln| warp.thread_idxs.get(&ln).map(|t| (ln, *t)))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
        };
        Ok(resp)
    }
}

fn op_name(req: &Request) -> &'static str {
    match req {
        Request::Initialize { .. } => "initialize",
        Request::Finalize => "finalize",
        Request::QueryNumDevices => "query_num_devices",
        Request::QueryDeviceSpec { .. } => "query_device_spec",
        Request::ReadValidWarps { .. } => "read_valid_warps",
        Request::ReadBrokenWarps { .. } => "read_broken_warps",
        Request::ReadWarpState { .. } => "read_warp_state",
        Request::ReadRegisterRange { .. } => "read_register_range",
        Request::WriteRegister { .. } => "write_register",
        Request::ReadUniformRegisterRange { .. } => "read_uregister_range",
        Request::WriteUniformRegister { .. } => "write_uregister",
        Request::ReadPredicates { .. } => "read_predicates",
        Request::WritePredicates { .. } => "write_predicates",
        Request::ReadUniformPredicates { .. } => "read_upredicates",
        Request::WriteUniformPredicates { .. } => "write_upredicates",
        Request::ReadCcRegister { .. } => "read_cc_register",
        Request::WriteCcRegister { .. } => "write_cc_register",
        Request::ReadPc { .. } => "read_pc",
        Request::ReadVirtualPc { .. } => "read_virtual_pc",
        Request::ReadLaneException { .. } => "read_lane_exception",
        Request::ReadDeviceExceptionState { .. } => "read_device_exception_state",
        Request::ReadLocalMemory { .. } => "read_local_memory",
        Request::WriteLocalMemory { .. } => "write_local_memory",
        Request::ReadPinnedMemory { .. } => "read_pinned_memory",
        Request::WritePinnedMemory { .. } => "write_pinned_memory",
        Request::SetBreakpoint { .. } => "set_breakpoint",
        Request::UnsetBreakpoint { .. } => "unset_breakpoint",
        Request::SuspendDevice { .. } => "suspend_device",
        Request::ResumeDevice { .. } => "resume_device",
        Request::SingleStepWarp { .. } => "single_step_warp",
        Request::ResumeWarpsUntilPc { .. } => "resume_warps_until_pc",
        Request::Disassemble { .. } => "disassemble",
        Request::NextSyncEvent => "next_sync_event",
        Request::AckSyncEvents => "ack_sync_events",
        Request::NextAsyncEvent => "next_async_event",
        Request::QueryGridStatus { .. } => "query_grid_status",
        Request::QueryGridInfo { .. } => "query_grid_info",
        Request::NotificationPending => "notification_pending",
        Request::CheckPendingSigint => "check_pending_sigint",
        Request::UpdateGridIdInSm { .. } => "update_grid_id_in_sm",
        Request::UpdateBlockIdxInSm { .. } => "update_block_idx_in_sm",
        Request::UpdateThreadIdxInWarp { .. } => "update_thread_idx_in_warp",
    }
}

/// Cloneable handle to one simulated GPU setup. All clones share state, so a
/// test can keep one handle for scripting/inspection while the cache owns
/// another as its transport.
#[derive(Clone)]
pub struct SimDevice {
    state: Rc<RefCell<SimState>>,
}

impl SimDevice {
    pub fn new(devices: u32, sms: u32, warps: u32, lanes: u32) -> Self {
        Self { state: Rc::new(RefCell::new(SimState::new(devices, sms, warps, lanes))) }
    }

    /// Mutates the shared state under the hood; the usual way tests arrange
    /// masks, grids, and fault injection.
    pub fn script<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.borrow_mut())
    }

    /// How many times the named opcode has been dispatched.
    pub fn call_count(&self, op: &str) -> usize {
        self.state.borrow().calls.get(op).copied().unwrap_or(0)
    }
}

impl DebugTransport for SimDevice {
    fn call(&mut self, req: Request) -> Result<Response, TransportError> {
        let mut state = self.state.borrow_mut();
        *state.calls.entry(op_name(&req)).or_insert(0) += 1;
        state.dispatch(req)
    }
}
