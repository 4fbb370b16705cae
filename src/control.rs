// Resume/Wait Controller - drives the inferior and arbitrates stop reasons
// Resume invalidates cached device state before anything runs again; wait
// suspends everything, drains event queues and notifications, sweeps the
// kernel registry, and reports the highest-priority reason for the stop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info, warn};

use crate::coords::{Coords, Field};
use crate::events::{DeviceEvent, Notification};
use crate::exceptions::ExceptionKind;
use crate::state::StateCache;
use crate::transport::GridInfo;
use crate::{BreakpointRegistry, DebuggerSession, HostOps, SymbolResolver};

/// What the host process did when waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Stopped { signal: i32 },
    Exited { code: i32 },
}

/// Why control returned to the debugger, highest priority first.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Exception { kind: ExceptionKind, coords: Coords, signal: i32 },
    StepComplete { coords: Coords },
    Breakpoint { coords: Coords, pc: u64 },
    BrokenWarp { coords: Coords },
    AttachComplete,
    DetachComplete,
    Interrupt,
    Event,
    Notification,
    Host(HostStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    NotStarted,
    InProgress,
    Complete,
    Detached,
}

#[derive(Debug, Clone, Copy)]
struct StepInFlight {
    dev: u32,
    sm: u32,
    wp: u32,
    ln: u32,
}

/// Owns the host-control seam and the in-flight device step. All device and
/// registry state lives on the session; the controller only sequences it.
pub struct ResumeWaitController {
    host: Box<dyn HostOps>,
    step: Option<StepInFlight>,
    attach: AttachState,
    attach_event: Option<StopReason>,
}

impl ResumeWaitController {
    pub fn new(host: Box<dyn HostOps>) -> Self {
        Self { host, step: None, attach: AttachState::NotStarted, attach_event: None }
    }

    pub fn attach_state(&self) -> AttachState {
        self.attach
    }

    /// Lets the inferior run again. Cached device state is dropped first; a
    /// device-focused single step never resumes the host at all.
    pub fn resume(&mut self, session: &mut DebuggerSession, single_step: bool) -> Result<()> {
        if session.exceptions.is_valid() {
            if !session.exceptions.is_recoverable() {
                let kind = session.exceptions.kind();
                session.exceptions.reset();
                self.host.kill()?;
                bail!(
                    "cannot resume past fatal device exception{}",
                    kind.map(|k| format!(" ({k})")).unwrap_or_default()
                );
            }
            // a warp assert is the one fault the app can run through
            session.exceptions.reset();
        }
        session.notifications.mark_consumed();
        session.kernels.flush_disasm_caches();
        session.kernels.invalidate_grid_statuses();
        session.cache.tick();

        if single_step && session.focus.is_device() {
            let (dev, sm, wp, ln) = session.focus.current().require_physical()?;
            debug!("single-stepping warp ({}, {}, {})", dev, sm, wp);
            session.cache.single_step_warp(dev, sm, wp, 1)?;
            self.step = Some(StepInFlight { dev, sm, wp, ln });
            return Ok(());
        }

        // a device with notifications still queued stays suspended so the
        // next wait services them before it runs again
        let skip = pending_device_mask(session);
        let suspended = session.cache.suspended_devices_mask();
        let num_devices = session.cache.num_devices()?;
        for dev in 0..num_devices {
            if suspended & (1u64 << dev) != 0 {
                if skip & (1u64 << dev) != 0 {
                    debug!("device {} stays suspended: notification pending", dev);
                    continue;
                }
                session.cache.resume_device(dev)?;
            }
        }
        self.host.resume(single_step)?;
        Ok(())
    }

    /// Blocks until the inferior stops and reports why. Ordering when several
    /// things happened at once: exception, step, breakpoint, broken warp,
    /// attach/detach, interrupt, event, notification, then the bare host stop.
    pub fn wait(
        &mut self,
        session: &mut DebuggerSession,
        breakpoints: &dyn BreakpointRegistry,
        symbols: &dyn SymbolResolver,
    ) -> Result<StopReason> {
        // an exception latched at an earlier stop keeps ruling until reset
        if session.exceptions.is_valid() {
            return Ok(latched_exception(session));
        }

        if let Some(step) = self.step.take() {
            return self.finish_step(session, step);
        }

        let status = self.host.wait()?;
        if let HostStatus::Exited { code } = status {
            info!("inferior exited with code {}", code);
            return Ok(StopReason::Host(status));
        }

        session.cache.suspend_all_devices()?;

        let mut saw_event = false;
        while let Some(ev) = session.cache.client_mut().next_async_event()? {
            saw_event |= self.apply_event(session, symbols, ev)?;
        }
        let mut saw_sync = false;
        while let Some(ev) = session.cache.client_mut().next_sync_event()? {
            saw_sync = true;
            saw_event |= self.apply_event(session, symbols, ev)?;
        }
        if saw_sync {
            session.cache.client_mut().ack_sync_events()?;
        }

        let drained: Vec<Notification> = session.queue.lock().drain(..).collect();
        if !drained.is_empty() || session.cache.client_mut().notification_pending()? {
            session.notifications.record_received();
        }

        session.kernels.invalidate_grid_statuses();
        session.kernels.update_terminated(&mut session.cache)?;
        session.kernels.update_args(&mut session.cache, &mut session.focus, symbols)?;

        if let Some(reason) = self.scan_exceptions(session)? {
            session.notifications.mark_aliased();
            return Ok(reason);
        }
        if let Some(reason) = self.scan_broken_warps(session, breakpoints)? {
            session.notifications.mark_aliased();
            return Ok(reason);
        }
        if let Some(reason) = self.attach_event.take() {
            return Ok(reason);
        }
        if session.cache.client_mut().check_pending_sigint()? {
            return Ok(StopReason::Interrupt);
        }
        if saw_event {
            session.notifications.mark_aliased();
            return Ok(StopReason::Event);
        }
        if session.notifications.received() {
            session.notifications.reset_received();
            return Ok(StopReason::Notification);
        }
        Ok(StopReason::Host(status))
    }

    /// Bounded wait for the backend to come up after attaching to a running
    /// inferior; readiness is signalled through the notification flag.
    pub fn attach(&mut self, session: &mut DebuggerSession, max_attempts: u32) -> Result<()> {
        self.attach = AttachState::InProgress;
        for attempt in 0..max_attempts {
            if session.cache.client_mut().notification_pending()? {
                debug!("attach handshake ready after {} poll(s)", attempt + 1);
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        self.attach = AttachState::NotStarted;
        bail!("backend not ready after {} attach polls", max_attempts)
    }

    /// The step happened at resume time; this synthesizes the stop for it.
    fn finish_step(&mut self, session: &mut DebuggerSession, step: StepInFlight) -> Result<StopReason> {
        if session.cache.client_mut().check_pending_sigint()? {
            return Ok(StopReason::Interrupt);
        }
        session.kernels.invalidate_grid_statuses();
        session.kernels.update_terminated(&mut session.cache)?;
        if !session.cache.device_is_valid(step.dev)?
            || !session.cache.warp_is_valid(step.dev, step.sm, step.wp)?
        {
            debug!("stepped warp ran to completion");
            session.focus.invalidate();
            return Ok(StopReason::StepComplete { coords: Coords::invalid() });
        }
        let coords = warp_stop_coords(&mut session.cache, step.dev, step.sm, step.wp, Some(step.ln))?;
        if let Some(kind) = session.cache.lane_exception(step.dev, step.sm, step.wp, step.ln)? {
            session.exceptions.hit(kind, coords);
            session.focus.set_device(coords);
            return Ok(latched_exception(session));
        }
        session.focus.set_device(coords);
        Ok(StopReason::StepComplete { coords })
    }

    /// Folds one drained event into the session. Returns whether the event is
    /// worth reporting as a stop reason of its own.
    fn apply_event(
        &mut self,
        session: &mut DebuggerSession,
        symbols: &dyn SymbolResolver,
        event: DeviceEvent,
    ) -> Result<bool> {
        match event {
            DeviceEvent::KernelReady {
                dev,
                grid_id,
                parent_grid_id,
                context_id,
                module_id,
                entry_pc,
                grid_dim,
                block_dim,
                kind,
                origin,
            } => {
                let info = GridInfo {
                    dev,
                    grid_id,
                    parent_grid_id,
                    entry_pc,
                    context_id,
                    module_id,
                    grid_dim,
                    block_dim,
                    kind,
                    origin,
                };
                session.kernels.start_kernel_from_info(&mut session.cache, symbols, &info)?;
                Ok(true)
            }
            DeviceEvent::KernelFinished { dev, grid_id } => {
                if let Some(h) = session.kernels.find_by_grid_id(dev, grid_id) {
                    session.kernels.terminate(h);
                }
                Ok(true)
            }
            DeviceEvent::ContextCreate { dev, context_id } => {
                debug!("context {} created on device {}", context_id, dev);
                Ok(true)
            }
            DeviceEvent::ContextDestroy { dev, context_id } => {
                debug!("context {} destroyed on device {}", context_id, dev);
                session.cache.invalidate_device(dev);
                Ok(true)
            }
            DeviceEvent::InternalError { code } => {
                warn!("backend reported internal error {}", code);
                Ok(true)
            }
            DeviceEvent::Timeout => Ok(false),
            DeviceEvent::AttachComplete => {
                self.attach = AttachState::Complete;
                self.attach_event = Some(StopReason::AttachComplete);
                Ok(false)
            }
            DeviceEvent::DetachComplete => {
                self.attach = AttachState::Detached;
                self.attach_event = Some(StopReason::DetachComplete);
                Ok(false)
            }
        }
    }

    /// First faulting lane across all devices, scanned through the per-device
    /// SM exception mask so clean devices cost one call.
    fn scan_exceptions(&mut self, session: &mut DebuggerSession) -> Result<Option<StopReason>> {
        let num_devices = session.cache.num_devices()?;
        for dev in 0..num_devices {
            if !session.cache.device_is_valid(dev)? {
                continue;
            }
            let words = session.cache.device_exception_mask(dev)?;
            let num_sms = session.cache.num_sms(dev)?;
            for sm in 0..num_sms {
                let word = words.get((sm / 64) as usize).copied().unwrap_or(0);
                if word & (1u64 << (sm % 64)) == 0 {
                    continue;
                }
                let warps = session.cache.sm_valid_warps_mask(dev, sm)?;
                for wp in warps.iter() {
                    let lanes = session.cache.warp_valid_lanes_mask(dev, sm, wp)?;
                    for ln in lanes.iter() {
                        if let Some(kind) = session.cache.lane_exception(dev, sm, wp, ln)? {
                            let coords = warp_stop_coords(&mut session.cache, dev, sm, wp, Some(ln))?;
                            session.exceptions.hit(kind, coords);
                            session.focus.set_device(coords);
                            return Ok(Some(latched_exception(session)));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Broken warps stop the app for either a planted breakpoint or a bare
    /// break; a breakpoint hit anywhere outranks every plain broken warp.
    fn scan_broken_warps(
        &mut self,
        session: &mut DebuggerSession,
        breakpoints: &dyn BreakpointRegistry,
    ) -> Result<Option<StopReason>> {
        let mut first_broken: Option<Coords> = None;
        let num_devices = session.cache.num_devices()?;
        for dev in 0..num_devices {
            if !session.cache.device_is_valid(dev)? {
                continue;
            }
            let num_sms = session.cache.num_sms(dev)?;
            for sm in 0..num_sms {
                let broken = session.cache.sm_broken_warps_mask(dev, sm)?;
                for wp in broken.iter() {
                    let coords = warp_stop_coords(&mut session.cache, dev, sm, wp, None)?;
                    let (d, s, w, l) = coords.require_physical()?;
                    let pc = session.cache.lane_pc(d, s, w, l)?;
                    if breakpoints.breakpoint_at(pc) {
                        session.focus.set_device(coords);
                        return Ok(Some(StopReason::Breakpoint { coords, pc }));
                    }
                    if first_broken.is_none() {
                        first_broken = Some(coords);
                    }
                }
            }
        }
        if let Some(coords) = first_broken {
            session.focus.set_device(coords);
            return Ok(Some(StopReason::BrokenWarp { coords }));
        }
        Ok(None)
    }
}

/// Full stop coordinate for a warp: the given lane (or its lowest active or
/// valid one) plus the logical fields read from the warp.
fn warp_stop_coords(
    cache: &mut StateCache,
    dev: u32,
    sm: u32,
    wp: u32,
    ln: Option<u32>,
) -> Result<Coords> {
    let ln = match ln {
        Some(l) => l,
        None => match cache.warp_lowest_active_lane(dev, sm, wp)? {
            Some(l) => l,
            None => cache
                .warp_valid_lanes_mask(dev, sm, wp)?
                .lowest()
                .ok_or_else(|| anyhow!("warp ({}, {}, {}) has no valid lanes", dev, sm, wp))?,
        },
    };
    let mut coords = Coords::physical(dev, sm, wp, ln);
    coords.grid_id = Field::At(cache.warp_grid_id(dev, sm, wp)?);
    coords.block_idx = Field::At(cache.warp_block_idx(dev, sm, wp)?);
    coords.thread_idx = Field::At(cache.lane_thread_idx(dev, sm, wp, ln)?);
    Ok(coords)
}

fn latched_exception(session: &DebuggerSession) -> StopReason {
    // only called with a live record
    StopReason::Exception {
        kind: session.exceptions.kind().unwrap_or(ExceptionKind::DeviceIllegalInstruction),
        coords: session.exceptions.coords().unwrap_or_else(Coords::invalid),
        signal: session.exceptions.signal().unwrap_or(4),
    }
}

fn pending_device_mask(session: &DebuggerSession) -> u64 {
    let mut mask = 0u64;
    for n in session.queue.lock().iter() {
        if let Notification::Device(dev) = n {
            mask |= 1u64 << dev;
        }
    }
    mask
}

/// Host-control stand-in driven from fixed tables, the host-side counterpart
/// of the device simulator. Clones share state for post-hoc inspection.
#[derive(Clone, Default)]
pub struct ScriptedHost {
    inner: Rc<RefCell<HostScript>>,
}

#[derive(Default)]
struct HostScript {
    statuses: VecDeque<HostStatus>,
    resumes: usize,
    single_steps: usize,
    killed: bool,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: HostStatus) {
        self.inner.borrow_mut().statuses.push_back(status);
    }

    pub fn resumes(&self) -> usize {
        self.inner.borrow().resumes
    }

    pub fn single_steps(&self) -> usize {
        self.inner.borrow().single_steps
    }

    pub fn killed(&self) -> bool {
        self.inner.borrow().killed
    }
}

impl HostOps for ScriptedHost {
    fn resume(&mut self, single_step: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.resumes += 1;
        if single_step {
            inner.single_steps += 1;
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<HostStatus> {
        self.inner
            .borrow_mut()
            .statuses
            .pop_front()
            .ok_or_else(|| anyhow!("host wait with no scripted status"))
    }

    fn kill(&mut self) -> Result<()> {
        self.inner.borrow_mut().killed = true;
        Ok(())
    }
}
