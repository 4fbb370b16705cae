// Autostep - automatic warp stepping through user-declared code regions
// When execution reaches the start of an autostep region, the focused warp is
// stepped through it instruction by instruction (or line by line) so that a
// fault inside the region is attributed to the exact instruction that raised
// it. Straight-line stretches are batched; control flow is stepped singly.

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::coords::{Coords, Field};
use crate::exceptions::ExceptionKind;
use crate::iter::{CoordIterator, IterLevel, Select};
use crate::kernels::KernelRegistry;
use crate::state::StateCache;
use crate::{BreakpointRegistry, SymbolResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutostepGranularity {
    Instructions,
    Lines,
}

/// One user-declared autostep region: `length` units starting at `pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutostepRegion {
    pub id: u64,
    pub pc: u64,
    pub length: u32,
    pub granularity: AutostepGranularity,
}

/// How a finished region hands over to a neighboring one without resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjacencyRule {
    /// Continue only when the landing PC is exactly a region start.
    ExactStart,
    /// Continue when the landing PC falls anywhere inside a region.
    WithinRange,
}

/// Why an autostep run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The region (and any adjacent continuations) was stepped through.
    Completed,
    /// The warp ran to completion mid-region.
    WarpExited,
    /// A lane raised an exception. `precise` means the faulting instruction
    /// is known exactly; otherwise it lies within the last batched stretch.
    Fault { kind: ExceptionKind, coords: Coords, precise: bool },
    /// The region was disabled while the step was in flight.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutostepReport {
    pub steps_taken: u32,
    pub outcome: StepOutcome,
}

#[derive(Debug)]
struct ActiveStep {
    region: AutostepRegion,
    remaining: u32,
    dev: u32,
    sm: u32,
    wp: u32,
    ln: u32,
    last_line: Option<u32>,
}

/// Steps one warp through autostep regions. `begin` arms the engine when the
/// focused lane sits on a region start; `run` drives the warp until the
/// region budget is spent, the warp exits, or a lane faults.
#[derive(Debug, Default)]
pub struct SteppingEngine {
    active: Option<ActiveStep>,
}

impl SteppingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Arms the engine if `coords` sits at the start of an enabled region.
    /// Returns false (and stays idle) when there is nothing to step, the
    /// region is disabled, or the device generation has no stepping support.
    pub fn begin(
        &mut self,
        cache: &mut StateCache,
        breakpoints: &dyn BreakpointRegistry,
        symbols: &dyn SymbolResolver,
        coords: &Coords,
    ) -> Result<bool> {
        let (dev, sm, wp, ln) = coords.require_physical()?;
        // first-generation SMs cannot single-step warps
        if cache.sm_type(dev)?.starts_with("sm_1") {
            warn!("autostep unsupported on device {}", dev);
            return Ok(false);
        }
        let pc = cache.lane_pc(dev, sm, wp, ln)?;
        let region = match breakpoints.autostep_at(pc) {
            Some(r) if breakpoints.region_enabled(r.id) => r,
            _ => return Ok(false),
        };
        debug!("autostep armed at {:#x}, {} units", region.pc, region.length);
        self.active = Some(ActiveStep {
            remaining: region.length,
            region,
            dev,
            sm,
            wp,
            ln,
            last_line: symbols.line_for_pc(pc),
        });
        Ok(true)
    }

    /// Disarms without stepping. Safe to call at any time.
    pub fn cancel(&mut self) {
        self.active = None;
    }

    /// Drives the armed warp to the end of its region, then picks up any
    /// other valid warp still inside an enabled region and continues, until
    /// no stepping warp remains.
    pub fn run(
        &mut self,
        cache: &mut StateCache,
        kernels: &mut KernelRegistry,
        breakpoints: &mut dyn BreakpointRegistry,
        symbols: &dyn SymbolResolver,
        adjacency: AdjacencyRule,
    ) -> Result<AutostepReport> {
        let Some(mut act) = self.active.take() else {
            bail!("autostep run without an armed region");
        };
        let insn_size = cache.insn_size(act.dev)? as u64;
        let mut filter = Coords::wildcard();
        filter.dev = Field::At(act.dev);
        let mut warps = CoordIterator::new(filter, Select::VALID, IterLevel::Warps);
        let mut steps_taken = 0u32;

        let outcome = loop {
            let outcome = self.step_region(
                cache,
                kernels,
                breakpoints,
                symbols,
                adjacency,
                &mut act,
                insn_size,
                &mut steps_taken,
            )?;
            if outcome != StepOutcome::WarpExited {
                break outcome;
            }
            // the stepped warp is gone; any other valid warp still inside an
            // enabled region continues the run
            match next_stepping_warp(cache, kernels, breakpoints, symbols, &mut warps, insn_size)?
            {
                Some(next) => act = next,
                None => break StepOutcome::WarpExited,
            }
        };

        debug!("autostep finished after {} hardware steps", steps_taken);
        Ok(AutostepReport { steps_taken, outcome })
    }

    #[allow(clippy::too_many_arguments)]
    fn step_region(
        &self,
        cache: &mut StateCache,
        kernels: &mut KernelRegistry,
        breakpoints: &mut dyn BreakpointRegistry,
        symbols: &dyn SymbolResolver,
        adjacency: AdjacencyRule,
        act: &mut ActiveStep,
        insn_size: u64,
        steps_taken: &mut u32,
    ) -> Result<StepOutcome> {
        let (dev, sm, wp, ln) = (act.dev, act.sm, act.wp, act.ln);

        let outcome = loop {
            if act.remaining == 0 {
                let pc = cache.lane_pc(dev, sm, wp, ln)?;
                let next = match adjacency {
                    AdjacencyRule::ExactStart => breakpoints.autostep_at(pc),
                    AdjacencyRule::WithinRange => breakpoints.autostep_containing(pc),
                };
                match next {
                    Some(r) if r.id != act.region.id && breakpoints.region_enabled(r.id) => {
                        debug!("autostep continues into region at {:#x}", r.pc);
                        act.remaining = r.length;
                        act.region = r;
                        act.last_line = symbols.line_for_pc(pc);
                        continue;
                    }
                    _ => break StepOutcome::Completed,
                }
            }
            if !breakpoints.region_enabled(act.region.id) {
                break StepOutcome::Disabled;
            }
            if !cache.warp_is_valid(dev, sm, wp)? {
                break StepOutcome::WarpExited;
            }

            let lane_active = cache.lane_is_active(dev, sm, wp, ln)?;
            let before_pc = cache.lane_pc(dev, sm, wp, ln)?;
            let nsteps = if !lane_active {
                // the focused lane is diverged out; step the warp until it
                // rejoins, without charging the region budget
                1
            } else {
                self.batch_size(cache, kernels, act, before_pc, insn_size)?
            };
            cache.single_step_warp(dev, sm, wp, nsteps)?;
            *steps_taken += nsteps;

            if !cache.warp_is_valid(dev, sm, wp)? {
                break StepOutcome::WarpExited;
            }
            if !cache.lane_is_valid(dev, sm, wp, ln)? {
                break StepOutcome::WarpExited;
            }
            if let Some(kind) = cache.lane_exception(dev, sm, wp, ln)? {
                breakpoints.disable_region(act.region.id);
                break StepOutcome::Fault {
                    kind,
                    coords: Coords::physical(dev, sm, wp, ln),
                    precise: nsteps == 1,
                };
            }
            if !lane_active {
                continue;
            }

            let after_pc = cache.lane_pc(dev, sm, wp, ln)?;
            match act.region.granularity {
                AutostepGranularity::Instructions => {
                    // a branch mid-batch means the PC delta, not the request,
                    // is the real progress
                    let delta = after_pc.wrapping_sub(before_pc);
                    let advanced = if after_pc > before_pc && delta % insn_size == 0 {
                        (delta / insn_size) as u32
                    } else {
                        nsteps
                    };
                    act.remaining = act.remaining.saturating_sub(advanced.max(1));
                }
                AutostepGranularity::Lines => {
                    let line = symbols.line_for_pc(after_pc);
                    if line.is_some() && line != act.last_line {
                        act.remaining -= 1;
                        act.last_line = line;
                    }
                }
            }
        };

        Ok(outcome)
    }

    /// How many instructions can be stepped in one transport call: the run of
    /// straight-line code from `pc`, capped by the remaining budget. Control
    /// flow is always stepped singly so the landing PC stays predictable.
    fn batch_size(
        &self,
        cache: &mut StateCache,
        kernels: &mut KernelRegistry,
        act: &ActiveStep,
        pc: u64,
        insn_size: u64,
    ) -> Result<u32> {
        if act.region.granularity == AutostepGranularity::Lines {
            return Ok(1);
        }
        let handle = match kernels.kernel_for_warp(cache, act.dev, act.sm, act.wp)? {
            Some(h) => h,
            None => return Ok(1),
        };
        let max = act.remaining;
        let mut n = 0u32;
        let mut cur = pc;
        while n < max {
            let text = kernels.disassembly(cache, handle, cur)?;
            if is_control_flow(&text) {
                if n == 0 {
                    n = 1;
                }
                break;
            }
            n += 1;
            cur += insn_size;
        }
        Ok(n.max(1))
    }
}

/// Walks the remaining valid warps and arms the first one whose lowest
/// active lane sits inside an enabled region with budget left. Warps picked
/// up mid-region only get the portion of the budget past their PC.
fn next_stepping_warp(
    cache: &mut StateCache,
    kernels: &KernelRegistry,
    breakpoints: &dyn BreakpointRegistry,
    symbols: &dyn SymbolResolver,
    warps: &mut CoordIterator,
    insn_size: u64,
) -> Result<Option<ActiveStep>> {
    while let Some(c) = warps.next(cache, kernels)? {
        let (Some(dev), Some(sm), Some(wp)) = (c.dev.value(), c.sm.value(), c.wp.value()) else {
            continue;
        };
        let Some(ln) = cache.warp_lowest_active_lane(dev, sm, wp)? else {
            continue;
        };
        let pc = cache.lane_pc(dev, sm, wp, ln)?;
        let region = match breakpoints.autostep_containing(pc) {
            Some(r) if breakpoints.region_enabled(r.id) => r,
            _ => continue,
        };
        let consumed = if region.granularity == AutostepGranularity::Instructions && pc > region.pc
        {
            ((pc - region.pc) / insn_size) as u32
        } else {
            0
        };
        let remaining = region.length.saturating_sub(consumed);
        if remaining == 0 {
            continue;
        }
        debug!("autostep moves to warp ({}, {}, {}) at {:#x}", dev, sm, wp, pc);
        return Ok(Some(ActiveStep {
            region,
            remaining,
            dev,
            sm,
            wp,
            ln,
            last_line: symbols.line_for_pc(pc),
        }));
    }
    Ok(None)
}

/// Opcodes after which the next PC is not simply the following instruction.
fn is_control_flow(insn: &str) -> bool {
    let mut tokens = insn.split_whitespace();
    let op = match tokens.next() {
        // skip a predicate guard like @P0 or @!P2
        Some(t) if t.starts_with('@') => tokens.next().unwrap_or(""),
        Some(t) => t,
        None => "",
    };
    matches!(
        op,
        "BRA" | "BRX" | "JMP" | "JMX" | "CAL" | "CALL" | "RET" | "EXIT" | "BPT" | "SSY" | "BRK"
            | "BAR"
    )
}
