//! gpu-warp-debug - debugger core for warp-level GPU debugging
//!
//! Maintains a lazily populated mirror of device execution state (devices,
//! SMs, warps, lanes), a registry of kernel launches with parent/child
//! links, coordinate iteration with stable cursors, an autostep stepping
//! engine, exception tracking, and a resume/wait controller. All hardware
//! access goes through the [`transport::DebugTransport`] trait, so the same
//! core runs against an in-process backend or a packetized byte stream.

/// Typed client over the raw request/response transport.
pub mod api;
/// Autostep regions and the warp stepping engine.
pub mod autostep;
/// Resume/wait controller and stop-reason arbitration.
pub mod control;
/// Physical and logical coordinates, wildcards, and focus.
pub mod coords;
/// Device events and notification bookkeeping.
pub mod events;
/// Device exception classification and the live-exception tracker.
pub mod exceptions;
/// Resumable iteration over warps and lanes.
pub mod iter;
/// Kernel launch registry.
pub mod kernels;
/// Warp and lane bitmasks.
pub mod masks;
/// Scriptable software device backend.
pub mod sim;
/// The hierarchical lazy state cache.
pub mod state;
/// Transport trait, wire types, packet framing, and session plumbing.
pub mod transport;

use std::collections::HashMap;

use anyhow::Result;

use crate::api::DebugClient;
use crate::autostep::{AdjacencyRule, AutostepRegion};
use crate::control::HostStatus;
use crate::coords::{Coords, Focus};
use crate::events::{notification_queue, NotificationQueue, Notifications};
use crate::exceptions::ExceptionTracker;
use crate::kernels::KernelRegistry;
use crate::state::StateCache;
use crate::transport::DebugTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maps device PCs to source-level information. The debugger frontend owns
/// the symbol tables; the core only asks questions through this seam.
pub trait SymbolResolver {
    /// Name of the kernel whose entry point is `entry_pc`.
    fn kernel_name(&self, entry_pc: u64) -> Option<String> {
        let _ = entry_pc;
        None
    }

    /// Formatted argument list for the kernel in focus at `coords`.
    fn format_args(&self, coords: &Coords) -> Option<String> {
        let _ = coords;
        None
    }

    /// Source line containing `pc`, if line info is available.
    fn line_for_pc(&self, pc: u64) -> Option<u32> {
        let _ = pc;
        None
    }

    /// One past the last instruction of the kernel entered at `entry_pc`.
    fn kernel_end_pc(&self, entry_pc: u64) -> Option<u64> {
        let _ = entry_pc;
        None
    }
}

/// Breakpoint and autostep-region bookkeeping owned by the frontend.
pub trait BreakpointRegistry {
    /// The autostep region whose start is exactly `pc`, if any.
    fn autostep_at(&self, pc: u64) -> Option<AutostepRegion>;

    /// The region whose address range contains `pc`. Registries without
    /// range information fall back to an exact-start lookup.
    fn autostep_containing(&self, pc: u64) -> Option<AutostepRegion> {
        self.autostep_at(pc)
    }

    /// Whether the region is still enabled. Regions can be disabled while a
    /// step through them is in flight.
    fn region_enabled(&self, id: u64) -> bool;

    /// Whether a code breakpoint is planted at `pc`.
    fn breakpoint_at(&self, pc: u64) -> bool;

    /// Disables the region, typically after a fault inside it.
    fn disable_region(&mut self, id: u64);
}

/// Host-process control: resuming, waiting, and killing the inferior. The
/// debugger frontend implements this against its process layer.
pub trait HostOps {
    fn resume(&mut self, single_step: bool) -> Result<()>;
    fn wait(&mut self) -> Result<HostStatus>;
    fn kill(&mut self) -> Result<()>;
}

/// Session-wide tunables, applied once at construction.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Stepped warps may be preempted in software; a step then invalidates
    /// the whole device instead of just the stepped warps.
    pub software_preemption: bool,
    pub announce_kernels: bool,
    pub announce_system_kernels: bool,
    /// Kernels nested deeper than this are launched silently.
    pub announce_max_depth: Option<u32>,
    /// How an autostep continues when the step lands in another region.
    pub adjacency: AdjacencyRule,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            software_preemption: false,
            announce_kernels: true,
            announce_system_kernels: false,
            announce_max_depth: None,
            adjacency: AdjacencyRule::ExactStart,
        }
    }
}

/// One debug session: the cache, the kernel registry, the live exception,
/// notification bookkeeping, and the current focus, all bound to a single
/// transport. Controllers and stepping engines borrow the pieces they need.
pub struct DebuggerSession {
    pub config: DebugConfig,
    pub cache: StateCache,
    pub kernels: KernelRegistry,
    pub exceptions: ExceptionTracker,
    pub notifications: Notifications,
    pub queue: NotificationQueue,
    pub focus: Focus,
}

impl DebuggerSession {
    /// Performs the protocol handshake and builds an empty session. Fails if
    /// the backend speaks a different protocol revision.
    pub fn new(transport: Box<dyn DebugTransport>, config: DebugConfig) -> Result<Self> {
        let mut client = DebugClient::new(transport);
        client.initialize()?;
        let mut cache = StateCache::new(client);
        cache.set_software_preemption(config.software_preemption);
        let mut kernels = KernelRegistry::new();
        kernels.configure_announcements(
            config.announce_kernels,
            config.announce_system_kernels,
            config.announce_max_depth,
        );
        Ok(Self {
            config,
            cache,
            kernels,
            exceptions: ExceptionTracker::new(),
            notifications: Notifications::new(),
            queue: notification_queue(),
            focus: Focus::Host,
        })
    }

    /// Tears the session down; the transport is unusable afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        self.cache.client_mut().finalize()?;
        Ok(())
    }
}

/// Symbol resolver answering from fixed tables. Useful in tests and for
/// frontends without debug info.
#[derive(Debug, Default, Clone)]
pub struct FixedSymbols {
    pub name: Option<String>,
    pub args: Option<String>,
    pub lines: HashMap<u64, u32>,
    pub end_pcs: HashMap<u64, u64>,
}

impl SymbolResolver for FixedSymbols {
    fn kernel_name(&self, _entry_pc: u64) -> Option<String> {
        self.name.clone()
    }

    fn format_args(&self, _coords: &Coords) -> Option<String> {
        self.args.clone()
    }

    fn line_for_pc(&self, pc: u64) -> Option<u32> {
        self.lines.get(&pc).copied()
    }

    fn kernel_end_pc(&self, entry_pc: u64) -> Option<u64> {
        self.end_pcs.get(&entry_pc).copied()
    }
}

/// Breakpoint registry answering from fixed tables, the counterpart of
/// [`FixedSymbols`]. Instruction-granularity regions get an address range of
/// `length` fixed-size instructions for the range lookup.
#[derive(Debug, Clone)]
pub struct FixedBreakpoints {
    pub regions: Vec<AutostepRegion>,
    pub breakpoints: std::collections::HashSet<u64>,
    pub insn_size: u64,
    disabled: std::collections::HashSet<u64>,
}

impl Default for FixedBreakpoints {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            breakpoints: std::collections::HashSet::new(),
            insn_size: 8,
            disabled: std::collections::HashSet::new(),
        }
    }
}

impl BreakpointRegistry for FixedBreakpoints {
    fn autostep_at(&self, pc: u64) -> Option<AutostepRegion> {
        self.regions.iter().find(|r| r.pc == pc).copied()
    }

    fn autostep_containing(&self, pc: u64) -> Option<AutostepRegion> {
        self.regions
            .iter()
            .find(|r| {
                pc >= r.pc
                    && match r.granularity {
                        autostep::AutostepGranularity::Instructions => {
                            pc < r.pc + r.length as u64 * self.insn_size
                        }
                        autostep::AutostepGranularity::Lines => pc == r.pc,
                    }
            })
            .copied()
    }

    fn region_enabled(&self, id: u64) -> bool {
        !self.disabled.contains(&id)
    }

    fn breakpoint_at(&self, pc: u64) -> bool {
        self.breakpoints.contains(&pc)
    }

    fn disable_region(&mut self, id: u64) {
        self.disabled.insert(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_session_handshake_and_shutdown() {
        let sim = SimDevice::new(1, 1, 1, 32);
        let mut session =
            DebuggerSession::new(Box::new(sim.clone()), DebugConfig::default()).unwrap();
        assert_eq!(sim.call_count("initialize"), 1);
        assert_eq!(session.focus, Focus::Host);
        session.shutdown().unwrap();
        assert_eq!(sim.call_count("finalize"), 1);
    }

    #[test]
    fn test_session_rejects_revision_mismatch() {
        let sim = SimDevice::new(1, 1, 1, 32);
        sim.script(|s| s.set_revision(999));
        assert!(DebuggerSession::new(Box::new(sim), DebugConfig::default()).is_err());
    }

    #[test]
    fn test_fixed_symbols() {
        let mut syms = FixedSymbols::default();
        syms.name = Some("saxpy".into());
        syms.lines.insert(0x1000, 42);
        assert_eq!(syms.kernel_name(0x1000).as_deref(), Some("saxpy"));
        assert_eq!(syms.line_for_pc(0x1000), Some(42));
        assert_eq!(syms.line_for_pc(0x2000), None);
        assert_eq!(syms.kernel_end_pc(0x1000), None);
    }
}
