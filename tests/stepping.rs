//! Warp stepping: overshoot handling and autostep behavior end to end

use gpu_warp_debug::api::DebugClient;
use gpu_warp_debug::BreakpointRegistry;
use gpu_warp_debug::autostep::{
    AdjacencyRule, AutostepGranularity, AutostepRegion, SteppingEngine, StepOutcome,
};
use gpu_warp_debug::coords::{Coords, Dim3};
use gpu_warp_debug::exceptions::ExceptionKind;
use gpu_warp_debug::kernels::KernelRegistry;
use gpu_warp_debug::sim::SimDevice;
use gpu_warp_debug::state::StateCache;
use gpu_warp_debug::transport::{GridInfo, GridStatus, KernelOrigin, KernelType};
use gpu_warp_debug::{FixedBreakpoints, FixedSymbols};

const BASE: u64 = 0x1000;
const INSN: u64 = 8;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

fn grid(grid_id: u64) -> GridInfo {
    GridInfo {
        dev: 0,
        grid_id,
        parent_grid_id: None,
        entry_pc: BASE,
        context_id: 1,
        module_id: 1,
        grid_dim: Dim3::new(1, 1, 1),
        block_dim: Dim3::new(64, 1, 1),
        kind: KernelType::Application,
        origin: KernelOrigin::Cpu,
    }
}

#[test]
fn hardware_overshoot_invalidates_the_extra_warps() {
    init_logging();
    let sim = SimDevice::new(1, 1, 4, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b111);
        for wp in 0..3 {
            s.set_warp(0, 0, wp, 3, Dim3::default(), 0xF, 0xF);
        }
        // warp 2 rides along with any step on this SM
        s.set_step_extra_warps(0, 0, 0b100);
    });
    let mut cache = StateCache::new(DebugClient::new(Box::new(sim.clone())));
    let before = cache.lane_pc(0, 0, 2, 0).unwrap();
    cache.lane_pc(0, 0, 1, 0).unwrap();

    let stepped = cache.single_step_warp(0, 0, 0, 1).unwrap();
    assert_eq!(stepped.0, 0b101);

    // the overshot warp was invalidated, so its new PC is visible
    assert_eq!(cache.lane_pc(0, 0, 2, 0).unwrap(), before + INSN);
    // warp 1 was not stepped and not invalidated
    let warp_state_reads = sim.call_count("read_warp_state");
    cache.lane_pc(0, 0, 1, 0).unwrap();
    assert_eq!(sim.call_count("read_warp_state"), warp_state_reads);
}

fn engine_setup(
    regions: Vec<AutostepRegion>,
) -> (SimDevice, StateCache, KernelRegistry, FixedBreakpoints) {
    let sim = SimDevice::new(1, 1, 4, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b1);
        s.set_warp(0, 0, 0, 3, Dim3::default(), 0xFFFF, 0xFFFF);
        s.add_grid(grid(3), GridStatus::Active);
    });
    let mut cache = StateCache::new(DebugClient::new(Box::new(sim.clone())));
    let mut kernels = KernelRegistry::new();
    kernels
        .start_kernel_from_info(&mut cache, &FixedSymbols::default(), &grid(3))
        .unwrap();
    let mut bps = FixedBreakpoints::default();
    bps.regions = regions;
    (sim, cache, kernels, bps)
}

fn region(id: u64, pc: u64, length: u32) -> AutostepRegion {
    AutostepRegion { id, pc, length, granularity: AutostepGranularity::Instructions }
}

#[test]
fn autostep_chains_through_adjacent_regions() {
    let (_sim, mut cache, mut kernels, mut bps) =
        engine_setup(vec![region(1, BASE, 2), region(2, BASE + 2 * INSN, 3)]);
    let mut engine = SteppingEngine::new();
    assert!(engine
        .begin(&mut cache, &bps, &FixedSymbols::default(), &Coords::physical(0, 0, 0, 0))
        .unwrap());
    let report = engine
        .run(&mut cache, &mut kernels, &mut bps, &FixedSymbols::default(), AdjacencyRule::ExactStart)
        .unwrap();
    assert_eq!(report.outcome, StepOutcome::Completed);
    assert_eq!(report.steps_taken, 5);
    assert_eq!(cache.lane_pc(0, 0, 0, 0).unwrap(), BASE + 5 * INSN);
}

#[test]
fn exact_start_rule_stops_at_a_mid_region_landing() {
    // the second region starts inside the first one's stride, so an
    // exact-start handover never fires
    let (_sim, mut cache, mut kernels, mut bps) =
        engine_setup(vec![region(1, BASE, 3), region(2, BASE + 2 * INSN, 4)]);
    let mut engine = SteppingEngine::new();
    assert!(engine
        .begin(&mut cache, &bps, &FixedSymbols::default(), &Coords::physical(0, 0, 0, 0))
        .unwrap());
    let report = engine
        .run(&mut cache, &mut kernels, &mut bps, &FixedSymbols::default(), AdjacencyRule::ExactStart)
        .unwrap();
    assert_eq!(report.outcome, StepOutcome::Completed);
    assert_eq!(report.steps_taken, 3);

    let (_sim, mut cache, mut kernels, mut bps) =
        engine_setup(vec![region(1, BASE, 3), region(2, BASE + 2 * INSN, 4)]);
    let mut engine = SteppingEngine::new();
    assert!(engine
        .begin(&mut cache, &bps, &FixedSymbols::default(), &Coords::physical(0, 0, 0, 0))
        .unwrap());
    let report = engine
        .run(&mut cache, &mut kernels, &mut bps, &FixedSymbols::default(), AdjacencyRule::WithinRange)
        .unwrap();
    // the range rule picks region 2 up at BASE + 3 instructions
    assert_eq!(report.outcome, StepOutcome::Completed);
    assert!(report.steps_taken > 3);
}

#[test]
fn fault_mid_region_disables_it_and_reports_the_lane() {
    let (sim, mut cache, mut kernels, mut bps) = engine_setup(vec![region(1, BASE, 4)]);
    // branches force single stepping, keeping attribution precise
    sim.script(|s| {
        for i in 0..4u64 {
            s.set_disasm(BASE + i * INSN, "BRA 0x40");
        }
    });
    let mut engine = SteppingEngine::new();
    assert!(engine
        .begin(&mut cache, &bps, &FixedSymbols::default(), &Coords::physical(0, 0, 0, 5))
        .unwrap());
    sim.script(|s| s.set_lane_exception(0, 0, 0, 5, ExceptionKind::WarpMisalignedAddress));
    let report = engine
        .run(&mut cache, &mut kernels, &mut bps, &FixedSymbols::default(), AdjacencyRule::ExactStart)
        .unwrap();
    match report.outcome {
        StepOutcome::Fault { kind, coords, precise } => {
            assert_eq!(kind, ExceptionKind::WarpMisalignedAddress);
            assert_eq!(coords.require_physical().unwrap(), (0, 0, 0, 5));
            assert!(precise);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!bps.region_enabled(1));
}

#[test]
fn warp_completion_mid_region_is_not_an_error() {
    let (sim, mut cache, mut kernels, mut bps) = engine_setup(vec![region(1, BASE, 8)]);
    sim.script(|s| {
        s.set_warp_exit_after(0, 0, 0, 1);
        s.set_disasm(BASE, "EXIT");
    });
    let mut engine = SteppingEngine::new();
    assert!(engine
        .begin(&mut cache, &bps, &FixedSymbols::default(), &Coords::physical(0, 0, 0, 0))
        .unwrap());
    let report = engine
        .run(&mut cache, &mut kernels, &mut bps, &FixedSymbols::default(), AdjacencyRule::ExactStart)
        .unwrap();
    assert_eq!(report.outcome, StepOutcome::WarpExited);
}

#[test]
fn a_warp_exit_hands_over_to_the_next_warp_in_the_region() {
    init_logging();
    let (sim, mut cache, mut kernels, mut bps) = engine_setup(vec![region(1, BASE, 3)]);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b11);
        s.set_warp(0, 0, 1, 3, Dim3::default(), 0xF, 0xF);
        s.set_warp_exit_after(0, 0, 0, 1);
        s.set_disasm(BASE, "EXIT");
    });
    let mut engine = SteppingEngine::new();
    assert!(engine
        .begin(&mut cache, &bps, &FixedSymbols::default(), &Coords::physical(0, 0, 0, 0))
        .unwrap());
    let report = engine
        .run(&mut cache, &mut kernels, &mut bps, &FixedSymbols::default(), AdjacencyRule::ExactStart)
        .unwrap();
    // warp 0 exits after one step; warp 1 finishes the region
    assert_eq!(report.outcome, StepOutcome::Completed);
    assert_eq!(report.steps_taken, 4);
    assert_eq!(cache.lane_pc(0, 0, 1, 0).unwrap(), BASE + 3 * INSN);
    assert!(!cache.warp_is_valid(0, 0, 0).unwrap());
}
