//! End-to-end resume/wait flows: stop arbitration, exception lifecycle, and
//! the kernel launch DAG driven purely by drained events.

use gpu_warp_debug::control::{HostStatus, ResumeWaitController, ScriptedHost, StopReason};
use gpu_warp_debug::coords::{Coords, Dim3};
use gpu_warp_debug::events::{DeviceEvent, Notification};
use gpu_warp_debug::exceptions::ExceptionKind;
use gpu_warp_debug::sim::SimDevice;
use gpu_warp_debug::transport::{GridInfo, GridStatus, KernelOrigin, KernelType};
use gpu_warp_debug::{DebugConfig, DebuggerSession, FixedBreakpoints, FixedSymbols};

fn grid(grid_id: u64, parent: Option<u64>, origin: KernelOrigin) -> GridInfo {
    GridInfo {
        dev: 0,
        grid_id,
        parent_grid_id: parent,
        entry_pc: 0x1000 + grid_id * 0x100,
        context_id: 1,
        module_id: 1,
        grid_dim: Dim3::new(2, 1, 1),
        block_dim: Dim3::new(64, 1, 1),
        kind: KernelType::Application,
        origin,
    }
}

fn ready_event(info: &GridInfo) -> DeviceEvent {
    DeviceEvent::KernelReady {
        dev: info.dev,
        grid_id: info.grid_id,
        parent_grid_id: info.parent_grid_id,
        context_id: info.context_id,
        module_id: info.module_id,
        entry_pc: info.entry_pc,
        grid_dim: info.grid_dim,
        block_dim: info.block_dim,
        kind: info.kind,
        origin: info.origin,
    }
}

fn setup() -> (SimDevice, DebuggerSession, ResumeWaitController, ScriptedHost) {
    let sim = SimDevice::new(1, 2, 4, 32);
    let session = DebuggerSession::new(Box::new(sim.clone()), DebugConfig::default()).unwrap();
    let host = ScriptedHost::new();
    let ctrl = ResumeWaitController::new(Box::new(host.clone()));
    (sim, session, ctrl, host)
}

fn wait(
    ctrl: &mut ResumeWaitController,
    session: &mut DebuggerSession,
) -> StopReason {
    ctrl.wait(session, &FixedBreakpoints::default(), &FixedSymbols::default()).unwrap()
}

#[test]
fn launch_dag_builds_from_events_and_terminates_bottom_up() {
    let (sim, mut session, mut ctrl, host) = setup();
    let parent = grid(10, None, KernelOrigin::Cpu);
    let child = grid(11, Some(10), KernelOrigin::Gpu);
    sim.script(|s| {
        s.add_grid(parent.clone(), GridStatus::Active);
        s.add_grid(child.clone(), GridStatus::Active);
        s.push_sync_event(ready_event(&parent));
        s.push_sync_event(ready_event(&child));
    });
    host.push_status(HostStatus::Stopped { signal: 17 });
    assert_eq!(wait(&mut ctrl, &mut session), StopReason::Event);

    assert_eq!(session.kernels.len(), 2);
    let p = session.kernels.find_by_grid_id(0, 10).unwrap();
    let c = session.kernels.find_by_grid_id(0, 11).unwrap();
    assert_eq!(session.kernels.record(c).parent, Some(p));
    assert_eq!(session.kernels.depth(c), 1);
    assert!(session.kernels.record(p).launched);

    // child finishes first; the parent lingers until its own status flips
    sim.script(|s| s.set_grid_status(0, 11, GridStatus::Terminated));
    ctrl.resume(&mut session, false).unwrap();
    host.push_status(HostStatus::Stopped { signal: 17 });
    wait(&mut ctrl, &mut session);
    assert!(session.kernels.find_by_grid_id(0, 11).is_none());
    assert!(session.kernels.find_by_grid_id(0, 10).is_some());

    sim.script(|s| s.set_grid_status(0, 10, GridStatus::Terminated));
    ctrl.resume(&mut session, false).unwrap();
    host.push_status(HostStatus::Stopped { signal: 17 });
    wait(&mut ctrl, &mut session);
    assert!(session.kernels.is_empty());
}

#[test]
fn gpu_launch_with_unknown_parent_synthesizes_the_chain() {
    let (sim, mut session, mut ctrl, host) = setup();
    let root = grid(20, None, KernelOrigin::Cpu);
    let middle = grid(21, Some(20), KernelOrigin::Gpu);
    let leaf = grid(22, Some(21), KernelOrigin::Gpu);
    sim.script(|s| {
        s.add_grid(root.clone(), GridStatus::Active);
        s.add_grid(middle.clone(), GridStatus::Active);
        s.add_grid(leaf.clone(), GridStatus::Active);
        // only the leaf is ever announced
        s.push_async_event(ready_event(&leaf));
    });
    host.push_status(HostStatus::Stopped { signal: 17 });
    assert_eq!(wait(&mut ctrl, &mut session), StopReason::Event);

    assert_eq!(session.kernels.len(), 3);
    let leaf_h = session.kernels.find_by_grid_id(0, 22).unwrap();
    assert_eq!(session.kernels.depth(leaf_h), 2);
}

#[test]
fn warp_assert_is_survivable_but_a_fault_is_not() {
    let (sim, mut session, mut ctrl, host) = setup();
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b1);
        s.set_warp(0, 0, 0, 7, Dim3::default(), 0xF, 0xF);
        s.set_lane_exception(0, 0, 0, 1, ExceptionKind::WarpAssert);
    });
    host.push_status(HostStatus::Stopped { signal: 5 });
    match wait(&mut ctrl, &mut session) {
        StopReason::Exception { kind, signal, .. } => {
            assert_eq!(kind, ExceptionKind::WarpAssert);
            assert_eq!(signal, 5);
        }
        other => panic!("unexpected reason {:?}", other),
    }
    // an assert can be stepped over
    sim.script(|s| {
        s.set_warp(0, 0, 0, 7, Dim3::default(), 0xF, 0xF);
    });
    ctrl.resume(&mut session, false).unwrap();
    assert!(!host.killed());
    assert!(!session.exceptions.is_valid());

    // a memory fault cannot
    session.exceptions.hit(ExceptionKind::LaneIllegalAddress, Coords::physical(0, 0, 0, 1));
    assert!(ctrl.resume(&mut session, false).is_err());
    assert!(host.killed());
}

#[test]
fn notification_cycle_services_the_device_before_it_runs() {
    let (sim, mut session, mut ctrl, host) = setup();
    session.queue.lock().push_back(Notification::Device(0));
    host.push_status(HostStatus::Stopped { signal: 17 });
    assert_eq!(wait(&mut ctrl, &mut session), StopReason::Notification);
    assert!(session.notifications.pending());

    // nothing new queued: the consumed notification releases the device
    ctrl.resume(&mut session, false).unwrap();
    assert!(!session.notifications.pending());
    assert!(!sim.script(|s| s.is_suspended(0)));
    assert_eq!(host.resumes(), 1);
}

#[test]
fn focus_follows_the_stopping_warp() {
    let (sim, mut session, mut ctrl, host) = setup();
    sim.script(|s| {
        s.set_valid_warps(0, 1, 0b10);
        s.set_broken_warps(0, 1, 0b10);
        s.set_warp(0, 1, 1, 7, Dim3::new(1, 0, 0), 0xF, 0x6);
    });
    host.push_status(HostStatus::Stopped { signal: 5 });
    match wait(&mut ctrl, &mut session) {
        StopReason::BrokenWarp { coords } => {
            // lowest active lane of the broken warp
            assert_eq!(coords.require_physical().unwrap(), (0, 1, 1, 1));
            assert_eq!(coords.block_idx.value(), Some(Dim3::new(1, 0, 0)));
            assert_eq!(session.focus.current(), coords);
        }
        other => panic!("unexpected reason {:?}", other),
    }
}
