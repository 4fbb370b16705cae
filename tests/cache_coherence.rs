//! Cache coherence: lazy population, fault tolerance, and invalidation

use gpu_warp_debug::api::DebugClient;
use gpu_warp_debug::coords::Dim3;
use gpu_warp_debug::masks::LaneMask;
use gpu_warp_debug::sim::SimDevice;
use gpu_warp_debug::state::StateCache;
use gpu_warp_debug::transport::Request;
use proptest::prelude::*;
use std::collections::HashMap;

fn cache_for(sim: &SimDevice) -> StateCache {
    StateCache::new(DebugClient::new(Box::new(sim.clone())))
}

#[test]
fn topology_is_fetched_once_and_never_invalidated() {
    let sim = SimDevice::new(2, 4, 8, 32);
    let mut cache = cache_for(&sim);
    for _ in 0..5 {
        assert_eq!(cache.num_devices().unwrap(), 2);
        assert_eq!(cache.num_sms(0).unwrap(), 4);
        assert_eq!(cache.num_warps(1).unwrap(), 8);
        assert_eq!(cache.num_lanes(0).unwrap(), 32);
    }
    cache.system_invalidate();
    assert_eq!(cache.num_sms(0).unwrap(), 4);
    assert_eq!(sim.call_count("query_num_devices"), 1);
    assert_eq!(sim.call_count("query_device_spec"), 2);
}

#[test]
fn warp_state_populates_in_one_round_trip() {
    let sim = SimDevice::new(1, 1, 4, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b1);
        s.set_warp(0, 0, 0, 7, Dim3::new(2, 1, 0), 0xFFFF, 0x00FF);
    });
    let mut cache = cache_for(&sim);
    assert_eq!(cache.warp_grid_id(0, 0, 0).unwrap(), 7);
    assert_eq!(cache.warp_block_idx(0, 0, 0).unwrap(), Dim3::new(2, 1, 0));
    assert_eq!(cache.warp_valid_lanes_mask(0, 0, 0).unwrap(), LaneMask(0xFFFF));
    assert_eq!(cache.warp_active_lanes_mask(0, 0, 0).unwrap(), LaneMask(0x00FF));
    // diverged = valid lanes not currently active
    assert_eq!(cache.warp_divergent_lanes_mask(0, 0, 0).unwrap(), LaneMask(0xFF00));
    for ln in 0..16 {
        assert_eq!(cache.lane_thread_idx(0, 0, 0, ln).unwrap(), Dim3::new(ln, 0, 0));
    }
    assert_eq!(sim.call_count("read_warp_state"), 1);
}

#[test]
fn failed_fetch_leaves_slot_cold_then_recovers() {
    let sim = SimDevice::new(1, 1, 2, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b11);
        s.fail_next(Request::ReadValidWarps { dev: 0, sm: 0 });
    });
    let mut cache = cache_for(&sim);
    assert!(cache.sm_valid_warps_mask(0, 0).is_err());
    // the failure did not populate anything; the retry hits the device again
    assert_eq!(cache.sm_valid_warps_mask(0, 0).unwrap().0, 0b11);
    assert_eq!(sim.call_count("read_valid_warps"), 2);
    // and from here on the value is served from the cache
    cache.sm_valid_warps_mask(0, 0).unwrap();
    assert_eq!(sim.call_count("read_valid_warps"), 2);
}

#[test]
fn invalidation_drops_state_and_bumps_generation() {
    let sim = SimDevice::new(1, 1, 2, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b1);
        s.set_warp(0, 0, 0, 7, Dim3::default(), 0xF, 0xF);
    });
    let mut cache = cache_for(&sim);
    cache.warp_grid_id(0, 0, 0).unwrap();
    let gen = cache.generation();

    sim.script(|s| s.set_warp(0, 0, 0, 9, Dim3::default(), 0xF, 0xF));
    // stale until told otherwise
    assert_eq!(cache.warp_grid_id(0, 0, 0).unwrap(), 7);
    cache.invalidate_device(0);
    assert!(cache.generation() > gen);
    assert_eq!(cache.warp_grid_id(0, 0, 0).unwrap(), 9);
}

#[test]
fn resume_invalidates_before_the_device_runs() {
    let sim = SimDevice::new(1, 1, 2, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b1);
        s.set_warp(0, 0, 0, 7, Dim3::default(), 0xF, 0xF);
    });
    let mut cache = cache_for(&sim);
    cache.suspend_device(0).unwrap();
    cache.warp_grid_id(0, 0, 0).unwrap();
    let gen = cache.generation();
    cache.resume_device(0).unwrap();
    assert!(cache.generation() > gen);
    assert!(!cache.device_is_suspended(0).unwrap());
}

#[derive(Debug, Clone)]
enum RegOp {
    Read(u32),
    Write(u32, u32),
    Invalidate,
}

fn reg_op() -> impl Strategy<Value = RegOp> {
    prop_oneof![
        (0u32..64).prop_map(RegOp::Read),
        (0u32..64, any::<u32>()).prop_map(|(r, v)| RegOp::Write(r, v)),
        Just(RegOp::Invalidate),
    ]
}

proptest! {
    // whatever mix of reads, write-throughs, and invalidations runs, the
    // cache must agree with a shadow model of the device registers
    #[test]
    fn register_cache_matches_device_model(ops in proptest::collection::vec(reg_op(), 1..50)) {
        let sim = SimDevice::new(1, 1, 1, 32);
        sim.script(|s| {
            s.set_valid_warps(0, 0, 0b1);
            s.set_warp(0, 0, 0, 1, Dim3::default(), 0xF, 0xF);
        });
        let mut cache = cache_for(&sim);
        let mut model: HashMap<u32, u32> = HashMap::new();
        for op in ops {
            match op {
                RegOp::Read(r) => {
                    let got = cache.lane_register(0, 0, 0, 0, r).unwrap();
                    prop_assert_eq!(got, model.get(&r).copied().unwrap_or(0));
                }
                RegOp::Write(r, v) => {
                    cache.lane_register_write(0, 0, 0, 0, r, v).unwrap();
                    model.insert(r, v);
                }
                RegOp::Invalidate => cache.invalidate_warp(0, 0, 0),
            }
        }
    }
}
