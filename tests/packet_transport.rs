//! The packetized byte-stream transport must be indistinguishable from the
//! direct backend, multipart reassembly and escaping included.

use gpu_warp_debug::api::{ApiError, DebugClient};
use gpu_warp_debug::coords::Dim3;
use gpu_warp_debug::sim::SimDevice;
use gpu_warp_debug::state::StateCache;
use gpu_warp_debug::transport::packet::{LoopbackChannel, PacketServer, PacketTransport};
use gpu_warp_debug::transport::{Request, TransportError};

fn packet_client(sim: &SimDevice, max_packet: usize) -> DebugClient {
    let server = PacketServer::new(Box::new(sim.clone()), max_packet);
    let chan = LoopbackChannel::new(server);
    DebugClient::new(Box::new(PacketTransport::new(chan, max_packet)))
}

#[test]
fn cache_workload_is_identical_over_both_transports() {
    let sim = SimDevice::new(1, 2, 4, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b1011);
        s.set_valid_warps(0, 1, 0b0001);
        for wp in [0u32, 1, 3] {
            s.set_warp(0, 0, wp, 7, Dim3::new(wp, 0, 0), 0xFFFF, 0x00FF);
        }
        s.set_warp(0, 1, 0, 8, Dim3::new(9, 0, 0), 0xF, 0xF);
        s.set_register(0, 0, 0, 3, 10, 0xDEAD);
    });

    let mut direct = StateCache::new(DebugClient::new(Box::new(sim.clone())));
    let mut packet = StateCache::new(packet_client(&sim, 256));

    for cache in [&mut direct, &mut packet] {
        assert_eq!(cache.num_devices().unwrap(), 1);
        assert_eq!(cache.sm_valid_warps_mask(0, 0).unwrap().0, 0b1011);
        assert_eq!(cache.warp_grid_id(0, 0, 3).unwrap(), 7);
        assert_eq!(cache.warp_block_idx(0, 1, 0).unwrap(), Dim3::new(9, 0, 0));
        assert_eq!(cache.warp_divergent_lanes_mask(0, 0, 0).unwrap().0, 0xFF00);
        assert_eq!(cache.lane_register(0, 0, 0, 3, 10).unwrap(), 0xDEAD);
        assert_eq!(cache.lane_thread_idx(0, 0, 1, 4).unwrap(), Dim3::new(4, 0, 0));
    }
}

#[test]
fn multipart_reassembly_equals_single_packet_reply() {
    let sim = SimDevice::new(1, 1, 1, 32);
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let mut writer = DebugClient::new(Box::new(sim.clone()));
    writer.write_pinned_memory(0x4000, payload.clone()).unwrap();

    let mut small = packet_client(&sim, 96);
    let mut large = packet_client(&sim, 1 << 20);
    let via_parts = small.read_pinned_memory(0x4000, 2000).unwrap();
    let via_one = large.read_pinned_memory(0x4000, 2000).unwrap();
    assert_eq!(via_parts, payload);
    assert_eq!(via_parts, via_one);
}

#[test]
fn reserved_bytes_survive_the_wire() {
    let sim = SimDevice::new(1, 1, 1, 32);
    let mut client = packet_client(&sim, 128);
    // every byte the framing escapes, plus the escape byte's XOR partner
    let data = vec![b'#', b'$', b'}', b'*', b';', 0x5D, 0x00, 0xFF];
    client.write_pinned_memory(0x100, data.clone()).unwrap();
    assert_eq!(client.read_pinned_memory(0x100, data.len() as u32).unwrap(), data);
}

#[test]
fn backend_failures_come_back_as_remote_error_codes() {
    let sim = SimDevice::new(1, 1, 1, 32);
    sim.script(|s| s.fail_next(Request::QueryNumDevices));
    let mut client = packet_client(&sim, 256);
    match client.num_devices() {
        Err(ApiError::Transport(TransportError::Remote { code })) => assert_eq!(code, 1),
        other => panic!("unexpected result {:?}", other),
    }
    // the failure was consumed; the channel still works
    assert_eq!(client.num_devices().unwrap(), 1);
}

#[test]
fn stepping_works_over_the_packet_transport() {
    let sim = SimDevice::new(1, 1, 2, 32);
    sim.script(|s| {
        s.set_valid_warps(0, 0, 0b1);
        s.set_warp(0, 0, 0, 3, Dim3::default(), 0xF, 0xF);
    });
    let mut cache = StateCache::new(packet_client(&sim, 200));
    let before = cache.lane_pc(0, 0, 0, 0).unwrap();
    let stepped = cache.single_step_warp(0, 0, 0, 2).unwrap();
    assert_eq!(stepped.0, 0b1);
    assert_eq!(cache.lane_pc(0, 0, 0, 0).unwrap(), before + 2 * 8);
}
