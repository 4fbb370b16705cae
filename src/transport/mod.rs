// Debug Transport - request/response channel to the hardware-facing debug API
// Two interchangeable implementations: a direct in-process backend and a
// packetized byte-stream client (see packet.rs). Semantics are identical.

pub mod packet;
pub mod session;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coords::Dim3;
use crate::events::DeviceEvent;
use crate::exceptions::ExceptionKind;

/// Protocol revision carried in the Initialize handshake. A backend reporting
/// a different revision is unusable and the session must be torn down.
pub const PROTOCOL_REVISION: u32 = 3;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote error code E{code:02}")]
    Remote { code: u8 },
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("packet buffer overflow: payload of {size} exceeds {max}")]
    BufferOverflow { size: usize, max: usize },
    #[error("backend reported failure: {0}")]
    Backend(String),
}

/// Immutable per-device topology and identification, fetched once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub num_sms: u32,
    /// Warps per SM.
    pub num_warps: u32,
    /// Lanes per warp.
    pub num_lanes: u32,
    pub num_registers: u32,
    pub num_predicates: u32,
    pub num_uregisters: u32,
    pub num_upredicates: u32,
    pub dev_type: String,
    pub sm_type: String,
    pub dev_name: String,
    /// Size of one instruction in bytes.
    pub insn_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridStatus {
    Invalid,
    Pending,
    Active,
    Sleeping,
    Terminated,
}

impl GridStatus {
    /// Present on hardware: resident (active) or preempted (sleeping).
    pub fn is_present(&self) -> bool {
        matches!(self, GridStatus::Active | GridStatus::Sleeping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelType {
    System,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelOrigin {
    /// Launched from the host via the driver.
    Cpu,
    /// Launched dynamically from device code.
    Gpu,
}

/// Everything the hardware knows about one grid launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridInfo {
    pub dev: u32,
    pub grid_id: u64,
    pub parent_grid_id: Option<u64>,
    pub entry_pc: u64,
    pub context_id: u64,
    pub module_id: u64,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub kind: KernelType,
    pub origin: KernelOrigin,
}

/// Snapshot of one lane inside a warp state block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStateBlock {
    pub ln: u32,
    pub pc: u64,
    pub virtual_pc: u64,
    pub thread_idx: Dim3,
    pub exception: Option<ExceptionKind>,
}

/// Batched warp snapshot: one transport round trip populates the warp and
/// all of its valid lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpStateBlock {
    pub grid_id: u64,
    pub block_idx: Dim3,
    pub valid_lanes: u64,
    pub active_lanes: u64,
    pub error_pc: Option<u64>,
    pub lanes: Vec<LaneStateBlock>,
}

/// Full opcode set of the debug API. Every operation the cache, registry,
/// stepping engine, and controller need goes through exactly one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Initialize { revision: u32 },
    Finalize,
    QueryNumDevices,
    QueryDeviceSpec { dev: u32 },
    ReadValidWarps { dev: u32, sm: u32 },
    ReadBrokenWarps { dev: u32, sm: u32 },
    ReadWarpState { dev: u32, sm: u32, wp: u32 },
    ReadRegisterRange { dev: u32, sm: u32, wp: u32, ln: u32, first: u32, count: u32 },
    WriteRegister { dev: u32, sm: u32, wp: u32, ln: u32, regno: u32, value: u32 },
    ReadUniformRegisterRange { dev: u32, sm: u32, wp: u32, first: u32, count: u32 },
    WriteUniformRegister { dev: u32, sm: u32, wp: u32, regno: u32, value: u32 },
    ReadPredicates { dev: u32, sm: u32, wp: u32, ln: u32 },
    WritePredicates { dev: u32, sm: u32, wp: u32, ln: u32, values: Vec<bool> },
    ReadUniformPredicates { dev: u32, sm: u32, wp: u32 },
    WriteUniformPredicates { dev: u32, sm: u32, wp: u32, values: Vec<bool> },
    ReadCcRegister { dev: u32, sm: u32, wp: u32, ln: u32 },
    WriteCcRegister { dev: u32, sm: u32, wp: u32, ln: u32, value: u32 },
    ReadPc { dev: u32, sm: u32, wp: u32, ln: u32 },
    ReadVirtualPc { dev: u32, sm: u32, wp: u32, ln: u32 },
    ReadLaneException { dev: u32, sm: u32, wp: u32, ln: u32 },
    ReadDeviceExceptionState { dev: u32 },
    ReadLocalMemory { dev: u32, sm: u32, wp: u32, ln: u32, addr: u64, len: u32 },
    WriteLocalMemory { dev: u32, sm: u32, wp: u32, ln: u32, addr: u64, data: Vec<u8> },
    ReadPinnedMemory { addr: u64, len: u32 },
    WritePinnedMemory { addr: u64, data: Vec<u8> },
    SetBreakpoint { dev: u32, addr: u64 },
    UnsetBreakpoint { dev: u32, addr: u64 },
    SuspendDevice { dev: u32 },
    ResumeDevice { dev: u32 },
    SingleStepWarp { dev: u32, sm: u32, wp: u32, nsteps: u32 },
    ResumeWarpsUntilPc { dev: u32, sm: u32, warp_mask: u64, pc: u64 },
    Disassemble { dev: u32, addr: u64 },
    NextSyncEvent,
    AckSyncEvents,
    NextAsyncEvent,
    QueryGridStatus { dev: u32, grid_id: u64 },
    QueryGridInfo { dev: u32, grid_id: u64 },
    NotificationPending,
    CheckPendingSigint,
    UpdateGridIdInSm { dev: u32, sm: u32 },
    UpdateBlockIdxInSm { dev: u32, sm: u32 },
    UpdateThreadIdxInWarp { dev: u32, sm: u32, wp: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Initialized { revision: u32 },
    Count(u32),
    DeviceSpec(DeviceSpec),
    WarpMask(u64),
    WarpState(WarpStateBlock),
    Registers(Vec<u32>),
    Predicates(Vec<bool>),
    CcRegister(u32),
    Pc(u64),
    LaneException(Option<ExceptionKind>),
    ExceptionMask(Vec<u64>),
    Memory(Vec<u8>),
    SteppedWarpMask(u64),
    Instruction(String),
    Event(Option<DeviceEvent>),
    GridStatus(GridStatus),
    GridInfo(GridInfo),
    Bool(bool),
    GridIds(Vec<(u32, u64)>),
    BlockIdxs(Vec<(u32, Dim3)>),
    ThreadIdxs(Vec<(u32, Dim3)>),
}

/// Synchronous request/response channel to the debug backend. Calls block
/// until the reply arrives; there is no cancellation of an in-flight call.
pub trait DebugTransport {
    fn call(&mut self, req: Request) -> Result<Response, TransportError>;
}

impl<T: DebugTransport + ?Sized> DebugTransport for Box<T> {
    fn call(&mut self, req: Request) -> Result<Response, TransportError> {
        (**self).call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_grid_status_presence() {
        assert!(GridStatus::Active.is_present());
        assert!(GridStatus::Sleeping.is_present());
        assert!(!GridStatus::Pending.is_present());
        assert!(!GridStatus::Terminated.is_present());
        assert!(!GridStatus::Invalid.is_present());
    }

    #[test]
    fn test_request_json_round_trip() {
        let req = Request::ReadRegisterRange { dev: 1, sm: 2, wp: 3, ln: 4, first: 32, count: 32 };
        let bytes = serde_json::to_vec(&req).unwrap();
        let back: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn test_response_json_round_trip() {
        let resp = Response::WarpState(WarpStateBlock {
            grid_id: 7,
            block_idx: Dim3::new(1, 0, 0),
            valid_lanes: 0xFFFF,
            active_lanes: 0x00FF,
            error_pc: None,
            lanes: vec![LaneStateBlock {
                ln: 0,
                pc: 0x1000,
                virtual_pc: 0x1000,
                thread_idx: Dim3::new(0, 0, 0),
                exception: None,
            }],
        });
        let bytes = serde_json::to_vec(&resp).unwrap();
        let back: Response = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(resp, back);
    }
}
