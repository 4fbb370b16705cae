// Debug API Client - typed wrappers over the transport opcode set
// One method per operation; every call is a synchronous round trip. The
// handshake pins the protocol revision before anything else is allowed.

use thiserror::Error;
use tracing::trace;

use crate::coords::Dim3;
use crate::events::DeviceEvent;
use crate::exceptions::ExceptionKind;
use crate::transport::{
    DebugTransport, DeviceSpec, GridInfo, GridStatus, Request, Response, TransportError,
    WarpStateBlock, PROTOCOL_REVISION,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("incompatible debug API revision: client {client}, backend {backend}")]
    IncompatibleApi { client: u32, backend: u32 },
    #[error("unexpected response to {op}")]
    UnexpectedResponse { op: &'static str },
}

pub type ApiResult<T> = Result<T, ApiError>;

pub struct DebugClient {
    transport: Box<dyn DebugTransport>,
    initialized: bool,
}

impl DebugClient {
    pub fn new(transport: Box<dyn DebugTransport>) -> Self {
        Self { transport, initialized: false }
    }

    fn call(&mut self, op: &'static str, req: Request) -> ApiResult<Response> {
        trace!("api call: {}", op);
        Ok(self.transport.call(req)?)
    }

    /// Handshake. A revision mismatch is fatal for the session; the caller
    /// must tear the target down rather than continue.
    pub fn initialize(&mut self) -> ApiResult<()> {
        let resp = self.call("initialize", Request::Initialize { revision: PROTOCOL_REVISION })?;
        match resp {
            Response::Initialized { revision } if revision == PROTOCOL_REVISION => {
                self.initialized = true;
                Ok(())
            }
            Response::Initialized { revision } => {
                Err(ApiError::IncompatibleApi { client: PROTOCOL_REVISION, backend: revision })
            }
            _ => Err(ApiError::UnexpectedResponse { op: "initialize" }),
        }
    }

    pub fn finalize(&mut self) -> ApiResult<()> {
        self.call("finalize", Request::Finalize).and_then(expect_ok("finalize"))?;
        self.initialized = false;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn num_devices(&mut self) -> ApiResult<u32> {
        match self.call("query_num_devices", Request::QueryNumDevices)? {
            Response::Count(n) => Ok(n),
            _ => Err(ApiError::UnexpectedResponse { op: "query_num_devices" }),
        }
    }

    pub fn device_spec(&mut self, dev: u32) -> ApiResult<DeviceSpec> {
        match self.call("query_device_spec", Request::QueryDeviceSpec { dev })? {
            Response::DeviceSpec(spec) => Ok(spec),
            _ => Err(ApiError::UnexpectedResponse { op: "query_device_spec" }),
        }
    }

    pub fn valid_warps(&mut self, dev: u32, sm: u32) -> ApiResult<u64> {
        match self.call("read_valid_warps", Request::ReadValidWarps { dev, sm })? {
            Response::WarpMask(m) => Ok(m),
            _ => Err(ApiError::UnexpectedResponse { op: "read_valid_warps" }),
        }
    }

    pub fn broken_warps(&mut self, dev: u32, sm: u32) -> ApiResult<u64> {
        match self.call("read_broken_warps", Request::ReadBrokenWarps { dev, sm })? {
            Response::WarpMask(m) => Ok(m),
            _ => Err(ApiError::UnexpectedResponse { op: "read_broken_warps" }),
        }
    }

    pub fn warp_state(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<WarpStateBlock> {
        match self.call("read_warp_state", Request::ReadWarpState { dev, sm, wp })? {
            Response::WarpState(block) => Ok(block),
            _ => Err(ApiError::UnexpectedResponse { op: "read_warp_state" }),
        }
    }

    pub fn read_register_range(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        first: u32,
        count: u32,
    ) -> ApiResult<Vec<u32>> {
        let req = Request::ReadRegisterRange { dev, sm, wp, ln, first, count };
        match self.call("read_register_range", req)? {
            Response::Registers(regs) => Ok(regs),
            _ => Err(ApiError::UnexpectedResponse { op: "read_register_range" }),
        }
    }

    pub fn write_register(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        regno: u32,
        value: u32,
    ) -> ApiResult<()> {
        let req = Request::WriteRegister { dev, sm, wp, ln, regno, value };
        self.call("write_register", req).and_then(expect_ok("write_register"))
    }

    pub fn read_uregister_range(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        first: u32,
        count: u32,
    ) -> ApiResult<Vec<u32>> {
        let req = Request::ReadUniformRegisterRange { dev, sm, wp, first, count };
        match self.call("read_uregister_range", req)? {
            Response::Registers(regs) => Ok(regs),
            _ => Err(ApiError::UnexpectedResponse { op: "read_uregister_range" }),
        }
    }

    pub fn write_uregister(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        regno: u32,
        value: u32,
    ) -> ApiResult<()> {
        let req = Request::WriteUniformRegister { dev, sm, wp, regno, value };
        self.call("write_uregister", req).and_then(expect_ok("write_uregister"))
    }

    pub fn read_predicates(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<Vec<bool>> {
        match self.call("read_predicates", Request::ReadPredicates { dev, sm, wp, ln })? {
            Response::Predicates(p) => Ok(p),
            _ => Err(ApiError::UnexpectedResponse { op: "read_predicates" }),
        }
    }

    pub fn write_predicates(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        values: Vec<bool>,
    ) -> ApiResult<()> {
        let req = Request::WritePredicates { dev, sm, wp, ln, values };
        self.call("write_predicates", req).and_then(expect_ok("write_predicates"))
    }

    pub fn read_upredicates(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<Vec<bool>> {
        match self.call("read_upredicates", Request::ReadUniformPredicates { dev, sm, wp })? {
            Response::Predicates(p) => Ok(p),
            _ => Err(ApiError::UnexpectedResponse { op: "read_upredicates" }),
        }
    }

    pub fn write_upredicates(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        values: Vec<bool>,
    ) -> ApiResult<()> {
        let req = Request::WriteUniformPredicates { dev, sm, wp, values };
        self.call("write_upredicates", req).and_then(expect_ok("write_upredicates"))
    }

    pub fn read_cc_register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<u32> {
        match self.call("read_cc_register", Request::ReadCcRegister { dev, sm, wp, ln })? {
            Response::CcRegister(v) => Ok(v),
            _ => Err(ApiError::UnexpectedResponse { op: "read_cc_register" }),
        }
    }

    pub fn write_cc_register(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        value: u32,
    ) -> ApiResult<()> {
        let req = Request::WriteCcRegister { dev, sm, wp, ln, value };
        self.call("write_cc_register", req).and_then(expect_ok("write_cc_register"))
    }

    pub fn read_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<u64> {
        match self.call("read_pc", Request::ReadPc { dev, sm, wp, ln })? {
            Response::Pc(pc) => Ok(pc),
            _ => Err(ApiError::UnexpectedResponse { op: "read_pc" }),
        }
    }

    pub fn read_virtual_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<u64> {
        match self.call("read_virtual_pc", Request::ReadVirtualPc { dev, sm, wp, ln })? {
            Response::Pc(pc) => Ok(pc),
            _ => Err(ApiError::UnexpectedResponse { op: "read_virtual_pc" }),
        }
    }

    pub fn lane_exception(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
    ) -> ApiResult<Option<ExceptionKind>> {
        match self.call("read_lane_exception", Request::ReadLaneException { dev, sm, wp, ln })? {
            Response::LaneException(e) => Ok(e),
            _ => Err(ApiError::UnexpectedResponse { op: "read_lane_exception" }),
        }
    }

    pub fn device_exception_state(&mut self, dev: u32) -> ApiResult<Vec<u64>> {
        match self.call("read_device_exception_state", Request::ReadDeviceExceptionState { dev })? {
            Response::ExceptionMask(m) => Ok(m),
            _ => Err(ApiError::UnexpectedResponse { op: "read_device_exception_state" }),
        }
    }

    pub fn read_local_memory(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        addr: u64,
        len: u32,
    ) -> ApiResult<Vec<u8>> {
        let req = Request::ReadLocalMemory { dev, sm, wp, ln, addr, len };
        match self.call("read_local_memory", req)? {
            Response::Memory(data) => Ok(data),
            _ => Err(ApiError::UnexpectedResponse { op: "read_local_memory" }),
        }
    }

    pub fn write_local_memory(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        addr: u64,
        data: Vec<u8>,
    ) -> ApiResult<()> {
        let req = Request::WriteLocalMemory { dev, sm, wp, ln, addr, data };
        self.call("write_local_memory", req).and_then(expect_ok("write_local_memory"))
    }

    pub fn read_pinned_memory(&mut self, addr: u64, len: u32) -> ApiResult<Vec<u8>> {
        match self.call("read_pinned_memory", Request::ReadPinnedMemory { addr, len })? {
            Response::Memory(data) => Ok(data),
            _ => Err(ApiError::UnexpectedResponse { op: "read_pinned_memory" }),
        }
    }

    pub fn write_pinned_memory(&mut self, addr: u64, data: Vec<u8>) -> ApiResult<()> {
        self.call("write_pinned_memory", Request::WritePinnedMemory { addr, data })
            .and_then(expect_ok("write_pinned_memory"))
    }

    pub fn set_breakpoint(&mut self, dev: u32, addr: u64) -> ApiResult<()> {
        self.call("set_breakpoint", Request::SetBreakpoint { dev, addr })
            .and_then(expect_ok("set_breakpoint"))
    }

    pub fn unset_breakpoint(&mut self, dev: u32, addr: u64) -> ApiResult<()> {
        self.call("unset_breakpoint", Request::UnsetBreakpoint { dev, addr })
            .and_then(expect_ok("unset_breakpoint"))
    }

    pub fn suspend_device(&mut self, dev: u32) -> ApiResult<()> {
        self.call("suspend_device", Request::SuspendDevice { dev })
            .and_then(expect_ok("suspend_device"))
    }

    pub fn resume_device(&mut self, dev: u32) -> ApiResult<()> {
        self.call("resume_device", Request::ResumeDevice { dev })
            .and_then(expect_ok("resume_device"))
    }

    /// Steps one warp. Returns the mask of warps the hardware actually
    /// stepped, which can be a superset of the requested one.
    pub fn single_step_warp(&mut self, dev: u32, sm: u32, wp: u32, nsteps: u32) -> ApiResult<u64> {
        match self.call("single_step_warp", Request::SingleStepWarp { dev, sm, wp, nsteps })? {
            Response::SteppedWarpMask(m) => Ok(m),
            _ => Err(ApiError::UnexpectedResponse { op: "single_step_warp" }),
        }
    }

    pub fn resume_warps_until_pc(
        &mut self,
        dev: u32,
        sm: u32,
        warp_mask: u64,
        pc: u64,
    ) -> ApiResult<()> {
        let req = Request::ResumeWarpsUntilPc { dev, sm, warp_mask, pc };
        self.call("resume_warps_until_pc", req).and_then(expect_ok("resume_warps_until_pc"))
    }

    pub fn disassemble(&mut self, dev: u32, addr: u64) -> ApiResult<String> {
        match self.call("disassemble", Request::Disassemble { dev, addr })? {
            Response::Instruction(text) => Ok(text),
            _ => Err(ApiError::UnexpectedResponse { op: "disassemble" }),
        }
    }

    pub fn next_sync_event(&mut self) -> ApiResult<Option<DeviceEvent>> {
        match self.call("next_sync_event", Request::NextSyncEvent)? {
            Response::Event(e) => Ok(e),
            _ => Err(ApiError::UnexpectedResponse { op: "next_sync_event" }),
        }
    }

    pub fn ack_sync_events(&mut self) -> ApiResult<()> {
        self.call("ack_sync_events", Request::AckSyncEvents).and_then(expect_ok("ack_sync_events"))
    }

    pub fn next_async_event(&mut self) -> ApiResult<Option<DeviceEvent>> {
        match self.call("next_async_event", Request::NextAsyncEvent)? {
            Response::Event(e) => Ok(e),
            _ => Err(ApiError::UnexpectedResponse { op: "next_async_event" }),
        }
    }

    pub fn grid_status(&mut self, dev: u32, grid_id: u64) -> ApiResult<GridStatus> {
        match self.call("query_grid_status", Request::QueryGridStatus { dev, grid_id })? {
            Response::GridStatus(s) => Ok(s),
            _ => Err(ApiError::UnexpectedResponse { op: "query_grid_status" }),
        }
    }

    pub fn grid_info(&mut self, dev: u32, grid_id: u64) -> ApiResult<GridInfo> {
        match self.call("query_grid_info", Request::QueryGridInfo { dev, grid_id })? {
            Response::GridInfo(info) => Ok(info),
            _ => Err(ApiError::UnexpectedResponse { op: "query_grid_info" }),
        }
    }

    pub fn notification_pending(&mut self) -> ApiResult<bool> {
        match self.call("notification_pending", Request::NotificationPending)? {
            Response::Bool(b) => Ok(b),
            _ => Err(ApiError::UnexpectedResponse { op: "notification_pending" }),
        }
    }

    pub fn check_pending_sigint(&mut self) -> ApiResult<bool> {
        match self.call("check_pending_sigint", Request::CheckPendingSigint)? {
            Response::Bool(b) => Ok(b),
            _ => Err(ApiError::UnexpectedResponse { op: "check_pending_sigint" }),
        }
    }

    /// Batched refresh of every valid warp's grid id in one SM.
    pub fn update_grid_id_in_sm(&mut self, dev: u32, sm: u32) -> ApiResult<Vec<(u32, u64)>> {
        match self.call("update_grid_id_in_sm", Request::UpdateGridIdInSm { dev, sm })? {
            Response::GridIds(v) => Ok(v),
            _ => Err(ApiError::UnexpectedResponse { op: "update_grid_id_in_sm" }),
        }
    }

    /// Batched refresh of every valid warp's block index in one SM.
    pub fn update_block_idx_in_sm(&mut self, dev: u32, sm: u32) -> ApiResult<Vec<(u32, Dim3)>> {
        match self.call("update_block_idx_in_sm", Request::UpdateBlockIdxInSm { dev, sm })? {
            Response::BlockIdxs(v) => Ok(v),
            _ => Err(ApiError::UnexpectedResponse { op: "update_block_idx_in_sm" }),
        }
    }

    /// Batched refresh of every valid lane's thread index in one warp.
    pub fn update_thread_idx_in_warp(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
    ) -> ApiResult<Vec<(u32, Dim3)>> {
        let req = Request::UpdateThreadIdxInWarp { dev, sm, wp };
        match self.call("update_thread_idx_in_warp", req)? {
            Response::ThreadIdxs(v) => Ok(v),
            _ => Err(ApiError::UnexpectedResponse { op: "update_thread_idx_in_warp" }),
        }
    }
}

fn expect_ok(op: &'static str) -> impl Fn(Response) -> ApiResult<()> {
    move |resp| match resp {
        Response::Ok => Ok(()),
        _ => Err(ApiError::UnexpectedResponse { op }),
    }
}
