// Packet Framing - byte-stream client and agent shim for the debug API
// Requests travel as "vDbg;" + one binary-escaped payload; replies start
// with "OK;" (final), "MP;" (multi-part, more to come) or "E##" (error).
// A multi-part reply is pulled with "vDbgRetr;<bytes-received-so-far>"
// continuations until the final "OK;" part arrives.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use super::{DebugTransport, Request, Response, TransportError};

pub const REQUEST_PREFIX: &[u8] = b"vDbg;";
pub const RETR_PREFIX: &[u8] = b"vDbgRetr;";
pub const REPLY_OK: &[u8] = b"OK;";
pub const REPLY_MULTIPART: &[u8] = b"MP;";

const ESCAPE: u8 = b'}';
const ESCAPE_XOR: u8 = 0x20;

/// Error codes carried in "E##" replies.
pub const ERR_BACKEND: u8 = 1;
pub const ERR_MALFORMED: u8 = 2;
pub const ERR_OVERFLOW: u8 = 3;

fn needs_escape(b: u8) -> bool {
    matches!(b, b'#' | b'$' | b'}' | b'*' | b';')
}

/// Appends `data` to `out` in escaped form. Fails hard when the escaped form
/// would push `out` past `max` bytes; nothing is ever truncated.
pub fn append_escaped(out: &mut BytesMut, data: &[u8], max: usize) -> Result<(), TransportError> {
    for &b in data {
        let need = if needs_escape(b) { 2 } else { 1 };
        if out.len() + need > max {
            return Err(TransportError::BufferOverflow { size: out.len() + need, max });
        }
        if needs_escape(b) {
            out.put_u8(ESCAPE);
            out.put_u8(b ^ ESCAPE_XOR);
        } else {
            out.put_u8(b);
        }
    }
    Ok(())
}

/// Decodes an escaped payload back to raw bytes.
pub fn unescape(input: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b == ESCAPE {
            let next = *input
                .get(i + 1)
                .ok_or_else(|| TransportError::Malformed("dangling escape byte".into()))?;
            out.push(next ^ ESCAPE_XOR);
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    Ok(out)
}

/// Escapes raw bytes starting at `from`, stopping before `out` exceeds
/// `max`. Returns how many raw bytes were consumed.
fn escape_chunk(raw: &[u8], from: usize, out: &mut BytesMut, max: usize) -> usize {
    let mut consumed = 0;
    for &b in &raw[from..] {
        let need = if needs_escape(b) { 2 } else { 1 };
        if out.len() + need > max {
            break;
        }
        if needs_escape(b) {
            out.put_u8(ESCAPE);
            out.put_u8(b ^ ESCAPE_XOR);
        } else {
            out.put_u8(b);
        }
        consumed += 1;
    }
    consumed
}

/// One packet in, one packet out. Implemented by the socket channel and by
/// the in-memory loopback used in tests.
pub trait Channel {
    fn send(&mut self, pkt: &[u8]) -> Result<(), TransportError>;
    fn recv(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Client side of the packet protocol. Encodes each request, sends it over
/// the channel, and reassembles multi-part replies.
pub struct PacketTransport<C: Channel> {
    chan: C,
    max_packet: usize,
}

impl<C: Channel> PacketTransport<C> {
    pub fn new(chan: C, max_packet: usize) -> Self {
        Self { chan, max_packet }
    }

    fn encode_request(&self, req: &Request) -> Result<BytesMut, TransportError> {
        let payload = serde_json::to_vec(req)
            .map_err(|e| TransportError::Malformed(format!("request encode: {e}")))?;
        let mut pkt = BytesMut::with_capacity(payload.len() + REQUEST_PREFIX.len());
        pkt.extend_from_slice(REQUEST_PREFIX);
        append_escaped(&mut pkt, &payload, self.max_packet)?;
        Ok(pkt)
    }
}

impl<C: Channel> DebugTransport for PacketTransport<C> {
    fn call(&mut self, req: Request) -> Result<Response, TransportError> {
        let pkt = self.encode_request(&req)?;
        self.chan.send(&pkt)?;

        let mut payload: Vec<u8> = Vec::new();
        loop {
            let reply = self.chan.recv()?;
            if let Some(rest) = reply.strip_prefix(REPLY_OK) {
                payload.extend(unescape(rest)?);
                break;
            } else if let Some(rest) = reply.strip_prefix(REPLY_MULTIPART) {
                payload.extend(unescape(rest)?);
                trace!("multi-part reply, {} bytes so far", payload.len());
                let retr = format!("vDbgRetr;{}", payload.len());
                self.chan.send(retr.as_bytes())?;
            } else if reply.first() == Some(&b'E') && reply.len() >= 3 {
                let code = std::str::from_utf8(&reply[1..3])
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or_else(|| TransportError::Malformed("bad error reply".into()))?;
                return Err(TransportError::Remote { code });
            } else {
                return Err(TransportError::Malformed(format!(
                    "unrecognized reply prefix: {:?}",
                    &reply[..reply.len().min(8)]
                )));
            }
        }
        serde_json::from_slice(&payload)
            .map_err(|e| TransportError::Malformed(format!("response decode: {e}")))
    }
}

/// Agent-side shim: decodes request packets, dispatches them to an inner
/// backend, and splits oversized replies into multi-part packets.
pub struct PacketServer {
    inner: Box<dyn DebugTransport>,
    max_packet: usize,
    pending: Option<PendingReply>,
}

struct PendingReply {
    raw: Vec<u8>,
    pos: usize,
}

impl PacketServer {
    pub fn new(inner: Box<dyn DebugTransport>, max_packet: usize) -> Self {
        assert!(max_packet > REPLY_MULTIPART.len() + 2);
        Self { inner, max_packet, pending: None }
    }

    /// Handles one inbound packet and produces exactly one reply packet.
    pub fn handle(&mut self, pkt: &[u8]) -> Vec<u8> {
        match self.dispatch(pkt) {
            Ok(reply) => reply,
            Err(e) => {
                let code = match e {
                    TransportError::BufferOverflow { .. } => ERR_OVERFLOW,
                    TransportError::Malformed(_) => ERR_MALFORMED,
                    TransportError::Remote { code } => code,
                    _ => ERR_BACKEND,
                };
                format!("E{:02x}", code).into_bytes()
            }
        }
    }

    fn dispatch(&mut self, pkt: &[u8]) -> Result<Vec<u8>, TransportError> {
        if let Some(rest) = pkt.strip_prefix(RETR_PREFIX) {
            let claimed: usize = std::str::from_utf8(rest)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| TransportError::Malformed("bad retrieval offset".into()))?;
            let pending = self
                .pending
                .as_ref()
                .ok_or_else(|| TransportError::Malformed("retrieval without pending reply".into()))?;
            if claimed != pending.pos {
                return Err(TransportError::Malformed(format!(
                    "retrieval offset {} does not match sent {}",
                    claimed, pending.pos
                )));
            }
            return Ok(self.next_part());
        }

        let rest = pkt
            .strip_prefix(REQUEST_PREFIX)
            .ok_or_else(|| TransportError::Malformed("missing request prefix".into()))?;
        let payload = unescape(rest)?;
        let req: Request = serde_json::from_slice(&payload)
            .map_err(|e| TransportError::Malformed(format!("request decode: {e}")))?;
        let resp = self.inner.call(req)?;
        let raw = serde_json::to_vec(&resp)
            .map_err(|e| TransportError::Malformed(format!("response encode: {e}")))?;
        self.pending = Some(PendingReply { raw, pos: 0 });
        Ok(self.next_part())
    }

    fn next_part(&mut self) -> Vec<u8> {
        let pending = match self.pending.as_mut() {
            Some(p) => p,
            None => return REPLY_OK.to_vec(),
        };
        let mut body = BytesMut::with_capacity(self.max_packet);
        // Reserve the worst case: the prefix plus one escaped byte.
        let budget = self.max_packet - REPLY_OK.len();
        let consumed = escape_chunk(&pending.raw, pending.pos, &mut body, budget);
        pending.pos += consumed;
        let done = pending.pos >= pending.raw.len();
        let mut out = Vec::with_capacity(body.len() + REPLY_OK.len());
        if done {
            out.extend_from_slice(REPLY_OK);
            self.pending = None;
        } else {
            out.extend_from_slice(REPLY_MULTIPART);
        }
        out.extend_from_slice(&body);
        out
    }
}

/// In-memory channel: the server runs synchronously inside `send`, replies
/// are queued for `recv`. Used by unit and integration tests.
pub struct LoopbackChannel {
    server: PacketServer,
    replies: std::collections::VecDeque<Vec<u8>>,
}

impl LoopbackChannel {
    pub fn new(server: PacketServer) -> Self {
        Self { server, replies: std::collections::VecDeque::new() }
    }
}

impl Channel for LoopbackChannel {
    fn send(&mut self, pkt: &[u8]) -> Result<(), TransportError> {
        let reply = self.server.handle(pkt);
        self.replies.push_back(reply);
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.replies
            .pop_front()
            .ok_or_else(|| TransportError::Malformed("no reply queued".into()))
    }
}
