// Session Channel - IPC endpoints between the debugger and the device agent
// A per-session temporary directory holds two Unix sockets: "control" for the
// synchronous request/response stream and "notify" for asynchronous callback
// notifications drained by a background listener thread.

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, trace, warn};

use super::packet::Channel;
use super::TransportError;
use crate::events::{Notification, NotificationQueue};

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_POLL: Duration = Duration::from_millis(100);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Temporary directory holding the session's IPC endpoints. Removed from the
/// filesystem when dropped at session teardown.
pub struct SessionDir {
    dir: TempDir,
}

impl SessionDir {
    pub fn new() -> Result<Self, TransportError> {
        let dir = tempfile::Builder::new().prefix("gpu-dbg-session.").tempdir()?;
        let mut perms = std::fs::metadata(dir.path())?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(dir.path(), perms)?;
        debug!("session directory created at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn control_socket(&self) -> PathBuf {
        self.dir.path().join("control")
    }

    pub fn notify_socket(&self) -> PathBuf {
        self.dir.path().join("notify")
    }
}

fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Length-framed packet channel over the control socket. Connecting retries
/// on a fixed interval to ride out the agent creating its endpoint late.
pub struct SocketChannel {
    stream: UnixStream,
}

impl SocketChannel {
    pub fn connect(path: &Path, max_attempts: u32) -> Result<Self, TransportError> {
        let mut attempt = 0;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    debug!("connected to agent at {}", path.display());
                    return Ok(Self { stream });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(TransportError::Io(e));
                    }
                    trace!("agent socket not ready ({}), retrying", e);
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
            }
        }
    }
}

impl Channel for SocketChannel {
    fn send(&mut self, pkt: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.stream, pkt)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(read_frame(&mut self.stream)?)
    }
}

/// Background thread accepting agent connections on the notify socket and
/// queueing decoded notifications for the main thread. Never touches cache
/// state; the main loop drains the queue at wait boundaries.
pub struct NotificationListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationListener {
    pub fn spawn(path: &Path, queue: NotificationQueue) -> Result<Self, TransportError> {
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("dbg-notify".into())
            .spawn(move || listener_loop(listener, queue, thread_stop))?;
        Ok(Self { stop, handle: Some(handle) })
    }

    /// Stops the thread and joins it. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn listener_loop(listener: UnixListener, queue: NotificationQueue, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, _)) => {
                if stream.set_nonblocking(false).is_err()
                    || stream.set_read_timeout(Some(READ_POLL)).is_err()
                {
                    continue;
                }
                drain_stream(&mut stream, &queue, &stop);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("notification accept failed: {}", e);
                break;
            }
        }
    }
}

fn drain_stream(stream: &mut UnixStream, queue: &NotificationQueue, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match read_frame(stream) {
            Ok(payload) => match serde_json::from_slice::<Notification>(&payload) {
                Ok(n) => {
                    trace!("notification received: {:?}", n);
                    queue.lock().push_back(n);
                }
                Err(e) => {
                    warn!("dropping undecodable notification: {}", e);
                }
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            // peer closed or hard error: back to accepting
            Err(_) => return,
        }
    }
}
