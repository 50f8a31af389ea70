//! The device-exposure bridge
//!
//! Requests arriving from the host's userspace character-device facility
//! are enqueued onto a bounded channel and drained by a small pool of
//! request-servicing threads. Each request carries a single-slot reply
//! channel. This is the one place internal [`Errno`] statuses are
//! narrowed into the closed [`BridgeError`] boundary set.

use crate::compat::CompatCall;
use crate::handle::{MapBuffer, OpenHandle};
use crate::registry::{DeviceRegistry, IoFlags, IoctlArg, OpenFlags, PollMask};
use common::{BridgeError, Errno};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, trace};

/// Request-servicing threads in the pool.
const BRIDGE_WORKERS: usize = 4;

/// Bound of the request channel.
const REQUEST_QUEUE_DEPTH: usize = 64;

/// Ioctl argument as it crosses the host boundary.
#[derive(Debug, Clone)]
pub enum IoctlPayload {
    None,
    /// Legacy convention: a small integer passed by value
    Value(u64),
    /// An argument structure passed through a user buffer
    Buffer(Vec<u8>),
}

/// Result of an ioctl, with the (possibly updated) argument buffer.
#[derive(Debug, Clone)]
pub struct IoctlReply {
    pub result: i64,
    pub buffer: Option<Vec<u8>>,
}

type Reply<T> = async_channel::Sender<T>;

enum BridgeRequest {
    Open {
        nr: u32,
        flags: OpenFlags,
        reply: Reply<Result<u64, BridgeError>>,
    },
    Close {
        id: u64,
        reply: Reply<Result<(), BridgeError>>,
    },
    Read {
        id: u64,
        len: usize,
        flags: IoFlags,
        reply: Reply<Result<Vec<u8>, BridgeError>>,
    },
    Write {
        id: u64,
        data: Vec<u8>,
        flags: IoFlags,
        reply: Reply<Result<usize, BridgeError>>,
    },
    Ioctl {
        id: u64,
        code: u32,
        payload: IoctlPayload,
        reply: Reply<Result<IoctlReply, BridgeError>>,
    },
    Poll {
        id: u64,
        mask: PollMask,
        reply: Reply<PollMask>,
    },
    Mmap {
        id: u64,
        length: usize,
        page_offset: u64,
        reply: Reply<Result<Arc<MapBuffer>, BridgeError>>,
    },
}

/// The exposure bridge front object.
///
/// The synchronous methods enqueue a request and block on its reply;
/// they are what a host character-device frontend calls from its own
/// event loop.
pub struct Bridge {
    registry: Arc<DeviceRegistry>,
    tx: async_channel::Sender<BridgeRequest>,
    workers: Vec<JoinHandle<()>>,
    handles: Arc<Mutex<HashMap<u64, Arc<OpenHandle>>>>,
}

impl Bridge {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let (tx, rx) = async_channel::bounded(REQUEST_QUEUE_DEPTH);
        let handles: Arc<Mutex<HashMap<u64, Arc<OpenHandle>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let next_id = Arc::new(AtomicU64::new(1));
        let mut workers = Vec::with_capacity(BRIDGE_WORKERS);
        for n in 0..BRIDGE_WORKERS {
            let rx: async_channel::Receiver<BridgeRequest> = rx.clone();
            let registry = registry.clone();
            let handles = handles.clone();
            let next_id = next_id.clone();
            let worker = std::thread::Builder::new()
                .name(format!("bridge-{}", n))
                .spawn(move || {
                    while let Ok(request) = rx.recv_blocking() {
                        serve(&registry, &handles, &next_id, request);
                    }
                    trace!("bridge worker {} stopped", n);
                })
                .expect("spawn bridge worker");
            workers.push(worker);
        }

        info!("exposure bridge started with {} workers", BRIDGE_WORKERS);
        Self {
            registry,
            tx,
            workers,
            handles,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn roundtrip<T>(&self, build: impl FnOnce(Reply<T>) -> BridgeRequest) -> Result<T, BridgeError> {
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        self.tx
            .send_blocking(build(reply_tx))
            .map_err(|_| BridgeError::Other)?;
        reply_rx.recv_blocking().map_err(|_| BridgeError::Other)
    }

    pub fn open(&self, nr: u32, flags: OpenFlags) -> Result<u64, BridgeError> {
        self.roundtrip(|reply| BridgeRequest::Open { nr, flags, reply })?
    }

    pub fn close(&self, id: u64) -> Result<(), BridgeError> {
        self.roundtrip(|reply| BridgeRequest::Close { id, reply })?
    }

    pub fn read(&self, id: u64, len: usize, flags: IoFlags) -> Result<Vec<u8>, BridgeError> {
        self.roundtrip(|reply| BridgeRequest::Read {
            id,
            len,
            flags,
            reply,
        })?
    }

    pub fn write(&self, id: u64, data: Vec<u8>, flags: IoFlags) -> Result<usize, BridgeError> {
        self.roundtrip(|reply| BridgeRequest::Write {
            id,
            data,
            flags,
            reply,
        })?
    }

    pub fn ioctl(
        &self,
        id: u64,
        code: u32,
        payload: IoctlPayload,
    ) -> Result<IoctlReply, BridgeError> {
        self.roundtrip(|reply| BridgeRequest::Ioctl {
            id,
            code,
            payload,
            reply,
        })?
    }

    /// Poll never fails; an unknown handle reports error readiness.
    pub fn poll(&self, id: u64, mask: PollMask) -> PollMask {
        self.roundtrip(|reply| BridgeRequest::Poll { id, mask, reply })
            .unwrap_or(PollMask::ERR)
    }

    pub fn mmap(
        &self,
        id: u64,
        length: usize,
        page_offset: u64,
    ) -> Result<Arc<MapBuffer>, BridgeError> {
        self.roundtrip(|reply| BridgeRequest::Mmap {
            id,
            length,
            page_offset,
            reply,
        })?
    }

    /// Open handles currently tracked by the bridge.
    pub fn open_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.tx.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn serve(
    registry: &Arc<DeviceRegistry>,
    handles: &Arc<Mutex<HashMap<u64, Arc<OpenHandle>>>>,
    next_id: &Arc<AtomicU64>,
    request: BridgeRequest,
) {
    match request {
        BridgeRequest::Open { nr, flags, reply } => {
            let result = registry
                .open(nr, flags)
                .map(|handle| {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    handles.lock().unwrap().insert(id, handle);
                    id
                })
                .map_err(narrow);
            let _ = reply.send_blocking(result);
        }

        BridgeRequest::Close { id, reply } => {
            let removed = handles.lock().unwrap().remove(&id);
            let result = match removed {
                Some(handle) => registry.close(&handle).map_err(narrow),
                None => Err(BridgeError::Invalid),
            };
            let _ = reply.send_blocking(result);
        }

        BridgeRequest::Read {
            id,
            len,
            flags,
            reply,
        } => {
            let result = with_handle(handles, id).and_then(|handle| {
                let mut buf = vec![0u8; len];
                let n = registry.read(&handle, &mut buf, flags).map_err(narrow)?;
                buf.truncate(n);
                Ok(buf)
            });
            let _ = reply.send_blocking(result);
        }

        BridgeRequest::Write {
            id,
            data,
            flags,
            reply,
        } => {
            let result = with_handle(handles, id)
                .and_then(|handle| registry.write(&handle, &data, flags).map_err(narrow));
            let _ = reply.send_blocking(result);
        }

        BridgeRequest::Ioctl {
            id,
            code,
            payload,
            reply,
        } => {
            let result =
                with_handle(handles, id).and_then(|handle| serve_ioctl(registry, &handle, code, payload));
            let _ = reply.send_blocking(result);
        }

        BridgeRequest::Poll { id, mask, reply } => {
            let ready = match with_handle(handles, id) {
                Ok(handle) => registry.poll(&handle, mask),
                Err(_) => PollMask::ERR,
            };
            let _ = reply.send_blocking(ready);
        }

        BridgeRequest::Mmap {
            id,
            length,
            page_offset,
            reply,
        } => {
            let result = with_handle(handles, id)
                .and_then(|handle| registry.mmap(&handle, length, page_offset).map_err(narrow));
            let _ = reply.send_blocking(result);
        }
    }
}

fn with_handle(
    handles: &Arc<Mutex<HashMap<u64, Arc<OpenHandle>>>>,
    id: u64,
) -> Result<Arc<OpenHandle>, BridgeError> {
    handles
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .ok_or(BridgeError::Invalid)
}

fn serve_ioctl(
    registry: &Arc<DeviceRegistry>,
    handle: &Arc<OpenHandle>,
    code: u32,
    payload: IoctlPayload,
) -> Result<IoctlReply, BridgeError> {
    let compat = handle.flags().contains(OpenFlags::COMPAT);
    match payload {
        IoctlPayload::None => {
            let result = dispatch_ioctl(registry, handle, code, IoctlArg::None, compat)?;
            Ok(IoctlReply {
                result,
                buffer: None,
            })
        }
        IoctlPayload::Value(value) => {
            let result = dispatch_ioctl(registry, handle, code, IoctlArg::Value(value), compat)?;
            Ok(IoctlReply {
                result,
                buffer: None,
            })
        }
        IoctlPayload::Buffer(mut data) => {
            if compat {
                // Stage the argument through the per-thread scratch arena
                let call = CompatCall::begin();
                let chunk = call.copy_in(&data).map_err(narrow)?;
                let result = call.with_mut(chunk, |bytes| {
                    registry.compat_ioctl(handle, code, IoctlArg::Buffer(bytes))
                });
                let result = result.map_err(narrow)?;
                call.copy_out(chunk, &mut data);
                Ok(IoctlReply {
                    result,
                    buffer: Some(data),
                })
            } else {
                let result = registry
                    .ioctl(handle, code, IoctlArg::Buffer(&mut data))
                    .map_err(narrow)?;
                Ok(IoctlReply {
                    result,
                    buffer: Some(data),
                })
            }
        }
    }
}

fn dispatch_ioctl(
    registry: &Arc<DeviceRegistry>,
    handle: &Arc<OpenHandle>,
    code: u32,
    arg: IoctlArg<'_>,
    compat: bool,
) -> Result<i64, BridgeError> {
    let result = if compat {
        registry.compat_ioctl(handle, code, arg)
    } else {
        registry.ioctl(handle, code, arg)
    };
    result.map_err(narrow)
}

/// Narrow an internal status into the boundary set.
fn narrow(errno: Errno) -> BridgeError {
    let narrowed = BridgeError::from(errno);
    if narrowed == BridgeError::Other {
        debug!("collapsing internal status {} to boundary 'other'", errno);
    }
    narrowed
}

/// Raw host errno for a boundary error, for frontends that speak errno.
#[cfg(target_os = "linux")]
pub fn host_errno(err: BridgeError) -> nix::errno::Errno {
    use nix::errno::Errno as Host;
    match err {
        BridgeError::Busy => Host::EBUSY,
        BridgeError::WouldBlock => Host::EAGAIN,
        BridgeError::Invalid => Host::EINVAL,
        BridgeError::NoMemory => Host::ENOMEM,
        BridgeError::Fault => Host::EFAULT,
        BridgeError::Interrupted => Host::EINTR,
        BridgeError::Other => Host::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_is_closed() {
        assert_eq!(narrow(Errno::Busy), BridgeError::Busy);
        assert_eq!(narrow(Errno::Again), BridgeError::WouldBlock);
        assert_eq!(narrow(Errno::NoSys), BridgeError::Other);
        assert_eq!(narrow(Errno::Pipe), BridgeError::Other);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_errno_mapping() {
        use nix::errno::Errno as Host;
        assert_eq!(host_errno(BridgeError::Busy), Host::EBUSY);
        assert_eq!(host_errno(BridgeError::WouldBlock), Host::EAGAIN);
        assert_eq!(host_errno(BridgeError::Other), Host::EIO);
    }
}
