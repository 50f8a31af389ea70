//! Open-file handles and memory-mapping bookkeeping
//!
//! An [`OpenHandle`] lives between open and close. It carries a synthetic
//! inode identity and a bounded table of [`VMA_SLOTS`] mapping slots; a
//! repeated mapping of the same `(length, page_offset)` returns the
//! already-bound buffer without consulting the device again, and close
//! releases every bound slot before the device's release callback runs.

use crate::devnum::DeviceNode;
use crate::registry::{Cdev, DeviceRegistry, IoFlags, IoctlArg, OpenFlags, PollMask};
use common::Errno;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Mapping slots per open file.
pub const VMA_SLOTS: usize = 16;

/// A backing buffer for one memory mapping.
///
/// Identity (pointer equality of the `Arc`) is what the idempotent-remap
/// contract is expressed in.
pub struct MapBuffer {
    data: Mutex<Vec<u8>>,
}

impl MapBuffer {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; len]),
        })
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn copy_to(&self, out: &mut [u8], offset: usize) {
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return;
        }
        let end = (offset + out.len()).min(data.len());
        let n = end - offset;
        out[..n].copy_from_slice(&data[offset..end]);
    }

    pub fn copy_from(&self, src: &[u8], offset: usize) {
        let mut data = self.data.lock().unwrap();
        if offset >= data.len() {
            return;
        }
        let end = (offset + src.len()).min(data.len());
        let n = end - offset;
        data[offset..end].copy_from_slice(&src[..n]);
    }
}

pub type VmaCloseHook = Box<dyn FnOnce(&OpenHandle) + Send>;

/// What a device's mmap callback hands back.
pub struct MmapReply {
    pub buffer: Arc<MapBuffer>,
    pub close_hook: Option<VmaCloseHook>,
}

struct VmaBinding {
    length: usize,
    page_offset: u64,
    buffer: Arc<MapBuffer>,
    close_hook: Option<VmaCloseHook>,
}

/// Per-open-file state, created on open and destroyed on close.
pub struct OpenHandle {
    cdev: Arc<Cdev>,
    node: DeviceNode,
    nr: u32,
    inode: u64,
    flags: OpenFlags,
    vma: Mutex<Vec<Option<VmaBinding>>>,
}

impl OpenHandle {
    pub fn cdev(&self) -> &Arc<Cdev> {
        &self.cdev
    }

    pub fn node(&self) -> DeviceNode {
        self.node
    }

    pub fn device_number(&self) -> u32 {
        self.nr
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Number of currently bound mapping slots.
    pub fn bound_mappings(&self) -> usize {
        self.vma.lock().unwrap().iter().flatten().count()
    }
}

impl DeviceRegistry {
    /// Open the device registered at `nr`.
    ///
    /// If the device declares an open callback and it fails, the freshly
    /// allocated handle is discarded and the open fails with that status.
    pub fn open(&self, nr: u32, flags: OpenFlags) -> Result<Arc<OpenHandle>, Errno> {
        let cdev = self.lookup(nr).ok_or(Errno::NoDev)?;
        let node = crate::devnum::decode(nr, &self.settings).ok_or(Errno::NoDev)?;

        let handle = Arc::new(OpenHandle {
            cdev,
            node,
            nr,
            inode: self.next_inode.fetch_add(1, Ordering::Relaxed),
            flags,
            vma: Mutex::new((0..VMA_SLOTS).map(|_| None).collect()),
        });

        self.lock.lock();
        let opened = handle.cdev.ops().open(&handle);
        self.lock.unlock();

        match opened {
            Ok(()) => {
                trace!("opened {:#x} as inode {}", nr, handle.inode);
                Ok(handle)
            }
            Err(errno) => {
                debug!("open callback for {:#x} failed: {}", nr, errno);
                Err(errno)
            }
        }
    }

    /// Close an open handle.
    ///
    /// Every bound mapping slot is released (its close hook invoked)
    /// before the device's release callback runs, and regardless of that
    /// callback's outcome the handle is gone afterwards.
    pub fn close(&self, handle: &Arc<OpenHandle>) -> Result<(), Errno> {
        self.lock.lock();

        let bindings: Vec<VmaBinding> = {
            let mut vma = handle.vma.lock().unwrap();
            vma.iter_mut().filter_map(Option::take).collect()
        };
        for mut binding in bindings {
            if let Some(hook) = binding.close_hook.take() {
                hook(handle);
            }
        }

        let released = handle.cdev.ops().release(handle);
        self.lock.unlock();

        trace!("closed inode {}", handle.inode);
        released
    }

    /// Map `length` bytes at `page_offset` into the caller.
    ///
    /// An exact `(length, page_offset)` match on an already-bound slot
    /// returns the same buffer without invoking the device callback a
    /// second time. Otherwise the first empty slot is claimed; with all
    /// slots occupied the request fails.
    pub fn mmap(
        &self,
        handle: &OpenHandle,
        length: usize,
        page_offset: u64,
    ) -> Result<Arc<MapBuffer>, Errno> {
        if length == 0 {
            return Err(Errno::Inval);
        }

        self.lock.lock();
        let result = self.mmap_locked(handle, length, page_offset);
        self.lock.unlock();
        result
    }

    fn mmap_locked(
        &self,
        handle: &OpenHandle,
        length: usize,
        page_offset: u64,
    ) -> Result<Arc<MapBuffer>, Errno> {
        let slot = {
            let vma = handle.vma.lock().unwrap();
            if let Some(binding) = vma
                .iter()
                .flatten()
                .find(|b| b.length == length && b.page_offset == page_offset)
            {
                trace!("idempotent remap of {} bytes at page {}", length, page_offset);
                return Ok(binding.buffer.clone());
            }
            match vma.iter().position(Option::is_none) {
                Some(slot) => slot,
                None => {
                    debug!("mapping table full on inode {}", handle.inode);
                    return Err(Errno::NoMem);
                }
            }
        };

        let reply = handle.cdev.ops().mmap(handle, length, page_offset)?;
        let buffer = reply.buffer.clone();
        handle.vma.lock().unwrap()[slot] = Some(VmaBinding {
            length,
            page_offset,
            buffer: reply.buffer,
            close_hook: reply.close_hook,
        });
        Ok(buffer)
    }

    pub fn read(
        &self,
        handle: &OpenHandle,
        buf: &mut [u8],
        flags: IoFlags,
    ) -> Result<usize, Errno> {
        self.lock.lock();
        let result = handle.cdev.ops().read(handle, buf, flags);
        self.lock.unlock();
        result
    }

    pub fn write(&self, handle: &OpenHandle, buf: &[u8], flags: IoFlags) -> Result<usize, Errno> {
        self.lock.lock();
        let result = handle.cdev.ops().write(handle, buf, flags);
        self.lock.unlock();
        result
    }

    pub fn ioctl(
        &self,
        handle: &OpenHandle,
        code: u32,
        arg: IoctlArg<'_>,
    ) -> Result<i64, Errno> {
        self.lock.lock();
        let result = handle.cdev.ops().ioctl(handle, code, arg);
        self.lock.unlock();
        result
    }

    pub fn compat_ioctl(
        &self,
        handle: &OpenHandle,
        code: u32,
        arg: IoctlArg<'_>,
    ) -> Result<i64, Errno> {
        self.lock.lock();
        let result = handle.cdev.ops().compat_ioctl(handle, code, arg);
        self.lock.unlock();
        result
    }

    pub fn poll(&self, handle: &OpenHandle, mask: PollMask) -> PollMask {
        self.lock.lock();
        let ready = handle.cdev.ops().poll(handle, mask);
        self.lock.unlock();
        ready
    }
}
