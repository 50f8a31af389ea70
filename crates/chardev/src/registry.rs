//! Device registration and lookup
//!
//! A registered device (cdev) couples an operation table with the
//! contiguous device-number range it occupies. Each device class keeps a
//! fixed-capacity slot table; a slot holds at most one device.

use crate::devnum::{self, DeviceClass};
use crate::handle::{MmapReply, OpenHandle};
use common::{DispatchSettings, Errno};
use kcore::GiantLock;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

bitflags::bitflags! {
    /// Flags carried by an open file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ     = 0x1;
        const WRITE    = 0x2;
        /// Reads and writes must not block
        const NONBLOCK = 0x4;
        /// Opened by a 32-bit caller; ioctls route through the compat path
        const COMPAT   = 0x8;
    }
}

bitflags::bitflags! {
    /// Per-request I/O flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        const NONBLOCK = 0x1;
    }
}

bitflags::bitflags! {
    /// Poll readiness mask, legacy bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMask: u16 {
        const IN  = 0x001;
        const PRI = 0x002;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
    }
}

/// Ioctl argument as seen by the device.
///
/// The by-value variant covers the legacy convention of passing a small
/// integer directly in the argument word instead of a user buffer.
pub enum IoctlArg<'a> {
    None,
    Value(u64),
    Buffer(&'a mut [u8]),
}

/// Operation table a device class driver registers.
///
/// Every method has a default so drivers implement only what their
/// device supports, mirroring an optional-function-pointer table.
pub trait CdevOps: Send + Sync {
    fn open(&self, _handle: &OpenHandle) -> Result<(), Errno> {
        Ok(())
    }

    fn release(&self, _handle: &OpenHandle) -> Result<(), Errno> {
        Ok(())
    }

    fn read(&self, _handle: &OpenHandle, _buf: &mut [u8], _flags: IoFlags) -> Result<usize, Errno> {
        Err(Errno::NoSys)
    }

    fn write(&self, _handle: &OpenHandle, _buf: &[u8], _flags: IoFlags) -> Result<usize, Errno> {
        Err(Errno::NoSys)
    }

    fn ioctl(&self, _handle: &OpenHandle, _code: u32, _arg: IoctlArg<'_>) -> Result<i64, Errno> {
        Err(Errno::NoSys)
    }

    /// 32-bit-compatibility ioctl; defaults to the native handler.
    fn compat_ioctl(
        &self,
        handle: &OpenHandle,
        code: u32,
        arg: IoctlArg<'_>,
    ) -> Result<i64, Errno> {
        self.ioctl(handle, code, arg)
    }

    fn mmap(
        &self,
        _handle: &OpenHandle,
        _length: usize,
        _page_offset: u64,
    ) -> Result<MmapReply, Errno> {
        Err(Errno::NoSys)
    }

    fn poll(&self, _handle: &OpenHandle, _mask: PollMask) -> PollMask {
        PollMask::IN | PollMask::OUT
    }
}

/// A registered device: operation table plus the number range it occupies.
pub struct Cdev {
    pub name: String,
    pub first: u32,
    pub count: u32,
    ops: Arc<dyn CdevOps>,
}

impl Cdev {
    pub fn ops(&self) -> &dyn CdevOps {
        self.ops.as_ref()
    }
}

/// The per-class subdevice tables and dispatch entry points.
pub struct DeviceRegistry {
    pub(crate) lock: Arc<GiantLock>,
    pub(crate) settings: DispatchSettings,
    tables: Mutex<Vec<Vec<Option<Arc<Cdev>>>>>,
    pub(crate) next_inode: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(lock: Arc<GiantLock>, settings: DispatchSettings) -> Self {
        let tables = DeviceClass::ALL
            .iter()
            .map(|class| vec![None; class.capacity()])
            .collect();
        Self {
            lock,
            settings,
            tables: Mutex::new(tables),
            next_inode: AtomicU64::new(1),
        }
    }

    pub fn giant(&self) -> &Arc<GiantLock> {
        &self.lock
    }

    /// Register `ops` over the contiguous number range `[first, first+count)`.
    ///
    /// Numbers in the range that do not decode are skipped with a warning
    /// (partially configured classes are tolerated); any decodable slot
    /// already occupied fails the whole registration with `Busy`.
    pub fn register(
        &self,
        ops: Arc<dyn CdevOps>,
        name: &str,
        first: u32,
        count: u32,
    ) -> Result<Arc<Cdev>, Errno> {
        if count == 0 {
            return Err(Errno::Inval);
        }
        let cdev = Arc::new(Cdev {
            name: name.to_string(),
            first,
            count,
            ops,
        });

        self.lock.lock();
        let mut tables = self.tables.lock().unwrap();

        // All-or-nothing: check every slot before touching any
        for nr in first..first + count {
            if let Some(node) = devnum::decode(nr, &self.settings)
                && tables[node.class.index()][node.instance].is_some()
            {
                drop(tables);
                self.lock.unlock();
                warn!("device number {:#x} already registered", nr);
                return Err(Errno::Busy);
            }
        }

        for nr in first..first + count {
            match devnum::decode(nr, &self.settings) {
                Some(node) => {
                    tables[node.class.index()][node.instance] = Some(cdev.clone());
                }
                None => warn!("skipping undecodable device number {:#x} in range", nr),
            }
        }
        drop(tables);
        self.lock.unlock();

        debug!(
            "registered {} over numbers {:#x}..{:#x}",
            cdev.name,
            first,
            first + count
        );
        Ok(cdev)
    }

    /// Clear the slots of the range `[first, first+count)`.
    pub fn unregister(&self, first: u32, count: u32) {
        self.lock.lock();
        let mut tables = self.tables.lock().unwrap();
        for nr in first..first + count {
            if let Some(node) = devnum::decode(nr, &self.settings) {
                tables[node.class.index()][node.instance] = None;
            }
        }
        drop(tables);
        self.lock.unlock();
        debug!("unregistered numbers {:#x}..{:#x}", first, first + count);
    }

    /// Look up the device registered at `nr`.
    ///
    /// "Not registered" is a normal outcome, never an error.
    pub fn lookup(&self, nr: u32) -> Option<Arc<Cdev>> {
        let node = devnum::decode(nr, &self.settings)?;
        let tables = self.tables.lock().unwrap();
        tables[node.class.index()][node.instance].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnum::{VIDEO_MAJOR, makedev};

    struct NullDev;
    impl CdevOps for NullDev {}

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(GiantLock::new()), DispatchSettings::default())
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = registry();
        let first = makedev(VIDEO_MAJOR, 8);

        registry
            .register(Arc::new(NullDev), "cam0", first, 4)
            .unwrap();
        for nr in first..first + 4 {
            assert!(registry.lookup(nr).is_some());
        }
        assert!(registry.lookup(first + 4).is_none());
        assert!(registry.lookup(makedev(VIDEO_MAJOR, 7)).is_none());

        registry.unregister(first, 4);
        for nr in first..first + 4 {
            assert!(registry.lookup(nr).is_none());
        }
    }

    #[test]
    fn test_double_register_is_busy() {
        let registry = registry();
        let first = makedev(VIDEO_MAJOR, 0);
        registry
            .register(Arc::new(NullDev), "cam0", first, 2)
            .unwrap();
        let clash = registry.register(Arc::new(NullDev), "cam1", first + 1, 2);
        assert_eq!(clash.err(), Some(Errno::Busy));
        // The failed registration must not have claimed anything
        assert!(registry.lookup(first + 2).is_none());
    }

    #[test]
    fn test_empty_range_rejected() {
        let registry = registry();
        let err = registry
            .register(Arc::new(NullDev), "none", makedev(VIDEO_MAJOR, 0), 0)
            .err();
        assert_eq!(err, Some(Errno::Inval));
    }

    #[test]
    fn test_lookup_unknown_major_is_none() {
        let registry = registry();
        assert!(registry.lookup(makedev(200, 0)).is_none());
    }
}
