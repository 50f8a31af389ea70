//! Character-device registry, dispatch, and the host exposure bridge
//!
//! Hosted drivers register an operation table against a contiguous range
//! of legacy-style device numbers; the registry decodes incoming numbers
//! into `(class, instance)` and dispatches open/read/write/ioctl/mmap/
//! poll/release onto the registered table. The exposure bridge sits
//! between the host's userspace character-device facility and the
//! registry, narrowing internal status codes into the small boundary
//! error set.

pub mod bridge;
pub mod compat;
pub mod devnum;
pub mod handle;
pub mod registry;

pub use bridge::{Bridge, IoctlPayload, IoctlReply};
pub use compat::{COMPAT_ARENA_SIZE, CompatCall, CompatChunk};
pub use devnum::{DeviceClass, DeviceNode};
pub use handle::{MapBuffer, MmapReply, OpenHandle, VMA_SLOTS};
pub use registry::{Cdev, CdevOps, DeviceRegistry, IoFlags, IoctlArg, OpenFlags, PollMask};
