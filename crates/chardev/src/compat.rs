//! Scratch arena for 32-bit-compatibility ioctl arguments
//!
//! Compatibility ioctls repack their argument structures through a fixed
//! per-thread arena: bump-allocated for the duration of one call and
//! released in bulk when the call returns. A request that exceeds the
//! remaining budget fails; the arena never grows.

use common::Errno;
use std::cell::RefCell;
use std::marker::PhantomData;

/// Fixed per-thread scratch budget, in bytes.
pub const COMPAT_ARENA_SIZE: usize = 4096;

struct ArenaState {
    buf: Vec<u8>,
    used: usize,
    depth: u32,
}

thread_local! {
    static ARENA: RefCell<ArenaState> = RefCell::new(ArenaState {
        buf: vec![0u8; COMPAT_ARENA_SIZE],
        used: 0,
        depth: 0,
    });
}

/// A chunk handed out by the arena, valid for the enclosing call.
#[derive(Debug, Clone, Copy)]
pub struct CompatChunk {
    offset: usize,
    len: usize,
}

impl CompatChunk {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Guard scoping one compatibility ioctl call.
///
/// Nested guards share the arena; the budget is released in bulk when
/// the outermost guard drops. Not `Send`: chunks are only meaningful on
/// the thread that allocated them.
pub struct CompatCall {
    _thread_bound: PhantomData<*const ()>,
}

impl CompatCall {
    pub fn begin() -> Self {
        ARENA.with(|arena| arena.borrow_mut().depth += 1);
        Self {
            _thread_bound: PhantomData,
        }
    }

    /// Bump-allocate `len` zeroed bytes.
    pub fn alloc(&self, len: usize) -> Result<CompatChunk, Errno> {
        ARENA.with(|arena| {
            let mut state = arena.borrow_mut();
            if len > COMPAT_ARENA_SIZE - state.used {
                return Err(Errno::NoMem);
            }
            let offset = state.used;
            state.used += len;
            state.buf[offset..offset + len].fill(0);
            Ok(CompatChunk { offset, len })
        })
    }

    /// Allocate and fill a chunk with `data`.
    pub fn copy_in(&self, data: &[u8]) -> Result<CompatChunk, Errno> {
        let chunk = self.alloc(data.len())?;
        ARENA.with(|arena| {
            let mut state = arena.borrow_mut();
            state.buf[chunk.offset..chunk.offset + chunk.len].copy_from_slice(data);
        });
        Ok(chunk)
    }

    /// Copy a chunk's current contents out.
    pub fn copy_out(&self, chunk: CompatChunk, out: &mut [u8]) {
        ARENA.with(|arena| {
            let state = arena.borrow();
            let n = out.len().min(chunk.len);
            out[..n].copy_from_slice(&state.buf[chunk.offset..chunk.offset + n]);
        });
    }

    /// Run `f` over the chunk's bytes in place.
    pub fn with_mut<R>(&self, chunk: CompatChunk, f: impl FnOnce(&mut [u8]) -> R) -> R {
        ARENA.with(|arena| {
            let mut state = arena.borrow_mut();
            f(&mut state.buf[chunk.offset..chunk.offset + chunk.len])
        })
    }

    /// Bytes still available in this thread's arena.
    pub fn remaining(&self) -> usize {
        ARENA.with(|arena| COMPAT_ARENA_SIZE - arena.borrow().used)
    }
}

impl Drop for CompatCall {
    fn drop(&mut self) {
        ARENA.with(|arena| {
            let mut state = arena.borrow_mut();
            state.depth -= 1;
            if state.depth == 0 {
                state.used = 0;
            }
        });
    }
}
