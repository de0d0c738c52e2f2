// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A raw, growable anonymous OS mapping. [`LinearMemory`](super::memory::LinearMemory)
//! is built directly on top of this; nothing above this module ever calls
//! into `rustix`/`libc` itself.

use std::io;
use std::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// An anonymous mapping that can grow in place via `mremap(MAYMOVE)`,
/// falling back to an explicit unmap-remap-copy where that primitive is
/// unavailable.
#[derive(Debug)]
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Reserve a fresh anonymous, read-write mapping of exactly `len` bytes.
    pub fn reserve(len: usize) -> io::Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unix::reserve(len)
            } else {
                fallback::reserve(len)
            }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Attempt to grow this mapping in place to `new_len` bytes, which must
    /// be `>= self.len()`. Returns `true` if the mapping's base address
    /// changed (every use-site must re-resolve its pointer), `false` if it
    /// grew in place.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other reference to the old base pointer
    /// outlives a `true` return.
    pub unsafe fn grow(&mut self, new_len: usize) -> io::Result<bool> {
        debug_assert!(new_len >= self.len);
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unix::grow(self, new_len)
            } else {
                fallback::grow(self, new_len)
            }
        }
    }

    /// Mark `[offset, offset+len)` (relative to the mapping base) as
    /// inaccessible. Used to install the guard page ahead of guest-visible
    /// memory.
    pub fn protect_none(&mut self, offset: usize, len: usize) -> io::Result<()> {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unix::protect_none(self, offset, len)
            } else {
                let _ = (offset, len);
                Ok(())
            }
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unix::unmap(self);
            } else {
                fallback::unmap(self);
            }
        }
    }
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::ptr::NonNull;

    use rustix::mm::{MapFlags, MprotectFlags, MremapFlags, ProtFlags, mmap_anonymous, mprotect, mremap};

    use super::Mmap;

    pub(super) fn reserve(len: usize) -> io::Result<Mmap> {
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len.max(1),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
            .map_err(io::Error::from)?
        };
        Ok(Mmap {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned a null pointer"),
            len,
        })
    }

    pub(super) fn grow(mmap: &mut Mmap, new_len: usize) -> io::Result<bool> {
        let new_ptr = unsafe {
            mremap(
                mmap.ptr.as_ptr().cast(),
                mmap.len.max(1),
                new_len.max(1),
                MremapFlags::MAYMOVE,
            )
            .map_err(io::Error::from)?
        };
        let moved = new_ptr != mmap.ptr.as_ptr().cast();
        mmap.ptr = NonNull::new(new_ptr.cast()).expect("mremap returned a null pointer");
        mmap.len = new_len;
        Ok(moved)
    }

    pub(super) fn protect_none(mmap: &mut Mmap, offset: usize, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        unsafe {
            mprotect(
                mmap.ptr.as_ptr().add(offset).cast(),
                len,
                MprotectFlags::empty(),
            )
            .map_err(io::Error::from)
        }
    }

    pub(super) fn unmap(mmap: &mut Mmap) {
        if mmap.len == 0 {
            return;
        }
        unsafe {
            let _ = rustix::mm::munmap(mmap.ptr.as_ptr().cast(), mmap.len.max(1));
        }
    }
}

/// Fallback backend for targets without `mremap`: a plain heap allocation,
/// grown by allocating a new buffer and copying the old bytes into it. This
/// always "moves" (there is no way to grow a `Vec`'s backing allocation in
/// place and report it), matching the spec's documented fallback contract.
#[cfg(not(unix))]
mod fallback {
    use std::alloc::{Layout, alloc, alloc_zeroed, dealloc};
    use std::io;
    use std::ptr::NonNull;

    use super::Mmap;

    fn layout_for(len: usize) -> Layout {
        Layout::from_size_align(len.max(1), 64 * 1024).expect("layout overflow")
    }

    pub(super) fn reserve(len: usize) -> io::Result<Mmap> {
        let layout = layout_for(len);
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Mmap { ptr, len })
    }

    pub(super) fn grow(mmap: &mut Mmap, new_len: usize) -> io::Result<bool> {
        let old_layout = layout_for(mmap.len);
        let new_layout = layout_for(new_len);
        let new_ptr = unsafe { alloc_zeroed(new_layout) };
        let new_ptr = NonNull::new(new_ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        unsafe {
            std::ptr::copy_nonoverlapping(mmap.ptr.as_ptr(), new_ptr.as_ptr(), mmap.len);
            dealloc(mmap.ptr.as_ptr(), old_layout);
        }
        mmap.ptr = new_ptr;
        mmap.len = new_len;
        Ok(true)
    }

    pub(super) fn unmap(mmap: &mut Mmap) {
        if mmap.len == 0 {
            return;
        }
        unsafe { dealloc(mmap.ptr.as_ptr(), layout_for(mmap.len)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_grow_preserves_contents() {
        let mut mmap = Mmap::reserve(4096).unwrap();
        unsafe {
            mmap.as_mut_ptr().write(0xAB);
        }
        unsafe {
            mmap.grow(8192).unwrap();
        }
        assert_eq!(mmap.len(), 8192);
        unsafe {
            assert_eq!(*mmap.as_ptr(), 0xAB);
        }
    }
}
