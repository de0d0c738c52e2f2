// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The WASI-shaped host-import shim (§4.6/§4.6.1): a fixed set of host
//! functions conforming to the engine's import ABI, touching guest memory
//! through [`crate::vm::LinearMemory`] with bounds checks.
//!
//! Every function here is the safe Rust implementation a compiled
//! artifact would call through an `extern "C"` trampoline shaped
//! `(instance*, int32…) → int32`; building that trampoline is the code
//! generator's job, which §1 places out of scope, so these are exposed as
//! plain Rust functions over [`HostContext`] rather than `extern "C"`
//! symbols.

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Errno, Trap};
use crate::vm::Instance;

/// Recovers the calling instance and brokers bounds-checked access to its
/// `"memory"` export for the duration of one host call.
pub struct HostContext<'a> {
    instance: &'a Instance,
}

impl<'a> HostContext<'a> {
    /// # Safety
    ///
    /// `instance_ptr` must be the leading `instance*` argument of a host
    /// import call: a value returned by [`Instance::closure_ptr`] on a
    /// still-live instance.
    pub unsafe fn from_raw(instance_ptr: *mut u8) -> Self {
        Self {
            instance: unsafe { Instance::from_closure_ptr(instance_ptr) },
        }
    }

    pub fn new(instance: &'a Instance) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &'a Instance {
        self.instance
    }

    fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, Errno> {
        let memory = self.instance.exported_memory("memory").ok_or(Errno::Fault)?;
        let memory = memory.borrow();
        memory
            .get_range(u64::from(addr), u64::from(len))
            .map(<[u8]>::to_vec)
            .map_err(|_| Errno::Fault)
    }

    fn write_bytes(&self, addr: u32, bytes: &[u8]) -> Result<(), Errno> {
        let memory = self.instance.exported_memory("memory").ok_or(Errno::Fault)?;
        let mut memory = memory.borrow_mut();
        let dst = memory
            .get_range_mut(u64::from(addr), bytes.len() as u64)
            .map_err(|_| Errno::Fault)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn read_u32(&self, addr: u32) -> Result<u32, Errno> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("read_bytes(.., 4) returns 4 bytes")))
    }

    fn write_u32(&self, addr: u32, value: u32) -> Result<(), Errno> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u64(&self, addr: u32, value: u64) -> Result<(), Errno> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u16(&self, addr: u32, value: u16) -> Result<(), Errno> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u8(&self, addr: u32, value: u8) -> Result<(), Errno> {
        self.write_bytes(addr, &[value])
    }
}

/// One `ciovec`: `{buf: u32, len: u32}`, 8 bytes, fields at offsets `{0, 4}`
/// per §6.
struct Ciovec {
    buf: u32,
    len: u32,
}

fn read_ciovec(ctx: &HostContext, addr: u32) -> Result<Ciovec, Errno> {
    Ok(Ciovec {
        buf: ctx.read_u32(addr)?,
        len: ctx.read_u32(addr + 4)?,
    })
}

fn stdio_writer(fd: i32) -> Result<Box<dyn Write>, Errno> {
    match fd {
        1 => Ok(Box::new(std::io::stdout())),
        2 => Ok(Box::new(std::io::stderr())),
        _ => Err(Errno::Badf),
    }
}

/// The fixed host-import surface this engine implements (§4.6.1). File
/// descriptors 0/1/2 are wired to process stdin/stdout/stderr; any other
/// `fd` is rejected with [`Errno::Badf`].
pub struct Wasi;

impl Wasi {
    pub fn fd_write(ctx: &HostContext, fd: i32, iovs: u32, iovs_len: u32, nwritten: u32) -> i32 {
        errno_result(Self::fd_write_inner(ctx, fd, iovs, iovs_len, nwritten))
    }

    fn fd_write_inner(ctx: &HostContext, fd: i32, iovs: u32, iovs_len: u32, nwritten: u32) -> Result<(), Errno> {
        let mut writer = stdio_writer(fd)?;
        let mut total = 0u32;
        for i in 0..iovs_len {
            let vec = read_ciovec(ctx, iovs + i * 8)?;
            let bytes = ctx.read_bytes(vec.buf, vec.len)?;
            writer.write_all(&bytes).map_err(Errno::from)?;
            total += vec.len;
        }
        ctx.write_u32(nwritten, total)?;
        tracing::trace!(fd, total, "fd_write");
        Ok(())
    }

    pub fn fd_read(ctx: &HostContext, fd: i32, iovs: u32, iovs_len: u32, nread: u32) -> i32 {
        errno_result(Self::fd_read_inner(ctx, fd, iovs, iovs_len, nread))
    }

    fn fd_read_inner(ctx: &HostContext, fd: i32, iovs: u32, iovs_len: u32, nread: u32) -> Result<(), Errno> {
        if fd != 0 {
            return Err(Errno::Badf);
        }
        let mut total = 0u32;
        for i in 0..iovs_len {
            let vec = read_ciovec(ctx, iovs + i * 8)?;
            let mut buf = vec![0u8; vec.len as usize];
            let n = std::io::stdin().read(&mut buf).map_err(Errno::from)?;
            buf.truncate(n);
            ctx.write_bytes(vec.buf, &buf)?;
            total += n as u32;
            if n < vec.len as usize {
                break;
            }
        }
        ctx.write_u32(nread, total)?;
        tracing::trace!(fd, total, "fd_read");
        Ok(())
    }

    pub fn fd_close(_ctx: &HostContext, fd: i32) -> i32 {
        match fd {
            0..=2 => Errno::Success.code() as i32,
            _ => Errno::Badf.code() as i32,
        }
    }

    pub fn fd_fdstat_get(ctx: &HostContext, fd: i32, out: u32) -> i32 {
        errno_result(Self::fd_fdstat_get_inner(ctx, fd, out))
    }

    fn fd_fdstat_get_inner(ctx: &HostContext, fd: i32, out: u32) -> Result<(), Errno> {
        if !(0..=2).contains(&fd) {
            return Err(Errno::Badf);
        }
        const FILETYPE_CHARACTER_DEVICE: u8 = 2;
        ctx.write_u8(out, FILETYPE_CHARACTER_DEVICE)?;
        ctx.write_u16(out + 2, 0)?;
        ctx.write_u64(out + 8, u64::MAX)?;
        ctx.write_u64(out + 16, u64::MAX)?;
        Ok(())
    }

    pub fn environ_sizes_get(ctx: &HostContext, count: u32, buf_size: u32) -> i32 {
        errno_result(ctx.write_u32(count, 0).and_then(|()| ctx.write_u32(buf_size, 0)))
    }

    pub fn environ_get(_ctx: &HostContext, _environ: u32, _environ_buf: u32) -> i32 {
        Errno::Success.code() as i32
    }

    pub fn clock_time_get(ctx: &HostContext, _id: i32, _precision: i64, out: u32) -> i32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch");
        errno_result(ctx.write_u64(out, now.as_nanos() as u64))
    }

    /// Terminates the guest: returns the out-of-band [`Trap::Exit`] signal
    /// rather than an errno. The top-level invocation point unwinds on
    /// this and maps `code` to the process exit status (§5/§7).
    pub fn proc_exit(code: i32) -> Trap {
        Trap::Exit(code)
    }
}

fn errno_result(result: Result<(), Errno>) -> i32 {
    match result {
        Ok(()) => Errno::Success.code() as i32,
        Err(errno) => errno.code() as i32,
    }
}

#[cfg(test)]
mod tests {
    use crate::types::ValType;
    use crate::vm::artifact::{Artifact, EntityMetadata, ExportDescriptor, FakeArtifact, MemoryType};
    use crate::vm::InstanceBuilder;

    use super::*;

    fn empty_meta<T>() -> EntityMetadata<T> {
        EntityMetadata {
            types: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
        }
    }

    fn instance_with_memory() -> Box<Instance> {
        let artifact: Box<dyn Artifact> = Box::new(FakeArtifact {
            memory: EntityMetadata {
                types: vec![MemoryType { min: 1, max: Some(4) }],
                imports: Vec::new(),
                exports: vec![ExportDescriptor {
                    index: 0,
                    name: "memory".to_string(),
                }],
            },
            table: empty_meta(),
            global: empty_meta::<ValType>(),
            function: empty_meta(),
            init: Box::new(|_| {}),
        });
        InstanceBuilder::new(artifact).build().unwrap()
    }

    #[test]
    fn fd_write_reports_byte_count_and_success() {
        let instance = instance_with_memory();
        let ctx = HostContext::new(&instance);

        // Lay out one ciovec at address 0 pointing at "ok\n" stored at 16.
        let message = b"ok\n";
        ctx.write_bytes(16, message).unwrap();
        ctx.write_u32(0, 16).unwrap();
        ctx.write_u32(4, message.len() as u32).unwrap();

        let errno = Wasi::fd_write(&ctx, 1, 0, 1, 24);
        assert_eq!(errno, Errno::Success.code() as i32);
        assert_eq!(ctx.read_u32(24).unwrap(), message.len() as u32);
    }

    #[test]
    fn fd_write_rejects_bad_descriptor() {
        let instance = instance_with_memory();
        let ctx = HostContext::new(&instance);
        let errno = Wasi::fd_write(&ctx, 9, 0, 0, 24);
        assert_eq!(errno, Errno::Badf.code() as i32);
    }

    #[test]
    fn fd_fdstat_get_fills_expected_offsets() {
        let instance = instance_with_memory();
        let ctx = HostContext::new(&instance);

        let errno = Wasi::fd_fdstat_get(&ctx, 1, 0);
        assert_eq!(errno, Errno::Success.code() as i32);
        assert_eq!(ctx.read_bytes(0, 1).unwrap(), vec![2]);
    }

    #[test]
    fn environ_sizes_get_reports_no_entries() {
        let instance = instance_with_memory();
        let ctx = HostContext::new(&instance);

        assert_eq!(
            Wasi::environ_sizes_get(&ctx, 0, 4),
            Errno::Success.code() as i32
        );
        assert_eq!(ctx.read_u32(0).unwrap(), 0);
        assert_eq!(ctx.read_u32(4).unwrap(), 0);
    }

    #[test]
    fn proc_exit_raises_exit_trap() {
        assert_eq!(Wasi::proc_exit(42), Trap::Exit(42));
    }
}
