//! The remote side of a Park: a marshaling handle usable from any worker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use wasi_farm_shm::{Allocator, Caller, DualLockMode, Locker, SharedSegment, ShmError};

use crate::error::{FarmError, Result};
use crate::layout::{
    claim_ref_id, deposit, deposit_pair, drain_notices, take_fdstat, take_filestat, take_prestat,
    withdraw, Block, Notice, Slot, FDS_LEN, NO_REF, PROTOCOL_FAULT,
};
use crate::ops::{AdminOp, FdOp};
use crate::wasi::{
    Advice, Errno, Fdflags, Fdstat, Filestat, Fstflags, Lookupflags, Oflags, Prestat, Rights,
    WasiResult, Whence,
};

/// Everything a worker needs to talk to a Park: segments and offsets only.
///
/// Cheap to clone; moving it to another worker is how a Park is shared.
#[derive(Debug, Clone)]
pub struct RefObject {
    pub(crate) fds: Arc<SharedSegment>,
    pub(crate) admin: Arc<SharedSegment>,
    pub(crate) allocator: Arc<SharedSegment>,
    pub(crate) max_fds: u32,
    pub(crate) max_refs: u32,
    pub(crate) stdio: [Option<u32>; 3],
    pub(crate) allow_list: Vec<u32>,
}

impl RefObject {
    /// Identity of the Park behind this object.
    pub fn park_key(&self) -> usize {
        Arc::as_ptr(&self.fds) as usize
    }

    /// Remote fds serving stdin, stdout and stderr.
    pub fn stdio(&self) -> [Option<u32>; 3] {
        self.stdio
    }

    /// Remote fds a Ref may map at construction.
    pub fn allow_list(&self) -> &[u32] {
        &self.allow_list
    }
}

/// Fds announced to a Ref since it last looked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notifications {
    pub closed: Vec<u32>,
    pub opened: Vec<u32>,
}

/// Payloads staged for one call.
///
/// Until the Park picks the call up they are the sender's; a call that fails
/// before pickup hands them back with [`Outbox::reclaim`].
struct Outbox<'a> {
    allocator: &'a Allocator,
    timeout: Option<Duration>,
    staged: Vec<(u32, u32)>,
}

impl<'a> Outbox<'a> {
    fn new(allocator: &'a Allocator, timeout: Option<Duration>) -> Self {
        Self {
            allocator,
            timeout,
            staged: Vec::new(),
        }
    }

    /// Pointer at argument `at`, length at `at + 1`.
    fn send(&mut self, slot: &Slot<'_>, at: usize, data: &[u8]) -> Result<()> {
        let (ptr, len) = deposit(self.allocator, data, self.timeout)?;
        self.staged.push((ptr, len));
        slot.set_arg(at, ptr);
        slot.set_arg(at + 1, len);
        Ok(())
    }

    /// Two paths in one payload: pointer at argument `at`, then both lengths.
    fn send_pair(&mut self, slot: &Slot<'_>, at: usize, first: &[u8], second: &[u8]) -> Result<()> {
        let (ptr, first, second) = deposit_pair(self.allocator, first, second, self.timeout)?;
        self.staged.push((ptr, first + second));
        slot.set_arg(at, ptr);
        slot.set_arg(at + 1, first);
        slot.set_arg(at + 2, second);
        Ok(())
    }

    fn reclaim(self) {
        for (ptr, len) in self.staged {
            if let Err(e) = self.allocator.free(ptr, len) {
                warn!(ptr, len, error = %e, "could not reclaim payload");
            }
        }
    }
}

/// Marshals WASI calls into a Park's slots.
///
/// Every operation returns `Result<WasiResult<T>>`: the outer error means the
/// shared-memory contract is broken, the inner one is an errno for the guest.
///
/// Dropping a Ref gives its id back to the Park.
#[derive(Debug)]
pub struct Ref {
    object: RefObject,
    allocator: Allocator,
    id: u32,
    timeout: Option<Duration>,
    dual_lock_mode: DualLockMode,
}

impl Ref {
    /// Rehydrate `object` and take a fresh ref id.
    pub fn new(object: RefObject) -> Result<Self> {
        let allocator = Allocator::from_segment(object.allocator.clone());
        let mut remote = Self {
            object,
            allocator,
            id: NO_REF,
            timeout: None,
            dual_lock_mode: DualLockMode::default(),
        };
        remote.set_id()?;
        Ok(remote)
    }

    /// Treat calls slower than `timeout` as a broken Park.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dual_lock_mode(mut self, mode: DualLockMode) -> Self {
        self.dual_lock_mode = mode;
        self
    }

    /// Take the lowest free ref id, giving back the one held before.
    pub fn set_id(&mut self) -> Result<u32> {
        self.release_id();
        let (max_fds, max_refs) = (self.object.max_fds, self.object.max_refs);
        let id = claim_ref_id(&self.object.admin, max_fds, max_refs)
            .ok_or(FarmError::RefIdExhausted(max_refs))?;
        self.id = id;
        trace!(id, "ref attached");
        Ok(id)
    }

    /// Ask the Park to forget this Ref's watches and notices and free its id.
    fn release_id(&mut self) {
        if self.id == NO_REF {
            return;
        }
        match self.admin_call(AdminOp::ReleaseRef, 0) {
            Ok(Ok(())) => trace!(id = self.id, "ref released"),
            Ok(Err(errno)) => warn!(id = self.id, %errno, "park refused ref release"),
            Err(e) => debug!(id = self.id, error = %e, "park unreachable, ref id kept"),
        }
        self.id = NO_REF;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn object(&self) -> &RefObject {
        &self.object
    }

    /// Current size of the Park's fd table.
    pub fn get_fds_len(&self) -> u32 {
        self.object.admin.load(FDS_LEN)
    }

    /// Largest payload moved in one call. Reads are clamped to it and writes
    /// are split into chunks of it.
    pub fn max_payload(&self) -> usize {
        (self.allocator.capacity() / 4).max(1)
    }

    /// Atomically take the close and open notices addressed to this Ref.
    pub fn take_notifications(&self) -> Notifications {
        let (admin, max_fds) = (&self.object.admin, self.object.max_fds);
        Notifications {
            closed: drain_notices(admin, max_fds, self.id, Notice::Close),
            opened: drain_notices(admin, max_fds, self.id, Notice::Open),
        }
    }

    fn locker(&self, fd: u32) -> Locker {
        Locker::new(self.object.fds.clone(), Block::fd(fd).lock())
    }

    fn receive(&self, slot: &Slot<'_>) -> Result<Vec<u8>> {
        withdraw(&self.allocator, slot.arg(0), slot.arg(1))
    }

    fn check_path(&self, path: &[u8]) -> WasiResult<()> {
        if path.len() > self.max_payload() {
            Err(Errno::NAMETOOLONG)
        } else {
            Ok(())
        }
    }

    /// Publish one call on `fd`'s slot; the fd lock must already be held.
    fn invoke<T>(
        &self,
        fd: u32,
        op: FdOp,
        encode: impl FnOnce(&Slot<'_>, &mut Outbox<'_>) -> Result<()>,
        decode: impl FnOnce(&Slot<'_>) -> Result<T>,
    ) -> Result<WasiResult<T>> {
        let block = Block::fd(fd);
        let slot = Slot::new(&self.object.fds, block);
        slot.set_func(op.id());
        let mut outbox = Outbox::new(&self.allocator, self.timeout);
        if let Err(e) = encode(&slot, &mut outbox) {
            outbox.reclaim();
            return Err(e);
        }
        let called = Caller::new(self.object.fds.clone(), block.call())
            .with_timeout(self.timeout)
            .call_and_wait();
        match called {
            Ok(()) => {}
            // The Park took the call and its payloads; it cleans up alone.
            Err(ShmError::Abandoned) => {
                warn!(fd, op = op.wasi_name(), "call abandoned after pickup");
                return Err(ShmError::Abandoned.into());
            }
            Err(e) => {
                outbox.reclaim();
                return Err(e.into());
            }
        }
        match slot.errno_raw() {
            0 => decode(&slot).map(Ok),
            PROTOCOL_FAULT => Err(FarmError::Protocol(format!(
                "park rejected {} on fd {fd}",
                op.wasi_name()
            ))),
            raw => u16::try_from(raw)
                .map(|errno| Err(Errno(errno)))
                .map_err(|_| FarmError::Protocol(format!("errno word {raw} on fd {fd}"))),
        }
    }

    fn call<T>(
        &self,
        fd: u32,
        op: FdOp,
        encode: impl FnOnce(&Slot<'_>, &mut Outbox<'_>) -> Result<()>,
        decode: impl FnOnce(&Slot<'_>) -> Result<T>,
    ) -> Result<WasiResult<T>> {
        if fd >= self.get_fds_len() {
            return Ok(Err(Errno::BADF));
        }
        let _guard = self.locker(fd).lock_timeout(self.timeout)?;
        self.invoke(fd, op, encode, decode)
    }

    /// Like [`Ref::call`] for operations touching two fds of this Park.
    fn call_pair<T>(
        &self,
        fd: u32,
        other: u32,
        op: FdOp,
        encode: impl FnOnce(&Slot<'_>, &mut Outbox<'_>) -> Result<()>,
        decode: impl FnOnce(&Slot<'_>) -> Result<T>,
    ) -> Result<WasiResult<T>> {
        let len = self.get_fds_len();
        if fd >= len || other >= len {
            return Ok(Err(Errno::BADF));
        }
        if fd == other {
            return self.call(fd, op, encode, decode);
        }
        let _guard = Locker::dual_lock_timeout(
            &self.locker(fd),
            &self.locker(other),
            self.dual_lock_mode,
            self.timeout,
        )?;
        self.invoke(fd, op, encode, decode)
    }

    fn simple(&self, fd: u32, op: FdOp, encode: impl FnOnce(&Slot<'_>)) -> Result<WasiResult<()>> {
        self.call(
            fd,
            op,
            |slot, _| {
                encode(slot);
                Ok(())
            },
            |_| Ok(()),
        )
    }

    pub fn fd_advise(&self, fd: u32, offset: u64, len: u64, advice: Advice) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdAdvise, |slot| {
            slot.set_arg_u64(0, offset);
            slot.set_arg_u64(2, len);
            slot.set_arg(4, advice as u32);
        })
    }

    pub fn fd_allocate(&self, fd: u32, offset: u64, len: u64) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdAllocate, |slot| {
            slot.set_arg_u64(0, offset);
            slot.set_arg_u64(2, len);
        })
    }

    /// Close `fd`; every other Ref watching it is told on its next check.
    pub fn fd_close(&self, fd: u32) -> Result<WasiResult<()>> {
        let id = self.id;
        self.simple(fd, FdOp::FdClose, |slot| slot.set_arg(0, id))
    }

    pub fn fd_datasync(&self, fd: u32) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdDatasync, |_| {})
    }

    pub fn fd_fdstat_get(&self, fd: u32) -> Result<WasiResult<Fdstat>> {
        self.call(fd, FdOp::FdFdstatGet, |_, _| Ok(()), |slot| Ok(take_fdstat(slot)))
    }

    pub fn fd_fdstat_set_flags(&self, fd: u32, flags: Fdflags) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdFdstatSetFlags, |slot| slot.set_arg(0, flags as u32))
    }

    pub fn fd_fdstat_set_rights(
        &self,
        fd: u32,
        base: Rights,
        inheriting: Rights,
    ) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdFdstatSetRights, |slot| {
            slot.set_arg_u64(0, base);
            slot.set_arg_u64(2, inheriting);
        })
    }

    pub fn fd_filestat_get(&self, fd: u32) -> Result<WasiResult<Filestat>> {
        self.call(fd, FdOp::FdFilestatGet, |_, _| Ok(()), |slot| Ok(take_filestat(slot)))
    }

    pub fn fd_filestat_set_size(&self, fd: u32, size: u64) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdFilestatSetSize, |slot| slot.set_arg_u64(0, size))
    }

    pub fn fd_filestat_set_times(
        &self,
        fd: u32,
        atim: u64,
        mtim: u64,
        flags: Fstflags,
    ) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdFilestatSetTimes, |slot| {
            slot.set_arg_u64(0, atim);
            slot.set_arg_u64(2, mtim);
            slot.set_arg(4, flags as u32);
        })
    }

    /// Read up to `len` bytes at `offset`; may return fewer than asked.
    pub fn fd_pread(&self, fd: u32, len: usize, offset: u64) -> Result<WasiResult<Vec<u8>>> {
        let len = len.min(self.max_payload()) as u32;
        self.call(
            fd,
            FdOp::FdPread,
            |slot, _| {
                slot.set_arg(0, len);
                slot.set_arg_u64(1, offset);
                Ok(())
            },
            |slot| self.receive(slot),
        )
    }

    pub fn fd_prestat_get(&self, fd: u32) -> Result<WasiResult<Prestat>> {
        self.call(fd, FdOp::FdPrestatGet, |_, _| Ok(()), |slot| Ok(take_prestat(slot)))
    }

    pub fn fd_prestat_dir_name(&self, fd: u32) -> Result<WasiResult<Vec<u8>>> {
        self.call(fd, FdOp::FdPrestatDirName, |_, _| Ok(()), |slot| self.receive(slot))
    }

    pub fn fd_pwrite(&self, fd: u32, data: &[u8], offset: u64) -> Result<WasiResult<u32>> {
        if fd >= self.get_fds_len() {
            return Ok(Err(Errno::BADF));
        }
        let _guard = self.locker(fd).lock_timeout(self.timeout)?;
        self.chunked(data, |chunk, done| {
            self.invoke(
                fd,
                FdOp::FdPwrite,
                |slot, out| {
                    out.send(slot, 0, chunk)?;
                    slot.set_arg_u64(2, offset + done as u64);
                    Ok(())
                },
                |slot| Ok(slot.arg(0)),
            )
        })
    }

    /// Read up to `len` bytes; an empty result at a non-zero `len` is EOF.
    pub fn fd_read(&self, fd: u32, len: usize) -> Result<WasiResult<Vec<u8>>> {
        let len = len.min(self.max_payload()) as u32;
        self.call(
            fd,
            FdOp::FdRead,
            |slot, _| {
                slot.set_arg(0, len);
                Ok(())
            },
            |slot| self.receive(slot),
        )
    }

    /// Encoded dirents starting at `cookie`, cut at `buf_len` bytes.
    pub fn fd_readdir(&self, fd: u32, buf_len: usize, cookie: u64) -> Result<WasiResult<Vec<u8>>> {
        let buf_len = buf_len.min(self.max_payload()) as u32;
        self.call(
            fd,
            FdOp::FdReaddir,
            |slot, _| {
                slot.set_arg(0, buf_len);
                slot.set_arg_u64(1, cookie);
                Ok(())
            },
            |slot| self.receive(slot),
        )
    }

    pub fn fd_seek(&self, fd: u32, offset: i64, whence: Whence) -> Result<WasiResult<u64>> {
        self.call(
            fd,
            FdOp::FdSeek,
            |slot, _| {
                slot.set_arg_u64(0, offset as u64);
                slot.set_arg(2, whence as u32);
                Ok(())
            },
            |slot| Ok(slot.arg_u64(0)),
        )
    }

    pub fn fd_sync(&self, fd: u32) -> Result<WasiResult<()>> {
        self.simple(fd, FdOp::FdSync, |_| {})
    }

    pub fn fd_tell(&self, fd: u32) -> Result<WasiResult<u64>> {
        self.call(fd, FdOp::FdTell, |_, _| Ok(()), |slot| Ok(slot.arg_u64(0)))
    }

    /// Write `data`, split into payload-sized calls under one fd lock.
    pub fn fd_write(&self, fd: u32, data: &[u8]) -> Result<WasiResult<u32>> {
        if fd >= self.get_fds_len() {
            return Ok(Err(Errno::BADF));
        }
        let _guard = self.locker(fd).lock_timeout(self.timeout)?;
        self.chunked(data, |chunk, _| {
            self.invoke(
                fd,
                FdOp::FdWrite,
                |slot, out| out.send(slot, 0, chunk),
                |slot| Ok(slot.arg(0)),
            )
        })
    }

    /// Drive `write` over payload-sized chunks, stopping at the first short
    /// write. An errno after some progress reports the progress instead.
    fn chunked(
        &self,
        data: &[u8],
        mut write: impl FnMut(&[u8], usize) -> Result<WasiResult<u32>>,
    ) -> Result<WasiResult<u32>> {
        if data.is_empty() {
            return write(data, 0);
        }
        let mut done = 0usize;
        for chunk in data.chunks(self.max_payload()) {
            match write(chunk, done)? {
                Ok(written) => {
                    done += written as usize;
                    if (written as usize) < chunk.len() {
                        break;
                    }
                }
                Err(errno) if done == 0 => return Ok(Err(errno)),
                Err(_) => break,
            }
        }
        Ok(Ok(done as u32))
    }

    pub fn path_create_directory(&self, fd: u32, path: &[u8]) -> Result<WasiResult<()>> {
        if let Err(errno) = self.check_path(path) {
            return Ok(Err(errno));
        }
        self.call(fd, FdOp::PathCreateDirectory, |slot, out| out.send(slot, 0, path), |_| Ok(()))
    }

    pub fn path_filestat_get(
        &self,
        fd: u32,
        flags: Lookupflags,
        path: &[u8],
    ) -> Result<WasiResult<Filestat>> {
        if let Err(errno) = self.check_path(path) {
            return Ok(Err(errno));
        }
        self.call(
            fd,
            FdOp::PathFilestatGet,
            |slot, out| {
                slot.set_arg(0, flags);
                out.send(slot, 1, path)
            },
            |slot| Ok(take_filestat(slot)),
        )
    }

    pub fn path_filestat_set_times(
        &self,
        fd: u32,
        flags: Lookupflags,
        path: &[u8],
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> Result<WasiResult<()>> {
        if let Err(errno) = self.check_path(path) {
            return Ok(Err(errno));
        }
        self.call(
            fd,
            FdOp::PathFilestatSetTimes,
            |slot, out| {
                slot.set_arg(0, flags);
                out.send(slot, 1, path)?;
                slot.set_arg_u64(3, atim);
                slot.set_arg_u64(5, mtim);
                slot.set_arg(7, fst_flags as u32);
                Ok(())
            },
            |_| Ok(()),
        )
    }

    /// Hard-link `old_path` under `fd` to `new_path` under `new_fd`; both fds
    /// belong to this Park and are locked together.
    pub fn path_link(
        &self,
        fd: u32,
        old_flags: Lookupflags,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<WasiResult<()>> {
        if let Err(errno) = self.check_path(old_path).and(self.check_path(new_path)) {
            return Ok(Err(errno));
        }
        self.call_pair(
            fd,
            new_fd,
            FdOp::PathLink,
            |slot, out| {
                slot.set_arg(0, old_flags);
                out.send_pair(slot, 1, old_path, new_path)?;
                slot.set_arg(4, new_fd);
                Ok(())
            },
            |_| Ok(()),
        )
    }

    /// Open `path` under `fd`, returning the new remote fd.
    #[allow(clippy::too_many_arguments)]
    pub fn path_open(
        &self,
        fd: u32,
        dirflags: Lookupflags,
        path: &[u8],
        oflags: Oflags,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
    ) -> Result<WasiResult<u32>> {
        if let Err(errno) = self.check_path(path) {
            return Ok(Err(errno));
        }
        let id = self.id;
        self.call(
            fd,
            FdOp::PathOpen,
            |slot, out| {
                slot.set_arg(0, dirflags);
                out.send(slot, 1, path)?;
                slot.set_arg(3, oflags as u32);
                slot.set_arg_u64(4, rights_base);
                slot.set_arg_u64(6, rights_inheriting);
                slot.set_arg(8, fdflags as u32);
                slot.set_arg(9, id);
                Ok(())
            },
            |slot| Ok(slot.arg(0)),
        )
    }

    pub fn path_readlink(&self, fd: u32, path: &[u8], buf_len: usize) -> Result<WasiResult<Vec<u8>>> {
        if let Err(errno) = self.check_path(path) {
            return Ok(Err(errno));
        }
        let buf_len = buf_len.min(self.max_payload()) as u32;
        self.call(
            fd,
            FdOp::PathReadlink,
            |slot, out| {
                out.send(slot, 0, path)?;
                slot.set_arg(2, buf_len);
                Ok(())
            },
            |slot| self.receive(slot),
        )
    }

    pub fn path_remove_directory(&self, fd: u32, path: &[u8]) -> Result<WasiResult<()>> {
        if let Err(errno) = self.check_path(path) {
            return Ok(Err(errno));
        }
        self.call(fd, FdOp::PathRemoveDirectory, |slot, out| out.send(slot, 0, path), |_| Ok(()))
    }

    /// Rename `old_path` under `fd` to `new_path` under `new_fd`; both fds
    /// belong to this Park and are locked together.
    pub fn path_rename(
        &self,
        fd: u32,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<WasiResult<()>> {
        if let Err(errno) = self.check_path(old_path).and(self.check_path(new_path)) {
            return Ok(Err(errno));
        }
        self.call_pair(
            fd,
            new_fd,
            FdOp::PathRename,
            |slot, out| {
                out.send_pair(slot, 0, old_path, new_path)?;
                slot.set_arg(3, new_fd);
                Ok(())
            },
            |_| Ok(()),
        )
    }

    pub fn path_symlink(&self, old_path: &[u8], fd: u32, new_path: &[u8]) -> Result<WasiResult<()>> {
        if let Err(errno) = self.check_path(old_path).and(self.check_path(new_path)) {
            return Ok(Err(errno));
        }
        self.call(
            fd,
            FdOp::PathSymlink,
            |slot, out| out.send_pair(slot, 0, old_path, new_path),
            |_| Ok(()),
        )
    }

    pub fn path_unlink_file(&self, fd: u32, path: &[u8]) -> Result<WasiResult<()>> {
        if let Err(errno) = self.check_path(path) {
            return Ok(Err(errno));
        }
        self.call(fd, FdOp::PathUnlinkFile, |slot, out| out.send(slot, 0, path), |_| Ok(()))
    }

    fn admin_call(&self, op: AdminOp, fd: u32) -> Result<WasiResult<()>> {
        let admin = &self.object.admin;
        let block = Block::admin();
        let _guard = Locker::new(admin.clone(), block.lock()).lock_timeout(self.timeout)?;
        let slot = Slot::new(admin, block);
        slot.set_func(op.id());
        slot.set_arg(0, fd);
        slot.set_arg(1, self.id);
        Caller::new(admin.clone(), block.call())
            .with_timeout(self.timeout)
            .call_and_wait()?;
        match slot.errno_raw() {
            0 => Ok(Ok(())),
            PROTOCOL_FAULT => Err(FarmError::Protocol(format!(
                "park rejected {}",
                op.wasi_name()
            ))),
            raw => Ok(Err(Errno(raw as u16))),
        }
    }

    /// Ask to be told when `fd` closes.
    pub fn register_visibility(&self, fd: u32) -> Result<WasiResult<()>> {
        self.admin_call(AdminOp::RegisterVisibility, fd)
    }

    pub fn unregister_visibility(&self, fd: u32) -> Result<WasiResult<()>> {
        self.admin_call(AdminOp::UnregisterVisibility, fd)
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        self.release_id();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::memfs::{ConsoleIn, ConsoleOut};
    use crate::{Descriptor, Park, ParkConfig};

    fn park(config: ParkConfig) -> Park {
        let (stdout, _) = ConsoleOut::capture();
        let (stderr, _) = ConsoleOut::capture();
        let descriptors: Vec<Box<dyn Descriptor>> = vec![
            Box::new(ConsoleIn::from_bytes("")),
            Box::new(stdout),
            Box::new(stderr),
        ];
        let park = Park::new(descriptors, config).unwrap();
        park.listen().unwrap();
        park
    }

    #[test]
    fn write_gives_up_while_allocator_is_held_full() {
        let park = park(ParkConfig {
            allocator_capacity: 64,
            ..ParkConfig::default()
        });
        let object = park.ref_object();
        let remote = Ref::new(object.clone())
            .unwrap()
            .with_timeout(Some(Duration::from_millis(100)));
        let other = Allocator::from_segment(object.allocator.clone());
        let held = other.write(&[7u8; 60]).unwrap();

        let started = Instant::now();
        let err = remote.fd_write(1, &[1u8; 16]).unwrap_err();
        assert_eq!(err, FarmError::Shm(ShmError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(park.live_payloads(), 1);

        other.free(held.0, held.1).unwrap();
        assert_eq!(remote.fd_write(1, &[1u8; 16]).unwrap().unwrap(), 16);
        assert_eq!(park.live_payloads(), 0);
    }

    #[test]
    fn write_resumes_once_allocator_drains() {
        let park = park(ParkConfig {
            allocator_capacity: 64,
            ..ParkConfig::default()
        });
        let object = park.ref_object();
        let remote = Ref::new(object.clone()).unwrap();
        let other = Allocator::from_segment(object.allocator.clone());
        let held = other.write(&[7u8; 60]).unwrap();

        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            other.free(held.0, held.1).unwrap();
        });
        assert_eq!(remote.fd_write(1, &[1u8; 16]).unwrap().unwrap(), 16);
        release.join().unwrap();
    }

    #[test]
    fn dropping_a_ref_frees_its_id() {
        let park = park(ParkConfig {
            max_refs: 1,
            ..ParkConfig::default()
        });
        let object = park.ref_object();
        let first = Ref::new(object.clone()).unwrap();
        assert!(ref_id_in_use_by(&object, 0));
        drop(first);
        assert!(!ref_id_in_use_by(&object, 0));
        assert_eq!(Ref::new(object).unwrap().id(), 0);
    }

    fn ref_id_in_use_by(object: &RefObject, id: u32) -> bool {
        crate::layout::ref_id_in_use(&object.admin, object.max_fds, object.max_refs, id)
    }
}
