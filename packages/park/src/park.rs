//! The owner of the authoritative descriptor table.
//!
//! A Park serves one loop thread per fd slot and one admin thread. Each loop
//! blocks on its slot's [`Listener`], decodes the function id, applies the
//! operation to the real descriptor and writes results and errno back.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};
use wasi_farm_shm::{Allocator, Listener, SharedSegment};

use crate::config::ParkConfig;
use crate::descriptor::Descriptor;
use crate::error::{FarmError, Result};
use crate::layout::{
    admin_words, bitmap_words, deposit, fd_table_words, notice_bit, put_fdstat, put_filestat,
    put_prestat, ref_id_in_use, release_ref_id, withdraw, withdraw_pair, Block, Notice, Slot,
    FDS_LEN, REF_IDS_SEEN,
};
use crate::ops::{AdminOp, FdOp};
use crate::remote::RefObject;
use crate::wasi::{encode_dirents, Errno, WasiResult, Whence};

type DescriptorCell = Arc<Mutex<Option<Box<dyn Descriptor>>>>;

struct Table {
    /// Logical table size; slots at or beyond it have never been used.
    len: u32,
    in_use: Vec<bool>,
    listening: Vec<bool>,
    started: bool,
}

struct ParkInner {
    config: ParkConfig,
    fds: Arc<SharedSegment>,
    admin: Arc<SharedSegment>,
    allocator: Allocator,
    slots: Vec<DescriptorCell>,
    /// Lock order: `table` before `visibility`. Binding a new slot holds
    /// `table` for the whole bind, which serializes opens.
    table: Mutex<Table>,
    /// fd -> ref ids that must learn about its close.
    visibility: Mutex<HashMap<u32, BTreeSet<u32>>>,
    initial: u32,
}

/// Owner of a descriptor table shared with any number of Refs.
#[derive(Clone)]
pub struct Park {
    inner: Arc<ParkInner>,
}

impl std::fmt::Debug for Park {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Park")
            .field("fds_len", &self.fds_len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Park {
    /// Create a Park owning `descriptors` as fds `0..descriptors.len()`.
    ///
    /// Every initial descriptor is on the allow-list handed to Refs.
    pub fn new(descriptors: Vec<Box<dyn Descriptor>>, config: ParkConfig) -> Result<Self> {
        let count = descriptors.len() as u32;
        if config.max_fds == 0 || count > config.max_fds {
            return Err(FarmError::InvalidHandle(format!(
                "{count} initial descriptors do not fit in {} slots",
                config.max_fds
            )));
        }
        if let Some(index) = config.stdio().into_iter().flatten().find(|&i| i >= count) {
            return Err(FarmError::InvalidHandle(format!(
                "stdio index {index} is not an initial descriptor"
            )));
        }

        let max = config.max_fds as usize;
        let fds = SharedSegment::new(fd_table_words(config.max_fds));
        let admin = SharedSegment::new(admin_words(config.max_fds, config.max_refs));
        admin.store(FDS_LEN, count);
        let allocator = Allocator::new(config.allocator_capacity);

        let mut initial = descriptors.into_iter();
        let slots = (0..max)
            .map(|_| Arc::new(Mutex::new(initial.next())))
            .collect();
        let mut in_use = vec![false; max];
        in_use[..count as usize].fill(true);

        Ok(Self {
            inner: Arc::new(ParkInner {
                config,
                fds,
                admin,
                allocator,
                slots,
                table: Mutex::new(Table {
                    len: count,
                    in_use,
                    listening: vec![false; max],
                    started: false,
                }),
                visibility: Mutex::new(HashMap::new()),
                initial: count,
            }),
        })
    }

    /// Start one loop per live slot plus the admin loop.
    ///
    /// Loops run until the process exits.
    #[instrument(skip(self), level = "debug")]
    pub fn listen(&self) -> Result<()> {
        let inner = &self.inner;
        let mut table = inner.table.lock();
        if table.started {
            return Err(FarmError::Protocol("park is already listening".to_string()));
        }

        let listener = Listener::attach(inner.admin.clone(), Block::admin().call())?;
        let park = Arc::clone(inner);
        thread::Builder::new()
            .name("park-admin".to_string())
            .spawn(move || park.serve_admin(listener))
            .map_err(|e| FarmError::Spawn(e.to_string()))?;

        for fd in 0..table.len {
            inner.spawn_fd_loop(fd)?;
            table.listening[fd as usize] = true;
        }
        table.started = true;
        info!(fds = table.len, "park listening");
        Ok(())
    }

    /// The plain handle a worker needs to build a [`crate::Ref`].
    pub fn ref_object(&self) -> RefObject {
        let inner = &self.inner;
        RefObject {
            fds: inner.fds.clone(),
            admin: inner.admin.clone(),
            allocator: inner.allocator.segment().clone(),
            max_fds: inner.config.max_fds,
            max_refs: inner.config.max_refs,
            stdio: inner.config.stdio(),
            allow_list: (0..inner.initial).collect(),
        }
    }

    pub fn config(&self) -> &ParkConfig {
        &self.inner.config
    }

    pub fn fds_len(&self) -> u32 {
        self.inner.admin.load(FDS_LEN)
    }

    /// Whether `fd` currently holds a descriptor.
    pub fn is_open(&self, fd: u32) -> bool {
        self.inner
            .slots
            .get(fd as usize)
            .is_some_and(|cell| cell.lock().is_some())
    }

    /// Number of fds holding a descriptor.
    pub fn open_count(&self) -> usize {
        self.inner.slots.iter().filter(|cell| cell.lock().is_some()).count()
    }

    /// Payloads deposited in the Park's allocator and not yet withdrawn.
    pub fn live_payloads(&self) -> u32 {
        self.inner.allocator.live()
    }

    /// Ref ids registered to hear about `fd` closing.
    pub fn watchers(&self, fd: u32) -> Vec<u32> {
        self.inner
            .visibility
            .lock()
            .get(&fd)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl ParkInner {
    fn spawn_fd_loop(self: &Arc<Self>, fd: u32) -> Result<()> {
        // Attach before the fd number can be handed out so no caller ever
        // observes the slot without a listener.
        let listener = Listener::attach(self.fds.clone(), Block::fd(fd).call())?;
        let park = Arc::clone(self);
        thread::Builder::new()
            .name(format!("park-fd-{fd}"))
            .spawn(move || park.serve_fd(fd, listener))
            .map_err(|e| FarmError::Spawn(e.to_string()))?;
        Ok(())
    }

    /// Upper bound on every ref id handed out so far.
    fn seen_refs(&self) -> u32 {
        self.admin.load(REF_IDS_SEEN).min(self.config.max_refs)
    }

    fn attached_refs(&self) -> impl Iterator<Item = u32> + '_ {
        let (max_fds, max_refs) = (self.config.max_fds, self.config.max_refs);
        (0..self.seen_refs()).filter(move |&id| ref_id_in_use(&self.admin, max_fds, max_refs, id))
    }

    fn serve_fd(self: Arc<Self>, fd: u32, mut listener: Listener) {
        loop {
            let call = match listener.listen() {
                Ok(call) => call,
                Err(e) => {
                    error!(fd, error = %e, "fd loop stopped");
                    return;
                }
            };
            let slot = Slot::new(&self.fds, Block::fd(fd));
            let (stop, staged) = match self.dispatch(fd, &slot) {
                Ok(result) => {
                    let staged = result.is_ok()
                        && FdOp::try_from(slot.func()).is_ok_and(FdOp::returns_payload);
                    slot.set_errno(result.err().unwrap_or(Errno::SUCCESS));
                    (false, staged.then(|| (slot.arg(0), slot.arg(1))))
                }
                Err(e) => {
                    error!(fd, error = %e, "rejected call");
                    slot.set_protocol_fault();
                    (matches!(e, FarmError::UnknownFunction(_)), None)
                }
            };
            if !call.finish() {
                warn!(fd, "caller gave up on call");
                if let Some((ptr, len)) = staged {
                    if let Err(e) = self.allocator.free(ptr, len) {
                        error!(fd, error = %e, "could not release abandoned result");
                    }
                }
            }
            if stop {
                return;
            }
        }
    }

    fn serve_admin(self: Arc<Self>, mut listener: Listener) {
        loop {
            let call = match listener.listen() {
                Ok(call) => call,
                Err(e) => {
                    error!(error = %e, "admin loop stopped");
                    return;
                }
            };
            let slot = Slot::new(&self.admin, Block::admin());
            let stop = match AdminOp::try_from(slot.func()) {
                Ok(op) => {
                    let result = self.admin_op(op, slot.arg(0), slot.arg(1));
                    slot.set_errno(result.err().unwrap_or(Errno::SUCCESS));
                    false
                }
                Err(e) => {
                    error!(error = %e, "rejected admin call");
                    slot.set_protocol_fault();
                    true
                }
            };
            call.finish();
            if stop {
                return;
            }
        }
    }

    fn admin_op(&self, op: AdminOp, fd: u32, ref_id: u32) -> WasiResult<()> {
        trace!(op = op.wasi_name(), fd, ref_id, "admin");
        if ref_id >= self.config.max_refs {
            return Err(Errno::INVAL);
        }
        let table = self.table.lock();
        match op {
            AdminOp::RegisterVisibility => {
                if !table.in_use.get(fd as usize).copied().unwrap_or(false) {
                    return Err(Errno::BADF);
                }
                self.visibility.lock().entry(fd).or_default().insert(ref_id);
            }
            AdminOp::UnregisterVisibility => {
                if let Some(ids) = self.visibility.lock().get_mut(&fd) {
                    ids.remove(&ref_id);
                }
            }
            AdminOp::ReleaseRef => {
                for ids in self.visibility.lock().values_mut() {
                    ids.remove(&ref_id);
                }
                let max_fds = self.config.max_fds;
                for notice in [Notice::Close, Notice::Open] {
                    let (first, _) = notice_bit(max_fds, ref_id, notice, 0);
                    for w in 0..bitmap_words(max_fds) {
                        self.admin.store(first + w, 0);
                    }
                }
                release_ref_id(&self.admin, max_fds, self.config.max_refs, ref_id);
                debug!(ref_id, "ref released");
            }
        }
        Ok(())
    }

    fn with_descriptor<T>(
        &self,
        fd: u32,
        f: impl FnOnce(&mut dyn Descriptor) -> WasiResult<T>,
    ) -> WasiResult<T> {
        let cell = self.slots.get(fd as usize).ok_or(Errno::BADF)?;
        let mut guard = cell.lock();
        match guard.as_deref_mut() {
            Some(descriptor) => f(descriptor),
            None => Err(Errno::BADF),
        }
    }

    /// Run `f` on `fd` with `other` as the destination directory.
    ///
    /// Callers hold both fd lockers, so nobody else touches either slot.
    fn with_pair<T>(
        &self,
        fd: u32,
        other: u32,
        f: impl FnOnce(&mut dyn Descriptor, Option<&dyn Descriptor>) -> WasiResult<T>,
    ) -> WasiResult<T> {
        if fd == other {
            return self.with_descriptor(fd, |descriptor| f(descriptor, None));
        }
        let other_cell = self.slots.get(other as usize).ok_or(Errno::BADF)?;
        self.with_descriptor(fd, |descriptor| {
            let guard = other_cell.lock();
            match guard.as_deref() {
                Some(new_dir) => f(descriptor, Some(new_dir)),
                None => Err(Errno::BADF),
            }
        })
    }

    fn input(&self, slot: &Slot<'_>, at: usize) -> Result<Vec<u8>> {
        withdraw(&self.allocator, slot.arg(at), slot.arg(at + 1))
    }

    /// Two byte strings deposited together: pointer at `at`, lengths after it.
    fn input_pair(&self, slot: &Slot<'_>, at: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        withdraw_pair(&self.allocator, slot.arg(at), slot.arg(at + 1), slot.arg(at + 2))
    }

    fn output(&self, slot: &Slot<'_>, result: WasiResult<Vec<u8>>) -> Result<WasiResult<()>> {
        match result {
            Ok(data) => {
                let (ptr, len) = deposit(&self.allocator, &data, self.config.call_timeout)?;
                slot.set_arg(0, ptr);
                slot.set_arg(1, len);
                Ok(Ok(()))
            }
            Err(errno) => Ok(Err(errno)),
        }
    }

    fn dispatch(self: &Arc<Self>, fd: u32, slot: &Slot<'_>) -> Result<WasiResult<()>> {
        let op = FdOp::try_from(slot.func())?;
        trace!(fd, op = op.wasi_name(), "dispatch");
        let result = match op {
            FdOp::FdAdvise => {
                let (offset, len, advice) = (slot.arg_u64(0), slot.arg_u64(2), slot.arg(4) as u8);
                self.with_descriptor(fd, |d| d.fd_advise(offset, len, advice))
            }
            FdOp::FdAllocate => {
                let (offset, len) = (slot.arg_u64(0), slot.arg_u64(2));
                self.with_descriptor(fd, |d| d.fd_allocate(offset, len))
            }
            FdOp::FdClose => self.close(fd, slot.arg(0)),
            FdOp::FdDatasync => self.with_descriptor(fd, |d| d.fd_datasync()),
            FdOp::FdFdstatGet => self
                .with_descriptor(fd, |d| d.fd_fdstat_get())
                .map(|stat| put_fdstat(slot, &stat)),
            FdOp::FdFdstatSetFlags => {
                let flags = slot.arg(0) as u16;
                self.with_descriptor(fd, |d| d.fd_fdstat_set_flags(flags))
            }
            FdOp::FdFdstatSetRights => {
                let (base, inheriting) = (slot.arg_u64(0), slot.arg_u64(2));
                self.with_descriptor(fd, |d| d.fd_fdstat_set_rights(base, inheriting))
            }
            FdOp::FdFilestatGet => self
                .with_descriptor(fd, |d| d.fd_filestat_get())
                .map(|stat| put_filestat(slot, &stat)),
            FdOp::FdFilestatSetSize => {
                let size = slot.arg_u64(0);
                self.with_descriptor(fd, |d| d.fd_filestat_set_size(size))
            }
            FdOp::FdFilestatSetTimes => {
                let (atim, mtim, flags) = (slot.arg_u64(0), slot.arg_u64(2), slot.arg(4) as u16);
                self.with_descriptor(fd, |d| d.fd_filestat_set_times(atim, mtim, flags))
            }
            FdOp::FdPread => {
                let (len, offset) = (slot.arg(0) as usize, slot.arg_u64(1));
                let read = self.with_descriptor(fd, |d| d.fd_pread(len, offset));
                return self.output(slot, read);
            }
            FdOp::FdPrestatGet => self
                .with_descriptor(fd, |d| d.fd_prestat_get())
                .map(|prestat| put_prestat(slot, &prestat)),
            FdOp::FdPrestatDirName => {
                let name = self.with_descriptor(fd, |d| d.fd_prestat_dir_name());
                return self.output(slot, name);
            }
            FdOp::FdPwrite => {
                let data = self.input(slot, 0)?;
                let offset = slot.arg_u64(2);
                self.with_descriptor(fd, |d| d.fd_pwrite(&data, offset))
                    .map(|written| slot.set_arg(0, written))
            }
            FdOp::FdRead => {
                let len = slot.arg(0) as usize;
                let read = self.with_descriptor(fd, |d| d.fd_read(len));
                return self.output(slot, read);
            }
            FdOp::FdReaddir => {
                let (buf_len, cookie) = (slot.arg(0) as usize, slot.arg_u64(1));
                let entries = self
                    .with_descriptor(fd, |d| d.fd_readdir(cookie))
                    .map(|entries| encode_dirents(&entries, buf_len));
                return self.output(slot, entries);
            }
            FdOp::FdSeek => {
                let offset = slot.arg_u64(0) as i64;
                match Whence::try_from(slot.arg(2)) {
                    Ok(whence) => self
                        .with_descriptor(fd, |d| d.fd_seek(offset, whence))
                        .map(|position| slot.set_arg_u64(0, position)),
                    Err(errno) => Err(errno),
                }
            }
            FdOp::FdSync => self.with_descriptor(fd, |d| d.fd_sync()),
            FdOp::FdTell => self
                .with_descriptor(fd, |d| d.fd_tell())
                .map(|position| slot.set_arg_u64(0, position)),
            FdOp::FdWrite => {
                let data = self.input(slot, 0)?;
                self.with_descriptor(fd, |d| d.fd_write(&data))
                    .map(|written| slot.set_arg(0, written))
            }
            FdOp::PathCreateDirectory => {
                let path = self.input(slot, 0)?;
                self.with_descriptor(fd, |d| d.path_create_directory(&path))
            }
            FdOp::PathFilestatGet => {
                let flags = slot.arg(0);
                let path = self.input(slot, 1)?;
                self.with_descriptor(fd, |d| d.path_filestat_get(flags, &path))
                    .map(|stat| put_filestat(slot, &stat))
            }
            FdOp::PathFilestatSetTimes => {
                let flags = slot.arg(0);
                let path = self.input(slot, 1)?;
                let (atim, mtim, fst_flags) =
                    (slot.arg_u64(3), slot.arg_u64(5), slot.arg(7) as u16);
                self.with_descriptor(fd, |d| {
                    d.path_filestat_set_times(flags, &path, atim, mtim, fst_flags)
                })
            }
            FdOp::PathLink => {
                let old_flags = slot.arg(0);
                let (old_path, new_path) = self.input_pair(slot, 1)?;
                let new_fd = slot.arg(4);
                self.with_pair(fd, new_fd, |d, new_dir| {
                    d.path_link(old_flags, &old_path, new_dir, &new_path)
                })
            }
            FdOp::PathOpen => return self.open(fd, slot),
            FdOp::PathReadlink => {
                let path = self.input(slot, 0)?;
                let buf_len = slot.arg(2) as usize;
                let target = self.with_descriptor(fd, |d| d.path_readlink(&path)).map(|mut t| {
                    t.truncate(buf_len);
                    t
                });
                return self.output(slot, target);
            }
            FdOp::PathRemoveDirectory => {
                let path = self.input(slot, 0)?;
                self.with_descriptor(fd, |d| d.path_remove_directory(&path))
            }
            FdOp::PathRename => {
                let (old_path, new_path) = self.input_pair(slot, 0)?;
                let new_fd = slot.arg(3);
                self.with_pair(fd, new_fd, |d, new_dir| {
                    d.path_rename(&old_path, new_dir, &new_path)
                })
            }
            FdOp::PathSymlink => {
                let (old_path, new_path) = self.input_pair(slot, 0)?;
                self.with_descriptor(fd, |d| d.path_symlink(&old_path, &new_path))
            }
            FdOp::PathUnlinkFile => {
                let path = self.input(slot, 0)?;
                self.with_descriptor(fd, |d| d.path_unlink_file(&path))
            }
        };
        Ok(result)
    }

    /// Release the descriptor, tell every other watcher, then free the number.
    fn close(&self, fd: u32, closer: u32) -> WasiResult<()> {
        let released = self.slots[fd as usize].lock().take();
        let Some(descriptor) = released else {
            return Err(Errno::BADF);
        };
        drop(descriptor);

        let mut table = self.table.lock();
        let watchers = self.visibility.lock().remove(&fd).unwrap_or_default();
        let max_fds = self.config.max_fds;
        for ref_id in 0..self.seen_refs() {
            let (word, mask) = notice_bit(max_fds, ref_id, Notice::Open, fd);
            self.admin.fetch_and(word, !mask);
        }
        for &ref_id in watchers.iter().filter(|&&id| id != closer) {
            let (word, mask) = notice_bit(max_fds, ref_id, Notice::Close, fd);
            self.admin.fetch_or(word, mask);
        }
        table.in_use[fd as usize] = false;
        debug!(fd, closer, notified = watchers.len(), "closed");
        Ok(())
    }

    fn open(self: &Arc<Self>, fd: u32, slot: &Slot<'_>) -> Result<WasiResult<()>> {
        let dirflags = slot.arg(0);
        let path = self.input(slot, 1)?;
        let oflags = slot.arg(3) as u16;
        let (rights_base, rights_inheriting) = (slot.arg_u64(4), slot.arg_u64(6));
        let fdflags = slot.arg(8) as u16;
        let opener = slot.arg(9);

        let opened = self.with_descriptor(fd, |d| {
            d.path_open(dirflags, &path, oflags, rights_base, rights_inheriting, fdflags)
        });
        let descriptor = match opened {
            Ok(descriptor) => descriptor,
            Err(errno) => return Ok(Err(errno)),
        };
        match self.bind(descriptor, opener)? {
            Some(new_fd) => {
                debug!(dir = fd, new_fd, opener, path = %String::from_utf8_lossy(&path), "opened");
                slot.set_arg(0, new_fd);
                Ok(Ok(()))
            }
            None => Ok(Err(Errno::NFILE)),
        }
    }

    /// Place `descriptor` in the lowest free slot, growing the table if
    /// needed, and announce it to every attached Ref but the opener.
    ///
    /// The slot's loop is listening before this returns.
    fn bind(self: &Arc<Self>, descriptor: Box<dyn Descriptor>, opener: u32) -> Result<Option<u32>> {
        let mut table = self.table.lock();
        let free = (0..table.len).find(|&i| !table.in_use[i as usize]);
        let index = match free {
            Some(index) => index,
            None if table.len < self.config.max_fds => table.len,
            None => {
                warn!(max_fds = self.config.max_fds, "fd table full");
                return Ok(None);
            }
        };
        if !table.listening[index as usize] {
            self.spawn_fd_loop(index)?;
            table.listening[index as usize] = true;
        }

        *self.slots[index as usize].lock() = Some(descriptor);
        table.in_use[index as usize] = true;
        if index == table.len {
            table.len += 1;
            self.admin.store(FDS_LEN, table.len);
        }

        let max_fds = self.config.max_fds;
        let mut visibility = self.visibility.lock();
        let watchers = visibility.entry(index).or_default();
        for ref_id in self.attached_refs() {
            watchers.insert(ref_id);
            if ref_id != opener {
                let (word, mask) = notice_bit(max_fds, ref_id, Notice::Open, index);
                self.admin.fetch_or(word, mask);
            }
        }
        Ok(Some(index))
    }
}
