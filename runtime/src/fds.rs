//! One virtual fd space stitched together from several Parks.
//!
//! Each worker sees descriptors as small integers. Behind each number sits a
//! remote fd in some Park, reached through that Park's [`Ref`]. Fds 0, 1 and 2
//! are always stdio; everything else is handed out lowest-free from 3 up.
//!
//! Other workers may close or open fds behind our back. The Parks leave a note
//! in each Ref's bitmaps and the table applies them lazily: every operation
//! drains the notes before it resolves its fd, so a closed fd turns into
//! `ERRNO_BADF` on its next use.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use wasi_farm_park::wasi::{Advice, Fstflags};
use wasi_farm_park::{
    Errno, Fdflags, Fdstat, Filestat, Lookupflags, Oflags, Prestat, Ref, RefObject, Rights,
    WasiResult, Whence,
};

use crate::config::FarmConfig;
use crate::error::{Result, RuntimeError};

/// Where a virtual fd really lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdEntry {
    /// Index of the Ref (and its Park) in the table.
    pub park: usize,
    /// The fd number inside that Park.
    pub remote: u32,
}

/// How a table fills its map at construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FdSeed {
    /// Stdio from the first Park declaring each slot, then every Park's
    /// allow-list from fd 3 up.
    #[default]
    Initial,
    /// Copy another worker's map, as a thread-spawned sibling does.
    Snapshot(Vec<Option<FdEntry>>),
}

/// The per-worker fd map and the Refs behind it.
#[derive(Debug)]
pub struct FdTable {
    refs: Vec<Ref>,
    map: Vec<Option<FdEntry>>,
}

impl FdTable {
    /// Attach one Ref per object and build the map described by `seed`.
    pub fn new(objects: Vec<RefObject>, seed: FdSeed, config: &FarmConfig) -> Result<Self> {
        let refs = objects
            .into_iter()
            .map(|object| {
                Ok(Ref::new(object)?
                    .with_timeout(config.call_timeout)
                    .with_dual_lock_mode(config.dual_lock_mode()))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut table = Self {
            refs,
            map: vec![None; 3],
        };
        match seed {
            FdSeed::Initial => table.seed_initial()?,
            FdSeed::Snapshot(entries) => table.seed_snapshot(entries)?,
        }
        table.register_all()?;
        debug!(refs = table.refs.len(), fds = table.map.len(), "fd table ready");
        Ok(table)
    }

    fn seed_initial(&mut self) -> Result<()> {
        for slot in 0..3u32 {
            let found = self.refs.iter().enumerate().find_map(|(park, r)| {
                r.object().stdio()[slot as usize].map(|remote| FdEntry { park, remote })
            });
            self.map[slot as usize] = Some(found.ok_or(RuntimeError::MissingStdio(slot))?);
        }
        for park in 0..self.refs.len() {
            let stdio = self.refs[park].object().stdio();
            let allowed: Vec<u32> = self.refs[park].object().allow_list().to_vec();
            for remote in allowed {
                if stdio.contains(&Some(remote)) {
                    continue;
                }
                self.map_remote(park, remote);
            }
        }
        Ok(())
    }

    fn seed_snapshot(&mut self, entries: Vec<Option<FdEntry>>) -> Result<()> {
        let parks = self.refs.len();
        self.map = entries
            .into_iter()
            .map(|entry| entry.filter(|e| e.park < parks))
            .collect();
        self.map.resize(self.map.len().max(3), None);
        for slot in 0..3u32 {
            if self.map[slot as usize].is_none() {
                return Err(RuntimeError::MissingStdio(slot));
            }
        }
        Ok(())
    }

    /// Ask each Park to tell us when our fds close. Fds already gone are
    /// dropped from the map.
    fn register_all(&mut self) -> Result<()> {
        let entries: Vec<(usize, FdEntry)> = self
            .map
            .iter()
            .enumerate()
            .filter_map(|(fd, entry)| entry.map(|e| (fd, e)))
            .collect();
        for (fd, entry) in entries {
            if let Err(errno) = self.refs[entry.park].register_visibility(entry.remote)? {
                debug!(fd, remote = entry.remote, %errno, "initial fd already closed");
                self.map[fd] = None;
            }
        }
        Ok(())
    }

    pub fn refs(&self) -> &[Ref] {
        &self.refs
    }

    /// Where `fd` points right now, without draining notifications.
    pub fn entry(&self, fd: u32) -> Option<FdEntry> {
        self.map.get(fd as usize).copied().flatten()
    }

    /// The virtual fd mapped to `remote` in Park `park`, if any.
    pub fn lookup(&self, park: usize, remote: u32) -> Option<u32> {
        self.map
            .iter()
            .position(|entry| *entry == Some(FdEntry { park, remote }))
            .map(|fd| fd as u32)
    }

    pub fn snapshot(&self) -> Vec<Option<FdEntry>> {
        self.map.clone()
    }

    /// Apply every pending close and open notification.
    ///
    /// Closes go first so that a remote number closed and reused since the
    /// last check ends up mapped to a fresh virtual fd.
    pub fn check_fds(&mut self) -> Result<()> {
        for park in 0..self.refs.len() {
            let notes = self.refs[park].take_notifications();
            for remote in notes.closed {
                if let Some(fd) = self.lookup(park, remote) {
                    trace!(fd, park, remote, "fd closed elsewhere");
                    self.map[fd as usize] = None;
                }
            }
            for remote in notes.opened {
                let fd = self.map_remote(park, remote);
                trace!(fd, park, remote, "fd opened elsewhere");
            }
        }
        Ok(())
    }

    fn map_remote(&mut self, park: usize, remote: u32) -> u32 {
        if let Some(fd) = self.lookup(park, remote) {
            return fd;
        }
        let entry = Some(FdEntry { park, remote });
        match self.map.iter().skip(3).position(Option::is_none) {
            Some(free) => {
                self.map[free + 3] = entry;
                (free + 3) as u32
            }
            None => {
                self.map.push(entry);
                (self.map.len() - 1) as u32
            }
        }
    }

    fn resolve(&self, fd: u32) -> WasiResult<FdEntry> {
        self.entry(fd).ok_or(Errno::BADF)
    }

    fn with_fd<T>(
        &mut self,
        fd: u32,
        op: impl FnOnce(&Ref, u32) -> wasi_farm_park::Result<WasiResult<T>>,
    ) -> Result<WasiResult<T>> {
        self.check_fds()?;
        let entry = match self.resolve(fd) {
            Ok(entry) => entry,
            Err(errno) => return Ok(Err(errno)),
        };
        Ok(op(&self.refs[entry.park], entry.remote)?)
    }

    /// Resolve two fds that must live in the same Park.
    fn with_pair<T>(
        &mut self,
        fd: u32,
        other: u32,
        op: impl FnOnce(&Ref, u32, u32) -> wasi_farm_park::Result<WasiResult<T>>,
    ) -> Result<WasiResult<T>> {
        self.check_fds()?;
        let (a, b) = match (self.resolve(fd), self.resolve(other)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(errno), _) | (_, Err(errno)) => return Ok(Err(errno)),
        };
        if a.park != b.park {
            debug!(fd, other, "two-fd operation across parks");
            return Ok(Err(Errno::BADF));
        }
        Ok(op(&self.refs[a.park], a.remote, b.remote)?)
    }

    pub fn fd_advise(
        &mut self,
        fd: u32,
        offset: u64,
        len: u64,
        advice: Advice,
    ) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_advise(remote, offset, len, advice))
    }

    pub fn fd_allocate(&mut self, fd: u32, offset: u64, len: u64) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_allocate(remote, offset, len))
    }

    /// Close `fd` in its Park and forget it here. Other workers learn of the
    /// close through their own notifications.
    pub fn fd_close(&mut self, fd: u32) -> Result<WasiResult<()>> {
        let result = self.with_fd(fd, |r, remote| r.fd_close(remote))?;
        if matches!(result, Ok(()) | Err(Errno::BADF)) {
            if let Some(slot) = self.map.get_mut(fd as usize) {
                *slot = None;
            }
        }
        Ok(result)
    }

    pub fn fd_datasync(&mut self, fd: u32) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_datasync(remote))
    }

    pub fn fd_fdstat_get(&mut self, fd: u32) -> Result<WasiResult<Fdstat>> {
        self.with_fd(fd, |r, remote| r.fd_fdstat_get(remote))
    }

    pub fn fd_fdstat_set_flags(&mut self, fd: u32, flags: Fdflags) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_fdstat_set_flags(remote, flags))
    }

    pub fn fd_fdstat_set_rights(
        &mut self,
        fd: u32,
        base: Rights,
        inheriting: Rights,
    ) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_fdstat_set_rights(remote, base, inheriting))
    }

    pub fn fd_filestat_get(&mut self, fd: u32) -> Result<WasiResult<Filestat>> {
        self.with_fd(fd, |r, remote| r.fd_filestat_get(remote))
    }

    pub fn fd_filestat_set_size(&mut self, fd: u32, size: u64) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_filestat_set_size(remote, size))
    }

    pub fn fd_filestat_set_times(
        &mut self,
        fd: u32,
        atim: u64,
        mtim: u64,
        flags: Fstflags,
    ) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_filestat_set_times(remote, atim, mtim, flags))
    }

    pub fn fd_pread(&mut self, fd: u32, len: usize, offset: u64) -> Result<WasiResult<Vec<u8>>> {
        self.with_fd(fd, |r, remote| r.fd_pread(remote, len, offset))
    }

    pub fn fd_prestat_get(&mut self, fd: u32) -> Result<WasiResult<Prestat>> {
        self.with_fd(fd, |r, remote| r.fd_prestat_get(remote))
    }

    pub fn fd_prestat_dir_name(&mut self, fd: u32) -> Result<WasiResult<Vec<u8>>> {
        self.with_fd(fd, |r, remote| r.fd_prestat_dir_name(remote))
    }

    pub fn fd_pwrite(&mut self, fd: u32, data: &[u8], offset: u64) -> Result<WasiResult<u32>> {
        self.with_fd(fd, |r, remote| r.fd_pwrite(remote, data, offset))
    }

    pub fn fd_read(&mut self, fd: u32, len: usize) -> Result<WasiResult<Vec<u8>>> {
        self.with_fd(fd, |r, remote| r.fd_read(remote, len))
    }

    pub fn fd_readdir(
        &mut self,
        fd: u32,
        buf_len: usize,
        cookie: u64,
    ) -> Result<WasiResult<Vec<u8>>> {
        self.with_fd(fd, |r, remote| r.fd_readdir(remote, buf_len, cookie))
    }

    /// Make `to` refer to what `from` refers to, closing `to`'s old target.
    pub fn fd_renumber(&mut self, from: u32, to: u32) -> Result<WasiResult<()>> {
        self.check_fds()?;
        let (source, target) = match (self.resolve(from), self.resolve(to)) {
            (Ok(source), Ok(target)) => (source, target),
            (Err(errno), _) | (_, Err(errno)) => return Ok(Err(errno)),
        };
        if from == to {
            return Ok(Ok(()));
        }
        if let Err(errno) = self.refs[target.park].fd_close(target.remote)? {
            if errno != Errno::BADF {
                return Ok(Err(errno));
            }
        }
        self.map[to as usize] = Some(source);
        self.map[from as usize] = None;
        Ok(Ok(()))
    }

    pub fn fd_seek(&mut self, fd: u32, offset: i64, whence: Whence) -> Result<WasiResult<u64>> {
        self.with_fd(fd, |r, remote| r.fd_seek(remote, offset, whence))
    }

    pub fn fd_sync(&mut self, fd: u32) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.fd_sync(remote))
    }

    pub fn fd_tell(&mut self, fd: u32) -> Result<WasiResult<u64>> {
        self.with_fd(fd, |r, remote| r.fd_tell(remote))
    }

    pub fn fd_write(&mut self, fd: u32, data: &[u8]) -> Result<WasiResult<u32>> {
        self.with_fd(fd, |r, remote| r.fd_write(remote, data))
    }

    pub fn path_create_directory(&mut self, fd: u32, path: &[u8]) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.path_create_directory(remote, path))
    }

    pub fn path_filestat_get(
        &mut self,
        fd: u32,
        flags: Lookupflags,
        path: &[u8],
    ) -> Result<WasiResult<Filestat>> {
        self.with_fd(fd, |r, remote| r.path_filestat_get(remote, flags, path))
    }

    pub fn path_filestat_set_times(
        &mut self,
        fd: u32,
        flags: Lookupflags,
        path: &[u8],
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| {
            r.path_filestat_set_times(remote, flags, path, atim, mtim, fst_flags)
        })
    }

    pub fn path_link(
        &mut self,
        fd: u32,
        old_flags: Lookupflags,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<WasiResult<()>> {
        self.with_pair(fd, new_fd, |r, remote, new_remote| {
            r.path_link(remote, old_flags, old_path, new_remote, new_path)
        })
    }

    /// Open `path` under `fd` and map the new remote fd.
    #[allow(clippy::too_many_arguments)]
    pub fn path_open(
        &mut self,
        fd: u32,
        dirflags: Lookupflags,
        path: &[u8],
        oflags: Oflags,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
    ) -> Result<WasiResult<u32>> {
        self.check_fds()?;
        let dir = match self.resolve(fd) {
            Ok(entry) => entry,
            Err(errno) => return Ok(Err(errno)),
        };
        let opened = self.refs[dir.park].path_open(
            dir.remote,
            dirflags,
            path,
            oflags,
            rights_base,
            rights_inheriting,
            fdflags,
        )?;
        let remote = match opened {
            Ok(remote) => remote,
            Err(errno) => return Ok(Err(errno)),
        };
        let park = dir.park;
        // A stale mapping of a reused remote number must go before we map it.
        self.check_fds()?;
        let new_fd = self.map_remote(park, remote);
        if let Err(errno) = self.refs[park].register_visibility(remote)? {
            debug!(fd = new_fd, remote, %errno, "opened fd vanished before registering");
            self.map[new_fd as usize] = None;
            return Ok(Err(errno));
        }
        Ok(Ok(new_fd))
    }

    pub fn path_readlink(
        &mut self,
        fd: u32,
        path: &[u8],
        buf_len: usize,
    ) -> Result<WasiResult<Vec<u8>>> {
        self.with_fd(fd, |r, remote| r.path_readlink(remote, path, buf_len))
    }

    pub fn path_remove_directory(&mut self, fd: u32, path: &[u8]) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.path_remove_directory(remote, path))
    }

    pub fn path_rename(
        &mut self,
        fd: u32,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<WasiResult<()>> {
        self.with_pair(fd, new_fd, |r, remote, new_remote| {
            r.path_rename(remote, old_path, new_remote, new_path)
        })
    }

    pub fn path_symlink(
        &mut self,
        old_path: &[u8],
        fd: u32,
        new_path: &[u8],
    ) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.path_symlink(old_path, remote, new_path))
    }

    pub fn path_unlink_file(&mut self, fd: u32, path: &[u8]) -> Result<WasiResult<()>> {
        self.with_fd(fd, |r, remote| r.path_unlink_file(remote, path))
    }
}
