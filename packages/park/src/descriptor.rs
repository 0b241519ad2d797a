//! The capability set a Park needs from a real descriptor.
//!
//! Implementations only override what they support; every default returns
//! the errno a POSIX system would give for an unsupported operation on that
//! kind of object.

use std::any::Any;

use crate::wasi::{
    rights, Advice, DirEntry, Errno, Fdflags, Fdstat, Filestat, Filetype, Fstflags, Lookupflags,
    Oflags, Prestat, Rights, WasiResult, Whence,
};

/// A real descriptor owned by a Park.
///
/// Methods take `&mut self`: a Park serializes every call on one fd, so
/// implementations do not need interior locking for per-fd state.
pub trait Descriptor: Send {
    fn filetype(&self) -> Filetype;

    fn as_any(&self) -> &dyn Any;

    fn fd_advise(&mut self, _offset: u64, _len: u64, _advice: Advice) -> WasiResult<()> {
        Ok(())
    }

    fn fd_allocate(&mut self, _offset: u64, _len: u64) -> WasiResult<()> {
        Err(Errno::NOTSUP)
    }

    fn fd_datasync(&mut self) -> WasiResult<()> {
        Ok(())
    }

    fn fd_fdstat_get(&mut self) -> WasiResult<Fdstat> {
        Ok(Fdstat {
            filetype: self.filetype(),
            flags: 0,
            rights_base: rights::ALL,
            rights_inheriting: rights::ALL,
        })
    }

    fn fd_fdstat_set_flags(&mut self, _flags: Fdflags) -> WasiResult<()> {
        Err(Errno::NOTSUP)
    }

    fn fd_fdstat_set_rights(&mut self, _base: Rights, _inheriting: Rights) -> WasiResult<()> {
        Ok(())
    }

    fn fd_filestat_get(&mut self) -> WasiResult<Filestat> {
        Ok(Filestat {
            filetype: self.filetype(),
            nlink: 1,
            ..Default::default()
        })
    }

    fn fd_filestat_set_size(&mut self, _size: u64) -> WasiResult<()> {
        Err(Errno::BADF)
    }

    fn fd_filestat_set_times(&mut self, _atim: u64, _mtim: u64, _flags: Fstflags) -> WasiResult<()> {
        Err(Errno::NOTSUP)
    }

    fn fd_pread(&mut self, _len: usize, _offset: u64) -> WasiResult<Vec<u8>> {
        Err(Errno::SPIPE)
    }

    fn fd_prestat_get(&mut self) -> WasiResult<Prestat> {
        Err(Errno::BADF)
    }

    fn fd_prestat_dir_name(&mut self) -> WasiResult<Vec<u8>> {
        Err(Errno::BADF)
    }

    fn fd_pwrite(&mut self, _data: &[u8], _offset: u64) -> WasiResult<u32> {
        Err(Errno::SPIPE)
    }

    fn fd_read(&mut self, _len: usize) -> WasiResult<Vec<u8>> {
        Err(Errno::BADF)
    }

    /// Entries starting at `cookie`; each entry's `next` is the cookie after it.
    fn fd_readdir(&mut self, _cookie: u64) -> WasiResult<Vec<DirEntry>> {
        Err(Errno::NOTDIR)
    }

    fn fd_seek(&mut self, _offset: i64, _whence: Whence) -> WasiResult<u64> {
        Err(Errno::SPIPE)
    }

    fn fd_sync(&mut self) -> WasiResult<()> {
        Ok(())
    }

    fn fd_tell(&mut self) -> WasiResult<u64> {
        self.fd_seek(0, Whence::Cur)
    }

    fn fd_write(&mut self, _data: &[u8]) -> WasiResult<u32> {
        Err(Errno::BADF)
    }

    fn path_create_directory(&mut self, _path: &[u8]) -> WasiResult<()> {
        Err(Errno::NOTDIR)
    }

    fn path_filestat_get(&mut self, _flags: Lookupflags, _path: &[u8]) -> WasiResult<Filestat> {
        Err(Errno::NOTDIR)
    }

    fn path_filestat_set_times(
        &mut self,
        _flags: Lookupflags,
        _path: &[u8],
        _atim: u64,
        _mtim: u64,
        _fst_flags: Fstflags,
    ) -> WasiResult<()> {
        Err(Errno::NOTDIR)
    }

    /// `new_dir` is `None` when source and destination are the same fd.
    fn path_link(
        &mut self,
        _old_flags: Lookupflags,
        _old_path: &[u8],
        _new_dir: Option<&dyn Descriptor>,
        _new_path: &[u8],
    ) -> WasiResult<()> {
        Err(Errno::NOTDIR)
    }

    fn path_open(
        &mut self,
        _dirflags: Lookupflags,
        _path: &[u8],
        _oflags: Oflags,
        _rights_base: Rights,
        _rights_inheriting: Rights,
        _fdflags: Fdflags,
    ) -> WasiResult<Box<dyn Descriptor>> {
        Err(Errno::NOTDIR)
    }

    fn path_readlink(&mut self, _path: &[u8]) -> WasiResult<Vec<u8>> {
        Err(Errno::NOTDIR)
    }

    fn path_remove_directory(&mut self, _path: &[u8]) -> WasiResult<()> {
        Err(Errno::NOTDIR)
    }

    /// `new_dir` is `None` when source and destination are the same fd.
    fn path_rename(
        &mut self,
        _old_path: &[u8],
        _new_dir: Option<&dyn Descriptor>,
        _new_path: &[u8],
    ) -> WasiResult<()> {
        Err(Errno::NOTDIR)
    }

    fn path_symlink(&mut self, _old_path: &[u8], _new_path: &[u8]) -> WasiResult<()> {
        Err(Errno::NOTDIR)
    }

    fn path_unlink_file(&mut self, _path: &[u8]) -> WasiResult<()> {
        Err(Errno::NOTDIR)
    }
}
