//! `wasi_snapshot_preview1` and `wasi:thread-spawn` on a wasmtime [`Linker`].
//!
//! Each import decodes its pointers against the guest memory, calls into
//! [`AnimalState`] and encodes the answer back. Guest-visible failures come
//! back as errno values. Host failures (a broken Park, a dead background
//! worker) trap the guest with the [`RuntimeError`] as payload.

use tracing::{debug, warn};
use wasi_farm_park::wasi::eventtype;
use wasi_farm_park::{Errno, WasiResult, Whence};
use wasmtime::{Caller, Linker};

use crate::animal::{AnimalState, Event, Subscription, SubscriptionKind};
use crate::error::{ProcExit, Result, RuntimeError};
use crate::memory::GuestMemory;

const WASI: &str = "wasi_snapshot_preview1";

const SUBSCRIPTION_SIZE: u32 = 48;
const EVENT_SIZE: usize = 32;

type Ctx<'a> = Caller<'a, AnimalState>;

/// Return early with the errno of a failed guest-level step.
macro_rules! guest {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(errno) => return Ok(raw(errno)),
        }
    };
}

fn raw(errno: Errno) -> i32 {
    errno.raw() as i32
}

fn status(result: WasiResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(errno) => raw(errno),
    }
}

fn host<T>(result: Result<T>) -> wasmtime::Result<T> {
    result.map_err(wasmtime::Error::new)
}

fn unit(result: Result<WasiResult<()>>) -> wasmtime::Result<i32> {
    host(result).map(status)
}

fn write_strings(
    caller: &mut Ctx<'_>,
    memory: &GuestMemory,
    strings: &[String],
    ptrs: u32,
    buf: u32,
) -> WasiResult<()> {
    let mut cursor = buf;
    for (i, s) in strings.iter().enumerate() {
        memory.write_u32(&mut *caller, ptrs + 4 * i as u32, cursor)?;
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        memory.write(&mut *caller, cursor, &bytes)?;
        cursor += bytes.len() as u32;
    }
    Ok(())
}

fn write_sizes(
    caller: &mut Ctx<'_>,
    memory: &GuestMemory,
    strings: &[String],
    count_out: u32,
    size_out: u32,
) -> WasiResult<()> {
    let size: usize = strings.iter().map(|s| s.len() + 1).sum();
    memory.write_u32(&mut *caller, count_out, strings.len() as u32)?;
    memory.write_u32(&mut *caller, size_out, size as u32)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Decode one 48-byte `subscription`.
pub fn decode_subscription(bytes: &[u8]) -> WasiResult<Subscription> {
    let userdata = le_u64(&bytes[0..8]);
    let kind = match bytes[8] {
        eventtype::CLOCK => SubscriptionKind::Clock {
            id: le_u32(&bytes[16..20]),
            timeout: le_u64(&bytes[24..32]),
            flags: u16::from_le_bytes([bytes[40], bytes[41]]),
        },
        eventtype::FD_READ => SubscriptionKind::FdRead(le_u32(&bytes[16..20])),
        eventtype::FD_WRITE => SubscriptionKind::FdWrite(le_u32(&bytes[16..20])),
        _ => return Err(Errno::INVAL),
    };
    Ok(Subscription { userdata, kind })
}

/// Encode one 32-byte `event`.
pub fn encode_event(event: &Event) -> [u8; EVENT_SIZE] {
    let mut out = [0u8; EVENT_SIZE];
    out[0..8].copy_from_slice(&event.userdata.to_le_bytes());
    out[8..10].copy_from_slice(&event.error.raw().to_le_bytes());
    out[10] = event.kind;
    out
}

/// Register every import on `linker`.
pub fn add_to_linker(linker: &mut Linker<AnimalState>) -> Result<()> {
    add_process(linker).map_err(|e| RuntimeError::wasm("linker", e))?;
    add_fd(linker).map_err(|e| RuntimeError::wasm("linker", e))?;
    add_path(linker).map_err(|e| RuntimeError::wasm("linker", e))?;
    add_sockets(linker).map_err(|e| RuntimeError::wasm("linker", e))?;
    Ok(())
}

fn add_process(linker: &mut Linker<AnimalState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        WASI,
        "args_get",
        |mut caller: Ctx<'_>, argv: i32, buf: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let args = caller.data().options.args.clone();
            Ok(status(write_strings(&mut caller, &memory, &args, argv as u32, buf as u32)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "args_sizes_get",
        |mut caller: Ctx<'_>, count: i32, size: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let args = caller.data().options.args.clone();
            Ok(status(write_sizes(&mut caller, &memory, &args, count as u32, size as u32)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "environ_get",
        |mut caller: Ctx<'_>, environ: i32, buf: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let env = caller.data().options.env.clone();
            Ok(status(write_strings(&mut caller, &memory, &env, environ as u32, buf as u32)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "environ_sizes_get",
        |mut caller: Ctx<'_>, count: i32, size: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let env = caller.data().options.env.clone();
            Ok(status(write_sizes(&mut caller, &memory, &env, count as u32, size as u32)))
        },
    )?;

    linker.func_wrap(
        WASI,
        "clock_res_get",
        |mut caller: Ctx<'_>, id: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let res = guest!(caller.data().clock_res(id as u32));
            Ok(status(memory.write_u64(&mut caller, out as u32, res)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "clock_time_get",
        |mut caller: Ctx<'_>, id: i32, _precision: i64, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let now = guest!(caller.data().clock_time(id as u32));
            Ok(status(memory.write_u64(&mut caller, out as u32, now)))
        },
    )?;

    linker.func_wrap(
        WASI,
        "random_get",
        |mut caller: Ctx<'_>, buf: i32, len: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            guest!(memory.check_range(&caller, buf as u32, len as u32 as usize));
            let mut bytes = vec![0u8; len as u32 as usize];
            caller.data().random_fill(&mut bytes);
            Ok(status(memory.write(&mut caller, buf as u32, &bytes)))
        },
    )?;

    linker.func_wrap(
        WASI,
        "poll_oneoff",
        |mut caller: Ctx<'_>, subs: i32, events: i32, count: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let len = guest!((count as u32).checked_mul(SUBSCRIPTION_SIZE).ok_or(Errno::INVAL));
            let bytes = guest!(memory.read(&caller, subs as u32, len));
            let subscriptions = guest!(bytes
                .chunks_exact(SUBSCRIPTION_SIZE as usize)
                .map(decode_subscription)
                .collect::<WasiResult<Vec<_>>>());
            let fired = guest!(host(caller.data_mut().poll_oneoff(&subscriptions))?);
            let encoded: Vec<u8> = fired.iter().flat_map(encode_event).collect();
            guest!(memory.write(&mut caller, events as u32, &encoded));
            Ok(status(memory.write_u32(&mut caller, out as u32, fired.len() as u32)))
        },
    )?;

    linker.func_wrap(
        WASI,
        "proc_exit",
        |_caller: Ctx<'_>, code: i32| -> wasmtime::Result<()> {
            Err(wasmtime::Error::new(ProcExit(code)))
        },
    )?;
    linker.func_wrap(WASI, "proc_raise", |_caller: Ctx<'_>, _signal: i32| -> i32 {
        raw(Errno::NOSYS)
    })?;
    linker.func_wrap(WASI, "sched_yield", |_caller: Ctx<'_>| -> i32 {
        std::thread::yield_now();
        0
    })?;

    linker.func_wrap(
        "wasi",
        "thread-spawn",
        |mut caller: Ctx<'_>, start_arg: i32| -> i32 {
            match caller.data_mut().thread_spawn(start_arg) {
                Ok(Ok(tid)) => tid,
                Ok(Err(errno)) => {
                    debug!(%errno, "thread-spawn refused");
                    -raw(errno)
                }
                Err(e) => {
                    warn!(error = %e, "thread-spawn failed");
                    -1
                }
            }
        },
    )?;
    Ok(())
}

fn add_fd(linker: &mut Linker<AnimalState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        WASI,
        "fd_advise",
        |mut caller: Ctx<'_>, fd: i32, offset: i64, len: i64, advice: i32| {
            unit(caller.data_mut().fds.fd_advise(fd as u32, offset as u64, len as u64, advice as u8))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_allocate",
        |mut caller: Ctx<'_>, fd: i32, offset: i64, len: i64| {
            unit(caller.data_mut().fds.fd_allocate(fd as u32, offset as u64, len as u64))
        },
    )?;
    linker.func_wrap(WASI, "fd_close", |mut caller: Ctx<'_>, fd: i32| {
        unit(caller.data_mut().fds.fd_close(fd as u32))
    })?;
    linker.func_wrap(WASI, "fd_datasync", |mut caller: Ctx<'_>, fd: i32| {
        unit(caller.data_mut().fds.fd_datasync(fd as u32))
    })?;
    linker.func_wrap(
        WASI,
        "fd_fdstat_get",
        |mut caller: Ctx<'_>, fd: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let stat = guest!(host(caller.data_mut().fds.fd_fdstat_get(fd as u32))?);
            Ok(status(memory.write(&mut caller, out as u32, &stat.encode())))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_fdstat_set_flags",
        |mut caller: Ctx<'_>, fd: i32, flags: i32| {
            unit(caller.data_mut().fds.fd_fdstat_set_flags(fd as u32, flags as u16))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_fdstat_set_rights",
        |mut caller: Ctx<'_>, fd: i32, base: i64, inheriting: i64| {
            unit(caller.data_mut().fds.fd_fdstat_set_rights(
                fd as u32,
                base as u64,
                inheriting as u64,
            ))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_filestat_get",
        |mut caller: Ctx<'_>, fd: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let stat = guest!(host(caller.data_mut().fds.fd_filestat_get(fd as u32))?);
            Ok(status(memory.write(&mut caller, out as u32, &stat.encode())))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_filestat_set_size",
        |mut caller: Ctx<'_>, fd: i32, size: i64| {
            unit(caller.data_mut().fds.fd_filestat_set_size(fd as u32, size as u64))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_filestat_set_times",
        |mut caller: Ctx<'_>, fd: i32, atim: i64, mtim: i64, flags: i32| {
            unit(caller.data_mut().fds.fd_filestat_set_times(
                fd as u32,
                atim as u64,
                mtim as u64,
                flags as u16,
            ))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_pread",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, offset: i64, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let iovs = guest!(memory.iovecs(&caller, iovs as u32, iovs_len as u32));
            let want: usize = iovs.iter().map(|&(_, len)| len as usize).sum();
            let data = guest!(host(caller.data_mut().fds.fd_pread(fd as u32, want, offset as u64))?);
            let placed = guest!(memory.scatter(&mut caller, &iovs, &data));
            Ok(status(memory.write_u32(&mut caller, out as u32, placed as u32)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_prestat_get",
        |mut caller: Ctx<'_>, fd: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let prestat = guest!(host(caller.data_mut().fds.fd_prestat_get(fd as u32))?);
            Ok(status(memory.write(&mut caller, out as u32, &prestat.encode())))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_prestat_dir_name",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let name = guest!(host(caller.data_mut().fds.fd_prestat_dir_name(fd as u32))?);
            if name.len() > path_len as u32 as usize {
                return Ok(raw(Errno::NAMETOOLONG));
            }
            Ok(status(memory.write(&mut caller, path as u32, &name)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_pwrite",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, offset: i64, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let iovs = guest!(memory.iovecs(&caller, iovs as u32, iovs_len as u32));
            let data = guest!(memory.gather(&caller, &iovs));
            let written = guest!(host(caller.data_mut().fds.fd_pwrite(fd as u32, &data, offset as u64))?);
            Ok(status(memory.write_u32(&mut caller, out as u32, written)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_read",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let iovs = guest!(memory.iovecs(&caller, iovs as u32, iovs_len as u32));
            let want: usize = iovs.iter().map(|&(_, len)| len as usize).sum();
            let data = guest!(host(caller.data_mut().fds.fd_read(fd as u32, want))?);
            let placed = guest!(memory.scatter(&mut caller, &iovs, &data));
            Ok(status(memory.write_u32(&mut caller, out as u32, placed as u32)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_readdir",
        |mut caller: Ctx<'_>, fd: i32, buf: i32, buf_len: i32, cookie: i64, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let buf_len = buf_len as u32 as usize;
            let mut data = guest!(host(caller.data_mut().fds.fd_readdir(fd as u32, buf_len, cookie as u64))?);
            data.truncate(buf_len);
            guest!(memory.write(&mut caller, buf as u32, &data));
            Ok(status(memory.write_u32(&mut caller, out as u32, data.len() as u32)))
        },
    )?;
    linker.func_wrap(WASI, "fd_renumber", |mut caller: Ctx<'_>, from: i32, to: i32| {
        unit(caller.data_mut().fds.fd_renumber(from as u32, to as u32))
    })?;
    linker.func_wrap(
        WASI,
        "fd_seek",
        |mut caller: Ctx<'_>, fd: i32, offset: i64, whence: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let whence = guest!(Whence::try_from(whence as u32));
            let position = guest!(host(caller.data_mut().fds.fd_seek(fd as u32, offset, whence))?);
            Ok(status(memory.write_u64(&mut caller, out as u32, position)))
        },
    )?;
    linker.func_wrap(WASI, "fd_sync", |mut caller: Ctx<'_>, fd: i32| {
        unit(caller.data_mut().fds.fd_sync(fd as u32))
    })?;
    linker.func_wrap(
        WASI,
        "fd_tell",
        |mut caller: Ctx<'_>, fd: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let position = guest!(host(caller.data_mut().fds.fd_tell(fd as u32))?);
            Ok(status(memory.write_u64(&mut caller, out as u32, position)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "fd_write",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let iovs = guest!(memory.iovecs(&caller, iovs as u32, iovs_len as u32));
            let data = guest!(memory.gather(&caller, &iovs));
            let written = guest!(host(caller.data_mut().fds.fd_write(fd as u32, &data))?);
            Ok(status(memory.write_u32(&mut caller, out as u32, written)))
        },
    )?;
    Ok(())
}

fn add_path(linker: &mut Linker<AnimalState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        WASI,
        "path_create_directory",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let path = guest!(memory.read(&caller, path as u32, path_len as u32));
            unit(caller.data_mut().fds.path_create_directory(fd as u32, &path))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_filestat_get",
        |mut caller: Ctx<'_>, fd: i32, flags: i32, path: i32, path_len: i32, out: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let path = guest!(memory.read(&caller, path as u32, path_len as u32));
            let stat = guest!(host(caller.data_mut().fds.path_filestat_get(fd as u32, flags as u32, &path))?);
            Ok(status(memory.write(&mut caller, out as u32, &stat.encode())))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_filestat_set_times",
        |mut caller: Ctx<'_>,
         fd: i32,
         flags: i32,
         path: i32,
         path_len: i32,
         atim: i64,
         mtim: i64,
         fst_flags: i32|
         -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let path = guest!(memory.read(&caller, path as u32, path_len as u32));
            unit(caller.data_mut().fds.path_filestat_set_times(
                fd as u32,
                flags as u32,
                &path,
                atim as u64,
                mtim as u64,
                fst_flags as u16,
            ))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_link",
        |mut caller: Ctx<'_>,
         old_fd: i32,
         old_flags: i32,
         old_path: i32,
         old_len: i32,
         new_fd: i32,
         new_path: i32,
         new_len: i32|
         -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let old_path = guest!(memory.read(&caller, old_path as u32, old_len as u32));
            let new_path = guest!(memory.read(&caller, new_path as u32, new_len as u32));
            unit(caller.data_mut().fds.path_link(
                old_fd as u32,
                old_flags as u32,
                &old_path,
                new_fd as u32,
                &new_path,
            ))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_open",
        |mut caller: Ctx<'_>,
         fd: i32,
         dirflags: i32,
         path: i32,
         path_len: i32,
         oflags: i32,
         rights_base: i64,
         rights_inheriting: i64,
         fdflags: i32,
         out: i32|
         -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let path = guest!(memory.read(&caller, path as u32, path_len as u32));
            let opened = guest!(host(caller.data_mut().fds.path_open(
                fd as u32,
                dirflags as u32,
                &path,
                oflags as u16,
                rights_base as u64,
                rights_inheriting as u64,
                fdflags as u16,
            ))?);
            Ok(status(memory.write_u32(&mut caller, out as u32, opened)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_readlink",
        |mut caller: Ctx<'_>,
         fd: i32,
         path: i32,
         path_len: i32,
         buf: i32,
         buf_len: i32,
         out: i32|
         -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let path = guest!(memory.read(&caller, path as u32, path_len as u32));
            let buf_len = buf_len as u32 as usize;
            let mut target = guest!(host(caller.data_mut().fds.path_readlink(fd as u32, &path, buf_len))?);
            target.truncate(buf_len);
            guest!(memory.write(&mut caller, buf as u32, &target));
            Ok(status(memory.write_u32(&mut caller, out as u32, target.len() as u32)))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_remove_directory",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let path = guest!(memory.read(&caller, path as u32, path_len as u32));
            unit(caller.data_mut().fds.path_remove_directory(fd as u32, &path))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_rename",
        |mut caller: Ctx<'_>,
         fd: i32,
         old_path: i32,
         old_len: i32,
         new_fd: i32,
         new_path: i32,
         new_len: i32|
         -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let old_path = guest!(memory.read(&caller, old_path as u32, old_len as u32));
            let new_path = guest!(memory.read(&caller, new_path as u32, new_len as u32));
            unit(caller.data_mut().fds.path_rename(fd as u32, &old_path, new_fd as u32, &new_path))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_symlink",
        |mut caller: Ctx<'_>,
         old_path: i32,
         old_len: i32,
         fd: i32,
         new_path: i32,
         new_len: i32|
         -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let old_path = guest!(memory.read(&caller, old_path as u32, old_len as u32));
            let new_path = guest!(memory.read(&caller, new_path as u32, new_len as u32));
            unit(caller.data_mut().fds.path_symlink(&old_path, fd as u32, &new_path))
        },
    )?;
    linker.func_wrap(
        WASI,
        "path_unlink_file",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| -> wasmtime::Result<i32> {
            let memory = GuestMemory::of(&mut caller)?;
            let path = guest!(memory.read(&caller, path as u32, path_len as u32));
            unit(caller.data_mut().fds.path_unlink_file(fd as u32, &path))
        },
    )?;
    Ok(())
}

/// Network sockets are not supported; every socket import reports `ENOSYS`.
fn add_sockets(linker: &mut Linker<AnimalState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        WASI,
        "sock_accept",
        |_caller: Ctx<'_>, _fd: i32, _flags: i32, _out: i32| -> i32 { raw(Errno::NOSYS) },
    )?;
    linker.func_wrap(
        WASI,
        "sock_recv",
        |_caller: Ctx<'_>, _fd: i32, _data: i32, _len: i32, _flags: i32, _out: i32, _out_flags: i32| -> i32 {
            raw(Errno::NOSYS)
        },
    )?;
    linker.func_wrap(
        WASI,
        "sock_send",
        |_caller: Ctx<'_>, _fd: i32, _data: i32, _len: i32, _flags: i32, _out: i32| -> i32 {
            raw(Errno::NOSYS)
        },
    )?;
    linker.func_wrap(
        WASI,
        "sock_shutdown",
        |_caller: Ctx<'_>, _fd: i32, _how: i32| -> i32 { raw(Errno::NOSYS) },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_subscription_layout() {
        let mut bytes = [0u8; 48];
        bytes[0..8].copy_from_slice(&7u64.to_le_bytes());
        bytes[8] = eventtype::CLOCK;
        bytes[16..20].copy_from_slice(&1u32.to_le_bytes());
        bytes[24..32].copy_from_slice(&5_000u64.to_le_bytes());
        bytes[40..42].copy_from_slice(&1u16.to_le_bytes());

        let sub = decode_subscription(&bytes).unwrap();
        assert_eq!(sub.userdata, 7);
        assert_eq!(
            sub.kind,
            SubscriptionKind::Clock {
                id: 1,
                timeout: 5_000,
                flags: 1
            }
        );
    }

    #[test]
    fn unknown_subscription_tag_is_inval() {
        let mut bytes = [0u8; 48];
        bytes[8] = 9;
        assert_eq!(decode_subscription(&bytes), Err(Errno::INVAL));
    }

    #[test]
    fn event_layout() {
        let event = Event {
            userdata: 0x0102,
            error: Errno::BADF,
            kind: eventtype::FD_READ,
        };
        let bytes = encode_event(&event);
        assert_eq!(le_u64(&bytes[0..8]), 0x0102);
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), 8);
        assert_eq!(bytes[10], eventtype::FD_READ);
        assert!(bytes[11..].iter().all(|b| *b == 0));
    }
}
