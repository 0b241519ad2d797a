//! Guest linear memory access for host imports.
//!
//! Out-of-bounds pointers become `ERRNO_FAULT` for the guest, never a trap.

use std::cell::UnsafeCell;

use wasi_farm_park::{Errno, WasiResult};
use wasmtime::{AsContext, AsContextMut, Caller, Extern, Memory, SharedMemory};

use crate::animal::AnimalState;

/// The memory a guest's pointers refer to.
#[derive(Clone)]
pub enum GuestMemory {
    Private(Memory),
    Shared(SharedMemory),
}

impl GuestMemory {
    /// Resolve the calling instance's memory: the farm's shared memory when
    /// there is one, otherwise the `memory` export.
    pub fn of(caller: &mut Caller<'_, AnimalState>) -> wasmtime::Result<Self> {
        if let Some(shared) = caller.data().memory.clone() {
            return Ok(GuestMemory::Shared(shared));
        }
        match caller.get_export("memory") {
            Some(Extern::Memory(memory)) => Ok(GuestMemory::Private(memory)),
            Some(Extern::SharedMemory(memory)) => Ok(GuestMemory::Shared(memory)),
            _ => Err(wasmtime::Error::msg("guest exports no memory")),
        }
    }

    /// Start of `ptr..ptr + len` if the whole range lies inside the memory.
    pub fn check_range(&self, store: impl AsContext, ptr: u32, len: usize) -> WasiResult<usize> {
        let start = ptr as usize;
        let end = start.checked_add(len).ok_or(Errno::FAULT)?;
        let size = match self {
            GuestMemory::Private(memory) => memory.data_size(store),
            GuestMemory::Shared(memory) => memory.data().len(),
        };
        if end > size {
            return Err(Errno::FAULT);
        }
        Ok(start)
    }

    pub fn read(&self, store: impl AsContext, ptr: u32, len: u32) -> WasiResult<Vec<u8>> {
        let start = self.check_range(&store, ptr, len as usize)?;
        let mut out = vec![0u8; len as usize];
        match self {
            GuestMemory::Private(memory) => memory
                .read(store, start, &mut out)
                .map_err(|_| Errno::FAULT)?,
            GuestMemory::Shared(memory) => {
                let cells = &memory.data()[start..start + out.len()];
                // SAFETY: the range is in bounds; other threads may race on
                // these bytes exactly as the guest's own plain loads would.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        UnsafeCell::raw_get(cells.as_ptr()),
                        out.as_mut_ptr(),
                        out.len(),
                    );
                }
            }
        }
        Ok(out)
    }

    pub fn write(&self, store: impl AsContextMut, ptr: u32, data: &[u8]) -> WasiResult<()> {
        match self {
            GuestMemory::Private(memory) => memory
                .write(store, ptr as usize, data)
                .map_err(|_| Errno::FAULT),
            GuestMemory::Shared(memory) => {
                let start = self.check_range(&store, ptr, data.len())?;
                let cells = &memory.data()[start..start + data.len()];
                // SAFETY: as in `read`; `UnsafeCell` permits the write.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        UnsafeCell::raw_get(cells.as_ptr()),
                        data.len(),
                    );
                }
                Ok(())
            }
        }
    }

    pub fn read_u32(&self, store: impl AsContext, ptr: u32) -> WasiResult<u32> {
        let bytes = self.read(store, ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, store: impl AsContext, ptr: u32) -> WasiResult<u64> {
        let bytes = self.read(store, ptr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_u32(&self, store: impl AsContextMut, ptr: u32, value: u32) -> WasiResult<()> {
        self.write(store, ptr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, store: impl AsContextMut, ptr: u32, value: u64) -> WasiResult<()> {
        self.write(store, ptr, &value.to_le_bytes())
    }

    /// Decode an `iovec`/`ciovec` array into `(buf, len)` pairs.
    pub fn iovecs(
        &self,
        store: impl AsContext,
        ptr: u32,
        count: u32,
    ) -> WasiResult<Vec<(u32, u32)>> {
        let raw = self.read(store, ptr, count.checked_mul(8).ok_or(Errno::FAULT)?)?;
        Ok(raw
            .chunks_exact(8)
            .map(|pair| {
                let buf = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
                let len = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
                (buf, len)
            })
            .collect())
    }

    /// Concatenate the bytes a `ciovec` array points at.
    pub fn gather(&self, store: impl AsContext, iovs: &[(u32, u32)]) -> WasiResult<Vec<u8>> {
        let store = store.as_context();
        let mut out = Vec::new();
        for &(buf, len) in iovs {
            out.extend(self.read(&store, buf, len)?);
        }
        Ok(out)
    }

    /// Spread `data` over an `iovec` array, returning how much was placed.
    pub fn scatter(
        &self,
        mut store: impl AsContextMut,
        iovs: &[(u32, u32)],
        data: &[u8],
    ) -> WasiResult<usize> {
        let mut store = store.as_context_mut();
        let mut placed = 0;
        for &(buf, len) in iovs {
            if placed == data.len() {
                break;
            }
            let take = (len as usize).min(data.len() - placed);
            self.write(&mut store, buf, &data[placed..placed + take])?;
            placed += take;
        }
        Ok(placed)
    }
}
