//! Word offsets shared by Park and Ref.
//!
//! Both sides must change together; nothing here is negotiated at runtime.
//!
//! Every call site (one per fd, plus the admin site) is a block of
//! [`BLOCK_WORDS`] words:
//!
//! | word | meaning |
//! |---|---|
//! | 0 | fd lock |
//! | 1 | call state |
//! | 2 | listener presence |
//! | 3 | function id (first word of the 18-word slot) |
//! | 4..=20 | arguments and results |
//! | 21 | errno |

use std::time::Duration;

use tracing::trace;
use wasi_farm_shm::{Allocator, SharedSegment};

use crate::error::{FarmError, Result};
use crate::wasi::{Errno, Fdstat, Filestat, Filetype, Prestat};

pub const SLOT_WORDS: usize = 18;
pub const ARG_WORDS: usize = SLOT_WORDS - 1;
pub const BLOCK_WORDS: usize = 3 + SLOT_WORDS + 1;

/// Errno word value meaning the Park rejected the call as corrupt.
pub const PROTOCOL_FAULT: u32 = u32::MAX;

/// Ref id used when an operation has no originating Ref.
pub const NO_REF: u32 = u32::MAX;

// Admin segment.
/// One past the highest ref id ever handed out.
pub const REF_IDS_SEEN: usize = 0;
pub const FDS_LEN: usize = 1;
pub const ADMIN_BLOCK: usize = 2;
pub const BITMAPS: usize = ADMIN_BLOCK + BLOCK_WORDS;

/// One call site within a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    base: usize,
}

impl Block {
    pub fn fd(fd: u32) -> Self {
        Self {
            base: fd as usize * BLOCK_WORDS,
        }
    }

    pub fn admin() -> Self {
        Self { base: ADMIN_BLOCK }
    }

    pub fn lock(&self) -> usize {
        self.base
    }

    /// Base of the Caller/Listener word pair.
    pub fn call(&self) -> usize {
        self.base + 1
    }

    pub fn func(&self) -> usize {
        self.base + 3
    }

    pub fn arg(&self, i: usize) -> usize {
        debug_assert!(i < ARG_WORDS);
        self.base + 4 + i
    }

    pub fn errno(&self) -> usize {
        self.base + 3 + SLOT_WORDS
    }
}

/// Typed access to one block's slot.
pub struct Slot<'a> {
    segment: &'a SharedSegment,
    block: Block,
}

impl<'a> Slot<'a> {
    pub fn new(segment: &'a SharedSegment, block: Block) -> Self {
        Self { segment, block }
    }

    pub fn func(&self) -> u32 {
        self.segment.load(self.block.func())
    }

    pub fn set_func(&self, id: u32) {
        self.segment.store(self.block.func(), id);
    }

    pub fn arg(&self, i: usize) -> u32 {
        self.segment.load(self.block.arg(i))
    }

    pub fn set_arg(&self, i: usize, value: u32) {
        self.segment.store(self.block.arg(i), value);
    }

    /// 64-bit value in argument words `i` and `i + 1`.
    pub fn arg_u64(&self, i: usize) -> u64 {
        debug_assert!(i + 1 < ARG_WORDS);
        self.segment.load_u64(self.block.arg(i))
    }

    pub fn set_arg_u64(&self, i: usize, value: u64) {
        debug_assert!(i + 1 < ARG_WORDS);
        self.segment.store_u64(self.block.arg(i), value);
    }

    pub fn errno_raw(&self) -> u32 {
        self.segment.load(self.block.errno())
    }

    pub fn set_errno(&self, errno: Errno) {
        self.segment.store(self.block.errno(), errno.raw() as u32);
    }

    pub fn set_protocol_fault(&self) {
        self.segment.store(self.block.errno(), PROTOCOL_FAULT);
    }
}

/// `fdstat` results occupy argument words 0..6.
pub fn put_fdstat(slot: &Slot<'_>, stat: &Fdstat) {
    slot.set_arg(0, stat.filetype as u32);
    slot.set_arg(1, stat.flags as u32);
    slot.set_arg_u64(2, stat.rights_base);
    slot.set_arg_u64(4, stat.rights_inheriting);
}

pub fn take_fdstat(slot: &Slot<'_>) -> Fdstat {
    Fdstat {
        filetype: Filetype::from_raw(slot.arg(0) as u8),
        flags: slot.arg(1) as u16,
        rights_base: slot.arg_u64(2),
        rights_inheriting: slot.arg_u64(4),
    }
}

/// `filestat` results occupy argument words 0..15.
pub fn put_filestat(slot: &Slot<'_>, stat: &Filestat) {
    slot.set_arg_u64(0, stat.dev);
    slot.set_arg_u64(2, stat.ino);
    slot.set_arg(4, stat.filetype as u32);
    slot.set_arg_u64(5, stat.nlink);
    slot.set_arg_u64(7, stat.size);
    slot.set_arg_u64(9, stat.atim);
    slot.set_arg_u64(11, stat.mtim);
    slot.set_arg_u64(13, stat.ctim);
}

pub fn take_filestat(slot: &Slot<'_>) -> Filestat {
    Filestat {
        dev: slot.arg_u64(0),
        ino: slot.arg_u64(2),
        filetype: Filetype::from_raw(slot.arg(4) as u8),
        nlink: slot.arg_u64(5),
        size: slot.arg_u64(7),
        atim: slot.arg_u64(9),
        mtim: slot.arg_u64(11),
        ctim: slot.arg_u64(13),
    }
}

pub fn put_prestat(slot: &Slot<'_>, prestat: &Prestat) {
    slot.set_arg(0, prestat.tag as u32);
    slot.set_arg(1, prestat.name_len);
}

pub fn take_prestat(slot: &Slot<'_>) -> Prestat {
    Prestat {
        tag: slot.arg(0) as u8,
        name_len: slot.arg(1),
    }
}

/// Words needed by the fd table for `max_fds` descriptors.
pub fn fd_table_words(max_fds: u32) -> usize {
    max_fds as usize * BLOCK_WORDS
}

/// Words per notification bitmap.
pub fn bitmap_words(max_fds: u32) -> usize {
    (max_fds as usize).div_ceil(32)
}

/// First word of the bitmap of ref ids in use, after the notice bitmaps.
pub fn ref_ids_base(max_fds: u32, max_refs: u32) -> usize {
    BITMAPS + max_refs as usize * 2 * bitmap_words(max_fds)
}

/// Words needed by the admin segment.
pub fn admin_words(max_fds: u32, max_refs: u32) -> usize {
    ref_ids_base(max_fds, max_refs) + (max_refs as usize).div_ceil(32)
}

/// Take the lowest free ref id, or `None` if all `max_refs` are in use.
pub fn claim_ref_id(admin: &SharedSegment, max_fds: u32, max_refs: u32) -> Option<u32> {
    let base = ref_ids_base(max_fds, max_refs);
    for w in 0..(max_refs as usize).div_ceil(32) {
        loop {
            let bits = admin.load(base + w);
            let free = (!bits).trailing_zeros();
            let id = w as u32 * 32 + free;
            if free == 32 || id >= max_refs {
                break;
            }
            if admin.compare_exchange(base + w, bits, bits | 1 << free).is_ok() {
                let _ = admin.fetch_update(REF_IDS_SEEN, |seen| Some(seen.max(id + 1)));
                return Some(id);
            }
        }
    }
    None
}

pub fn release_ref_id(admin: &SharedSegment, max_fds: u32, max_refs: u32, id: u32) {
    let word = ref_ids_base(max_fds, max_refs) + id as usize / 32;
    admin.fetch_and(word, !(1 << (id % 32)));
}

pub fn ref_id_in_use(admin: &SharedSegment, max_fds: u32, max_refs: u32, id: u32) -> bool {
    let word = ref_ids_base(max_fds, max_refs) + id as usize / 32;
    admin.load(word) & (1 << (id % 32)) != 0
}

/// Which notification bitmap of a Ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Close,
    Open,
}

/// Word holding `fd`'s bit in `ref_id`'s bitmap, and the bit mask.
pub fn notice_bit(max_fds: u32, ref_id: u32, notice: Notice, fd: u32) -> (usize, u32) {
    let words = bitmap_words(max_fds);
    let map = BITMAPS
        + ref_id as usize * 2 * words
        + match notice {
            Notice::Close => 0,
            Notice::Open => words,
        };
    (map + fd as usize / 32, 1 << (fd % 32))
}

/// Drain `ref_id`'s bitmap, returning the fds whose bits were set.
pub fn drain_notices(admin: &SharedSegment, max_fds: u32, ref_id: u32, notice: Notice) -> Vec<u32> {
    let (first, _) = notice_bit(max_fds, ref_id, notice, 0);
    let mut fds = Vec::new();
    for w in 0..bitmap_words(max_fds) {
        let mut bits = admin.swap(first + w, 0);
        while bits != 0 {
            let bit = bits.trailing_zeros();
            fds.push(w as u32 * 32 + bit);
            bits &= bits - 1;
        }
    }
    fds
}

/// Copy `data` into the allocator, waiting up to `timeout` for a bulk rewind
/// if the region is momentarily full.
///
/// The caller must not hold another payload in the same allocator, or the
/// rewind it waits for can never happen.
pub fn deposit(allocator: &Allocator, data: &[u8], timeout: Option<Duration>) -> Result<(u32, u32)> {
    let (ptr, len) = allocator.write_timeout(data, timeout)?;
    trace!(ptr, len, "deposited");
    Ok((ptr, len))
}

/// Deposit two byte strings as one payload. Returns the pointer and both
/// lengths; [`withdraw_pair`] undoes it.
pub fn deposit_pair(
    allocator: &Allocator,
    first: &[u8],
    second: &[u8],
    timeout: Option<Duration>,
) -> Result<(u32, u32, u32)> {
    let (ptr, _) = deposit(allocator, &[first, second].concat(), timeout)?;
    Ok((ptr, first.len() as u32, second.len() as u32))
}

/// Withdraw a payload written by [`deposit_pair`].
pub fn withdraw_pair(
    allocator: &Allocator,
    ptr: u32,
    first: u32,
    second: u32,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let total = first.checked_add(second).ok_or_else(|| {
        FarmError::Protocol(format!("pair lengths {first}+{second} overflow"))
    })?;
    let mut data = withdraw(allocator, ptr, total)?;
    let second = data.split_off(first as usize);
    Ok((data, second))
}

/// Copy a payload out of the allocator and release it.
pub fn withdraw(allocator: &Allocator, ptr: u32, len: u32) -> Result<Vec<u8>> {
    let data = allocator.get_memory(ptr, len)?;
    allocator.free(ptr, len)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasi_farm_shm::ShmError;

    #[test]
    fn block_offsets() {
        let block = Block::fd(2);
        assert_eq!(block.lock(), 44);
        assert_eq!(block.call(), 45);
        assert_eq!(block.func(), 47);
        assert_eq!(block.arg(0), 48);
        assert_eq!(block.arg(ARG_WORDS - 1), 64);
        assert_eq!(block.errno(), 65);
        assert_eq!(Block::fd(3).lock(), 66);
    }

    #[test]
    fn admin_block_follows_counters() {
        let admin = Block::admin();
        assert_eq!(admin.lock(), 2);
        assert_eq!(admin.func(), 5);
        assert_eq!(admin.errno(), 23);
        assert_eq!(BITMAPS, 24);
    }

    #[test]
    fn notices_drain_once() {
        let admin = SharedSegment::new(admin_words(128, 4));
        for fd in [3, 40, 127] {
            let (word, mask) = notice_bit(128, 2, Notice::Close, fd);
            admin.fetch_or(word, mask);
        }
        let (word, mask) = notice_bit(128, 2, Notice::Open, 5);
        admin.fetch_or(word, mask);

        assert_eq!(drain_notices(&admin, 128, 2, Notice::Close), vec![3, 40, 127]);
        assert!(drain_notices(&admin, 128, 2, Notice::Close).is_empty());
        assert!(drain_notices(&admin, 128, 1, Notice::Open).is_empty());
        assert_eq!(drain_notices(&admin, 128, 2, Notice::Open), vec![5]);
    }

    #[test]
    fn filestat_fits_in_arguments() {
        let segment = SharedSegment::new(BLOCK_WORDS);
        let slot = Slot::new(&segment, Block::fd(0));
        let stat = Filestat {
            dev: 1,
            ino: u64::MAX - 3,
            filetype: Filetype::Directory,
            nlink: 2,
            size: 1 << 40,
            atim: 5,
            mtim: 6,
            ctim: 7,
        };
        put_filestat(&slot, &stat);
        assert_eq!(take_filestat(&slot), stat);
        assert_eq!(slot.errno_raw(), 0);
    }

    #[test]
    fn deposit_rejects_oversized_payload() {
        let allocator = Allocator::new(16);
        assert!(deposit(&allocator, &[0u8; 17], None).is_err());
        let (ptr, len) = deposit(&allocator, b"abc", None).unwrap();
        assert_eq!(withdraw(&allocator, ptr, len).unwrap(), b"abc");
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn deposit_times_out_while_region_is_held() {
        let allocator = Allocator::new(64);
        let held = deposit(&allocator, &[1u8; 48], None).unwrap();
        let err = deposit(&allocator, &[2u8; 48], Some(Duration::from_millis(50))).unwrap_err();
        assert_eq!(err, FarmError::Shm(ShmError::Timeout));

        withdraw(&allocator, held.0, held.1).unwrap();
        assert!(deposit(&allocator, &[2u8; 48], Some(Duration::from_millis(50))).is_ok());
    }

    #[test]
    fn pair_is_one_payload() {
        let allocator = Allocator::new(64);
        let (ptr, first, second) = deposit_pair(&allocator, b"old/name", b"new", None).unwrap();
        assert_eq!(allocator.live(), 1);
        let (old, new) = withdraw_pair(&allocator, ptr, first, second).unwrap();
        assert_eq!((old.as_slice(), new.as_slice()), (&b"old/name"[..], &b"new"[..]));
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn ref_ids_are_reused_lowest_first() {
        let admin = SharedSegment::new(admin_words(32, 40));
        let ids: Vec<u32> = (0..40).map(|_| claim_ref_id(&admin, 32, 40).unwrap()).collect();
        assert_eq!(ids, (0..40).collect::<Vec<_>>());
        assert_eq!(claim_ref_id(&admin, 32, 40), None);
        assert_eq!(admin.load(REF_IDS_SEEN), 40);

        release_ref_id(&admin, 32, 40, 33);
        release_ref_id(&admin, 32, 40, 5);
        assert!(!ref_id_in_use(&admin, 32, 40, 5));
        assert_eq!(claim_ref_id(&admin, 32, 40), Some(5));
        assert_eq!(claim_ref_id(&admin, 32, 40), Some(33));
        assert_eq!(admin.load(REF_IDS_SEEN), 40);
    }
}
