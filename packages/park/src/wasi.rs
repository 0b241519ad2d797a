//! WASI Preview-1 vocabulary: errno values, flags and the fixed-layout records
//! guests read out of linear memory.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A WASI errno. Ordinary failures travel as this value, never as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Errno(pub u16);

/// Outcome of a WASI operation.
pub type WasiResult<T> = std::result::Result<T, Errno>;

impl Errno {
    pub const SUCCESS: Errno = Errno(0);
    pub const TOOBIG: Errno = Errno(1);
    pub const ACCES: Errno = Errno(2);
    pub const AGAIN: Errno = Errno(6);
    pub const BADF: Errno = Errno(8);
    pub const BUSY: Errno = Errno(10);
    pub const EXIST: Errno = Errno(20);
    pub const FAULT: Errno = Errno(21);
    pub const FBIG: Errno = Errno(22);
    pub const INVAL: Errno = Errno(28);
    pub const IO: Errno = Errno(29);
    pub const ISDIR: Errno = Errno(31);
    pub const LOOP: Errno = Errno(32);
    pub const MFILE: Errno = Errno(33);
    pub const NAMETOOLONG: Errno = Errno(37);
    pub const NFILE: Errno = Errno(41);
    pub const NOENT: Errno = Errno(44);
    pub const NOMEM: Errno = Errno(48);
    pub const NOSPC: Errno = Errno(51);
    pub const NOSYS: Errno = Errno(52);
    pub const NOTDIR: Errno = Errno(54);
    pub const NOTEMPTY: Errno = Errno(55);
    pub const NOTSUP: Errno = Errno(58);
    pub const OVERFLOW: Errno = Errno(61);
    pub const PERM: Errno = Errno(63);
    pub const SPIPE: Errno = Errno(70);
    pub const XDEV: Errno = Errno(75);
    pub const NOTCAPABLE: Errno = Errno(76);

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "SUCCESS",
            1 => "2BIG",
            2 => "ACCES",
            6 => "AGAIN",
            8 => "BADF",
            10 => "BUSY",
            20 => "EXIST",
            21 => "FAULT",
            22 => "FBIG",
            28 => "INVAL",
            29 => "IO",
            31 => "ISDIR",
            32 => "LOOP",
            33 => "MFILE",
            37 => "NAMETOOLONG",
            41 => "NFILE",
            44 => "NOENT",
            48 => "NOMEM",
            51 => "NOSPC",
            52 => "NOSYS",
            54 => "NOTDIR",
            55 => "NOTEMPTY",
            58 => "NOTSUP",
            61 => "OVERFLOW",
            63 => "PERM",
            70 => "SPIPE",
            75 => "XDEV",
            76 => "NOTCAPABLE",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERRNO_{} ({})", self.name(), self.0)
    }
}

impl From<std::io::ErrorKind> for Errno {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind::*;
        match kind {
            NotFound => Errno::NOENT,
            PermissionDenied => Errno::ACCES,
            AlreadyExists => Errno::EXIST,
            WouldBlock => Errno::AGAIN,
            InvalidInput | InvalidData => Errno::INVAL,
            Unsupported => Errno::NOTSUP,
            OutOfMemory => Errno::NOMEM,
            _ => Errno::IO,
        }
    }
}

/// File type of a descriptor or directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Filetype {
    #[default]
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

impl Filetype {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Filetype::BlockDevice,
            2 => Filetype::CharacterDevice,
            3 => Filetype::Directory,
            4 => Filetype::RegularFile,
            5 => Filetype::SocketDgram,
            6 => Filetype::SocketStream,
            7 => Filetype::SymbolicLink,
            _ => Filetype::Unknown,
        }
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl TryFrom<u32> for Whence {
    type Error = Errno;

    fn try_from(raw: u32) -> WasiResult<Self> {
        match raw {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(Errno::INVAL),
        }
    }
}

pub type Fdflags = u16;
pub type Oflags = u16;
pub type Lookupflags = u32;
pub type Fstflags = u16;
pub type Rights = u64;
pub type Advice = u8;

pub mod fdflags {
    pub const APPEND: u16 = 1 << 0;
    pub const DSYNC: u16 = 1 << 1;
    pub const NONBLOCK: u16 = 1 << 2;
    pub const RSYNC: u16 = 1 << 3;
    pub const SYNC: u16 = 1 << 4;
}

pub mod oflags {
    pub const CREAT: u16 = 1 << 0;
    pub const DIRECTORY: u16 = 1 << 1;
    pub const EXCL: u16 = 1 << 2;
    pub const TRUNC: u16 = 1 << 3;
}

pub mod lookupflags {
    pub const SYMLINK_FOLLOW: u32 = 1 << 0;
}

pub mod fstflags {
    pub const ATIM: u16 = 1 << 0;
    pub const ATIM_NOW: u16 = 1 << 1;
    pub const MTIM: u16 = 1 << 2;
    pub const MTIM_NOW: u16 = 1 << 3;
}

pub mod rights {
    pub const FD_READ: u64 = 1 << 1;
    pub const FD_SEEK: u64 = 1 << 2;
    pub const FD_WRITE: u64 = 1 << 6;
    /// Every right defined by Preview-1.
    pub const ALL: u64 = (1 << 29) - 1;
}

pub mod clockid {
    pub const REALTIME: u32 = 0;
    pub const MONOTONIC: u32 = 1;
    pub const PROCESS_CPUTIME_ID: u32 = 2;
    pub const THREAD_CPUTIME_ID: u32 = 3;
}

pub mod eventtype {
    pub const CLOCK: u8 = 0;
    pub const FD_READ: u8 = 1;
    pub const FD_WRITE: u8 = 2;
}

pub mod subclockflags {
    pub const ABSTIME: u16 = 1 << 0;
}

/// Tag of the only [`Prestat`] variant.
pub const PREOPENTYPE_DIR: u8 = 0;

/// `fdstat`: 24 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fdstat {
    pub filetype: Filetype,
    pub flags: Fdflags,
    pub rights_base: Rights,
    pub rights_inheriting: Rights,
}

impl Fdstat {
    pub const SIZE: usize = 24;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.filetype as u8;
        out[2..4].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.rights_base.to_le_bytes());
        out[16..24].copy_from_slice(&self.rights_inheriting.to_le_bytes());
        out
    }
}

/// `filestat`: 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Filestat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: Filetype,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

impl Filestat {
    pub const SIZE: usize = 64;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.dev.to_le_bytes());
        out[8..16].copy_from_slice(&self.ino.to_le_bytes());
        out[16] = self.filetype as u8;
        out[24..32].copy_from_slice(&self.nlink.to_le_bytes());
        out[32..40].copy_from_slice(&self.size.to_le_bytes());
        out[40..48].copy_from_slice(&self.atim.to_le_bytes());
        out[48..56].copy_from_slice(&self.mtim.to_le_bytes());
        out[56..64].copy_from_slice(&self.ctim.to_le_bytes());
        out
    }
}

/// `prestat` for a preopened directory: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prestat {
    pub tag: u8,
    pub name_len: u32,
}

impl Prestat {
    pub const SIZE: usize = 8;

    pub fn dir(name_len: u32) -> Self {
        Self {
            tag: PREOPENTYPE_DIR,
            name_len,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.tag;
        out[4..8].copy_from_slice(&self.name_len.to_le_bytes());
        out
    }
}

/// One directory entry as returned by [`crate::Descriptor::fd_readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Cookie of the entry following this one.
    pub next: u64,
    pub ino: u64,
    pub filetype: Filetype,
    pub name: Vec<u8>,
}

/// Size of a `dirent` header; the name follows it.
pub const DIRENT_HEADER: usize = 24;

/// Serialize entries the way `fd_readdir` hands them to the guest, cutting
/// the stream at `buf_len` bytes.
pub fn encode_dirents(entries: &[DirEntry], buf_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        if out.len() >= buf_len {
            break;
        }
        let mut header = [0u8; DIRENT_HEADER];
        header[0..8].copy_from_slice(&entry.next.to_le_bytes());
        header[8..16].copy_from_slice(&entry.ino.to_le_bytes());
        header[16..20].copy_from_slice(&(entry.name.len() as u32).to_le_bytes());
        header[20] = entry.filetype as u8;
        out.extend_from_slice(&header);
        out.extend_from_slice(&entry.name);
    }
    out.truncate(buf_len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_display_names_value() {
        assert_eq!(Errno::BADF.to_string(), "ERRNO_BADF (8)");
        assert_eq!(Errno(999).name(), "UNKNOWN");
    }

    #[test]
    fn filestat_layout() {
        let stat = Filestat {
            ino: 7,
            filetype: Filetype::RegularFile,
            nlink: 1,
            size: 300,
            ..Default::default()
        };
        let bytes = stat.encode();
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 7);
        assert_eq!(bytes[16], 4);
        assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 300);
    }

    #[test]
    fn dirents_truncate_at_buffer() {
        let entries = vec![
            DirEntry {
                next: 1,
                ino: 1,
                filetype: Filetype::Directory,
                name: b".".to_vec(),
            },
            DirEntry {
                next: 2,
                ino: 9,
                filetype: Filetype::RegularFile,
                name: b"main.rs".to_vec(),
            },
        ];
        let full = encode_dirents(&entries, 4096);
        assert_eq!(full.len(), 2 * DIRENT_HEADER + 1 + 7);
        assert_eq!(&full[DIRENT_HEADER + 1 + DIRENT_HEADER..], b"main.rs");

        let cut = encode_dirents(&entries, 30);
        assert_eq!(cut.len(), 30);
    }

    #[test]
    fn whence_rejects_unknown() {
        assert_eq!(Whence::try_from(1), Ok(Whence::Cur));
        assert_eq!(Whence::try_from(3), Err(Errno::INVAL));
    }
}
