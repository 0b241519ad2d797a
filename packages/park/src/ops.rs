//! Function ids carried in word 0 of a slot.

use crate::error::FarmError;

macro_rules! op_ids {
    ($name:ident { $($variant:ident = $id:literal => $wasi:literal),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $id),*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            pub fn id(self) -> u32 {
                self as u32
            }

            /// Name of the WASI import this operation serves.
            pub fn wasi_name(self) -> &'static str {
                match self {
                    $($name::$variant => $wasi),*
                }
            }
        }

        impl TryFrom<u32> for $name {
            type Error = FarmError;

            fn try_from(id: u32) -> Result<Self, FarmError> {
                match id {
                    $($id => Ok($name::$variant),)*
                    other => Err(FarmError::UnknownFunction(other)),
                }
            }
        }
    };
}

op_ids!(FdOp {
    FdAdvise = 1 => "fd_advise",
    FdAllocate = 2 => "fd_allocate",
    FdClose = 3 => "fd_close",
    FdDatasync = 4 => "fd_datasync",
    FdFdstatGet = 5 => "fd_fdstat_get",
    FdFdstatSetFlags = 6 => "fd_fdstat_set_flags",
    FdFdstatSetRights = 7 => "fd_fdstat_set_rights",
    FdFilestatGet = 8 => "fd_filestat_get",
    FdFilestatSetSize = 9 => "fd_filestat_set_size",
    FdFilestatSetTimes = 10 => "fd_filestat_set_times",
    FdPread = 11 => "fd_pread",
    FdPrestatGet = 12 => "fd_prestat_get",
    FdPrestatDirName = 13 => "fd_prestat_dir_name",
    FdPwrite = 14 => "fd_pwrite",
    FdRead = 15 => "fd_read",
    FdReaddir = 16 => "fd_readdir",
    FdSeek = 17 => "fd_seek",
    FdSync = 18 => "fd_sync",
    FdTell = 19 => "fd_tell",
    FdWrite = 20 => "fd_write",
    PathCreateDirectory = 21 => "path_create_directory",
    PathFilestatGet = 22 => "path_filestat_get",
    PathFilestatSetTimes = 23 => "path_filestat_set_times",
    PathLink = 24 => "path_link",
    PathOpen = 25 => "path_open",
    PathReadlink = 26 => "path_readlink",
    PathRemoveDirectory = 27 => "path_remove_directory",
    PathRename = 28 => "path_rename",
    PathSymlink = 29 => "path_symlink",
    PathUnlinkFile = 30 => "path_unlink_file",
});

op_ids!(AdminOp {
    RegisterVisibility = 1 => "register_visibility",
    UnregisterVisibility = 2 => "unregister_visibility",
    ReleaseRef = 3 => "release_ref",
});

impl FdOp {
    /// Whether a successful call leaves a result payload in the allocator.
    pub fn returns_payload(self) -> bool {
        matches!(
            self,
            FdOp::FdPread
                | FdOp::FdPrestatDirName
                | FdOp::FdRead
                | FdOp::FdReaddir
                | FdOp::PathReadlink
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_unique() {
        let mut ids: Vec<u32> = FdOp::ALL.iter().map(|op| op.id()).collect();
        assert_eq!(ids.len(), 30);
        ids.dedup();
        assert_eq!(ids.len(), 30);
        for op in FdOp::ALL {
            assert_eq!(FdOp::try_from(op.id()).unwrap(), *op);
        }
    }

    #[test]
    fn zero_is_not_an_op() {
        assert_eq!(FdOp::try_from(0), Err(FarmError::UnknownFunction(0)));
        assert_eq!(AdminOp::try_from(4), Err(FarmError::UnknownFunction(4)));
        assert_eq!(FdOp::PathOpen.wasi_name(), "path_open");
        assert!(FdOp::FdRead.returns_payload());
        assert!(!FdOp::FdWrite.returns_payload());
    }
}
