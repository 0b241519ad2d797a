//! A small in-memory filesystem implementing [`Descriptor`].
//!
//! Nodes are shared trees of `Arc<RwLock<Node>>`; hard links are the same
//! node under two names. Paths are resolved relative to a directory
//! descriptor and can never climb above the preopen they started from.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::descriptor::Descriptor;
use crate::wasi::{
    fdflags, fstflags, lookupflags, oflags, rights, DirEntry, Errno, Fdflags, Fdstat, Filestat,
    Filetype, Fstflags, Lookupflags, Oflags, Prestat, Rights, WasiResult, Whence,
};

static INODE_COUNTER: AtomicU64 = AtomicU64::new(1);

const MAX_SYMLINK_DEPTH: u32 = 16;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub type NodeRef = Arc<RwLock<Node>>;

#[derive(Debug)]
pub enum NodeKind {
    File(Vec<u8>),
    Dir(BTreeMap<Vec<u8>, NodeRef>),
    Symlink(Vec<u8>),
}

#[derive(Debug)]
pub struct Node {
    ino: u64,
    links: u64,
    atim: u64,
    mtim: u64,
    ctim: u64,
    kind: NodeKind,
}

impl Node {
    fn new_ref(kind: NodeKind) -> NodeRef {
        let t = now();
        Arc::new(RwLock::new(Node {
            ino: INODE_COUNTER.fetch_add(1, Ordering::SeqCst),
            links: 1,
            atim: t,
            mtim: t,
            ctim: t,
            kind,
        }))
    }

    fn empty_dir() -> NodeRef {
        Self::new_ref(NodeKind::Dir(BTreeMap::new()))
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn filetype(&self) -> Filetype {
        match self.kind {
            NodeKind::File(_) => Filetype::RegularFile,
            NodeKind::Dir(_) => Filetype::Directory,
            NodeKind::Symlink(_) => Filetype::SymbolicLink,
        }
    }

    fn stat(&self) -> Filestat {
        let size = match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir(entries) => entries.len() as u64,
            NodeKind::Symlink(target) => target.len() as u64,
        };
        Filestat {
            dev: 0,
            ino: self.ino,
            filetype: self.filetype(),
            nlink: self.links,
            size,
            atim: self.atim,
            mtim: self.mtim,
            ctim: self.ctim,
        }
    }

    fn set_times(&mut self, atim: u64, mtim: u64, flags: Fstflags) -> WasiResult<()> {
        if (flags & fstflags::ATIM != 0 && flags & fstflags::ATIM_NOW != 0)
            || (flags & fstflags::MTIM != 0 && flags & fstflags::MTIM_NOW != 0)
        {
            return Err(Errno::INVAL);
        }
        let t = now();
        if flags & fstflags::ATIM != 0 {
            self.atim = atim;
        } else if flags & fstflags::ATIM_NOW != 0 {
            self.atim = t;
        }
        if flags & fstflags::MTIM != 0 {
            self.mtim = mtim;
        } else if flags & fstflags::MTIM_NOW != 0 {
            self.mtim = t;
        }
        self.ctim = t;
        Ok(())
    }

    fn child(&self, name: &[u8]) -> WasiResult<Option<NodeRef>> {
        match &self.kind {
            NodeKind::Dir(entries) => Ok(entries.get(name).cloned()),
            _ => Err(Errno::NOTDIR),
        }
    }

    fn entries_mut(&mut self) -> WasiResult<&mut BTreeMap<Vec<u8>, NodeRef>> {
        match &mut self.kind {
            NodeKind::Dir(entries) => Ok(entries),
            _ => Err(Errno::NOTDIR),
        }
    }
}

fn components(path: &[u8]) -> WasiResult<Vec<&[u8]>> {
    if path.first() == Some(&b'/') {
        return Err(Errno::NOTCAPABLE);
    }
    Ok(path
        .split(|&b| b == b'/')
        .filter(|c| !c.is_empty() && *c != b".")
        .collect())
}

/// Walk `parts` from `chain` (root first, current directory last).
fn walk(chain: &[NodeRef], parts: &[&[u8]], follow_last: bool, depth: u32) -> WasiResult<Vec<NodeRef>> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(Errno::LOOP);
    }
    let mut chain = chain.to_vec();
    for (i, part) in parts.iter().enumerate() {
        if *part == b".." {
            if chain.len() == 1 {
                return Err(Errno::NOTCAPABLE);
            }
            chain.pop();
            continue;
        }
        let current = chain.last().cloned().ok_or(Errno::BADF)?;
        let next = current.read().child(part)?.ok_or(Errno::NOENT)?;
        let is_last = i + 1 == parts.len();
        let target = match &next.read().kind {
            NodeKind::Symlink(target) if !is_last || follow_last => Some(target.clone()),
            _ => None,
        };
        match target {
            Some(target) => {
                let target_parts = components(&target)?;
                chain = walk(&chain, &target_parts, true, depth + 1)?;
            }
            None => chain.push(next),
        }
    }
    Ok(chain)
}

/// Resolve everything but the last component of `path`.
fn walk_parent(chain: &[NodeRef], path: &[u8]) -> WasiResult<(Vec<NodeRef>, Vec<u8>)> {
    let parts = components(path)?;
    let (name, dirs) = parts.split_last().ok_or(Errno::INVAL)?;
    if *name == b".." {
        return Err(Errno::INVAL);
    }
    let parent = walk(chain, dirs, true, 0)?;
    Ok((parent, name.to_vec()))
}

fn last(chain: &[NodeRef]) -> WasiResult<&NodeRef> {
    chain.last().ok_or(Errno::BADF)
}

/// The whole tree, plus helpers for filling it from the host.
#[derive(Debug, Clone)]
pub struct MemFs {
    root: NodeRef,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            root: Node::empty_dir(),
        }
    }

    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    fn host_parts(path: &str) -> Vec<&[u8]> {
        path.as_bytes()
            .split(|&b| b == b'/')
            .filter(|c| !c.is_empty() && *c != b".")
            .collect()
    }

    /// Create `path` and any missing parents.
    pub fn create_dir_all(&self, path: &str) -> WasiResult<NodeRef> {
        let mut current = self.root.clone();
        for part in Self::host_parts(path) {
            let existing = current.read().child(part)?;
            let next = match existing {
                Some(node) => node,
                None => {
                    let node = Node::empty_dir();
                    current.write().entries_mut()?.insert(part.to_vec(), node.clone());
                    node
                }
            };
            current = next;
        }
        Ok(current)
    }

    /// Create or replace the file at `path`, creating parents as needed.
    pub fn write_file(&self, path: &str, data: impl Into<Vec<u8>>) -> WasiResult<()> {
        let parts = Self::host_parts(path);
        let (name, dirs) = parts.split_last().ok_or(Errno::INVAL)?;
        let dir_path = dirs
            .iter()
            .map(|p| String::from_utf8_lossy(p))
            .collect::<Vec<_>>()
            .join("/");
        let parent = self.create_dir_all(&dir_path)?;
        let mut parent = parent.write();
        parent
            .entries_mut()?
            .insert(name.to_vec(), Node::new_ref(NodeKind::File(data.into())));
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> WasiResult<Vec<u8>> {
        let chain = walk(&[self.root.clone()], &Self::host_parts(path), true, 0)?;
        let node = last(&chain)?.read();
        match &node.kind {
            NodeKind::File(data) => Ok(data.clone()),
            NodeKind::Dir(_) => Err(Errno::ISDIR),
            NodeKind::Symlink(_) => Err(Errno::INVAL),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        walk(&[self.root.clone()], &Self::host_parts(path), false, 0).is_ok()
    }

    /// Copy the host directory `host_dir` into the root, recursively.
    ///
    /// Returns the number of files copied.
    pub fn preload(&self, host_dir: &Path) -> std::io::Result<usize> {
        fn copy(dir: &Path, target: &NodeRef) -> std::io::Result<usize> {
            let mut files = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned().into_bytes();
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    let node = Node::empty_dir();
                    files += copy(&entry.path(), &node)?;
                    insert(target, name, node)?;
                } else if file_type.is_file() {
                    let data = fs::read(entry.path())?;
                    insert(target, name, Node::new_ref(NodeKind::File(data)))?;
                    files += 1;
                }
            }
            Ok(files)
        }

        fn insert(target: &NodeRef, name: Vec<u8>, node: NodeRef) -> std::io::Result<()> {
            target
                .write()
                .entries_mut()
                .map_err(|e| std::io::Error::other(e.to_string()))?
                .insert(name, node);
            Ok(())
        }

        let files = copy(host_dir, &self.root)?;
        debug!(files, dir = %host_dir.display(), "preloaded");
        Ok(files)
    }

    /// A directory descriptor for the root, preopened under `name`.
    pub fn preopen(&self, name: &str) -> MemDir {
        MemDir {
            chain: vec![self.root.clone()],
            preopen: Some(name.as_bytes().to_vec()),
        }
    }
}

/// An open directory.
#[derive(Debug)]
pub struct MemDir {
    /// Directories from the preopen root down to this one.
    chain: Vec<NodeRef>,
    preopen: Option<Vec<u8>>,
}

impl MemDir {
    fn node(&self) -> WasiResult<&NodeRef> {
        last(&self.chain)
    }

    /// Parent chain and name for the destination of a two-directory operation.
    fn destination(&self, new_dir: Option<&dyn Descriptor>, new_path: &[u8]) -> WasiResult<(Vec<NodeRef>, Vec<u8>)> {
        match new_dir {
            None => walk_parent(&self.chain, new_path),
            Some(other) => {
                let other = other.as_any().downcast_ref::<MemDir>().ok_or(Errno::XDEV)?;
                walk_parent(&other.chain, new_path)
            }
        }
    }

    fn create_file(&self, path: &[u8], oflags: Oflags) -> WasiResult<Vec<NodeRef>> {
        let (mut parent, name) = walk_parent(&self.chain, path)?;
        let dir = last(&parent)?.clone();
        let existing = dir.read().child(&name)?;
        match existing {
            Some(_) if oflags & oflags::EXCL != 0 => Err(Errno::EXIST),
            Some(_) => walk(&self.chain, &components(path)?, true, 0),
            None => {
                let node = Node::new_ref(NodeKind::File(Vec::new()));
                dir.write().entries_mut()?.insert(name, node.clone());
                parent.push(node);
                Ok(parent)
            }
        }
    }
}

impl Descriptor for MemDir {
    fn filetype(&self) -> Filetype {
        Filetype::Directory
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fd_filestat_get(&mut self) -> WasiResult<Filestat> {
        Ok(self.node()?.read().stat())
    }

    fn fd_filestat_set_times(&mut self, atim: u64, mtim: u64, flags: Fstflags) -> WasiResult<()> {
        self.node()?.write().set_times(atim, mtim, flags)
    }

    fn fd_prestat_get(&mut self) -> WasiResult<Prestat> {
        let name = self.preopen.as_ref().ok_or(Errno::BADF)?;
        Ok(Prestat::dir(name.len() as u32))
    }

    fn fd_prestat_dir_name(&mut self) -> WasiResult<Vec<u8>> {
        self.preopen.clone().ok_or(Errno::BADF)
    }

    fn fd_read(&mut self, _len: usize) -> WasiResult<Vec<u8>> {
        Err(Errno::ISDIR)
    }

    fn fd_write(&mut self, _data: &[u8]) -> WasiResult<u32> {
        Err(Errno::ISDIR)
    }

    fn fd_readdir(&mut self, cookie: u64) -> WasiResult<Vec<DirEntry>> {
        let node = self.node()?.read();
        let parent_ino = match self.chain.len() {
            0 | 1 => node.ino,
            n => self.chain[n - 2].read().ino,
        };
        let NodeKind::Dir(children) = &node.kind else {
            return Err(Errno::NOTDIR);
        };
        let mut all = vec![
            (b".".to_vec(), node.ino, Filetype::Directory),
            (b"..".to_vec(), parent_ino, Filetype::Directory),
        ];
        for (name, child) in children {
            let child = child.read();
            all.push((name.clone(), child.ino, child.filetype()));
        }
        Ok(all
            .into_iter()
            .enumerate()
            .skip(cookie as usize)
            .map(|(i, (name, ino, filetype))| DirEntry {
                next: i as u64 + 1,
                ino,
                filetype,
                name,
            })
            .collect())
    }

    fn path_create_directory(&mut self, path: &[u8]) -> WasiResult<()> {
        let (parent, name) = walk_parent(&self.chain, path)?;
        let dir = last(&parent)?;
        let mut dir = dir.write();
        let entries = dir.entries_mut()?;
        if entries.contains_key(&name) {
            return Err(Errno::EXIST);
        }
        entries.insert(name, Node::empty_dir());
        Ok(())
    }

    fn path_filestat_get(&mut self, flags: Lookupflags, path: &[u8]) -> WasiResult<Filestat> {
        let follow = flags & lookupflags::SYMLINK_FOLLOW != 0;
        let chain = walk(&self.chain, &components(path)?, follow, 0)?;
        let stat = last(&chain)?.read().stat();
        Ok(stat)
    }

    fn path_filestat_set_times(
        &mut self,
        flags: Lookupflags,
        path: &[u8],
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> WasiResult<()> {
        let follow = flags & lookupflags::SYMLINK_FOLLOW != 0;
        let chain = walk(&self.chain, &components(path)?, follow, 0)?;
        let mut node = last(&chain)?.write();
        node.set_times(atim, mtim, fst_flags)
    }

    fn path_link(
        &mut self,
        old_flags: Lookupflags,
        old_path: &[u8],
        new_dir: Option<&dyn Descriptor>,
        new_path: &[u8],
    ) -> WasiResult<()> {
        let follow = old_flags & lookupflags::SYMLINK_FOLLOW != 0;
        let source = walk(&self.chain, &components(old_path)?, follow, 0)?;
        let node = last(&source)?.clone();
        if node.read().filetype() == Filetype::Directory {
            return Err(Errno::PERM);
        }
        let (parent, name) = self.destination(new_dir, new_path)?;
        let dir = last(&parent)?;
        {
            let mut dir = dir.write();
            let entries = dir.entries_mut()?;
            if entries.contains_key(&name) {
                return Err(Errno::EXIST);
            }
            entries.insert(name, node.clone());
        }
        node.write().links += 1;
        Ok(())
    }

    fn path_open(
        &mut self,
        dirflags: Lookupflags,
        path: &[u8],
        oflags: Oflags,
        rights_base: Rights,
        _rights_inheriting: Rights,
        fdflags: Fdflags,
    ) -> WasiResult<Box<dyn Descriptor>> {
        let parts = components(path)?;
        let chain = if oflags & oflags::CREAT != 0 {
            if oflags & oflags::DIRECTORY != 0 {
                return Err(Errno::INVAL);
            }
            self.create_file(path, oflags)?
        } else {
            let follow = dirflags & lookupflags::SYMLINK_FOLLOW != 0;
            walk(&self.chain, &parts, follow, 0)?
        };

        let node = last(&chain)?.clone();
        let filetype = node.read().filetype();
        match filetype {
            Filetype::Directory => {
                if oflags & oflags::TRUNC != 0 {
                    return Err(Errno::ISDIR);
                }
                Ok(Box::new(MemDir {
                    chain,
                    preopen: None,
                }))
            }
            Filetype::SymbolicLink => Err(Errno::LOOP),
            _ => {
                if oflags & oflags::DIRECTORY != 0 {
                    return Err(Errno::NOTDIR);
                }
                if oflags & oflags::TRUNC != 0 {
                    let mut file = node.write();
                    if let NodeKind::File(data) = &mut file.kind {
                        data.clear();
                    }
                    file.mtim = now();
                }
                Ok(Box::new(MemFile {
                    node,
                    position: 0,
                    flags: fdflags,
                    readable: rights_base & rights::FD_READ != 0,
                    writable: rights_base & rights::FD_WRITE != 0,
                }))
            }
        }
    }

    fn path_readlink(&mut self, path: &[u8]) -> WasiResult<Vec<u8>> {
        let chain = walk(&self.chain, &components(path)?, false, 0)?;
        let node = last(&chain)?.read();
        match &node.kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(Errno::INVAL),
        }
    }

    fn path_remove_directory(&mut self, path: &[u8]) -> WasiResult<()> {
        let (parent, name) = walk_parent(&self.chain, path)?;
        let dir = last(&parent)?;
        let mut dir = dir.write();
        let entries = dir.entries_mut()?;
        let node = entries.get(&name).ok_or(Errno::NOENT)?;
        match &node.read().kind {
            NodeKind::Dir(children) if !children.is_empty() => return Err(Errno::NOTEMPTY),
            NodeKind::Dir(_) => {}
            _ => return Err(Errno::NOTDIR),
        }
        entries.remove(&name);
        Ok(())
    }

    fn path_rename(
        &mut self,
        old_path: &[u8],
        new_dir: Option<&dyn Descriptor>,
        new_path: &[u8],
    ) -> WasiResult<()> {
        let (old_parent, old_name) = walk_parent(&self.chain, old_path)?;
        let (new_parent, new_name) = self.destination(new_dir, new_path)?;
        let old_dir = last(&old_parent)?.clone();
        let new_dir = last(&new_parent)?.clone();

        let node = old_dir.read().child(&old_name)?.ok_or(Errno::NOENT)?;
        if new_parent.iter().any(|ancestor| Arc::ptr_eq(ancestor, &node)) {
            return Err(Errno::INVAL);
        }
        let moving_dir = node.read().filetype() == Filetype::Directory;
        if let Some(existing) = new_dir.read().child(&new_name)? {
            if Arc::ptr_eq(&existing, &node) {
                return Ok(());
            }
            match (&existing.read().kind, moving_dir) {
                (NodeKind::Dir(children), true) if !children.is_empty() => {
                    return Err(Errno::NOTEMPTY)
                }
                (NodeKind::Dir(_), false) => return Err(Errno::ISDIR),
                (NodeKind::File(_) | NodeKind::Symlink(_), true) => return Err(Errno::NOTDIR),
                _ => {}
            }
        }

        old_dir.write().entries_mut()?.remove(&old_name);
        new_dir.write().entries_mut()?.insert(new_name, node.clone());
        node.write().ctim = now();
        Ok(())
    }

    fn path_symlink(&mut self, old_path: &[u8], new_path: &[u8]) -> WasiResult<()> {
        let (parent, name) = walk_parent(&self.chain, new_path)?;
        let dir = last(&parent)?;
        let mut dir = dir.write();
        let entries = dir.entries_mut()?;
        if entries.contains_key(&name) {
            return Err(Errno::EXIST);
        }
        entries.insert(name, Node::new_ref(NodeKind::Symlink(old_path.to_vec())));
        Ok(())
    }

    fn path_unlink_file(&mut self, path: &[u8]) -> WasiResult<()> {
        let (parent, name) = walk_parent(&self.chain, path)?;
        let dir = last(&parent)?;
        let node = {
            let mut dir = dir.write();
            let entries = dir.entries_mut()?;
            let node = entries.get(&name).ok_or(Errno::NOENT)?;
            if node.read().filetype() == Filetype::Directory {
                return Err(Errno::ISDIR);
            }
            entries.remove(&name).ok_or(Errno::NOENT)?
        };
        let mut node = node.write();
        node.links = node.links.saturating_sub(1);
        Ok(())
    }
}

/// An open regular file with its own position.
#[derive(Debug)]
pub struct MemFile {
    node: NodeRef,
    position: u64,
    flags: Fdflags,
    readable: bool,
    writable: bool,
}

impl MemFile {
    fn read_at(&self, len: usize, offset: u64) -> WasiResult<Vec<u8>> {
        if !self.readable {
            return Err(Errno::BADF);
        }
        let mut node = self.node.write();
        node.atim = now();
        let NodeKind::File(data) = &node.kind else {
            return Err(Errno::BADF);
        };
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write_at(&self, bytes: &[u8], offset: Option<u64>) -> WasiResult<u64> {
        if !self.writable {
            return Err(Errno::BADF);
        }
        let mut node = self.node.write();
        node.mtim = now();
        let NodeKind::File(data) = &mut node.kind else {
            return Err(Errno::BADF);
        };
        let start = offset.map(|o| o as usize).unwrap_or(data.len());
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(end as u64)
    }

    fn size(&self) -> u64 {
        match &self.node.read().kind {
            NodeKind::File(data) => data.len() as u64,
            _ => 0,
        }
    }
}

impl Descriptor for MemFile {
    fn filetype(&self) -> Filetype {
        Filetype::RegularFile
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fd_allocate(&mut self, offset: u64, len: u64) -> WasiResult<()> {
        if !self.writable {
            return Err(Errno::BADF);
        }
        let want = offset.checked_add(len).ok_or(Errno::FBIG)? as usize;
        let mut node = self.node.write();
        if let NodeKind::File(data) = &mut node.kind {
            if data.len() < want {
                data.resize(want, 0);
            }
        }
        Ok(())
    }

    fn fd_fdstat_get(&mut self) -> WasiResult<Fdstat> {
        let mut base = rights::ALL;
        if !self.readable {
            base &= !rights::FD_READ;
        }
        if !self.writable {
            base &= !rights::FD_WRITE;
        }
        Ok(Fdstat {
            filetype: Filetype::RegularFile,
            flags: self.flags,
            rights_base: base,
            rights_inheriting: base,
        })
    }

    fn fd_fdstat_set_flags(&mut self, flags: Fdflags) -> WasiResult<()> {
        self.flags = flags;
        Ok(())
    }

    fn fd_filestat_get(&mut self) -> WasiResult<Filestat> {
        Ok(self.node.read().stat())
    }

    fn fd_filestat_set_size(&mut self, size: u64) -> WasiResult<()> {
        if !self.writable {
            return Err(Errno::BADF);
        }
        let mut node = self.node.write();
        node.mtim = now();
        if let NodeKind::File(data) = &mut node.kind {
            data.resize(size as usize, 0);
        }
        Ok(())
    }

    fn fd_filestat_set_times(&mut self, atim: u64, mtim: u64, flags: Fstflags) -> WasiResult<()> {
        self.node.write().set_times(atim, mtim, flags)
    }

    fn fd_pread(&mut self, len: usize, offset: u64) -> WasiResult<Vec<u8>> {
        self.read_at(len, offset)
    }

    fn fd_pwrite(&mut self, data: &[u8], offset: u64) -> WasiResult<u32> {
        self.write_at(data, Some(offset))?;
        Ok(data.len() as u32)
    }

    fn fd_read(&mut self, len: usize) -> WasiResult<Vec<u8>> {
        let data = self.read_at(len, self.position)?;
        self.position += data.len() as u64;
        Ok(data)
    }

    fn fd_seek(&mut self, offset: i64, whence: Whence) -> WasiResult<u64> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position as i64,
            Whence::End => self.size() as i64,
        };
        let target = base.checked_add(offset).ok_or(Errno::OVERFLOW)?;
        if target < 0 {
            return Err(Errno::INVAL);
        }
        self.position = target as u64;
        Ok(self.position)
    }

    fn fd_write(&mut self, data: &[u8]) -> WasiResult<u32> {
        let offset = if self.flags & fdflags::APPEND != 0 {
            None
        } else {
            Some(self.position)
        };
        self.position = self.write_at(data, offset)?;
        Ok(data.len() as u32)
    }
}

/// Shared byte sink, for capturing console output.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A readable character device.
pub struct ConsoleIn {
    reader: Box<dyn Read + Send>,
}

impl ConsoleIn {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Cursor::new(data.into()))
    }

    pub fn stdin() -> Self {
        Self::new(std::io::stdin())
    }
}

impl Descriptor for ConsoleIn {
    fn filetype(&self) -> Filetype {
        Filetype::CharacterDevice
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fd_read(&mut self, len: usize) -> WasiResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.reader.read(&mut buf).map_err(|e| Errno::from(e.kind()))?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// A writable character device.
pub struct ConsoleOut {
    writer: Box<dyn Write + Send>,
}

impl ConsoleOut {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    /// A console whose output lands in the returned buffer.
    pub fn capture() -> (Self, CaptureBuffer) {
        let buffer = CaptureBuffer::default();
        (Self::new(buffer.clone()), buffer)
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl Descriptor for ConsoleOut {
    fn filetype(&self) -> Filetype {
        Filetype::CharacterDevice
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fd_write(&mut self, data: &[u8]) -> WasiResult<u32> {
        self.writer
            .write_all(data)
            .and_then(|_| self.writer.flush())
            .map_err(|e| Errno::from(e.kind()))?;
        Ok(data.len() as u32)
    }

    fn fd_sync(&mut self) -> WasiResult<()> {
        self.writer.flush().map_err(|e| Errno::from(e.kind()))
    }
}
