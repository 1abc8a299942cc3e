//! A process-local filesystem with zero external I/O. The host assembles a
//! tree of files (inline bytes or lazily materialised), directories and
//! character-device nodes through [`MemoryFileSystem`]; the guest reaches
//! it through [`MemoryFsDriver`]. Read-only mounts wrap the driver in the
//! [`crate::driver::ReadOnly`] overlay.

use crate::abi::{Errno, Fdflags, Filestat, Filetype, Lookupflags, Oflags, Rights, Whence};
use crate::driver::{DeviceDriver, DeviceId, DeviceKind, DeviceRegistry, ReaddirEntry};
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use crate::pipe::PipeBuffer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

pub const ROOT_INODE: u64 = 1;

static MEMFS_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub type LazyReader =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = WasiResult<Vec<u8>>> + Send>> + Send + Sync>;

enum FileContent {
    Bytes(Vec<u8>),
    /// Content fetched on first read and cached as `Bytes` thereafter.
    Lazy { size: u64, reader: LazyReader },
}

impl FileContent {
    fn size(&self) -> u64 {
        match self {
            FileContent::Bytes(bytes) => bytes.len() as u64,
            FileContent::Lazy { size, .. } => *size,
        }
    }
}

enum NodeKind {
    File {
        content: FileContent,
    },
    Directory {
        children: BTreeMap<String, u64>,
    },
    CharacterDevice {
        readable: Option<Arc<PipeBuffer>>,
        writable: Option<Arc<PipeBuffer>>,
    },
}

struct Node {
    inode: u64,
    parent: u64,
    name: String,
    refs: u32,
    mtim: u64,
    ctim: u64,
    kind: NodeKind,
}

impl Node {
    fn filetype(&self) -> Filetype {
        match &self.kind {
            NodeKind::File { .. } => Filetype::RegularFile,
            NodeKind::Directory { .. } => Filetype::Directory,
            NodeKind::CharacterDevice { .. } => Filetype::CharacterDevice,
        }
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { content } => content.size(),
            // Directory size mirrors what a dirent listing would occupy,
            // rounded up to whole pages.
            NodeKind::Directory { children } => {
                (children.len() as u64 * 24).div_ceil(4096) * 4096
            }
            NodeKind::CharacterDevice { .. } => 101,
        }
    }
}

struct Tree {
    nodes: HashMap<u64, Node>,
    next_inode: u64,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Tree {
    fn new() -> Tree {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                inode: ROOT_INODE,
                parent: ROOT_INODE,
                name: String::new(),
                refs: 1,
                mtim: now_ns(),
                ctim: now_ns(),
                kind: NodeKind::Directory {
                    children: BTreeMap::new(),
                },
            },
        );
        Tree {
            nodes,
            next_inode: 2,
        }
    }

    fn allocate(&mut self, parent: u64, name: String, kind: NodeKind) -> u64 {
        let inode = self.next_inode;
        self.next_inode += 1;
        self.nodes.insert(
            inode,
            Node {
                inode,
                parent,
                name: name.clone(),
                refs: 0,
                mtim: now_ns(),
                ctim: now_ns(),
                kind,
            },
        );
        match &mut self.nodes.get_mut(&parent).expect("parent exists").kind {
            NodeKind::Directory { children } => {
                children.insert(name, inode);
            }
            _ => unreachable!("parent is a directory"),
        }
        inode
    }

    fn node(&self, inode: u64) -> WasiResult<&Node> {
        self.nodes.get(&inode).ok_or_else(Error::badf)
    }

    fn node_mut(&mut self, inode: u64) -> WasiResult<&mut Node> {
        self.nodes.get_mut(&inode).ok_or_else(Error::badf)
    }

    /// Walk `path` from `start`, resolving `.` and `..`. Fails `noent` if
    /// any segment is missing and `notdir` if a non-final segment is not a
    /// directory.
    fn resolve(&self, start: u64, path: &str) -> WasiResult<u64> {
        let mut current = start;
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    current = self.node(current)?.parent;
                    continue;
                }
                _ => {}
            }
            let node = self.node(current)?;
            match &node.kind {
                NodeKind::Directory { children } => {
                    current = *children.get(segment).ok_or_else(Error::noent)?;
                }
                _ => return Err(Error::notdir()),
            }
        }
        Ok(current)
    }

    /// Resolve everything but the final segment, returning the parent
    /// inode and the basename.
    fn resolve_parent<'a>(&self, start: u64, path: &'a str) -> WasiResult<(u64, &'a str)> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
            return Err(Error::inval());
        }
        match trimmed.rsplit_once('/') {
            Some((dir, name)) => Ok((self.resolve(start, dir)?, name)),
            None => Ok((start, trimmed)),
        }
    }

    fn filestat(&self, device: DeviceId, inode: u64) -> WasiResult<Filestat> {
        let node = self.node(inode)?;
        Ok(Filestat {
            dev: device.raw(),
            ino: node.inode,
            filetype: node.filetype(),
            nlink: 1,
            size: node.size(),
            atim: node.mtim,
            mtim: node.mtim,
            ctim: node.ctim,
        })
    }

    /// Detach a node from its parent directory. The node itself stays in
    /// the arena until its last descriptor is closed.
    fn detach(&mut self, parent: u64, name: &str) -> WasiResult<u64> {
        let inode = match &mut self.node_mut(parent)?.kind {
            NodeKind::Directory { children } => {
                children.remove(name).ok_or_else(Error::noent)?
            }
            _ => return Err(Error::notdir()),
        };
        self.nodes.get_mut(&parent).expect("parent exists").mtim = now_ns();
        Ok(inode)
    }

    fn release(&mut self, inode: u64) {
        if inode == ROOT_INODE {
            return;
        }
        let parent_id = if let Some(node) = self.nodes.get_mut(&inode) {
            node.refs = node.refs.saturating_sub(1);
            if node.refs == 0 {
                Some(node.parent)
            } else {
                None
            }
        } else {
            None
        };
        if let Some(parent_id) = parent_id {
            let orphaned = match self.nodes.get(&parent_id) {
                Some(parent) => match &parent.kind {
                    NodeKind::Directory { children } => {
                        !children.values().any(|&child| child == inode)
                    }
                    _ => true,
                },
                None => true,
            };
            if orphaned {
                self.nodes.remove(&inode);
            }
        }
    }
}

/// The host-facing factory: assemble a tree before (or while) it is
/// mounted. Shared with the driver that serves it.
pub struct MemoryFileSystem {
    uri: Url,
    tree: Arc<Mutex<Tree>>,
}

impl MemoryFileSystem {
    pub fn new() -> Arc<MemoryFileSystem> {
        let seq = MEMFS_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryFileSystem {
            uri: Url::parse(&format!("memfs:/{seq}")).expect("memfs uri"),
            tree: Arc::new(Mutex::new(Tree::new())),
        })
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    fn prepare_parent(&self, tree: &mut Tree, path: &str) -> WasiResult<(u64, String)> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::inval());
        }
        let mut current = ROOT_INODE;
        let segments: Vec<&str> = trimmed.split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            let existing = match &tree.node(current)?.kind {
                NodeKind::Directory { children } => children.get(*segment).copied(),
                _ => return Err(Error::notdir()),
            };
            current = match existing {
                Some(inode) => inode,
                None => tree.allocate(
                    current,
                    segment.to_string(),
                    NodeKind::Directory {
                        children: BTreeMap::new(),
                    },
                ),
            };
        }
        Ok((current, segments[segments.len() - 1].to_string()))
    }

    fn insert(&self, path: &str, kind: NodeKind) -> WasiResult<u64> {
        let mut tree = self.tree.lock();
        let (parent, name) = self.prepare_parent(&mut tree, path)?;
        match &tree.node(parent)?.kind {
            NodeKind::Directory { children } => {
                if children.contains_key(&name) {
                    return Err(Error::exist());
                }
            }
            _ => return Err(Error::notdir()),
        }
        Ok(tree.allocate(parent, name, kind))
    }

    pub fn create_directory(&self, path: &str) -> WasiResult<()> {
        self.insert(
            path,
            NodeKind::Directory {
                children: BTreeMap::new(),
            },
        )?;
        Ok(())
    }

    pub fn create_file(&self, path: &str, content: Vec<u8>) -> WasiResult<()> {
        self.insert(
            path,
            NodeKind::File {
                content: FileContent::Bytes(content),
            },
        )?;
        Ok(())
    }

    /// A file whose bytes are fetched by `reader` on first access.
    pub fn create_lazy_file(&self, path: &str, size: u64, reader: LazyReader) -> WasiResult<()> {
        self.insert(
            path,
            NodeKind::File {
                content: FileContent::Lazy { size, reader },
            },
        )?;
        Ok(())
    }

    /// A character-device node the guest can read; the returned pipe is
    /// the host's write end.
    pub fn create_readable(&self, path: &str) -> WasiResult<Arc<PipeBuffer>> {
        let pipe = PipeBuffer::new();
        self.insert(
            path,
            NodeKind::CharacterDevice {
                readable: Some(pipe.clone()),
                writable: None,
            },
        )?;
        Ok(pipe)
    }

    /// A character-device node the guest can write; the returned pipe is
    /// the host's read end.
    pub fn create_writable(&self, path: &str) -> WasiResult<Arc<PipeBuffer>> {
        let pipe = PipeBuffer::new();
        self.insert(
            path,
            NodeKind::CharacterDevice {
                readable: None,
                writable: Some(pipe.clone()),
            },
        )?;
        Ok(pipe)
    }
}

pub struct MemoryFsDriver {
    id: DeviceId,
    uri: Url,
    tree: Arc<Mutex<Tree>>,
}

impl MemoryFsDriver {
    pub fn new(registry: &DeviceRegistry, fs: &MemoryFileSystem) -> MemoryFsDriver {
        MemoryFsDriver::with_uri(registry, fs, fs.uri.clone())
    }

    /// Serve the tree under a caller-chosen locator (an extension bundle
    /// keeps its editor uri even though the listing lives in memory).
    pub fn with_uri(registry: &DeviceRegistry, fs: &MemoryFileSystem, uri: Url) -> MemoryFsDriver {
        MemoryFsDriver {
            id: registry.allocate_id(),
            uri,
            tree: fs.tree.clone(),
        }
    }

    /// Replace a lazy node's content with fetched bytes. No lock is held
    /// while the reader runs.
    async fn materialize(&self, inode: u64) -> WasiResult<()> {
        let pending = {
            let tree = self.tree.lock();
            match &tree.node(inode)?.kind {
                NodeKind::File {
                    content: FileContent::Lazy { reader, .. },
                } => Some(reader()),
                NodeKind::File { .. } => None,
                _ => return Err(Error::isdir()),
            }
        };
        if let Some(pending) = pending {
            let bytes = pending.await?;
            let mut tree = self.tree.lock();
            let node = tree.node_mut(inode)?;
            if let NodeKind::File { content } = &mut node.kind {
                if matches!(content, FileContent::Lazy { .. }) {
                    *content = FileContent::Bytes(bytes);
                }
            }
        }
        Ok(())
    }

    /// Run `f` over a file's materialised bytes. Callers that may touch a
    /// lazy file call [`MemoryFsDriver::materialize`] first.
    fn with_bytes<R>(&self, inode: u64, f: impl FnOnce(&mut Vec<u8>) -> R) -> WasiResult<R> {
        let mut tree = self.tree.lock();
        let node = tree.node_mut(inode)?;
        match &mut node.kind {
            NodeKind::File {
                content: FileContent::Bytes(bytes),
            } => Ok(f(bytes)),
            NodeKind::File { .. } => Err(Error::from(Errno::Io)),
            _ => Err(Error::isdir()),
        }
    }

    fn touch(&self, inode: u64) {
        if let Ok(node) = self.tree.lock().node_mut(inode) {
            node.mtim = now_ns();
        }
    }

    fn char_stream(&self, inode: u64, write: bool) -> WasiResult<Arc<PipeBuffer>> {
        let tree = self.tree.lock();
        match &tree.node(inode)?.kind {
            NodeKind::CharacterDevice { readable, writable } => {
                let stream = if write { writable } else { readable };
                stream.clone().ok_or_else(Error::badf)
            }
            _ => Err(Error::badf()),
        }
    }

    fn is_char_device(&self, inode: u64) -> bool {
        let tree = self.tree.lock();
        matches!(
            tree.node(inode).map(|n| n.filetype()),
            Ok(Filetype::CharacterDevice)
        )
    }

    fn descriptor_for(
        &self,
        fd: u32,
        inode: u64,
        filetype: Filetype,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
    ) -> Arc<FileDescriptor> {
        let mut tree = self.tree.lock();
        if let Ok(node) = tree.node_mut(inode) {
            node.refs += 1;
        }
        Arc::new(match filetype {
            Filetype::Directory => FileDescriptor::directory(
                self.id,
                fd,
                rights_base,
                rights_inheriting,
                fdflags,
                inode,
            ),
            Filetype::CharacterDevice => {
                FileDescriptor::character_device(self.id, fd, rights_base, fdflags, inode)
            }
            _ => FileDescriptor::file(self.id, fd, rights_base, fdflags, inode),
        })
    }
}

#[async_trait]
impl DeviceDriver for MemoryFsDriver {
    fn id(&self) -> DeviceId {
        self.id
    }
    fn uri(&self) -> &Url {
        &self.uri
    }
    fn kind(&self) -> DeviceKind {
        DeviceKind::FileSystem
    }

    async fn fd_advise(
        &self,
        _fd: &FileDescriptor,
        _offset: u64,
        _len: u64,
        _advice: crate::abi::Advice,
    ) -> WasiResult<()> {
        Ok(())
    }

    async fn fd_allocate(&self, fd: &FileDescriptor, offset: u64, len: u64) -> WasiResult<()> {
        let end = offset.checked_add(len).ok_or(Error::from(Errno::Fbig))?;
        self.materialize(fd.inode).await?;
        let grown = self.with_bytes(fd.inode, |bytes| {
            if (end as usize) > bytes.len() {
                bytes.resize(end as usize, 0);
                true
            } else {
                false
            }
        })?;
        if grown {
            self.touch(fd.inode);
        }
        Ok(())
    }

    async fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.tree.lock().release(fd.inode);
        Ok(())
    }

    async fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        self.tree.lock().filestat(self.id, fd.inode)
    }

    async fn fd_filestat_set_size(&self, fd: &FileDescriptor, size: u64) -> WasiResult<()> {
        self.materialize(fd.inode).await?;
        self.with_bytes(fd.inode, |bytes| bytes.resize(size as usize, 0))?;
        self.touch(fd.inode);
        Ok(())
    }

    async fn fd_read(&self, fd: &FileDescriptor, len: u64) -> WasiResult<Vec<u8>> {
        if self.is_char_device(fd.inode) {
            return Ok(self.char_stream(fd.inode, false)?.read(len as usize).await);
        }
        self.materialize(fd.inode).await?;
        let cursor = fd.cursor()?;
        let out = self.with_bytes(fd.inode, |bytes| {
            let start = std::cmp::min(cursor as usize, bytes.len());
            let take = std::cmp::min(len as usize, bytes.len() - start);
            bytes[start..start + take].to_vec()
        })?;
        fd.advance_cursor(out.len() as u64)?;
        Ok(out)
    }

    async fn fd_pread(&self, fd: &FileDescriptor, offset: u64, len: u64) -> WasiResult<Vec<u8>> {
        self.materialize(fd.inode).await?;
        self.with_bytes(fd.inode, |bytes| {
            let start = std::cmp::min(offset as usize, bytes.len());
            let take = std::cmp::min(len as usize, bytes.len() - start);
            bytes[start..start + take].to_vec()
        })
    }

    async fn fd_write(&self, fd: &FileDescriptor, data: &[u8]) -> WasiResult<u64> {
        if self.is_char_device(fd.inode) {
            return Ok(self.char_stream(fd.inode, true)?.write(data).await);
        }
        self.materialize(fd.inode).await?;
        let append = fd.fdflags.contains(Fdflags::APPEND);
        let mut cursor = fd.cursor()?;
        let written = self.with_bytes(fd.inode, |bytes| {
            if append {
                cursor = bytes.len() as u64;
            }
            let end = cursor as usize + data.len();
            if end > bytes.len() {
                bytes.resize(end, 0);
            }
            bytes[cursor as usize..end].copy_from_slice(data);
            data.len() as u64
        })?;
        self.touch(fd.inode);
        fd.set_cursor(cursor + written)?;
        Ok(written)
    }

    async fn fd_pwrite(&self, fd: &FileDescriptor, offset: u64, data: &[u8]) -> WasiResult<u64> {
        self.materialize(fd.inode).await?;
        let written = self.with_bytes(fd.inode, |bytes| {
            let end = offset as usize + data.len();
            if end > bytes.len() {
                bytes.resize(end, 0);
            }
            bytes[offset as usize..end].copy_from_slice(data);
            data.len() as u64
        })?;
        self.touch(fd.inode);
        Ok(written)
    }

    async fn fd_seek(&self, fd: &FileDescriptor, offset: i64, whence: Whence) -> WasiResult<u64> {
        let size = self.tree.lock().node(fd.inode)?.size();
        let cursor = fd.cursor()?;
        let new_cursor = match whence {
            Whence::Set => u64::try_from(offset).map_err(|_| Error::inval())?,
            Whence::Cur => {
                if offset < 0 {
                    cursor
                        .checked_sub(offset.unsigned_abs())
                        .ok_or_else(Error::inval)?
                } else {
                    cursor.checked_add(offset as u64).ok_or_else(Error::inval)?
                }
            }
            Whence::End => size.saturating_sub(u64::try_from(offset).map_err(|_| Error::inval())?),
        };
        let clamped = std::cmp::min(new_cursor, size);
        fd.set_cursor(clamped)?;
        Ok(clamped)
    }

    async fn fd_sync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    async fn fd_datasync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    async fn fd_readdir(&self, fd: &FileDescriptor) -> WasiResult<Vec<ReaddirEntry>> {
        let tree = self.tree.lock();
        let node = tree.node(fd.inode)?;
        match &node.kind {
            NodeKind::Directory { children } => Ok(children
                .iter()
                .filter_map(|(name, inode)| {
                    let child = tree.nodes.get(inode)?;
                    Some(ReaddirEntry {
                        inode: *inode,
                        filetype: child.filetype(),
                        name: name.clone(),
                    })
                })
                .collect()),
            _ => Err(Error::notdir()),
        }
    }

    async fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        if self.is_char_device(fd.inode) {
            return Ok(self.char_stream(fd.inode, false)?.available());
        }
        let size = self.tree.lock().node(fd.inode)?.size();
        Ok(size.saturating_sub(fd.cursor().unwrap_or(0)))
    }

    async fn path_open(
        &self,
        fd: u32,
        parent: &FileDescriptor,
        path: &str,
        oflags: Oflags,
        fdflags: Fdflags,
        rights_base: Rights,
        rights_inheriting: Rights,
    ) -> WasiResult<Arc<FileDescriptor>> {
        let (inode, filetype, truncate) = {
            let mut tree = self.tree.lock();
            match tree.resolve(parent.inode, path) {
                Ok(inode) => {
                    if oflags.contains(Oflags::CREAT | Oflags::EXCL) {
                        return Err(Error::exist());
                    }
                    let filetype = tree.node(inode)?.filetype();
                    if oflags.contains(Oflags::DIRECTORY) && filetype != Filetype::Directory {
                        return Err(Error::notdir());
                    }
                    (inode, filetype, oflags.contains(Oflags::TRUNC))
                }
                Err(Error::Wasi(Errno::Noent)) if oflags.contains(Oflags::CREAT) => {
                    let (dir, name) = tree.resolve_parent(parent.inode, path)?;
                    if tree.node(dir)?.filetype() != Filetype::Directory {
                        return Err(Error::notdir());
                    }
                    let inode = tree.allocate(
                        dir,
                        name.to_string(),
                        NodeKind::File {
                            content: FileContent::Bytes(Vec::new()),
                        },
                    );
                    (inode, Filetype::RegularFile, false)
                }
                Err(err) => return Err(err),
            }
        };
        if truncate {
            let mut tree = self.tree.lock();
            let node = tree.node_mut(inode)?;
            if let NodeKind::File { content } = &mut node.kind {
                *content = FileContent::Bytes(Vec::new());
                node.mtim = now_ns();
            }
        }
        Ok(self.descriptor_for(fd, inode, filetype, rights_base, rights_inheriting, fdflags))
    }

    async fn path_create_directory(&self, parent: &FileDescriptor, path: &str) -> WasiResult<()> {
        let mut tree = self.tree.lock();
        let (dir, name) = tree.resolve_parent(parent.inode, path)?;
        match &tree.node(dir)?.kind {
            NodeKind::Directory { children } => {
                if children.contains_key(name) {
                    return Err(Error::exist());
                }
            }
            _ => return Err(Error::notdir()),
        }
        tree.allocate(
            dir,
            name.to_string(),
            NodeKind::Directory {
                children: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn path_filestat_get(
        &self,
        parent: &FileDescriptor,
        _flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        let tree = self.tree.lock();
        let inode = tree.resolve(parent.inode, path)?;
        tree.filestat(self.id, inode)
    }

    async fn path_remove_directory(&self, parent: &FileDescriptor, path: &str) -> WasiResult<()> {
        let mut tree = self.tree.lock();
        let (dir, name) = tree.resolve_parent(parent.inode, path)?;
        let inode = tree.resolve(dir, name)?;
        let node = tree.node(inode)?;
        match &node.kind {
            NodeKind::Directory { children } => {
                if !children.is_empty() {
                    return Err(Error::from(Errno::Notempty));
                }
            }
            _ => return Err(Error::notdir()),
        }
        tree.detach(dir, name)?;
        if tree.node(inode).map(|n| n.refs).unwrap_or(0) == 0 {
            tree.nodes.remove(&inode);
        }
        Ok(())
    }

    async fn path_unlink_file(&self, parent: &FileDescriptor, path: &str) -> WasiResult<()> {
        let mut tree = self.tree.lock();
        let (dir, name) = tree.resolve_parent(parent.inode, path)?;
        let inode = tree.resolve(dir, name)?;
        if tree.node(inode)?.filetype() == Filetype::Directory {
            return Err(Error::isdir());
        }
        tree.detach(dir, name)?;
        // Deleted-but-open nodes stay in the arena as tombstones until the
        // last descriptor goes away.
        if tree.node(inode).map(|n| n.refs).unwrap_or(0) == 0 {
            tree.nodes.remove(&inode);
        }
        Ok(())
    }

    async fn path_rename(
        &self,
        old_parent: &FileDescriptor,
        old_path: &str,
        new_parent: &FileDescriptor,
        new_path: &str,
    ) -> WasiResult<()> {
        if new_parent.device != self.id {
            return Err(Error::nosys());
        }
        let mut tree = self.tree.lock();
        let (old_dir, old_name) = tree.resolve_parent(old_parent.inode, old_path)?;
        let (new_dir, new_name) = tree.resolve_parent(new_parent.inode, new_path)?;
        match &tree.node(new_dir)?.kind {
            NodeKind::Directory { children } => {
                if children.contains_key(new_name) {
                    return Err(Error::exist());
                }
            }
            _ => return Err(Error::notdir()),
        }
        let inode = tree.detach(old_dir, old_name)?;
        {
            let node = tree.node_mut(inode)?;
            node.parent = new_dir;
            node.name = new_name.to_string();
        }
        let new_name = new_name.to_string();
        match &mut tree.node_mut(new_dir)?.kind {
            NodeKind::Directory { children } => {
                children.insert(new_name, inode);
            }
            _ => unreachable!("checked above"),
        }
        Ok(())
    }

    async fn prestat_fd(&self, fd: u32) -> WasiResult<Arc<FileDescriptor>> {
        Ok(self.descriptor_for(
            fd,
            ROOT_INODE,
            Filetype::Directory,
            Rights::directory_base(),
            Rights::directory_inheriting(),
            Fdflags::empty(),
        ))
    }

    async fn create_stdio_fd(
        &self,
        fd: u32,
        path: Option<&str>,
        fdflags: Fdflags,
    ) -> WasiResult<Arc<FileDescriptor>> {
        if fd > 2 {
            return Err(Error::inval());
        }
        let path = path.ok_or_else(Error::inval)?;
        let (inode, filetype) = {
            let tree = self.tree.lock();
            let inode = tree.resolve(ROOT_INODE, path.trim_start_matches('/'))?;
            (inode, tree.node(inode)?.filetype())
        };
        let rights = match filetype {
            Filetype::CharacterDevice => Rights::character_device_base(),
            _ => Rights::file_base(),
        };
        Ok(self.descriptor_for(fd, inode, filetype, rights, Rights::empty(), fdflags))
    }

    fn join_path(&self, segments: &[&str]) -> WasiResult<Url> {
        let mut uri = self.uri.clone();
        let joined = segments.join("/");
        let base = uri.path().trim_end_matches('/').to_string();
        uri.set_path(&format!("{base}/{joined}"));
        Ok(uri)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (DeviceRegistry, Arc<MemoryFileSystem>, MemoryFsDriver) {
        let registry = DeviceRegistry::new();
        let fs = MemoryFileSystem::new();
        let driver = MemoryFsDriver::new(&registry, &fs);
        (registry, fs, driver)
    }

    async fn root(driver: &MemoryFsDriver) -> Arc<FileDescriptor> {
        driver.prestat_fd(3).await.unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_registry, _fs, driver) = fixture();
        let root = root(&driver).await;
        let fd = driver
            .path_open(
                5,
                &root,
                "a",
                Oflags::CREAT,
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap();
        assert_eq!(driver.fd_write(&fd, b"hello").await.unwrap(), 5);
        driver.fd_seek(&fd, 0, Whence::Set).await.unwrap();
        assert_eq!(driver.fd_read(&fd, 5).await.unwrap(), b"hello");
        let stat = driver.fd_filestat_get(&fd).await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.filetype, Filetype::RegularFile);
    }

    #[tokio::test]
    async fn open_creat_excl_on_existing_fails_exist() {
        let (_registry, fs, driver) = fixture();
        fs.create_file("/a", b"x".to_vec()).unwrap();
        let root = root(&driver).await;
        let err = driver
            .path_open(
                5,
                &root,
                "a",
                Oflags::CREAT | Oflags::EXCL,
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wasi(Errno::Exist)));
    }

    #[tokio::test]
    async fn open_directory_flag_on_file_fails_notdir() {
        let (_registry, fs, driver) = fixture();
        fs.create_file("/a", Vec::new()).unwrap();
        let root = root(&driver).await;
        let err = driver
            .path_open(
                5,
                &root,
                "a",
                Oflags::DIRECTORY,
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wasi(Errno::Notdir)));
    }

    #[tokio::test]
    async fn directory_size_is_page_rounded() {
        let (_registry, fs, driver) = fixture();
        fs.create_directory("/d").unwrap();
        fs.create_file("/d/one", Vec::new()).unwrap();
        let root = root(&driver).await;
        let stat = driver
            .path_filestat_get(&root, Lookupflags::empty(), "d")
            .await
            .unwrap();
        assert_eq!(stat.size, 4096);
    }

    #[tokio::test]
    async fn unlinked_open_file_remains_readable() {
        let (_registry, fs, driver) = fixture();
        fs.create_file("/a", b"keep".to_vec()).unwrap();
        let root = root(&driver).await;
        let fd = driver
            .path_open(
                5,
                &root,
                "a",
                Oflags::empty(),
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap();
        driver.path_unlink_file(&root, "a").await.unwrap();
        assert!(driver
            .path_filestat_get(&root, Lookupflags::empty(), "a")
            .await
            .is_err());
        assert_eq!(driver.fd_read(&fd, 4).await.unwrap(), b"keep");
        driver.fd_close(&fd).await.unwrap();
        // After the last reference is gone, the tombstone is dropped too.
        assert!(driver.tree.lock().nodes.get(&fd.inode).is_none());
    }

    #[tokio::test]
    async fn rename_preserves_inode() {
        let (_registry, fs, driver) = fixture();
        fs.create_file("/a", b"same bytes".to_vec()).unwrap();
        let root = root(&driver).await;
        let fd = driver
            .path_open(
                5,
                &root,
                "a",
                Oflags::empty(),
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap();
        driver.path_rename(&root, "a", &root, "b").await.unwrap();
        let stat = driver
            .path_filestat_get(&root, Lookupflags::empty(), "b")
            .await
            .unwrap();
        assert_eq!(stat.ino, fd.inode);
        assert_eq!(driver.fd_read(&fd, 16).await.unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn lazy_files_materialise_on_first_read() {
        let (_registry, fs, driver) = fixture();
        fs.create_lazy_file(
            "/lazy",
            7,
            Box::new(|| Box::pin(async { Ok(b"fetched".to_vec()) })),
        )
        .unwrap();
        let root = root(&driver).await;
        let stat = driver
            .path_filestat_get(&root, Lookupflags::empty(), "lazy")
            .await
            .unwrap();
        assert_eq!(stat.size, 7);
        let fd = driver
            .path_open(
                5,
                &root,
                "lazy",
                Oflags::empty(),
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap();
        assert_eq!(driver.fd_read(&fd, 16).await.unwrap(), b"fetched");
    }

    #[tokio::test]
    async fn readdir_lists_backend_order() {
        let (_registry, fs, driver) = fixture();
        fs.create_file("/b", Vec::new()).unwrap();
        fs.create_file("/a", Vec::new()).unwrap();
        fs.create_directory("/c").unwrap();
        let root = root(&driver).await;
        let entries = driver.fd_readdir(&root).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(entries[2].filetype, Filetype::Directory);
    }

    #[tokio::test]
    async fn append_mode_writes_at_end() {
        let (_registry, fs, driver) = fixture();
        fs.create_file("/log", b"one".to_vec()).unwrap();
        let root = root(&driver).await;
        let fd = driver
            .path_open(
                5,
                &root,
                "log",
                Oflags::empty(),
                Fdflags::APPEND,
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap();
        driver.fd_write(&fd, b"+two").await.unwrap();
        let stat = driver.fd_filestat_get(&fd).await.unwrap();
        assert_eq!(stat.size, 7);
    }

    #[tokio::test]
    async fn guest_reads_readable_device_node() {
        let (_registry, fs, driver) = fixture();
        let host_end = fs.create_readable("/dev/in").unwrap();
        host_end.write(b"from host").await;
        let root = root(&driver).await;
        let fd = driver
            .path_open(
                5,
                &root,
                "dev/in",
                Oflags::empty(),
                Fdflags::empty(),
                Rights::character_device_base(),
                Rights::empty(),
            )
            .await
            .unwrap();
        assert_eq!(fd.filetype, Filetype::CharacterDevice);
        assert_eq!(driver.fd_read(&fd, 16).await.unwrap(), b"from host");
    }

    #[tokio::test]
    async fn remove_directory_requires_empty() {
        let (_registry, fs, driver) = fixture();
        fs.create_directory("/d").unwrap();
        fs.create_file("/d/f", Vec::new()).unwrap();
        let root = root(&driver).await;
        let err = driver.path_remove_directory(&root, "d").await.unwrap_err();
        assert!(matches!(err, Error::Wasi(Errno::Notempty)));
        driver.path_unlink_file(&root, "d/f").await.unwrap();
        driver.path_remove_directory(&root, "d").await.unwrap();
    }
}
