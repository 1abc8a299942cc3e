//! Presents an editor's filesystem capability as a WASI filesystem. The
//! driver mirrors every path the guest has touched in a node cache keyed
//! by inode; file content is fetched lazily on first read and written
//! through to the back-end. Nodes deleted while descriptors are still
//! open live on in a tombstone cache.

use crate::abi::{Errno, Fdflags, Filestat, Filetype, Lookupflags, Oflags, Rights, Whence};
use crate::driver::{DeviceDriver, DeviceId, DeviceKind, DeviceRegistry, ReaddirEntry};
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

pub const ROOT_INODE: u64 = 1;

/// File kinds the editor API reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EditorFileType {
    File,
    Directory,
    SymbolicLink,
    Unknown,
}

impl From<EditorFileType> for Filetype {
    fn from(ft: EditorFileType) -> Filetype {
        match ft {
            EditorFileType::File => Filetype::RegularFile,
            EditorFileType::Directory => Filetype::Directory,
            EditorFileType::SymbolicLink => Filetype::SymbolicLink,
            EditorFileType::Unknown => Filetype::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EditorStat {
    pub filetype: EditorFileType,
    pub size: u64,
    pub ctime: u64,
    pub mtime: u64,
}

/// Errors the editor capability can report. Mapped to WASI errnos at the
/// driver boundary by a fixed table.
#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("file not found")]
    FileNotFound,
    #[error("file exists")]
    FileExists,
    #[error("not a directory")]
    FileNotADirectory,
    #[error("is a directory")]
    FileIsADirectory,
    #[error("no permissions")]
    NoPermissions,
    #[error("unavailable")]
    Unavailable,
    #[error("{0}")]
    Other(String),
}

impl From<EditorError> for Error {
    fn from(err: EditorError) -> Error {
        let errno = match err {
            EditorError::FileNotFound => Errno::Noent,
            EditorError::FileExists => Errno::Exist,
            EditorError::FileNotADirectory => Errno::Notdir,
            EditorError::FileIsADirectory => Errno::Isdir,
            EditorError::NoPermissions => Errno::Perm,
            EditorError::Unavailable => Errno::Busy,
            EditorError::Other(_) => Errno::Inval,
        };
        Error::Wasi(errno)
    }
}

/// The editor filesystem capability: an external collaborator named only
/// by its contract. Paths are absolute within the capability's root.
#[async_trait]
pub trait EditorFileSystem: Send + Sync {
    async fn stat(&self, path: &str) -> Result<EditorStat, EditorError>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, EditorError>;
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), EditorError>;
    async fn read_directory(&self, path: &str)
        -> Result<Vec<(String, EditorFileType)>, EditorError>;
    async fn create_directory(&self, path: &str) -> Result<(), EditorError>;
    async fn delete(&self, path: &str) -> Result<(), EditorError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), EditorError>;
}

enum CacheKind {
    File {
        /// Fetched on first read, then authoritative for reads and grown
        /// by writes.
        content: Option<Vec<u8>>,
    },
    Directory {
        children: HashMap<String, u64>,
    },
}

struct CacheNode {
    inode: u64,
    parent: u64,
    name: String,
    refs: u32,
    kind: CacheKind,
}

struct Tombstone {
    stat: Filestat,
    content: Option<Vec<u8>>,
    refs: u32,
}

struct Cache {
    nodes: HashMap<u64, CacheNode>,
    tombstones: HashMap<u64, Tombstone>,
    next_inode: u64,
}

impl Cache {
    fn new() -> Cache {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            CacheNode {
                inode: ROOT_INODE,
                parent: ROOT_INODE,
                name: String::new(),
                refs: 1,
                kind: CacheKind::Directory {
                    children: HashMap::new(),
                },
            },
        );
        Cache {
            nodes,
            tombstones: HashMap::new(),
            next_inode: 2,
        }
    }

    fn node(&self, inode: u64) -> WasiResult<&CacheNode> {
        self.nodes.get(&inode).ok_or_else(Error::badf)
    }

    fn node_mut(&mut self, inode: u64) -> WasiResult<&mut CacheNode> {
        self.nodes.get_mut(&inode).ok_or_else(Error::badf)
    }

    /// The capability-absolute path of a cached node.
    fn path_of(&self, inode: u64) -> WasiResult<String> {
        let mut segments: Vec<&str> = Vec::new();
        let mut current = inode;
        while current != ROOT_INODE {
            let node = self.node(current)?;
            segments.push(&node.name);
            current = node.parent;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Get or create the cache node for `name` under `parent`. The
    /// refcount is not bumped.
    fn ensure_child(&mut self, parent: u64, name: &str, directory: bool) -> WasiResult<u64> {
        let existing = match &self.node(parent)?.kind {
            CacheKind::Directory { children } => children.get(name).copied(),
            _ => return Err(Error::notdir()),
        };
        if let Some(inode) = existing {
            return Ok(inode);
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.nodes.insert(
            inode,
            CacheNode {
                inode,
                parent,
                name: name.to_string(),
                refs: 0,
                kind: if directory {
                    CacheKind::Directory {
                        children: HashMap::new(),
                    }
                } else {
                    CacheKind::File { content: None }
                },
            },
        );
        match &mut self.node_mut(parent)?.kind {
            CacheKind::Directory { children } => {
                children.insert(name.to_string(), inode);
            }
            _ => unreachable!("checked above"),
        }
        Ok(inode)
    }

    /// Walk a relative path from `start`, materialising intermediate
    /// directory nodes. Returns the inode of the parent directory and the
    /// final segment; an empty final segment means `start` itself.
    fn walk_parent(&mut self, start: u64, path: &str) -> WasiResult<(u64, String)> {
        let mut current = start;
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    if segments.pop().is_none() {
                        current = self.node(current)?.parent;
                    }
                }
                _ => segments.push(segment),
            }
        }
        let Some((last, intermediate)) = segments.split_last() else {
            return Ok((current, String::new()));
        };
        for segment in intermediate {
            current = self.ensure_child(current, segment, true)?;
        }
        Ok((current, (*last).to_string()))
    }

    /// Detach a node from its parent and park it in the tombstone cache
    /// if descriptors still reference it.
    fn bury(&mut self, inode: u64, stat: Filestat, content: Option<Vec<u8>>) {
        let Some(node) = self.nodes.remove(&inode) else {
            return;
        };
        if let Some(parent) = self.nodes.get_mut(&node.parent) {
            if let CacheKind::Directory { children } = &mut parent.kind {
                children.remove(&node.name);
            }
        }
        if node.refs > 0 {
            self.tombstones.insert(
                inode,
                Tombstone {
                    stat,
                    content,
                    refs: node.refs,
                },
            );
        }
    }

    fn retain(&mut self, inode: u64) {
        if let Some(node) = self.nodes.get_mut(&inode) {
            node.refs += 1;
        } else if let Some(tomb) = self.tombstones.get_mut(&inode) {
            tomb.refs += 1;
        }
    }

    fn release(&mut self, inode: u64) {
        if let Some(node) = self.nodes.get_mut(&inode) {
            node.refs = node.refs.saturating_sub(1);
        } else if let Some(tomb) = self.tombstones.get_mut(&inode) {
            tomb.refs = tomb.refs.saturating_sub(1);
            if tomb.refs == 0 {
                self.tombstones.remove(&inode);
            }
        }
    }
}

pub struct EditorFsDriver {
    id: DeviceId,
    uri: Url,
    fs: Arc<dyn EditorFileSystem>,
    cache: Mutex<Cache>,
}

impl EditorFsDriver {
    pub fn new(registry: &DeviceRegistry, uri: Url, fs: Arc<dyn EditorFileSystem>) -> EditorFsDriver {
        EditorFsDriver {
            id: registry.allocate_id(),
            uri,
            fs,
            cache: Mutex::new(Cache::new()),
        }
    }

    /// Resolve a path relative to `parent` into (parent inode, name,
    /// capability path of the target).
    fn locate(&self, parent: u64, path: &str) -> WasiResult<(u64, String, String)> {
        let mut cache = self.cache.lock();
        let (dir, name) = cache.walk_parent(parent, path)?;
        let dir_path = cache.path_of(dir)?;
        let full = if name.is_empty() {
            dir_path.clone()
        } else if dir_path == "/" {
            format!("/{name}")
        } else {
            format!("{dir_path}/{name}")
        };
        Ok((dir, name, full))
    }

    fn filestat_from(&self, inode: u64, stat: &EditorStat) -> Filestat {
        Filestat {
            dev: self.id.raw(),
            ino: inode,
            filetype: stat.filetype.into(),
            nlink: 1,
            size: stat.size,
            atim: stat.mtime,
            mtim: stat.mtime,
            ctim: stat.ctime,
        }
    }

    /// Load and cache a file's content; tombstoned nodes read from their
    /// cached copy.
    async fn fetch_content(&self, inode: u64) -> WasiResult<Vec<u8>> {
        let path = {
            let cache = self.cache.lock();
            if let Some(tomb) = cache.tombstones.get(&inode) {
                return Ok(tomb.content.clone().unwrap_or_default());
            }
            match &cache.node(inode)?.kind {
                CacheKind::File {
                    content: Some(content),
                } => return Ok(content.clone()),
                CacheKind::File { content: None } => cache.path_of(inode)?,
                _ => return Err(Error::isdir()),
            }
        };
        let bytes = self.fs.read_file(&path).await?;
        let mut cache = self.cache.lock();
        if let Ok(node) = cache.node_mut(inode) {
            if let CacheKind::File { content } = &mut node.kind {
                if content.is_none() {
                    *content = Some(bytes.clone());
                }
            }
        }
        Ok(bytes)
    }

    /// Store new content in the cache and persist it unless the node is a
    /// tombstone (the back-end path is gone).
    async fn store_content(&self, inode: u64, bytes: Vec<u8>) -> WasiResult<()> {
        let path = {
            let mut cache = self.cache.lock();
            if let Some(tomb) = cache.tombstones.get_mut(&inode) {
                tomb.stat.size = bytes.len() as u64;
                tomb.content = Some(bytes);
                return Ok(());
            }
            let path = cache.path_of(inode)?;
            match &mut cache.node_mut(inode)?.kind {
                CacheKind::File { content } => *content = Some(bytes.clone()),
                _ => return Err(Error::isdir()),
            }
            path
        };
        self.fs.write_file(&path, &bytes).await?;
        Ok(())
    }

    async fn size_of(&self, inode: u64) -> WasiResult<u64> {
        Ok(self.fetch_content(inode).await?.len() as u64)
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
        self.cache.lock().retain(inode);
        Arc::new(match filetype {
            Filetype::Directory => FileDescriptor::directory(
                self.id,
                fd,
                rights_base,
                rights_inheriting,
                fdflags,
                inode,
            ),
            _ => FileDescriptor::file(self.id, fd, rights_base, fdflags, inode),
        })
    }
}

#[async_trait]
impl DeviceDriver for EditorFsDriver {
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
        let end = offset.checked_add(len).ok_or(Error::from(Errno::Fbig))? as usize;
        let mut content = self.fetch_content(fd.inode).await?;
        if end > content.len() {
            content.resize(end, 0);
            self.store_content(fd.inode, content).await?;
        }
        Ok(())
    }

    async fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.cache.lock().release(fd.inode);
        Ok(())
    }

    async fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        let (path, cached_len) = {
            let cache = self.cache.lock();
            if let Some(tomb) = cache.tombstones.get(&fd.inode) {
                return Ok(tomb.stat);
            }
            let cached_len = match &cache.node(fd.inode)?.kind {
                CacheKind::File {
                    content: Some(content),
                } => Some(content.len() as u64),
                _ => None,
            };
            (cache.path_of(fd.inode)?, cached_len)
        };
        match (self.fs.stat(&path).await, cached_len) {
            // Loaded content is authoritative over the back-end size.
            (Ok(stat), Some(len)) => {
                let mut filestat = self.filestat_from(fd.inode, &stat);
                filestat.size = len;
                Ok(filestat)
            }
            (Ok(stat), None) => Ok(self.filestat_from(fd.inode, &stat)),
            // The back-end lost the file but we still hold its bytes.
            (Err(_), Some(len)) => Ok(Filestat {
                dev: self.id.raw(),
                ino: fd.inode,
                filetype: fd.filetype,
                nlink: 1,
                size: len,
                atim: 0,
                mtim: 0,
                ctim: 0,
            }),
            (Err(err), None) => Err(err.into()),
        }
    }

    async fn fd_filestat_set_size(&self, fd: &FileDescriptor, size: u64) -> WasiResult<()> {
        let mut content = self.fetch_content(fd.inode).await?;
        content.resize(size as usize, 0);
        self.store_content(fd.inode, content).await
    }

    async fn fd_read(&self, fd: &FileDescriptor, len: u64) -> WasiResult<Vec<u8>> {
        let content = self.fetch_content(fd.inode).await?;
        let cursor = fd.cursor()? as usize;
        let start = std::cmp::min(cursor, content.len());
        let take = std::cmp::min(len as usize, content.len() - start);
        let out = content[start..start + take].to_vec();
        fd.advance_cursor(out.len() as u64)?;
        Ok(out)
    }

    async fn fd_pread(&self, fd: &FileDescriptor, offset: u64, len: u64) -> WasiResult<Vec<u8>> {
        let content = self.fetch_content(fd.inode).await?;
        let start = std::cmp::min(offset as usize, content.len());
        let take = std::cmp::min(len as usize, content.len() - start);
        Ok(content[start..start + take].to_vec())
    }

    async fn fd_write(&self, fd: &FileDescriptor, data: &[u8]) -> WasiResult<u64> {
        let mut content = self.fetch_content(fd.inode).await?;
        let cursor = if fd.fdflags.contains(Fdflags::APPEND) {
            content.len() as u64
        } else {
            fd.cursor()?
        };
        let end = cursor as usize + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[cursor as usize..end].copy_from_slice(data);
        self.store_content(fd.inode, content).await?;
        fd.set_cursor(cursor + data.len() as u64)?;
        Ok(data.len() as u64)
    }

    async fn fd_pwrite(&self, fd: &FileDescriptor, offset: u64, data: &[u8]) -> WasiResult<u64> {
        let mut content = self.fetch_content(fd.inode).await?;
        let end = offset as usize + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        self.store_content(fd.inode, content).await?;
        Ok(data.len() as u64)
    }

    async fn fd_seek(&self, fd: &FileDescriptor, offset: i64, whence: Whence) -> WasiResult<u64> {
        let size = self.size_of(fd.inode).await?;
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
        // Writes persist eagerly; nothing is pending.
        Ok(())
    }

    async fn fd_datasync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    async fn fd_readdir(&self, fd: &FileDescriptor) -> WasiResult<Vec<ReaddirEntry>> {
        let path = self.cache.lock().path_of(fd.inode)?;
        let listing = self.fs.read_directory(&path).await?;
        let mut cache = self.cache.lock();
        let mut entries = Vec::with_capacity(listing.len());
        for (name, filetype) in listing {
            let inode = cache.ensure_child(
                fd.inode,
                &name,
                filetype == EditorFileType::Directory,
            )?;
            entries.push(ReaddirEntry {
                inode,
                filetype: filetype.into(),
                name,
            });
        }
        Ok(entries)
    }

    async fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        let size = self.size_of(fd.inode).await?;
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
        let (dir, name, full) = self.locate(parent.inode, path)?;
        if name.is_empty() {
            // Opening the directory the descriptor already points at.
            return Ok(self.descriptor_for(
                fd,
                dir,
                Filetype::Directory,
                rights_base,
                rights_inheriting,
                fdflags,
            ));
        }

        let (inode, filetype) = match self.fs.stat(&full).await {
            Err(EditorError::FileNotFound) => {
                if !oflags.contains(Oflags::CREAT) {
                    return Err(Error::noent());
                }
                let dir_path = self.cache.lock().path_of(dir)?;
                let parent_stat = self.fs.stat(&dir_path).await?;
                if parent_stat.filetype != EditorFileType::Directory {
                    return Err(Error::notdir());
                }
                self.fs.write_file(&full, &[]).await?;
                let mut cache = self.cache.lock();
                let inode = cache.ensure_child(dir, &name, false)?;
                if let CacheKind::File { content } = &mut cache.node_mut(inode)?.kind {
                    *content = Some(Vec::new());
                }
                (inode, Filetype::RegularFile)
            }
            Err(err) => return Err(err.into()),
            Ok(stat) => {
                if oflags.contains(Oflags::CREAT | Oflags::EXCL) {
                    return Err(Error::exist());
                }
                if oflags.contains(Oflags::DIRECTORY)
                    && stat.filetype != EditorFileType::Directory
                {
                    return Err(Error::notdir());
                }
                let inode = {
                    let mut cache = self.cache.lock();
                    cache.ensure_child(dir, &name, stat.filetype == EditorFileType::Directory)?
                };
                if oflags.contains(Oflags::TRUNC) {
                    self.fs.write_file(&full, &[]).await?;
                    let mut cache = self.cache.lock();
                    if let CacheKind::File { content } = &mut cache.node_mut(inode)?.kind {
                        *content = Some(Vec::new());
                    }
                }
                (inode, stat.filetype.into())
            }
        };

        Ok(self.descriptor_for(fd, inode, filetype, rights_base, rights_inheriting, fdflags))
    }

    async fn path_create_directory(&self, parent: &FileDescriptor, path: &str) -> WasiResult<()> {
        let (dir, name, full) = self.locate(parent.inode, path)?;
        if name.is_empty() {
            return Err(Error::exist());
        }
        self.fs.create_directory(&full).await?;
        self.cache.lock().ensure_child(dir, &name, true)?;
        Ok(())
    }

    async fn path_filestat_get(
        &self,
        parent: &FileDescriptor,
        _flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        let (dir, name, full) = self.locate(parent.inode, path)?;
        let stat = self.fs.stat(&full).await?;
        let inode = if name.is_empty() {
            dir
        } else {
            self.cache
                .lock()
                .ensure_child(dir, &name, stat.filetype == EditorFileType::Directory)?
        };
        Ok(self.filestat_from(inode, &stat))
    }

    async fn path_remove_directory(&self, parent: &FileDescriptor, path: &str) -> WasiResult<()> {
        let (dir, name, full) = self.locate(parent.inode, path)?;
        if name.is_empty() {
            return Err(Error::inval());
        }
        let stat = self.fs.stat(&full).await?;
        if stat.filetype != EditorFileType::Directory {
            return Err(Error::notdir());
        }
        self.fs.delete(&full).await?;
        let mut cache = self.cache.lock();
        let inode = match &cache.node(dir)?.kind {
            CacheKind::Directory { children } => children.get(&name).copied(),
            _ => None,
        };
        if let Some(inode) = inode {
            let filestat = self.filestat_from(inode, &stat);
            cache.bury(inode, filestat, None);
        }
        Ok(())
    }

    async fn path_unlink_file(&self, parent: &FileDescriptor, path: &str) -> WasiResult<()> {
        let (dir, name, full) = self.locate(parent.inode, path)?;
        if name.is_empty() {
            return Err(Error::isdir());
        }
        let stat = self.fs.stat(&full).await?;
        if stat.filetype == EditorFileType::Directory {
            return Err(Error::isdir());
        }

        // Capture content for any still-open descriptor before the
        // back-end forgets it.
        let open_inode = {
            let cache = self.cache.lock();
            match &cache.node(dir)?.kind {
                CacheKind::Directory { children } => children.get(&name).copied(),
                _ => None,
            }
        };
        let content = match open_inode {
            Some(inode) if self.cache.lock().node(inode).map(|n| n.refs > 0).unwrap_or(false) => {
                Some(self.fetch_content(inode).await?)
            }
            _ => None,
        };

        self.fs.delete(&full).await?;
        if let Some(inode) = open_inode {
            let filestat = self.filestat_from(inode, &stat);
            self.cache.lock().bury(inode, filestat, content);
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
        let (old_dir, old_name, old_full) = self.locate(old_parent.inode, old_path)?;
        let (new_dir, new_name, new_full) = self.locate(new_parent.inode, new_path)?;
        if old_name.is_empty() || new_name.is_empty() {
            return Err(Error::inval());
        }
        self.fs.rename(&old_full, &new_full).await?;

        // Rename the cached node in place so open descriptors keep their
        // inode and content.
        let mut cache = self.cache.lock();
        let moved = match &mut cache.node_mut(old_dir)?.kind {
            CacheKind::Directory { children } => children.remove(&old_name),
            _ => None,
        };
        if let Some(inode) = moved {
            {
                let node = cache.node_mut(inode)?;
                node.parent = new_dir;
                node.name = new_name.clone();
            }
            match &mut cache.node_mut(new_dir)?.kind {
                CacheKind::Directory { children } => {
                    children.insert(new_name, inode);
                }
                _ => return Err(Error::notdir()),
            }
        }
        Ok(())
    }

    async fn path_readlink(&self, parent: &FileDescriptor, path: &str) -> WasiResult<String> {
        let (_dir, _name, full) = self.locate(parent.inode, path)?;
        let stat = self.fs.stat(&full).await?;
        if stat.filetype != EditorFileType::SymbolicLink {
            return Err(Error::inval());
        }
        // Symbolic links are observable via stat only; the editor API
        // exposes no target resolution.
        Err(Error::nosys())
    }

    async fn prestat_fd(&self, fd: u32) -> WasiResult<Arc<FileDescriptor>> {
        debug!(uri = %self.uri, fd, "creating preopen for editor filesystem");
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
        let (dir, name, full) = self.locate(ROOT_INODE, path.trim_start_matches('/'))?;
        if name.is_empty() {
            return Err(Error::isdir());
        }
        match self.fs.stat(&full).await {
            Ok(stat) if stat.filetype == EditorFileType::Directory => {
                return Err(Error::isdir())
            }
            Ok(_) => {}
            Err(EditorError::FileNotFound) => self.fs.write_file(&full, &[]).await?,
            Err(err) => return Err(err.into()),
        }
        let inode = self.cache.lock().ensure_child(dir, &name, false)?;
        Ok(self.descriptor_for(
            fd,
            inode,
            Filetype::RegularFile,
            Rights::file_base(),
            Rights::empty(),
            fdflags,
        ))
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
pub(crate) mod test {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// In-memory stand-in for the editor capability.
    pub(crate) struct MockEditorFs {
        entries: SyncMutex<HashMap<String, MockEntry>>,
    }

    #[derive(Clone)]
    pub(crate) enum MockEntry {
        File(Vec<u8>),
        Directory,
    }

    impl MockEditorFs {
        pub(crate) fn new() -> Arc<MockEditorFs> {
            let mut entries = HashMap::new();
            entries.insert("/".to_string(), MockEntry::Directory);
            Arc::new(MockEditorFs {
                entries: SyncMutex::new(entries),
            })
        }

        pub(crate) fn add_file(&self, path: &str, content: &[u8]) {
            self.entries
                .lock()
                .insert(path.to_string(), MockEntry::File(content.to_vec()));
        }

        pub(crate) fn add_directory(&self, path: &str) {
            self.entries
                .lock()
                .insert(path.to_string(), MockEntry::Directory);
        }

        pub(crate) fn has(&self, path: &str) -> bool {
            self.entries.lock().contains_key(path)
        }
    }

    #[async_trait]
    impl EditorFileSystem for MockEditorFs {
        async fn stat(&self, path: &str) -> Result<EditorStat, EditorError> {
            match self.entries.lock().get(path) {
                Some(MockEntry::File(content)) => Ok(EditorStat {
                    filetype: EditorFileType::File,
                    size: content.len() as u64,
                    ctime: 1,
                    mtime: 2,
                }),
                Some(MockEntry::Directory) => Ok(EditorStat {
                    filetype: EditorFileType::Directory,
                    size: 0,
                    ctime: 1,
                    mtime: 2,
                }),
                None => Err(EditorError::FileNotFound),
            }
        }

        async fn read_file(&self, path: &str) -> Result<Vec<u8>, EditorError> {
            match self.entries.lock().get(path) {
                Some(MockEntry::File(content)) => Ok(content.clone()),
                Some(MockEntry::Directory) => Err(EditorError::FileIsADirectory),
                None => Err(EditorError::FileNotFound),
            }
        }

        async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), EditorError> {
            self.entries
                .lock()
                .insert(path.to_string(), MockEntry::File(content.to_vec()));
            Ok(())
        }

        async fn read_directory(
            &self,
            path: &str,
        ) -> Result<Vec<(String, EditorFileType)>, EditorError> {
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{path}/")
            };
            let entries = self.entries.lock();
            let mut listing: Vec<(String, EditorFileType)> = entries
                .iter()
                .filter(|(p, _)| {
                    p.starts_with(&prefix)
                        && *p != path
                        && !p[prefix.len()..].contains('/')
                        && !p[prefix.len()..].is_empty()
                })
                .map(|(p, e)| {
                    let name = p[prefix.len()..].to_string();
                    let filetype = match e {
                        MockEntry::File(_) => EditorFileType::File,
                        MockEntry::Directory => EditorFileType::Directory,
                    };
                    (name, filetype)
                })
                .collect();
            listing.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(listing)
        }

        async fn create_directory(&self, path: &str) -> Result<(), EditorError> {
            let mut entries = self.entries.lock();
            if entries.contains_key(path) {
                return Err(EditorError::FileExists);
            }
            entries.insert(path.to_string(), MockEntry::Directory);
            Ok(())
        }

        async fn delete(&self, path: &str) -> Result<(), EditorError> {
            self.entries
                .lock()
                .remove(path)
                .map(|_| ())
                .ok_or(EditorError::FileNotFound)
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), EditorError> {
            let mut entries = self.entries.lock();
            if entries.contains_key(to) {
                return Err(EditorError::FileExists);
            }
            let entry = entries.remove(from).ok_or(EditorError::FileNotFound)?;
            entries.insert(to.to_string(), entry);
            Ok(())
        }
    }

    fn fixture() -> (Arc<MockEditorFs>, EditorFsDriver) {
        let registry = DeviceRegistry::new();
        let fs = MockEditorFs::new();
        let driver = EditorFsDriver::new(
            &registry,
            Url::parse("editor:/workspace").unwrap(),
            fs.clone(),
        );
        (fs, driver)
    }

    async fn root(driver: &EditorFsDriver) -> Arc<FileDescriptor> {
        driver.prestat_fd(3).await.unwrap()
    }

    async fn open(
        driver: &EditorFsDriver,
        parent: &FileDescriptor,
        path: &str,
        oflags: Oflags,
    ) -> WasiResult<Arc<FileDescriptor>> {
        driver
            .path_open(
                5,
                parent,
                path,
                oflags,
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
    }

    #[tokio::test]
    async fn open_missing_without_creat_fails_noent() {
        let (_fs, driver) = fixture();
        let root = root(&driver).await;
        let err = open(&driver, &root, "absent", Oflags::empty()).await.unwrap_err();
        assert!(matches!(err, Error::Wasi(Errno::Noent)));
    }

    #[tokio::test]
    async fn creat_performs_zero_length_write() {
        let (fs, driver) = fixture();
        let root = root(&driver).await;
        let fd = open(&driver, &root, "new.txt", Oflags::CREAT).await.unwrap();
        assert!(fs.has("/new.txt"));
        let stat = driver.fd_filestat_get(&fd).await.unwrap();
        assert_eq!(stat.size, 0);
    }

    #[tokio::test]
    async fn lazy_content_is_fetched_once_then_cached() {
        let (fs, driver) = fixture();
        fs.add_file("/data", b"cached bytes");
        let root = root(&driver).await;
        let fd = open(&driver, &root, "data", Oflags::empty()).await.unwrap();
        assert_eq!(driver.fd_read(&fd, 6).await.unwrap(), b"cached");
        // Back-end changes are no longer observed once cached.
        fs.add_file("/data", b"XXXXXXXXXXXX");
        assert_eq!(driver.fd_read(&fd, 6).await.unwrap(), b" bytes");
    }

    #[tokio::test]
    async fn writes_persist_to_the_backend() {
        let (fs, driver) = fixture();
        fs.add_file("/out", b"");
        let root = root(&driver).await;
        let fd = open(&driver, &root, "out", Oflags::empty()).await.unwrap();
        driver.fd_write(&fd, b"persisted").await.unwrap();
        assert_eq!(
            fs.read_file("/out").await.unwrap(),
            b"persisted".to_vec()
        );
    }

    #[tokio::test]
    async fn rename_preserves_inode_and_content() {
        let (fs, driver) = fixture();
        fs.add_file("/a", b"stable");
        let root = root(&driver).await;
        let fd = open(&driver, &root, "a", Oflags::empty()).await.unwrap();
        assert_eq!(driver.fd_read(&fd, 3).await.unwrap(), b"sta");
        driver.path_rename(&root, "a", &root, "b").await.unwrap();
        assert!(fs.has("/b") && !fs.has("/a"));
        let stat = driver
            .path_filestat_get(&root, Lookupflags::empty(), "b")
            .await
            .unwrap();
        assert_eq!(stat.ino, fd.inode);
        assert_eq!(driver.fd_read(&fd, 3).await.unwrap(), b"ble");
    }

    #[tokio::test]
    async fn unlink_with_open_descriptor_leaves_a_tombstone() {
        let (fs, driver) = fixture();
        fs.add_file("/doomed", b"last words");
        let root = root(&driver).await;
        let fd = open(&driver, &root, "doomed", Oflags::empty()).await.unwrap();
        driver.path_unlink_file(&root, "doomed").await.unwrap();
        assert!(!fs.has("/doomed"));
        assert_eq!(driver.fd_read(&fd, 10).await.unwrap(), b"last words");
        let stat = driver.fd_filestat_get(&fd).await.unwrap();
        assert_eq!(stat.size, 10);
        driver.fd_close(&fd).await.unwrap();
        assert!(driver.cache.lock().tombstones.is_empty());
    }

    #[tokio::test]
    async fn readdir_lists_and_caches_children() {
        let (fs, driver) = fixture();
        fs.add_file("/z", b"1");
        fs.add_directory("/sub");
        let root = root(&driver).await;
        let entries = driver.fd_readdir(&root).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "z"]);
        // Same inode on a second listing.
        let again = driver.fd_readdir(&root).await.unwrap();
        assert_eq!(entries[1].inode, again[1].inode);
    }

    #[tokio::test]
    async fn editor_errors_map_per_table() {
        let (fs, driver) = fixture();
        fs.add_file("/plain", b"");
        let root = root(&driver).await;
        // Opening a file with O_DIRECTORY.
        let err = open(&driver, &root, "plain", Oflags::DIRECTORY).await.unwrap_err();
        assert!(matches!(err, Error::Wasi(Errno::Notdir)));
        // A create over an existing path with O_EXCL.
        let err = open(&driver, &root, "plain", Oflags::CREAT | Oflags::EXCL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wasi(Errno::Exist)));
    }
}
