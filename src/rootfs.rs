//! Splices mounted back-ends into one POSIX-like namespace. The tree here
//! is purely host-side: virtual directories connect mount points, and a
//! lookup either ends inside the virtual tree or cuts over into a mounted
//! driver with the remainder of the path. The guest's view of the virtual
//! directories themselves is read-only.

use crate::abi::{Fdflags, Filestat, Filetype, Lookupflags, Oflags, Rights};
use crate::driver::{DeviceDriver, DeviceId, DeviceKind, DeviceRegistry, ReaddirEntry};
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Root inode of every filesystem driver in this crate.
const MOUNT_ROOT_INODE: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("a mount already exists at {0}")]
    MountOverMount(String),
    #[error("{0} is inside the mount at {1}")]
    MountInsideMount(String, String),
    #[error("invalid mount point {0}")]
    InvalidMountPoint(String),
}

struct VNode {
    name: String,
    parent: usize,
    children: HashMap<String, usize>,
    mount: Option<Arc<dyn DeviceDriver>>,
}

impl VNode {
    fn inode(index: usize) -> u64 {
        index as u64 + 1
    }
}

struct VTree {
    nodes: Vec<VNode>,
}

impl VTree {
    fn new() -> VTree {
        VTree {
            nodes: vec![VNode {
                name: String::new(),
                parent: 0,
                children: HashMap::new(),
                mount: None,
            }],
        }
    }

    fn index_of(&self, inode: u64) -> WasiResult<usize> {
        let index = (inode.checked_sub(1).ok_or_else(Error::badf)?) as usize;
        if index >= self.nodes.len() {
            return Err(Error::badf());
        }
        Ok(index)
    }

    fn path_of(&self, mut index: usize) -> String {
        let mut segments: Vec<&str> = Vec::new();
        while index != 0 {
            segments.push(&self.nodes[index].name);
            index = self.nodes[index].parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }
}

/// Result of resolving a path against the virtual tree.
pub enum Find {
    /// The walk ended at a virtual directory.
    Virtual(u64),
    /// The walk reached a mount; `rest` is the remainder to resolve in
    /// the mounted driver (`"."` when the path named the mount itself).
    Mount {
        driver: Arc<dyn DeviceDriver>,
        rest: String,
    },
}

pub struct VirtualRootDriver {
    id: DeviceId,
    uri: Url,
    created: u64,
    tree: Mutex<VTree>,
}

impl VirtualRootDriver {
    pub fn new(registry: &DeviceRegistry) -> VirtualRootDriver {
        let id = registry.allocate_id();
        VirtualRootDriver {
            id,
            uri: Url::parse(&format!("vroot:/{}", id.raw())).expect("vroot uri"),
            created: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            tree: Mutex::new(VTree::new()),
        }
    }

    /// A directory descriptor for "/" that is never installed in the fd
    /// table; path resolution starts here.
    pub fn root_descriptor(&self) -> Arc<FileDescriptor> {
        Arc::new(FileDescriptor::directory(
            self.id,
            u32::MAX,
            Rights::directory_base(),
            Rights::directory_inheriting(),
            Fdflags::empty(),
            VNode::inode(0),
        ))
    }

    /// Graft `driver` at the absolute `path`, creating intermediate
    /// virtual directories. The final segment must not already be a mount.
    pub fn add_mount(&self, path: &str, driver: Arc<dyn DeviceDriver>) -> Result<(), MountError> {
        let trimmed = path.trim_matches('/');
        let mut tree = self.tree.lock();
        if trimmed.is_empty() {
            return Err(MountError::MountOverMount("/".to_string()));
        }
        let mut current = 0usize;
        let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(MountError::InvalidMountPoint(path.to_string()));
        }
        for segment in &segments[..segments.len() - 1] {
            if tree.nodes[current].mount.is_some() {
                return Err(MountError::MountInsideMount(
                    path.to_string(),
                    tree.path_of(current),
                ));
            }
            current = match tree.nodes[current].children.get(*segment).copied() {
                Some(child) => child,
                None => {
                    let child = tree.nodes.len();
                    tree.nodes.push(VNode {
                        name: segment.to_string(),
                        parent: current,
                        children: HashMap::new(),
                        mount: None,
                    });
                    tree.nodes[current].children.insert(segment.to_string(), child);
                    child
                }
            };
        }
        let last = segments[segments.len() - 1];
        if let Some(existing) = tree.nodes[current].children.get(last).copied() {
            if tree.nodes[existing].mount.is_some() {
                return Err(MountError::MountOverMount(path.to_string()));
            }
            tree.nodes[existing].mount = Some(driver);
            return Ok(());
        }
        let child = tree.nodes.len();
        tree.nodes.push(VNode {
            name: last.to_string(),
            parent: current,
            children: HashMap::new(),
            mount: Some(driver),
        });
        tree.nodes[current].children.insert(last.to_string(), child);
        Ok(())
    }

    /// Resolve `path` from the virtual node `start` (an inode of this
    /// driver). Idempotent under normalisation.
    pub fn find(&self, start: u64, path: &str) -> WasiResult<Find> {
        let tree = self.tree.lock();
        let mut current = tree.index_of(start)?;
        let segments: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        for (position, segment) in segments.iter().enumerate() {
            if *segment == ".." {
                current = tree.nodes[current].parent;
                continue;
            }
            match tree.nodes[current].children.get(*segment) {
                Some(&child) => {
                    if let Some(driver) = &tree.nodes[child].mount {
                        // A mount mid-path: hand the joined remainder to
                        // the mounted driver.
                        let rest = segments[position + 1..].join("/");
                        return Ok(Find::Mount {
                            driver: driver.clone(),
                            rest: if rest.is_empty() { ".".to_string() } else { rest },
                        });
                    }
                    current = child;
                }
                None => return Err(Error::noent()),
            }
        }
        match &tree.nodes[current].mount {
            Some(driver) => Ok(Find::Mount {
                driver: driver.clone(),
                rest: ".".to_string(),
            }),
            None => Ok(Find::Virtual(VNode::inode(current))),
        }
    }

    /// Reverse map: the absolute virtual path of `device`'s mount point
    /// joined with `rel`.
    pub fn make_virtual_path(&self, device: DeviceId, rel: &str) -> Option<String> {
        let tree = self.tree.lock();
        let index = tree
            .nodes
            .iter()
            .position(|n| n.mount.as_ref().map(|d| d.id()) == Some(device))?;
        let mount_path = tree.path_of(index);
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() || rel == "." {
            Some(mount_path)
        } else if mount_path == "/" {
            Some(format!("/{rel}"))
        } else {
            Some(format!("{mount_path}/{rel}"))
        }
    }

    fn synthetic_stat(&self, inode: u64) -> WasiResult<Filestat> {
        let tree = self.tree.lock();
        let index = tree.index_of(inode)?;
        Ok(Filestat {
            dev: self.id.raw(),
            ino: inode,
            filetype: Filetype::Directory,
            nlink: 1,
            size: tree.nodes[index].children.len() as u64,
            atim: self.created,
            mtim: self.created,
            ctim: self.created,
        })
    }
}

#[async_trait]
impl DeviceDriver for VirtualRootDriver {
    fn id(&self) -> DeviceId {
        self.id
    }
    fn uri(&self) -> &Url {
        &self.uri
    }
    fn kind(&self) -> DeviceKind {
        DeviceKind::FileSystem
    }

    async fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        self.synthetic_stat(fd.inode)
    }

    async fn fd_readdir(&self, fd: &FileDescriptor) -> WasiResult<Vec<ReaddirEntry>> {
        let tree = self.tree.lock();
        let index = tree.index_of(fd.inode)?;
        let mut entries: Vec<ReaddirEntry> = tree.nodes[index]
            .children
            .iter()
            .map(|(name, &child)| {
                let node = &tree.nodes[child];
                ReaddirEntry {
                    inode: if node.mount.is_some() {
                        MOUNT_ROOT_INODE
                    } else {
                        VNode::inode(child)
                    },
                    filetype: Filetype::Directory,
                    name: name.clone(),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
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
        if oflags.intersects(Oflags::CREAT | Oflags::TRUNC) {
            return Err(Error::perm());
        }
        match self.find(parent.inode, path)? {
            Find::Virtual(inode) => Ok(Arc::new(FileDescriptor::directory(
                self.id,
                fd,
                rights_base - Rights::write_implying(),
                rights_inheriting,
                fdflags,
                inode,
            ))),
            // Mount interiors are routed by the syscall service before the
            // driver is reached.
            Find::Mount { .. } => Err(Error::inval()),
        }
    }

    async fn path_filestat_get(
        &self,
        parent: &FileDescriptor,
        _flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        match self.find(parent.inode, path)? {
            Find::Virtual(inode) => self.synthetic_stat(inode),
            Find::Mount { .. } => Err(Error::inval()),
        }
    }

    async fn path_create_directory(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn path_remove_directory(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn path_unlink_file(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn path_rename(
        &self,
        _old_parent: &FileDescriptor,
        _old_path: &str,
        _new_parent: &FileDescriptor,
        _new_path: &str,
    ) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn prestat_fd(&self, fd: u32) -> WasiResult<Arc<FileDescriptor>> {
        Ok(Arc::new(FileDescriptor::directory(
            self.id,
            fd,
            Rights::directory_base(),
            Rights::directory_inheriting(),
            Fdflags::empty(),
            VNode::inode(0),
        )))
    }

    fn join_path(&self, segments: &[&str]) -> WasiResult<Url> {
        let mut uri = self.uri.clone();
        let joined = segments.join("/");
        let base = uri.path().trim_end_matches('/').to_string();
        uri.set_path(&format!("{base}/{joined}"));
        Ok(uri)
    }
}
