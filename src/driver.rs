//! The uniform back-end contract. Every device a process can reach — an
//! editor filesystem, an in-memory tree, a terminal — implements
//! [`DeviceDriver`]. Default method bodies return `nosys`, so a concrete
//! driver only overrides the vocabulary it supports; the [`ReadOnly`]
//! overlay turns every write-implying operation into `perm`.

use crate::abi::{Advice, Fdflags, Fdstat, Filestat, Lookupflags, Oflags, Rights, Whence};
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn from_raw(raw: u64) -> DeviceId {
        DeviceId(raw)
    }
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    FileSystem,
    Character,
}

/// One entry of a directory listing, in back-end order.
#[derive(Debug, Clone)]
pub struct ReaddirEntry {
    pub inode: u64,
    pub filetype: crate::abi::Filetype,
    pub name: String,
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn id(&self) -> DeviceId;
    fn uri(&self) -> &Url;
    fn kind(&self) -> DeviceKind;

    async fn fd_advise(
        &self,
        _fd: &FileDescriptor,
        _offset: u64,
        _len: u64,
        _advice: Advice,
    ) -> WasiResult<()> {
        Err(Error::nosys())
    }

    async fn fd_allocate(&self, _fd: &FileDescriptor, _offset: u64, _len: u64) -> WasiResult<()> {
        Err(Error::nosys())
    }

    /// Closing a descriptor on a device with no per-descriptor state is a
    /// no-op.
    async fn fd_close(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    async fn fd_fdstat_get(&self, fd: &FileDescriptor) -> WasiResult<Fdstat> {
        Ok(fd.fdstat())
    }

    async fn fd_filestat_get(&self, _fd: &FileDescriptor) -> WasiResult<Filestat> {
        Err(Error::nosys())
    }

    async fn fd_filestat_set_size(&self, _fd: &FileDescriptor, _size: u64) -> WasiResult<()> {
        Err(Error::nosys())
    }

    async fn fd_filestat_set_times(
        &self,
        _fd: &FileDescriptor,
        _atim: u64,
        _mtim: u64,
        _fst_flags: crate::abi::Fstflags,
    ) -> WasiResult<()> {
        Err(Error::nosys())
    }

    /// Read up to `len` bytes at the descriptor's cursor, advancing it by
    /// the returned amount.
    async fn fd_read(&self, _fd: &FileDescriptor, _len: u64) -> WasiResult<Vec<u8>> {
        Err(Error::nosys())
    }

    /// Positional read; the cursor does not move.
    async fn fd_pread(&self, _fd: &FileDescriptor, _offset: u64, _len: u64) -> WasiResult<Vec<u8>> {
        Err(Error::nosys())
    }

    /// Write at the cursor (or at EOF in append mode), advancing the
    /// cursor by the returned amount.
    async fn fd_write(&self, _fd: &FileDescriptor, _bytes: &[u8]) -> WasiResult<u64> {
        Err(Error::nosys())
    }

    /// Positional write; the cursor does not move.
    async fn fd_pwrite(
        &self,
        _fd: &FileDescriptor,
        _offset: u64,
        _bytes: &[u8],
    ) -> WasiResult<u64> {
        Err(Error::nosys())
    }

    async fn fd_seek(&self, _fd: &FileDescriptor, _offset: i64, _whence: Whence) -> WasiResult<u64> {
        Err(Error::nosys())
    }

    async fn fd_sync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Err(Error::nosys())
    }

    async fn fd_datasync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Err(Error::nosys())
    }

    async fn fd_readdir(&self, _fd: &FileDescriptor) -> WasiResult<Vec<ReaddirEntry>> {
        Err(Error::nosys())
    }

    /// Bytes that a read would currently return without blocking. Used by
    /// `poll_oneoff`.
    async fn fd_bytes_available(&self, _fd: &FileDescriptor) -> WasiResult<u64> {
        Err(Error::nosys())
    }

    #[allow(clippy::too_many_arguments)]
    async fn path_open(
        &self,
        _fd: u32,
        _parent: &FileDescriptor,
        _path: &str,
        _oflags: Oflags,
        _fdflags: Fdflags,
        _rights_base: Rights,
        _rights_inheriting: Rights,
    ) -> WasiResult<Arc<FileDescriptor>> {
        Err(Error::nosys())
    }

    async fn path_create_directory(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<()> {
        Err(Error::nosys())
    }

    async fn path_filestat_get(
        &self,
        _parent: &FileDescriptor,
        _flags: Lookupflags,
        _path: &str,
    ) -> WasiResult<Filestat> {
        Err(Error::nosys())
    }

    async fn path_remove_directory(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<()> {
        Err(Error::nosys())
    }

    async fn path_unlink_file(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<()> {
        Err(Error::nosys())
    }

    /// Rename within this device. The service routes cross-device renames
    /// to `nosys` before this is reached, and drivers verify it again.
    async fn path_rename(
        &self,
        _old_parent: &FileDescriptor,
        _old_path: &str,
        _new_parent: &FileDescriptor,
        _new_path: &str,
    ) -> WasiResult<()> {
        Err(Error::nosys())
    }

    async fn path_readlink(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<String> {
        Err(Error::nosys())
    }

    /// Manufacture the preopen directory descriptor for this device's "/".
    async fn prestat_fd(&self, _fd: u32) -> WasiResult<Arc<FileDescriptor>> {
        Err(Error::nosys())
    }

    /// Open a fresh descriptor for stdio redirection. Filesystem drivers
    /// accept a path; character drivers accept only fds 0..=2.
    async fn create_stdio_fd(
        &self,
        _fd: u32,
        _path: Option<&str>,
        _fdflags: Fdflags,
    ) -> WasiResult<Arc<FileDescriptor>> {
        Err(Error::nosys())
    }

    /// Compose a locator for a path relative to this device's root.
    fn join_path(&self, _segments: &[&str]) -> WasiResult<Url> {
        Err(Error::nosys())
    }
}

/// Read-only overlay: delegates everything, except that mutations fail
/// `perm` and opens are stripped of write authority.
pub struct ReadOnly<D> {
    inner: D,
}

impl<D: DeviceDriver> ReadOnly<D> {
    pub fn new(inner: D) -> ReadOnly<D> {
        ReadOnly { inner }
    }
}

#[async_trait]
impl<D: DeviceDriver> DeviceDriver for ReadOnly<D> {
    fn id(&self) -> DeviceId {
        self.inner.id()
    }
    fn uri(&self) -> &Url {
        self.inner.uri()
    }
    fn kind(&self) -> DeviceKind {
        self.inner.kind()
    }

    async fn fd_advise(
        &self,
        fd: &FileDescriptor,
        offset: u64,
        len: u64,
        advice: Advice,
    ) -> WasiResult<()> {
        self.inner.fd_advise(fd, offset, len, advice).await
    }

    async fn fd_allocate(&self, _fd: &FileDescriptor, _offset: u64, _len: u64) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.inner.fd_close(fd).await
    }

    async fn fd_fdstat_get(&self, fd: &FileDescriptor) -> WasiResult<Fdstat> {
        self.inner.fd_fdstat_get(fd).await
    }

    async fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        self.inner.fd_filestat_get(fd).await
    }

    async fn fd_filestat_set_size(&self, _fd: &FileDescriptor, _size: u64) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn fd_filestat_set_times(
        &self,
        _fd: &FileDescriptor,
        _atim: u64,
        _mtim: u64,
        _fst_flags: crate::abi::Fstflags,
    ) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn fd_read(&self, fd: &FileDescriptor, len: u64) -> WasiResult<Vec<u8>> {
        self.inner.fd_read(fd, len).await
    }

    async fn fd_pread(&self, fd: &FileDescriptor, offset: u64, len: u64) -> WasiResult<Vec<u8>> {
        self.inner.fd_pread(fd, offset, len).await
    }

    async fn fd_write(&self, _fd: &FileDescriptor, _bytes: &[u8]) -> WasiResult<u64> {
        Err(Error::perm())
    }

    async fn fd_pwrite(&self, _fd: &FileDescriptor, _offset: u64, _bytes: &[u8]) -> WasiResult<u64> {
        Err(Error::perm())
    }

    async fn fd_seek(&self, fd: &FileDescriptor, offset: i64, whence: Whence) -> WasiResult<u64> {
        self.inner.fd_seek(fd, offset, whence).await
    }

    async fn fd_sync(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.inner.fd_sync(fd).await
    }

    async fn fd_datasync(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.inner.fd_datasync(fd).await
    }

    async fn fd_readdir(&self, fd: &FileDescriptor) -> WasiResult<Vec<ReaddirEntry>> {
        self.inner.fd_readdir(fd).await
    }

    async fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        self.inner.fd_bytes_available(fd).await
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
        if fdflags.intersects(Fdflags::write_implying()) {
            return Err(Error::perm());
        }
        let rights_base = rights_base - Rights::write_implying();
        let rights_inheriting = rights_inheriting - Rights::write_implying();
        self.inner
            .path_open(fd, parent, path, oflags, fdflags, rights_base, rights_inheriting)
            .await
    }

    async fn path_create_directory(&self, _parent: &FileDescriptor, _path: &str) -> WasiResult<()> {
        Err(Error::perm())
    }

    async fn path_filestat_get(
        &self,
        parent: &FileDescriptor,
        flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        self.inner.path_filestat_get(parent, flags, path).await
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

    async fn path_readlink(&self, parent: &FileDescriptor, path: &str) -> WasiResult<String> {
        self.inner.path_readlink(parent, path).await
    }

    async fn prestat_fd(&self, fd: u32) -> WasiResult<Arc<FileDescriptor>> {
        let descriptor = self.inner.prestat_fd(fd).await?;
        Ok(Arc::new(FileDescriptor::directory(
            descriptor.device,
            descriptor.fd(),
            descriptor.rights_base - Rights::write_implying(),
            descriptor.rights_inheriting - Rights::write_implying(),
            descriptor.fdflags,
            descriptor.inode,
        )))
    }

    async fn create_stdio_fd(
        &self,
        fd: u32,
        path: Option<&str>,
        fdflags: Fdflags,
    ) -> WasiResult<Arc<FileDescriptor>> {
        if fdflags.intersects(Fdflags::write_implying()) {
            return Err(Error::perm());
        }
        self.inner.create_stdio_fd(fd, path, fdflags).await
    }

    fn join_path(&self, segments: &[&str]) -> WasiResult<Url> {
        self.inner.join_path(segments)
    }
}

/// Process-wide device bookkeeping: monotonic device ids and the
/// locator → driver map. Two drivers with the same URI are the same mount.
pub struct DeviceRegistry {
    next_id: AtomicU64,
    by_uri: Mutex<HashMap<Url, DeviceId>>,
    by_id: Mutex<HashMap<DeviceId, Arc<dyn DeviceDriver>>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            next_id: AtomicU64::new(1),
            by_uri: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
        }
    }

    pub fn allocate_id(&self) -> DeviceId {
        DeviceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a driver, deduplicating by URI. Returns the driver that is
    /// actually mounted (the existing one if the URI is already known).
    pub fn register(&self, driver: Arc<dyn DeviceDriver>) -> Arc<dyn DeviceDriver> {
        let mut by_uri = self.by_uri.lock();
        if let Some(existing) = by_uri.get(driver.uri()) {
            return self.by_id.lock()[existing].clone();
        }
        by_uri.insert(driver.uri().clone(), driver.id());
        self.by_id.lock().insert(driver.id(), driver.clone());
        driver
    }

    pub fn by_id(&self, id: DeviceId) -> WasiResult<Arc<dyn DeviceDriver>> {
        self.by_id.lock().get(&id).cloned().ok_or_else(Error::badf)
    }

    pub fn by_uri(&self, uri: &Url) -> Option<Arc<dyn DeviceDriver>> {
        let id = *self.by_uri.lock().get(uri)?;
        self.by_id.lock().get(&id).cloned()
    }
}

impl Default for DeviceRegistry {
    fn default() -> DeviceRegistry {
        DeviceRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::abi::Filetype;

    struct NullDevice {
        id: DeviceId,
        uri: Url,
    }

    #[async_trait]
    impl DeviceDriver for NullDevice {
        fn id(&self) -> DeviceId {
            self.id
        }
        fn uri(&self) -> &Url {
            &self.uri
        }
        fn kind(&self) -> DeviceKind {
            DeviceKind::Character
        }
    }

    fn null_device(registry: &DeviceRegistry, uri: &str) -> Arc<dyn DeviceDriver> {
        Arc::new(NullDevice {
            id: registry.allocate_id(),
            uri: Url::parse(uri).unwrap(),
        })
    }

    #[tokio::test]
    async fn defaults_are_nosys() {
        let registry = DeviceRegistry::new();
        let dev = null_device(&registry, "null:/dev");
        let fd = FileDescriptor::character_device(
            dev.id(),
            0,
            Rights::character_device_base(),
            Fdflags::empty(),
            0,
        );
        let err = dev.fd_read(&fd, 10).await.unwrap_err();
        assert!(matches!(err, Error::Wasi(crate::abi::Errno::Nosys)));
        let err = dev.fd_readdir(&fd).await.unwrap_err();
        assert!(matches!(err, Error::Wasi(crate::abi::Errno::Nosys)));
        // fdstat synthesises from the descriptor itself.
        let stat = dev.fd_fdstat_get(&fd).await.unwrap();
        assert_eq!(stat.fs_filetype, Filetype::CharacterDevice);
    }

    #[tokio::test]
    async fn read_only_overlay_rejects_mutation() {
        let registry = DeviceRegistry::new();
        let id = registry.allocate_id();
        let ro = ReadOnly::new(NullDevice {
            id,
            uri: Url::parse("null:/ro").unwrap(),
        });
        let fd = FileDescriptor::directory(
            id,
            3,
            Rights::directory_base(),
            Rights::directory_inheriting(),
            Fdflags::empty(),
            1,
        );
        let err = ro.path_unlink_file(&fd, "x").await.unwrap_err();
        assert!(matches!(err, Error::Wasi(crate::abi::Errno::Perm)));
        let err = ro
            .path_open(
                5,
                &fd,
                "x",
                Oflags::CREAT,
                Fdflags::empty(),
                Rights::file_base(),
                Rights::empty(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wasi(crate::abi::Errno::Perm)));
        let err = ro
            .path_open(
                5,
                &fd,
                "x",
                Oflags::empty(),
                Fdflags::APPEND,
                Rights::FD_READ,
                Rights::empty(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wasi(crate::abi::Errno::Perm)));
    }

    #[test]
    fn registry_dedupes_by_uri() {
        let registry = DeviceRegistry::new();
        let a = registry.register(null_device(&registry, "null:/same"));
        let b = registry.register(null_device(&registry, "null:/same"));
        assert_eq!(a.id(), b.id());
        let c = registry.register(null_device(&registry, "null:/other"));
        assert_ne!(a.id(), c.id());
    }
}
