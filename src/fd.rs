use crate::abi::{Errno, Fdflags, Fdstat, Filetype, Rights};
use crate::driver::{DeviceId, ReaddirEntry};
use crate::error::{Error, WasiResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub type DisposeFn = Box<dyn FnOnce() + Send>;

/// A single open descriptor. Shared between the fd table and the driver
/// that created it; all mutable state is interior so descriptors can be
/// handed out as `Arc`s.
///
/// Invariants: the inheriting set is nonzero only for directories, and the
/// cursor exists only for regular files.
pub struct FileDescriptor {
    pub device: DeviceId,
    fd: AtomicU32,
    pub filetype: Filetype,
    pub rights_base: Rights,
    pub rights_inheriting: Rights,
    pub fdflags: Fdflags,
    pub inode: u64,
    cursor: Option<AtomicU64>,
    readdir: Mutex<Option<Vec<ReaddirEntry>>>,
    dispose: Mutex<Option<DisposeFn>>,
}

impl FileDescriptor {
    pub fn file(
        device: DeviceId,
        fd: u32,
        rights_base: Rights,
        fdflags: Fdflags,
        inode: u64,
    ) -> FileDescriptor {
        FileDescriptor {
            device,
            fd: AtomicU32::new(fd),
            filetype: Filetype::RegularFile,
            rights_base: rights_base.narrow_for(Filetype::RegularFile),
            rights_inheriting: Rights::file_inheriting(),
            fdflags,
            inode,
            cursor: Some(AtomicU64::new(0)),
            readdir: Mutex::new(None),
            dispose: Mutex::new(None),
        }
    }

    pub fn directory(
        device: DeviceId,
        fd: u32,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
        inode: u64,
    ) -> FileDescriptor {
        FileDescriptor {
            device,
            fd: AtomicU32::new(fd),
            filetype: Filetype::Directory,
            rights_base: rights_base.narrow_for(Filetype::Directory),
            rights_inheriting,
            fdflags,
            inode,
            cursor: None,
            readdir: Mutex::new(None),
            dispose: Mutex::new(None),
        }
    }

    pub fn character_device(
        device: DeviceId,
        fd: u32,
        rights_base: Rights,
        fdflags: Fdflags,
        inode: u64,
    ) -> FileDescriptor {
        FileDescriptor {
            device,
            fd: AtomicU32::new(fd),
            filetype: Filetype::CharacterDevice,
            rights_base: rights_base.narrow_for(Filetype::CharacterDevice),
            rights_inheriting: Rights::empty(),
            fdflags,
            inode,
            cursor: None,
            readdir: Mutex::new(None),
            dispose: Mutex::new(None),
        }
    }

    pub fn with_dispose(self, dispose: DisposeFn) -> FileDescriptor {
        *self.dispose.lock() = Some(dispose);
        self
    }

    pub fn fd(&self) -> u32 {
        self.fd.load(Ordering::Relaxed)
    }

    pub(crate) fn renumber_to(&self, fd: u32) {
        self.fd.store(fd, Ordering::Relaxed);
    }

    /// Check the descriptor's own authority. Inheriting rights are
    /// irrelevant once the descriptor exists.
    pub fn assert_rights(&self, required: Rights) -> WasiResult<()> {
        if self.rights_base.contains(required) {
            Ok(())
        } else {
            Err(Error::perm())
        }
    }

    /// The de-facto "tell" pattern: `fd_seek(cur, 0)` succeeds with either
    /// seek or tell authority.
    pub fn assert_seek_or_tell(&self) -> WasiResult<()> {
        if self.rights_base.intersects(Rights::FD_SEEK | Rights::FD_TELL) {
            Ok(())
        } else {
            Err(Error::perm())
        }
    }

    pub fn is_directory(&self) -> bool {
        self.filetype == Filetype::Directory
    }

    pub fn cursor(&self) -> WasiResult<u64> {
        match &self.cursor {
            Some(c) => Ok(c.load(Ordering::Relaxed)),
            None => Err(Error::from(Errno::Spipe)),
        }
    }

    pub fn set_cursor(&self, value: u64) -> WasiResult<()> {
        match &self.cursor {
            Some(c) => {
                c.store(value, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::from(Errno::Spipe)),
        }
    }

    pub fn advance_cursor(&self, delta: u64) -> WasiResult<u64> {
        match &self.cursor {
            Some(c) => Ok(c.fetch_add(delta, Ordering::Relaxed) + delta),
            None => Err(Error::from(Errno::Spipe)),
        }
    }

    pub fn fdstat(&self) -> Fdstat {
        Fdstat {
            fs_filetype: self.filetype,
            fs_flags: self.fdflags,
            fs_rights_base: self.rights_base,
            fs_rights_inheriting: self.rights_inheriting,
        }
    }

    /// Take the readdir snapshot, if one is cached.
    pub fn take_readdir_snapshot(&self) -> Option<Vec<ReaddirEntry>> {
        self.readdir.lock().take()
    }

    pub fn store_readdir_snapshot(&self, entries: Vec<ReaddirEntry>) {
        *self.readdir.lock() = Some(entries);
    }

    /// Run the dispose hook, if any. Called exactly once, on close.
    pub fn dispose(&self) {
        if let Some(hook) = self.dispose.lock().take() {
            hook();
        }
    }

    /// Narrow this descriptor's rights, producing the replacement entry.
    /// The cursor, readdir snapshot and dispose hook move over; the caller
    /// re-inserts the result into the table. Widening fails `perm`.
    pub fn restrict_rights(
        &self,
        rights_base: Rights,
        rights_inheriting: Rights,
    ) -> WasiResult<FileDescriptor> {
        if !self.rights_base.contains(rights_base)
            || !self.rights_inheriting.contains(rights_inheriting)
        {
            return Err(Error::perm());
        }
        Ok(FileDescriptor {
            device: self.device,
            fd: AtomicU32::new(self.fd()),
            filetype: self.filetype,
            rights_base,
            rights_inheriting,
            fdflags: self.fdflags,
            inode: self.inode,
            cursor: self
                .cursor
                .as_ref()
                .map(|c| AtomicU64::new(c.load(Ordering::Relaxed))),
            readdir: Mutex::new(self.readdir.lock().take()),
            dispose: Mutex::new(self.dispose.lock().take()),
        })
    }
}

impl std::fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("device", &self.device)
            .field("fd", &self.fd())
            .field("filetype", &self.filetype)
            .field("inode", &self.inode)
            .field("fdflags", &self.fdflags)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::DeviceId;

    fn dev() -> DeviceId {
        DeviceId::from_raw(1)
    }

    #[test]
    fn rights_check_fails_perm() {
        let fd = FileDescriptor::file(dev(), 4, Rights::FD_READ, Fdflags::empty(), 7);
        assert!(fd.assert_rights(Rights::FD_READ).is_ok());
        let err = fd.assert_rights(Rights::FD_WRITE).unwrap_err();
        assert!(matches!(err, Error::Wasi(Errno::Perm)));
    }

    #[test]
    fn seek_or_tell_union() {
        let seek_only = FileDescriptor::file(
            dev(),
            4,
            Rights::FD_READ | Rights::FD_SEEK,
            Fdflags::empty(),
            7,
        );
        assert!(seek_only.assert_seek_or_tell().is_ok());
        let neither = FileDescriptor::file(dev(), 5, Rights::FD_READ, Fdflags::empty(), 7);
        assert!(neither.assert_seek_or_tell().is_err());
    }

    #[test]
    fn directories_have_no_cursor() {
        let dir = FileDescriptor::directory(
            dev(),
            3,
            Rights::directory_base(),
            Rights::directory_inheriting(),
            Fdflags::empty(),
            1,
        );
        assert!(dir.cursor().is_err());
        assert!(dir.rights_inheriting.contains(Rights::FD_READ));
    }

    #[test]
    fn file_inheriting_rights_are_empty() {
        let fd = FileDescriptor::file(dev(), 4, Rights::file_base(), Fdflags::empty(), 7);
        assert!(fd.rights_inheriting.is_empty());
        assert_eq!(fd.advance_cursor(5).unwrap(), 5);
        assert_eq!(fd.cursor().unwrap(), 5);
    }
}
