use crate::driver::DeviceId;
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Fds 0..=2 are stdio; renumbering to or from them is refused.
const FIRST_NON_STDIO_FD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Descriptor numbers are being handed to stdio factories and prestat
    /// calls, starting at 0.
    Init,
    /// Prestats are exhausted; everything from `first_real_fd` up is a
    /// regular open.
    Running,
}

struct Inner {
    phase: Phase,
    next_fd: u32,
    first_real_fd: u32,
    entries: HashMap<u32, Arc<FileDescriptor>>,
    roots: HashMap<DeviceId, Arc<FileDescriptor>>,
}

/// The process-wide descriptor registry. One instance per process, shared
/// by every per-thread syscall service; mutation happens on the host
/// execution context only.
pub struct FdTable {
    inner: Mutex<Inner>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            inner: Mutex::new(Inner {
                phase: Phase::Init,
                next_fd: 0,
                first_real_fd: 0,
                entries: HashMap::new(),
                roots: HashMap::new(),
            }),
        }
    }

    /// Claim the next descriptor number. The counter is shared between the
    /// init and running phases so prestats and early opens never collide.
    pub fn next_fd(&self) -> WasiResult<u32> {
        let mut inner = self.inner.lock();
        let fd = inner.next_fd;
        inner.next_fd = inner
            .next_fd
            .checked_add(1)
            .ok_or(Error::from(crate::abi::Errno::Nfile))?;
        Ok(fd)
    }

    /// End the init phase. The fd that triggered exhaustion becomes the
    /// first "real" fd.
    pub fn switch_to_running(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Init {
            inner.phase = Phase::Running;
            inner.first_real_fd = inner.next_fd;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().phase == Phase::Running
    }

    pub fn first_real_fd(&self) -> u32 {
        self.inner.lock().first_real_fd
    }

    pub fn add(&self, descriptor: Arc<FileDescriptor>) {
        let mut inner = self.inner.lock();
        inner.entries.insert(descriptor.fd(), descriptor);
    }

    pub fn get(&self, fd: u32) -> WasiResult<Arc<FileDescriptor>> {
        self.inner
            .lock()
            .entries
            .get(&fd)
            .cloned()
            .ok_or_else(Error::badf)
    }

    pub fn has(&self, fd: u32) -> bool {
        self.inner.lock().entries.contains_key(&fd)
    }

    pub fn delete(&self, fd: u32) -> WasiResult<Arc<FileDescriptor>> {
        self.inner.lock().entries.remove(&fd).ok_or_else(Error::badf)
    }

    /// Move `from` to the (absent) number `to`. Only permitted between
    /// two real (non-stdio) fds.
    pub fn renumber(&self, from: u32, to: u32) -> WasiResult<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&from) {
            return Err(Error::badf());
        }
        if from < FIRST_NON_STDIO_FD || to < FIRST_NON_STDIO_FD {
            return Err(Error::notsup());
        }
        if inner.entries.contains_key(&to) {
            return Err(Error::badf());
        }
        let descriptor = inner.entries.remove(&from).expect("presence checked");
        descriptor.renumber_to(to);
        inner.entries.insert(to, descriptor);
        Ok(())
    }

    /// Record a driver's "/" descriptor. Consulted when the virtual root
    /// forwards a path into that back-end.
    pub fn set_root(&self, device: DeviceId, descriptor: Arc<FileDescriptor>) {
        self.inner.lock().roots.insert(device, descriptor);
    }

    pub fn root(&self, device: DeviceId) -> Option<Arc<FileDescriptor>> {
        self.inner.lock().roots.get(&device).cloned()
    }
}

impl Default for FdTable {
    fn default() -> FdTable {
        FdTable::new()
    }
}
