//! The syscall service: one method per WASI preview-1 call. Each method
//! reads its arguments from guest memory, resolves the target descriptor
//! and checks its base rights, dispatches to the owning device driver,
//! writes results back and returns the wire errno. Anything unexpected
//! collapses to `inval` (stat failures default to `perm`).

use crate::abi::{
    Advice, Clockid, Dirent, Errno, Event, EventFdReadwrite, Eventrwflags, Eventtype, Fdflags,
    Lookupflags, Oflags, PrestatDir, Rights, Subclockflags, Subscription, SubscriptionU, Whence,
};
use crate::clocks::Clocks;
use crate::driver::{DeviceDriver, DeviceId, DeviceRegistry};
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use crate::memory::GuestMemory;
use crate::rootfs::{Find, VirtualRootDriver};
use crate::table::FdTable;
use cap_rand::RngCore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, trace};

/// Starts a guest thread on a fresh worker; the contract of the external
/// worker-spawning host API.
pub trait WorkerHost: Send + Sync {
    fn start_thread(&self, tid: u32, start_arg: u32) -> WasiResult<()>;
}

/// A preopened mount: its fd, the mount-point string reported through
/// `fd_prestat_dir_name`, and the backing device.
#[derive(Debug, Clone)]
pub struct Preopen {
    pub fd: u32,
    pub point: String,
    pub device: DeviceId,
}

/// Resolves the process's run future with an exit code, once.
pub struct ExitSignal {
    tx: Mutex<Option<oneshot::Sender<u32>>>,
}

impl ExitSignal {
    pub fn new() -> (ExitSignal, oneshot::Receiver<u32>) {
        let (tx, rx) = oneshot::channel();
        (
            ExitSignal {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn exit(&self, code: u32) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(code);
        }
    }

    pub fn is_exited(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// State shared by every per-thread service of one process.
pub(crate) struct ProcessShared {
    pub program_name: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub table: Arc<FdTable>,
    pub registry: Arc<DeviceRegistry>,
    pub preopens: Vec<Preopen>,
    pub vroot: Option<Arc<VirtualRootDriver>>,
    pub clocks: Clocks,
    pub exit: ExitSignal,
    pub random: Mutex<Box<dyn RngCore + Send + Sync>>,
    pub prestat_cursor: Mutex<usize>,
    pub next_tid: AtomicU32,
    pub worker_host: Mutex<Option<Arc<dyn WorkerHost>>>,
    pub trace: bool,
}

pub(crate) fn default_rng() -> Box<dyn RngCore + Send + Sync> {
    use cap_rand::rngs::StdRng;
    use cap_rand::SeedableRng;
    let mut thread_rng = cap_rand::thread_rng(cap_rand::ambient_authority());
    Box::new(StdRng::from_rng(&mut thread_rng).expect("seed rng from entropy"))
}

pub struct WasiService {
    shared: Arc<ProcessShared>,
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl WasiService {
    pub(crate) fn new(shared: Arc<ProcessShared>) -> WasiService {
        WasiService {
            shared,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh service for a spawned thread, bound to the same fd table
    /// and process state but with its own call statistics.
    pub fn for_thread(&self) -> WasiService {
        WasiService::new(self.shared.clone())
    }

    pub fn is_exited(&self) -> bool {
        self.shared.exit.is_exited()
    }

    /// Batch the per-worker call statistics into one log line.
    pub fn log_summary(&self) {
        let counts = self.counts.lock();
        if counts.is_empty() {
            return;
        }
        let mut calls: Vec<(&&'static str, &u64)> = counts.iter().collect();
        calls.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let summary: Vec<String> = calls.iter().map(|(k, v)| format!("{k}={v}")).collect();
        info!(target: "wasi", "syscall summary: {}", summary.join(" "));
    }

    fn finish(&self, name: &'static str, result: WasiResult<()>, default: Errno) -> Errno {
        let errno = match result {
            Ok(()) => Errno::Success,
            Err(err) => err.into_errno(default),
        };
        *self.counts.lock().entry(name).or_insert(0) += 1;
        if self.shared.trace {
            trace!(target: "wasi", call = name, errno = errno.raw(), "{name} -> {errno}");
        }
        errno
    }

    fn driver_of(&self, descriptor: &FileDescriptor) -> WasiResult<Arc<dyn DeviceDriver>> {
        self.shared.registry.by_id(descriptor.device)
    }

    /// Resolve a path argument into the driver that owns it, the parent
    /// descriptor inside that driver, and the remaining path. Absolute
    /// paths (and any path on a virtual-root descriptor) are redirected
    /// through the virtual root.
    fn route_path(
        &self,
        descriptor: &Arc<FileDescriptor>,
        path: &str,
    ) -> WasiResult<(Arc<dyn DeviceDriver>, Arc<FileDescriptor>, String)> {
        let absolute = path.starts_with('/');
        if let Some(vroot) = &self.shared.vroot {
            if absolute || descriptor.device == vroot.id() {
                let start = if absolute {
                    vroot.root_descriptor()
                } else {
                    descriptor.clone()
                };
                let rel = path.trim_start_matches('/');
                return match vroot.find(start.inode, rel)? {
                    Find::Virtual(_) => {
                        let driver: Arc<dyn DeviceDriver> = vroot.clone();
                        Ok((driver, start, rel.to_string()))
                    }
                    Find::Mount { driver, rest } => {
                        let root = self
                            .shared
                            .table
                            .root(driver.id())
                            .ok_or_else(Error::badf)?;
                        Ok((driver, root, rest))
                    }
                };
            }
        } else if absolute {
            // Without a virtual root a single mount owns "/".
            let preopen = self.shared.preopens.first().ok_or_else(Error::noent)?;
            let driver = self.shared.registry.by_id(preopen.device)?;
            let root = self
                .shared
                .table
                .root(preopen.device)
                .ok_or_else(Error::badf)?;
            return Ok((driver, root, path.trim_start_matches('/').to_string()));
        }
        Ok((
            self.driver_of(descriptor)?,
            descriptor.clone(),
            path.to_string(),
        ))
    }

    fn dir_descriptor(&self, fd: u32, rights: Rights) -> WasiResult<Arc<FileDescriptor>> {
        let descriptor = self.shared.table.get(fd)?;
        if !descriptor.is_directory() {
            return Err(Error::notdir());
        }
        descriptor.assert_rights(rights)?;
        Ok(descriptor)
    }

    // args / environ ------------------------------------------------------

    fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.shared.program_name.clone()];
        argv.extend(self.shared.args.iter().cloned());
        argv
    }

    fn environ(&self) -> Vec<String> {
        self.shared
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    fn write_string_array(
        memory: &GuestMemory,
        items: &[String],
        array_ptr: u32,
        buf_ptr: u32,
    ) -> WasiResult<()> {
        let mut entry_ptr = array_ptr;
        let mut cursor = buf_ptr;
        for item in items {
            memory.write_u32(entry_ptr, cursor)?;
            let bytes = item.as_bytes();
            memory.write_bytes(cursor, bytes)?;
            memory.write_u8(cursor + bytes.len() as u32, 0)?;
            cursor += bytes.len() as u32 + 1;
            entry_ptr += 4;
        }
        Ok(())
    }

    pub async fn args_sizes_get(
        &self,
        memory: &GuestMemory,
        argc_ptr: u32,
        argv_buf_size_ptr: u32,
    ) -> Errno {
        let result = (|| {
            let argv = self.argv();
            let size: u32 = argv.iter().map(|a| a.len() as u32 + 1).sum();
            memory.write_u32(argc_ptr, argv.len() as u32)?;
            memory.write_u32(argv_buf_size_ptr, size)?;
            Ok(())
        })();
        self.finish("args_sizes_get", result, Errno::Inval)
    }

    pub async fn args_get(&self, memory: &GuestMemory, argv_ptr: u32, argv_buf_ptr: u32) -> Errno {
        let result = Self::write_string_array(memory, &self.argv(), argv_ptr, argv_buf_ptr);
        self.finish("args_get", result, Errno::Inval)
    }

    pub async fn environ_sizes_get(
        &self,
        memory: &GuestMemory,
        count_ptr: u32,
        buf_size_ptr: u32,
    ) -> Errno {
        let result = (|| {
            let environ = self.environ();
            let size: u32 = environ.iter().map(|e| e.len() as u32 + 1).sum();
            memory.write_u32(count_ptr, environ.len() as u32)?;
            memory.write_u32(buf_size_ptr, size)?;
            Ok(())
        })();
        self.finish("environ_sizes_get", result, Errno::Inval)
    }

    pub async fn environ_get(
        &self,
        memory: &GuestMemory,
        environ_ptr: u32,
        environ_buf_ptr: u32,
    ) -> Errno {
        let result = Self::write_string_array(memory, &self.environ(), environ_ptr, environ_buf_ptr);
        self.finish("environ_get", result, Errno::Inval)
    }

    // clocks --------------------------------------------------------------

    pub async fn clock_res_get(&self, memory: &GuestMemory, clock_id: u32, res_ptr: u32) -> Errno {
        let result = (|| {
            let id = Clockid::from_raw(clock_id).ok_or_else(Error::inval)?;
            memory.write_u64(res_ptr, self.shared.clocks.resolution(id)?)?;
            Ok(())
        })();
        self.finish("clock_res_get", result, Errno::Inval)
    }

    pub async fn clock_time_get(
        &self,
        memory: &GuestMemory,
        clock_id: u32,
        _precision: u64,
        time_ptr: u32,
    ) -> Errno {
        let result = (|| {
            let id = Clockid::from_raw(clock_id).ok_or_else(Error::inval)?;
            memory.write_u64(time_ptr, self.shared.clocks.now(id)?)?;
            Ok(())
        })();
        self.finish("clock_time_get", result, Errno::Inval)
    }

    // descriptor calls ----------------------------------------------------

    pub async fn fd_advise(&self, fd: u32, offset: u64, len: u64, advice: u8) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_ADVISE)?;
            let advice = Advice::from_raw(advice).ok_or_else(Error::inval)?;
            self.driver_of(&descriptor)?
                .fd_advise(&descriptor, offset, len, advice)
                .await
        }
        .await;
        self.finish("fd_advise", result, Errno::Inval)
    }

    pub async fn fd_allocate(&self, fd: u32, offset: u64, len: u64) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_ALLOCATE)?;
            self.driver_of(&descriptor)?
                .fd_allocate(&descriptor, offset, len)
                .await
        }
        .await;
        self.finish("fd_allocate", result, Errno::Inval)
    }

    pub async fn fd_close(&self, fd: u32) -> Errno {
        let result = async {
            let descriptor = self.shared.table.delete(fd)?;
            let outcome = self
                .driver_of(&descriptor)?
                .fd_close(&descriptor)
                .await;
            descriptor.dispose();
            outcome
        }
        .await;
        self.finish("fd_close", result, Errno::Inval)
    }

    pub async fn fd_datasync(&self, fd: u32) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_DATASYNC)?;
            self.driver_of(&descriptor)?.fd_datasync(&descriptor).await
        }
        .await;
        self.finish("fd_datasync", result, Errno::Inval)
    }

    pub async fn fd_fdstat_get(&self, memory: &GuestMemory, fd: u32, stat_ptr: u32) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            let stat = self
                .driver_of(&descriptor)?
                .fd_fdstat_get(&descriptor)
                .await?;
            memory.write_bytes(stat_ptr, &stat.encode())
        }
        .await;
        self.finish("fd_fdstat_get", result, Errno::Inval)
    }

    pub async fn fd_fdstat_set_flags(&self, fd: u32, _flags: u16) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_FDSTAT_SET_FLAGS)?;
            Err(Error::nosys())
        }
        .await;
        self.finish("fd_fdstat_set_flags", result, Errno::Inval)
    }

    pub async fn fd_fdstat_set_rights(
        &self,
        fd: u32,
        rights_base: u64,
        rights_inheriting: u64,
    ) -> Errno {
        let result = (|| {
            let descriptor = self.shared.table.get(fd)?;
            let narrowed = descriptor.restrict_rights(
                Rights::from_bits_truncate(rights_base),
                Rights::from_bits_truncate(rights_inheriting),
            )?;
            self.shared.table.add(Arc::new(narrowed));
            Ok(())
        })();
        self.finish("fd_fdstat_set_rights", result, Errno::Inval)
    }

    pub async fn fd_filestat_get(&self, memory: &GuestMemory, fd: u32, stat_ptr: u32) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_FILESTAT_GET)?;
            let stat = self
                .driver_of(&descriptor)?
                .fd_filestat_get(&descriptor)
                .await?;
            memory.write_bytes(stat_ptr, &stat.encode())
        }
        .await;
        // A stat failure is most likely a permission problem in practice.
        self.finish("fd_filestat_get", result, Errno::Perm)
    }

    pub async fn fd_filestat_set_size(&self, fd: u32, size: u64) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_FILESTAT_SET_SIZE)?;
            self.driver_of(&descriptor)?
                .fd_filestat_set_size(&descriptor, size)
                .await
        }
        .await;
        self.finish("fd_filestat_set_size", result, Errno::Inval)
    }

    pub async fn fd_filestat_set_times(
        &self,
        _fd: u32,
        _atim: u64,
        _mtim: u64,
        _fst_flags: u16,
    ) -> Errno {
        self.finish("fd_filestat_set_times", Err(Error::nosys()), Errno::Inval)
    }

    pub async fn fd_pread(
        &self,
        memory: &GuestMemory,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        offset: u64,
        nread_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_READ | Rights::FD_SEEK)?;
            let iovs = memory.read_iovecs(iovs_ptr, iovs_len)?;
            let want: u64 = iovs.iter().map(|io| io.buf_len as u64).sum();
            let bytes = self
                .driver_of(&descriptor)?
                .fd_pread(&descriptor, offset, want)
                .await?;
            let nread = memory.scatter(&iovs, &bytes)?;
            memory.write_u32(nread_ptr, nread)
        }
        .await;
        self.finish("fd_pread", result, Errno::Inval)
    }

    pub async fn fd_prestat_get(&self, memory: &GuestMemory, _fd: u32, prestat_ptr: u32) -> Errno {
        let result = (|| {
            if self.shared.table.is_running() {
                return Err(Error::badf());
            }
            let mut cursor = self.shared.prestat_cursor.lock();
            match self.shared.preopens.get(*cursor) {
                Some(preopen) => {
                    *cursor += 1;
                    let prestat = PrestatDir {
                        pr_name_len: preopen.point.len() as u32,
                    };
                    memory.write_bytes(prestat_ptr, &prestat.encode())?;
                    Ok(())
                }
                None => {
                    // The fd that exhausts the iterator ends the guest
                    // libc's prestat loop and starts the running phase.
                    self.shared.table.switch_to_running();
                    Err(Error::badf())
                }
            }
        })();
        self.finish("fd_prestat_get", result, Errno::Inval)
    }

    pub async fn fd_prestat_dir_name(
        &self,
        memory: &GuestMemory,
        fd: u32,
        path_ptr: u32,
        path_len: u32,
    ) -> Errno {
        let result = (|| {
            let preopen = self
                .shared
                .preopens
                .iter()
                .find(|p| p.fd == fd)
                .ok_or_else(Error::badf)?;
            if preopen.point.len() as u32 != path_len {
                return Err(Error::from(Errno::Badmsg));
            }
            memory.write_bytes(path_ptr, preopen.point.as_bytes())
        })();
        self.finish("fd_prestat_dir_name", result, Errno::Inval)
    }

    pub async fn fd_pwrite(
        &self,
        memory: &GuestMemory,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        offset: u64,
        nwritten_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_WRITE | Rights::FD_SEEK)?;
            let iovs = memory.read_iovecs(iovs_ptr, iovs_len)?;
            let bytes = memory.gather(&iovs)?;
            let written = self
                .driver_of(&descriptor)?
                .fd_pwrite(&descriptor, offset, &bytes)
                .await?;
            memory.write_u32(nwritten_ptr, written as u32)
        }
        .await;
        self.finish("fd_pwrite", result, Errno::Inval)
    }

    pub async fn fd_read(
        &self,
        memory: &GuestMemory,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        nread_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_READ)?;
            let iovs = memory.read_iovecs(iovs_ptr, iovs_len)?;
            let want: u64 = iovs.iter().map(|io| io.buf_len as u64).sum();
            let bytes = self
                .driver_of(&descriptor)?
                .fd_read(&descriptor, want)
                .await?;
            let nread = memory.scatter(&iovs, &bytes)?;
            memory.write_u32(nread_ptr, nread)
        }
        .await;
        self.finish("fd_read", result, Errno::Inval)
    }

    pub async fn fd_readdir(
        &self,
        memory: &GuestMemory,
        fd: u32,
        buf_ptr: u32,
        buf_len: u32,
        cookie: u64,
        bufused_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_READDIR)?;

            // Cookie 0 (re)snapshots, discarding whatever an abandoned
            // pagination left behind; otherwise resume the snapshot taken
            // by the cookie-0 call, re-listing if it is gone.
            let snapshot = if cookie == 0 {
                descriptor.take_readdir_snapshot();
                None
            } else {
                descriptor.take_readdir_snapshot()
            };
            let entries = match snapshot {
                Some(entries) => entries,
                None => {
                    self.driver_of(&descriptor)?
                        .fd_readdir(&descriptor)
                        .await?
                }
            };

            let mut buf: Vec<u8> = Vec::with_capacity(buf_len as usize);
            let mut overflow = false;
            for (index, entry) in entries.iter().enumerate().skip(cookie as usize) {
                let name = entry.name.as_bytes();
                let header = Dirent {
                    d_next: index as u64 + 1,
                    d_ino: entry.inode,
                    d_namlen: name.len() as u32,
                    d_type: entry.filetype,
                }
                .encode();
                let record_len = header.len() + name.len();
                if buf.len() + record_len <= buf_len as usize {
                    buf.extend_from_slice(&header);
                    buf.extend_from_slice(name);
                } else {
                    // Fill the buffer with the truncated record; the
                    // caller sees bufused == buf_len and re-calls.
                    let mut record = Vec::with_capacity(record_len);
                    record.extend_from_slice(&header);
                    record.extend_from_slice(name);
                    let room = buf_len as usize - buf.len();
                    buf.extend_from_slice(&record[..room]);
                    overflow = true;
                    break;
                }
            }

            memory.write_bytes(buf_ptr, &buf)?;
            if overflow {
                descriptor.store_readdir_snapshot(entries);
                memory.write_u32(bufused_ptr, buf_len)?;
            } else {
                memory.write_u32(bufused_ptr, buf.len() as u32)?;
            }
            Ok(())
        }
        .await;
        self.finish("fd_readdir", result, Errno::Inval)
    }

    pub async fn fd_renumber(&self, from: u32, to: u32) -> Errno {
        let result = self.shared.table.renumber(from, to);
        self.finish("fd_renumber", result, Errno::Inval)
    }

    pub async fn fd_seek(
        &self,
        memory: &GuestMemory,
        fd: u32,
        offset: i64,
        whence: u8,
        newoffset_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            let whence = Whence::from_raw(whence).ok_or_else(Error::inval)?;
            // The de-facto "tell": seek(cur, 0) needs only one of the two
            // rights.
            if whence == Whence::Cur && offset == 0 {
                descriptor.assert_seek_or_tell()?;
            } else {
                descriptor.assert_rights(Rights::FD_SEEK)?;
            }
            let position = self
                .driver_of(&descriptor)?
                .fd_seek(&descriptor, offset, whence)
                .await?;
            memory.write_u64(newoffset_ptr, position)
        }
        .await;
        self.finish("fd_seek", result, Errno::Inval)
    }

    pub async fn fd_sync(&self, fd: u32) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_SYNC)?;
            self.driver_of(&descriptor)?.fd_sync(&descriptor).await
        }
        .await;
        self.finish("fd_sync", result, Errno::Inval)
    }

    pub async fn fd_tell(&self, memory: &GuestMemory, fd: u32, offset_ptr: u32) -> Errno {
        let result = (|| {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_seek_or_tell()?;
            memory.write_u64(offset_ptr, descriptor.cursor()?)
        })();
        self.finish("fd_tell", result, Errno::Inval)
    }

    pub async fn fd_write(
        &self,
        memory: &GuestMemory,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        nwritten_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.shared.table.get(fd)?;
            descriptor.assert_rights(Rights::FD_WRITE)?;
            let iovs = memory.read_iovecs(iovs_ptr, iovs_len)?;
            let bytes = memory.gather(&iovs)?;
            let written = self
                .driver_of(&descriptor)?
                .fd_write(&descriptor, &bytes)
                .await?;
            memory.write_u32(nwritten_ptr, written as u32)
        }
        .await;
        self.finish("fd_write", result, Errno::Inval)
    }

    // path calls ----------------------------------------------------------

    pub async fn path_create_directory(
        &self,
        memory: &GuestMemory,
        fd: u32,
        path_ptr: u32,
        path_len: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.dir_descriptor(fd, Rights::PATH_CREATE_DIRECTORY)?;
            let path = memory.read_string(path_ptr, path_len)?;
            let (driver, parent, rest) = self.route_path(&descriptor, &path)?;
            driver.path_create_directory(&parent, &rest).await
        }
        .await;
        self.finish("path_create_directory", result, Errno::Inval)
    }

    pub async fn path_filestat_get(
        &self,
        memory: &GuestMemory,
        fd: u32,
        flags: u32,
        path_ptr: u32,
        path_len: u32,
        stat_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.dir_descriptor(fd, Rights::PATH_FILESTAT_GET)?;
            let path = memory.read_string(path_ptr, path_len)?;
            let (driver, parent, rest) = self.route_path(&descriptor, &path)?;
            let stat = driver
                .path_filestat_get(&parent, Lookupflags::from_bits_truncate(flags), &rest)
                .await?;
            memory.write_bytes(stat_ptr, &stat.encode())
        }
        .await;
        self.finish("path_filestat_get", result, Errno::Inval)
    }

    pub async fn path_filestat_set_times(
        &self,
        _fd: u32,
        _flags: u32,
        _path_ptr: u32,
        _path_len: u32,
        _atim: u64,
        _mtim: u64,
        _fst_flags: u16,
    ) -> Errno {
        self.finish("path_filestat_set_times", Err(Error::nosys()), Errno::Inval)
    }

    pub async fn path_link(
        &self,
        _old_fd: u32,
        _old_flags: u32,
        _old_path_ptr: u32,
        _old_path_len: u32,
        _new_fd: u32,
        _new_path_ptr: u32,
        _new_path_len: u32,
    ) -> Errno {
        // The editor API has no hard links.
        self.finish("path_link", Err(Error::nosys()), Errno::Inval)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn path_open(
        &self,
        memory: &GuestMemory,
        fd: u32,
        _dirflags: u32,
        path_ptr: u32,
        path_len: u32,
        oflags: u16,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
        opened_fd_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.dir_descriptor(fd, Rights::PATH_OPEN)?;
            let oflags = Oflags::from_bits_truncate(oflags);
            let fdflags = Fdflags::from_bits_truncate(fdflags);
            if oflags.contains(Oflags::CREAT) {
                descriptor.assert_rights(Rights::PATH_CREATE_FILE)?;
            }
            if oflags.contains(Oflags::TRUNC) {
                descriptor.assert_rights(Rights::PATH_FILESTAT_SET_SIZE)?;
            }

            // Narrow the request to what the parent may hand down; the
            // driver applies per-filetype policy on top.
            let requested_base =
                Rights::from_bits_truncate(rights_base) & descriptor.rights_inheriting;
            let requested_inheriting =
                Rights::from_bits_truncate(rights_inheriting) & descriptor.rights_inheriting;

            let path = memory.read_string(path_ptr, path_len)?;
            let (driver, parent, rest) = self.route_path(&descriptor, &path)?;
            let new_fd = self.shared.table.next_fd()?;
            let opened = driver
                .path_open(
                    new_fd,
                    &parent,
                    &rest,
                    oflags,
                    fdflags,
                    requested_base,
                    requested_inheriting,
                )
                .await?;
            self.shared.table.add(opened.clone());
            memory.write_u32(opened_fd_ptr, opened.fd())
        }
        .await;
        self.finish("path_open", result, Errno::Inval)
    }

    pub async fn path_readlink(
        &self,
        memory: &GuestMemory,
        fd: u32,
        path_ptr: u32,
        path_len: u32,
        buf_ptr: u32,
        buf_len: u32,
        bufused_ptr: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.dir_descriptor(fd, Rights::PATH_READLINK)?;
            let path = memory.read_string(path_ptr, path_len)?;
            let (driver, parent, rest) = self.route_path(&descriptor, &path)?;
            let target = driver.path_readlink(&parent, &rest).await?;
            let bytes = target.as_bytes();
            let take = std::cmp::min(bytes.len(), buf_len as usize);
            memory.write_bytes(buf_ptr, &bytes[..take])?;
            memory.write_u32(bufused_ptr, take as u32)
        }
        .await;
        self.finish("path_readlink", result, Errno::Inval)
    }

    pub async fn path_remove_directory(
        &self,
        memory: &GuestMemory,
        fd: u32,
        path_ptr: u32,
        path_len: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.dir_descriptor(fd, Rights::PATH_REMOVE_DIRECTORY)?;
            let path = memory.read_string(path_ptr, path_len)?;
            let (driver, parent, rest) = self.route_path(&descriptor, &path)?;
            driver.path_remove_directory(&parent, &rest).await
        }
        .await;
        self.finish("path_remove_directory", result, Errno::Inval)
    }

    pub async fn path_rename(
        &self,
        memory: &GuestMemory,
        old_fd: u32,
        old_path_ptr: u32,
        old_path_len: u32,
        new_fd: u32,
        new_path_ptr: u32,
        new_path_len: u32,
    ) -> Errno {
        let result = async {
            let old_descriptor = self.dir_descriptor(old_fd, Rights::PATH_RENAME_SOURCE)?;
            let new_descriptor = self.dir_descriptor(new_fd, Rights::PATH_RENAME_TARGET)?;
            let old_path = memory.read_string(old_path_ptr, old_path_len)?;
            let new_path = memory.read_string(new_path_ptr, new_path_len)?;
            let (old_driver, old_parent, old_rest) = self.route_path(&old_descriptor, &old_path)?;
            let (new_driver, new_parent, new_rest) = self.route_path(&new_descriptor, &new_path)?;
            if old_driver.id() != new_driver.id() {
                // Renames never cross devices.
                return Err(Error::nosys());
            }
            old_driver
                .path_rename(&old_parent, &old_rest, &new_parent, &new_rest)
                .await
        }
        .await;
        self.finish("path_rename", result, Errno::Inval)
    }

    pub async fn path_symlink(
        &self,
        _old_path_ptr: u32,
        _old_path_len: u32,
        _fd: u32,
        _new_path_ptr: u32,
        _new_path_len: u32,
    ) -> Errno {
        // The editor API exposes no symlink creation.
        self.finish("path_symlink", Err(Error::nosys()), Errno::Inval)
    }

    pub async fn path_unlink_file(
        &self,
        memory: &GuestMemory,
        fd: u32,
        path_ptr: u32,
        path_len: u32,
    ) -> Errno {
        let result = async {
            let descriptor = self.dir_descriptor(fd, Rights::PATH_UNLINK_FILE)?;
            let path = memory.read_string(path_ptr, path_len)?;
            let (driver, parent, rest) = self.route_path(&descriptor, &path)?;
            driver.path_unlink_file(&parent, &rest).await
        }
        .await;
        self.finish("path_unlink_file", result, Errno::Inval)
    }

    // poll / process ------------------------------------------------------

    pub async fn poll_oneoff(
        &self,
        memory: &GuestMemory,
        in_ptr: u32,
        out_ptr: u32,
        nsubscriptions: u32,
        nevents_ptr: u32,
    ) -> Errno {
        let result = async {
            let mut subscriptions = Vec::with_capacity(nsubscriptions as usize);
            for i in 0..nsubscriptions {
                let bytes = memory.read_bytes(in_ptr + i * Subscription::SIZE, Subscription::SIZE)?;
                subscriptions.push(Subscription::decode(&bytes).ok_or_else(Error::inval)?);
            }

            // First pass: translate clock subscriptions into relative
            // timeouts and evaluate fd readiness once.
            let mut clock_waits: Vec<(u64, u64)> = Vec::new(); // (timeout ns, userdata)
            for sub in &subscriptions {
                if let SubscriptionU::Clock {
                    id,
                    timeout,
                    flags,
                    ..
                } = sub.u
                {
                    let ns = if flags.contains(Subclockflags::SUBSCRIPTION_CLOCK_ABSTIME) {
                        timeout.saturating_sub(self.shared.clocks.now(id)?)
                    } else {
                        timeout
                    };
                    clock_waits.push((ns, sub.userdata));
                }
            }

            let min_wait = clock_waits.iter().map(|(ns, _)| *ns).min();
            if let Some(ns) = min_wait {
                tokio::time::sleep(Duration::from_nanos(ns)).await;
            }

            let mut events: Vec<Event> = Vec::new();
            for (ns, userdata) in &clock_waits {
                if Some(*ns) == min_wait {
                    events.push(Event {
                        userdata: *userdata,
                        error: Errno::Success,
                        type_: Eventtype::Clock,
                        fd_readwrite: None,
                    });
                }
            }

            // fd_read readiness is (re-)evaluated after any clock sleep;
            // fd_write is immediately writable.
            for sub in &subscriptions {
                match sub.u {
                    SubscriptionU::FdRead { fd } => {
                        let outcome = async {
                            let descriptor = self.shared.table.get(fd)?;
                            descriptor.assert_rights(Rights::POLL_FD_READWRITE)?;
                            self.driver_of(&descriptor)?
                                .fd_bytes_available(&descriptor)
                                .await
                        }
                        .await;
                        match outcome {
                            Ok(0) => {}
                            Ok(nbytes) => events.push(Event {
                                userdata: sub.userdata,
                                error: Errno::Success,
                                type_: Eventtype::FdRead,
                                fd_readwrite: Some(EventFdReadwrite {
                                    nbytes,
                                    flags: Eventrwflags::empty(),
                                }),
                            }),
                            Err(err) => events.push(Event {
                                userdata: sub.userdata,
                                error: err.into_errno(Errno::Inval),
                                type_: Eventtype::FdRead,
                                fd_readwrite: Some(EventFdReadwrite {
                                    nbytes: 0,
                                    flags: Eventrwflags::empty(),
                                }),
                            }),
                        }
                    }
                    SubscriptionU::FdWrite { fd } => {
                        let error = match self.shared.table.get(fd) {
                            Ok(_) => Errno::Success,
                            Err(err) => err.into_errno(Errno::Badf),
                        };
                        events.push(Event {
                            userdata: sub.userdata,
                            error,
                            type_: Eventtype::FdWrite,
                            fd_readwrite: Some(EventFdReadwrite {
                                nbytes: 0,
                                flags: Eventrwflags::empty(),
                            }),
                        });
                    }
                    SubscriptionU::Clock { .. } => {}
                }
            }

            for (i, event) in events.iter().enumerate() {
                memory.write_bytes(out_ptr + i as u32 * Event::SIZE, &event.encode())?;
            }
            memory.write_u32(nevents_ptr, events.len() as u32)
        }
        .await;
        self.finish("poll_oneoff", result, Errno::Inval)
    }

    /// Tears the process down asynchronously; the call itself reports
    /// success.
    pub async fn proc_exit(&self, code: u32) -> Errno {
        self.shared.exit.exit(code);
        self.finish("proc_exit", Ok(()), Errno::Inval)
    }

    pub async fn proc_raise(&self, _signal: u8) -> Errno {
        self.finish("proc_raise", Err(Error::nosys()), Errno::Inval)
    }

    pub async fn random_get(&self, memory: &GuestMemory, buf_ptr: u32, buf_len: u32) -> Errno {
        let result = (|| {
            let mut bytes = vec![0u8; buf_len as usize];
            self.shared.random.lock().fill_bytes(&mut bytes);
            memory.write_bytes(buf_ptr, &bytes)
        })();
        self.finish("random_get", result, Errno::Inval)
    }

    pub async fn sched_yield(&self) -> Errno {
        tokio::task::yield_now().await;
        self.finish("sched_yield", Ok(()), Errno::Inval)
    }

    pub async fn sock_accept(&self, _fd: u32, _flags: u16) -> Errno {
        self.finish("sock_accept", Err(Error::notsup()), Errno::Inval)
    }

    pub async fn sock_recv(
        &self,
        _fd: u32,
        _ri_data_ptr: u32,
        _ri_data_len: u32,
        _ri_flags: u16,
    ) -> Errno {
        self.finish("sock_recv", Err(Error::notsup()), Errno::Inval)
    }

    pub async fn sock_send(
        &self,
        _fd: u32,
        _si_data_ptr: u32,
        _si_data_len: u32,
        _si_flags: u16,
    ) -> Errno {
        self.finish("sock_send", Err(Error::notsup()), Errno::Inval)
    }

    pub async fn sock_shutdown(&self, _fd: u32, _how: u8) -> Errno {
        self.finish("sock_shutdown", Err(Error::notsup()), Errno::Inval)
    }

    /// Start a guest thread on a fresh worker sharing this process's fd
    /// table. Writes the new thread id (monotonic from 2) on success and
    /// -1 on failure; the call itself reports success either way.
    pub async fn thread_spawn(
        &self,
        memory: &GuestMemory,
        tid_ptr: u32,
        start_arg: u32,
    ) -> Errno {
        let result = (|| {
            let host = self.shared.worker_host.lock().clone();
            let spawned = match host {
                Some(host) => {
                    let tid = self.shared.next_tid.fetch_add(1, Ordering::Relaxed);
                    host.start_thread(tid, start_arg).map(|()| tid)
                }
                None => Err(Error::notsup()),
            };
            match spawned {
                Ok(tid) => memory.write_u32(tid_ptr, tid),
                Err(_) => memory.write_u32(tid_ptr, u32::MAX),
            }
        })();
        self.finish("thread_spawn", result, Errno::Inval)
    }

    /// The calling worker detaches; nothing to unwind host-side.
    pub async fn thread_exit(&self, _tid: u32) -> Errno {
        self.finish("thread_exit", Ok(()), Errno::Inval)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chardev::ConsoleDriver;
    use crate::memfs::{MemoryFileSystem, MemoryFsDriver};

    /// Assemble a minimal process: console stdio plus memory filesystems
    /// mounted per `mounts`.
    async fn service_with_mounts(mounts: &[&str]) -> (WasiService, GuestMemory) {
        let registry = Arc::new(DeviceRegistry::new());
        let table = Arc::new(FdTable::new());

        let console: Arc<dyn DeviceDriver> = registry.register(Arc::new(ConsoleDriver::new(
            &registry,
            Box::new(|_| {}),
        )));
        for _ in 0..3u32 {
            let fd = table.next_fd().unwrap();
            let descriptor = console
                .create_stdio_fd(fd, None, Fdflags::empty())
                .await
                .unwrap();
            table.add(descriptor);
        }

        let vroot = if mounts.len() > 1 || mounts.iter().any(|m| *m != "/") {
            Some(Arc::new(VirtualRootDriver::new(&registry)))
        } else {
            None
        };
        let mut preopens = Vec::new();
        for point in mounts {
            let fs = MemoryFileSystem::new();
            let driver: Arc<dyn DeviceDriver> =
                registry.register(Arc::new(MemoryFsDriver::new(&registry, &fs)));
            if let Some(vroot) = &vroot {
                vroot.add_mount(point, driver.clone()).unwrap();
            }
            let fd = table.next_fd().unwrap();
            let root = driver.prestat_fd(fd).await.unwrap();
            table.add(root.clone());
            table.set_root(driver.id(), root);
            preopens.push(Preopen {
                fd,
                point: point.to_string(),
                device: driver.id(),
            });
        }
        if let Some(vroot) = &vroot {
            registry.register(vroot.clone());
        }

        let (exit, _rx) = ExitSignal::new();
        let shared = Arc::new(ProcessShared {
            program_name: "test".to_string(),
            args: vec!["one".to_string()],
            env: vec![("KEY".to_string(), "VALUE".to_string())],
            table,
            registry,
            preopens,
            vroot,
            clocks: Clocks::new(),
            exit,
            random: Mutex::new(default_rng()),
            prestat_cursor: Mutex::new(0),
            next_tid: AtomicU32::new(2),
            worker_host: Mutex::new(None),
            trace: false,
        });
        (WasiService::new(shared), GuestMemory::new(64 * 1024))
    }

    fn write_path(memory: &GuestMemory, ptr: u32, path: &str) -> (u32, u32) {
        memory.write_bytes(ptr, path.as_bytes()).unwrap();
        (ptr, path.len() as u32)
    }

    async fn open(
        service: &WasiService,
        memory: &GuestMemory,
        dirfd: u32,
        path: &str,
        oflags: Oflags,
    ) -> (Errno, u32) {
        let (p, l) = write_path(memory, 600, path);
        let errno = service
            .path_open(
                memory,
                dirfd,
                0,
                p,
                l,
                oflags.bits(),
                Rights::all().bits(),
                Rights::all().bits(),
                0,
                700,
            )
            .await;
        (errno, memory.read_u32(700).unwrap())
    }

    #[tokio::test]
    async fn args_round_trip_through_guest_memory() {
        let (service, memory) = service_with_mounts(&["/tmp"]).await;
        assert_eq!(
            service.args_sizes_get(&memory, 0, 4).await,
            Errno::Success
        );
        assert_eq!(memory.read_u32(0).unwrap(), 2); // program name + one arg
        assert_eq!(memory.read_u32(4).unwrap(), 9); // "test\0one\0"
        assert_eq!(service.args_get(&memory, 8, 32).await, Errno::Success);
        assert_eq!(memory.read_u32(8).unwrap(), 32);
        assert_eq!(memory.read_bytes(32, 5).unwrap(), b"test\0");
    }

    #[tokio::test]
    async fn prestat_loop_switches_table_to_running() {
        let (service, memory) = service_with_mounts(&["/workspace", "/tmp"]).await;
        assert_eq!(service.fd_prestat_get(&memory, 3, 0).await, Errno::Success);
        assert_eq!(memory.read_u8(0).unwrap(), 0); // preopen dir tag
        assert_eq!(memory.read_u32(4).unwrap(), 10); // "/workspace"
        assert_eq!(service.fd_prestat_get(&memory, 4, 0).await, Errno::Success);
        assert_eq!(memory.read_u32(4).unwrap(), 4); // "/tmp"
        assert_eq!(service.fd_prestat_get(&memory, 5, 0).await, Errno::Badf);
        assert!(service.shared.table.is_running());
        assert_eq!(service.shared.table.first_real_fd(), 5);

        assert_eq!(
            service.fd_prestat_dir_name(&memory, 3, 100, 10).await,
            Errno::Success
        );
        assert_eq!(memory.read_bytes(100, 10).unwrap(), b"/workspace");
        // Length must match exactly.
        assert_eq!(
            service.fd_prestat_dir_name(&memory, 3, 100, 11).await,
            Errno::Badmsg
        );
    }

    #[tokio::test]
    async fn write_then_stat_sees_the_size() {
        let (service, memory) = service_with_mounts(&["/workspace", "/tmp"]).await;
        service.fd_prestat_get(&memory, 3, 0).await;
        service.fd_prestat_get(&memory, 4, 0).await;
        service.fd_prestat_get(&memory, 5, 0).await;

        let (errno, fd) = open(&service, &memory, 4, "a", Oflags::CREAT).await;
        assert_eq!(errno, Errno::Success);
        assert_eq!(fd, 5);

        // One iovec: "hello" at 900.
        memory.write_bytes(900, b"hello").unwrap();
        memory.write_u32(800, 900).unwrap();
        memory.write_u32(804, 5).unwrap();
        assert_eq!(
            service.fd_write(&memory, fd, 800, 1, 808).await,
            Errno::Success
        );
        assert_eq!(memory.read_u32(808).unwrap(), 5);

        let (p, l) = write_path(&memory, 600, "a");
        assert_eq!(
            service.path_filestat_get(&memory, 4, 0, p, l, 1000).await,
            Errno::Success
        );
        let size = memory.read_u64(1000 + 32).unwrap();
        assert_eq!(size, 5);
        assert_eq!(memory.read_u8(1000 + 16).unwrap(), 4); // regular_file
    }

    #[tokio::test]
    async fn readdir_paginates_with_one_based_cookies() {
        let (service, memory) = service_with_mounts(&["/tmp"]).await;
        service.fd_prestat_get(&memory, 3, 0).await;
        service.fd_prestat_get(&memory, 4, 0).await;
        for name in ["a", "b", "c"] {
            let (errno, _) = open(&service, &memory, 3, name, Oflags::CREAT).await;
            assert_eq!(errno, Errno::Success);
        }

        let record = Dirent::SIZE + 1; // every name is one byte
        assert_eq!(
            service
                .fd_readdir(&memory, 3, 2000, record + 1, 0, 1996)
                .await,
            Errno::Success
        );
        // One whole entry fits; bufused reports the full buffer.
        assert_eq!(memory.read_u32(1996).unwrap(), record + 1);
        assert_eq!(memory.read_u64(2000).unwrap(), 1); // d_next
        let namelen = memory.read_u32(2000 + 16).unwrap();
        assert_eq!(
            memory.read_bytes(2000 + 24, namelen).unwrap(),
            b"a"
        );

        assert_eq!(
            service.fd_readdir(&memory, 3, 2000, 4096, 1, 1996).await,
            Errno::Success
        );
        assert_eq!(memory.read_u32(1996).unwrap(), 2 * record);
        assert_eq!(memory.read_u64(2000).unwrap(), 2);

        assert_eq!(
            service.fd_readdir(&memory, 3, 2000, 4096, 3, 1996).await,
            Errno::Success
        );
        assert_eq!(memory.read_u32(1996).unwrap(), 0);
    }

    #[tokio::test]
    async fn seek_rights_boundaries() {
        let (service, memory) = service_with_mounts(&["/tmp"]).await;
        service.fd_prestat_get(&memory, 3, 0).await;
        service.fd_prestat_get(&memory, 4, 0).await;
        let (_, fd) = open(&service, &memory, 3, "f", Oflags::CREAT).await;

        // Strip rights down to nothing relevant.
        assert_eq!(
            service
                .fd_fdstat_set_rights(fd, Rights::FD_READ.bits(), 0)
                .await,
            Errno::Success
        );
        assert_eq!(
            service.fd_seek(&memory, fd, 0, 1, 1200).await,
            Errno::Perm
        );

        let (_, fd2) = open(&service, &memory, 3, "g", Oflags::CREAT).await;
        assert_eq!(service.fd_seek(&memory, fd2, 0, 1, 1200).await, Errno::Success);
        // Bad whence.
        assert_eq!(service.fd_seek(&memory, fd2, 0, 9, 1200).await, Errno::Inval);
    }

    #[tokio::test]
    async fn renumber_boundaries() {
        let (service, memory) = service_with_mounts(&["/tmp"]).await;
        service.fd_prestat_get(&memory, 3, 0).await;
        service.fd_prestat_get(&memory, 4, 0).await;
        let (_, fd) = open(&service, &memory, 3, "f", Oflags::CREAT).await;

        assert_eq!(service.fd_renumber(fd, fd).await, Errno::Badf);
        assert_eq!(service.fd_renumber(1, fd + 1).await, Errno::Notsup);
        assert_eq!(service.fd_renumber(fd, fd + 7).await, Errno::Success);
    }

    #[tokio::test]
    async fn poll_single_relative_clock_waits() {
        let (service, memory) = service_with_mounts(&["/tmp"]).await;
        // subscription: userdata 7, clock monotonic, relative 50ms.
        memory.write_u64(3000, 7).unwrap();
        memory.write_u8(3008, 0).unwrap();
        memory.write_u32(3016, 1).unwrap();
        memory.write_u64(3024, 50_000_000).unwrap();

        let started = std::time::Instant::now();
        assert_eq!(
            service.poll_oneoff(&memory, 3000, 3100, 1, 3200).await,
            Errno::Success
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(memory.read_u32(3200).unwrap(), 1);
        assert_eq!(memory.read_u64(3100).unwrap(), 7);
        assert_eq!(memory.read_u16(3100 + 8).unwrap(), 0); // success
        assert_eq!(memory.read_u8(3100 + 10).unwrap(), 0); // clock event
    }

    #[tokio::test]
    async fn cross_device_rename_is_nosys() {
        let (service, memory) = service_with_mounts(&["/a", "/b"]).await;
        service.fd_prestat_get(&memory, 3, 0).await;
        service.fd_prestat_get(&memory, 4, 0).await;
        service.fd_prestat_get(&memory, 5, 0).await;
        let (errno, _) = open(&service, &memory, 3, "x", Oflags::CREAT).await;
        assert_eq!(errno, Errno::Success);

        let (op, ol) = write_path(&memory, 600, "x");
        let (np, nl) = write_path(&memory, 650, "y");
        assert_eq!(
            service.path_rename(&memory, 3, op, ol, 4, np, nl).await,
            Errno::Nosys
        );
    }

    #[tokio::test]
    async fn absolute_paths_route_through_the_virtual_root() {
        let (service, memory) = service_with_mounts(&["/a", "/b"]).await;
        service.fd_prestat_get(&memory, 3, 0).await;
        service.fd_prestat_get(&memory, 4, 0).await;
        service.fd_prestat_get(&memory, 5, 0).await;

        // Create /b/file by absolute path against the /a preopen.
        let (errno, fd) = open(&service, &memory, 3, "/b/file", Oflags::CREAT).await;
        assert_eq!(errno, Errno::Success);
        assert_eq!(service.fd_close(fd).await, Errno::Success);
        let (p, l) = write_path(&memory, 600, "file");
        assert_eq!(
            service.path_filestat_get(&memory, 4, 0, p, l, 1000).await,
            Errno::Success
        );
    }

    #[tokio::test]
    async fn random_get_fills_memory() {
        let (service, memory) = service_with_mounts(&["/tmp"]).await;
        assert_eq!(service.random_get(&memory, 5000, 16).await, Errno::Success);
        let a = memory.read_bytes(5000, 16).unwrap();
        assert_eq!(service.random_get(&memory, 5000, 16).await, Errno::Success);
        let b = memory.read_bytes(5000, 16).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn sockets_are_not_supported() {
        let (service, _memory) = service_with_mounts(&["/tmp"]).await;
        assert_eq!(service.sock_accept(3, 0).await, Errno::Notsup);
        assert_eq!(service.sock_shutdown(3, 0).await, Errno::Notsup);
    }

    struct RecordingHost(Mutex<Vec<u32>>);

    impl WorkerHost for RecordingHost {
        fn start_thread(&self, tid: u32, _start_arg: u32) -> WasiResult<()> {
            self.0.lock().push(tid);
            Ok(())
        }
    }

    #[tokio::test]
    async fn thread_spawn_allocates_monotonic_tids() {
        let (service, memory) = service_with_mounts(&["/tmp"]).await;
        // Without a worker host the spawn fails with tid -1.
        assert_eq!(service.thread_spawn(&memory, 0, 9).await, Errno::Success);
        assert_eq!(memory.read_u32(0).unwrap(), u32::MAX);

        let host = Arc::new(RecordingHost(Mutex::new(Vec::new())));
        *service.shared.worker_host.lock() = Some(host.clone());
        service.thread_spawn(&memory, 0, 9).await;
        assert_eq!(memory.read_u32(0).unwrap(), 2);
        service.thread_spawn(&memory, 0, 9).await;
        assert_eq!(memory.read_u32(0).unwrap(), 3);
        assert_eq!(*host.0.lock(), vec![2, 3]);
    }

    #[tokio::test]
    async fn proc_exit_resolves_the_exit_signal() {
        let (service, _memory) = service_with_mounts(&["/tmp"]).await;
        assert!(!service.is_exited());
        assert_eq!(service.proc_exit(3).await, Errno::Success);
        assert!(service.is_exited());
    }
}
