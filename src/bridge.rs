//! The synchronous-call bridge. A guest thread, running on its own
//! worker, writes a syscall request into a shared [`CallBuffer`], stores
//! `0` at the sync word and blocks on it; the host handler observes the
//! request, runs the asynchronous service method, writes the errno back,
//! stores `1` and wakes the guest. The protocol is point-to-point per
//! worker; there is no multiplexing.

use crate::abi::Errno;
use crate::error::{Error, WasiResult};
use crate::memory::GuestMemory;
use crate::service::WasiService;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Size of the fixed parameter area following the header. Large enough
/// for the widest signature (`path_open`: nine slots, two of them wide).
pub const PARAM_AREA_SIZE: usize = 96;

/// Shared-buffer header offsets (the byte layout the two sides agree on):
/// sync word at 0, errno at 4, method index at 8, parameters from 12.
pub const SYNC_OFFSET: usize = 0;
pub const ERRNO_OFFSET: usize = 4;
pub const METHOD_OFFSET: usize = 8;
pub const PARAMS_OFFSET: usize = 12;

const SYNC_REQUEST: u32 = 0;
const SYNC_REPLY: u32 = 1;

/// One parameter slot in a call signature. Pointers are 32-bit guest
/// offsets; the direction tells the host whether the referenced bytes are
/// read, written, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiArg {
    U32,
    U64,
    PtrIn,
    PtrOut,
    PtrInOut,
}

impl AbiArg {
    pub fn size(self) -> usize {
        match self {
            AbiArg::U64 => 8,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub params: &'static [AbiArg],
}

impl Signature {
    pub fn byte_len(&self) -> usize {
        self.params.iter().map(|p| p.size()).sum()
    }
}

macro_rules! syscalls {
    ($( $index:literal $variant:ident $name:literal [ $($arg:ident),* ] ),* $(,)?) => {
        /// Method indices of the wire protocol, one per preview-1 call.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum Syscall {
            $( $variant = $index, )*
        }

        impl Syscall {
            pub fn from_raw(raw: u32) -> Option<Syscall> {
                match raw {
                    $( $index => Some(Syscall::$variant), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Syscall::$variant => $name, )*
                }
            }

            pub fn signature(self) -> Signature {
                match self {
                    $( Syscall::$variant => Signature {
                        params: &[ $( AbiArg::$arg ),* ],
                    }, )*
                }
            }
        }
    };
}

syscalls! {
    0  ArgsSizesGet "args_sizes_get" [PtrOut, PtrOut],
    1  ArgsGet "args_get" [PtrOut, PtrOut],
    2  EnvironSizesGet "environ_sizes_get" [PtrOut, PtrOut],
    3  EnvironGet "environ_get" [PtrOut, PtrOut],
    4  ClockResGet "clock_res_get" [U32, PtrOut],
    5  ClockTimeGet "clock_time_get" [U32, U64, PtrOut],
    6  FdAdvise "fd_advise" [U32, U64, U64, U32],
    7  FdAllocate "fd_allocate" [U32, U64, U64],
    8  FdClose "fd_close" [U32],
    9  FdDatasync "fd_datasync" [U32],
    10 FdFdstatGet "fd_fdstat_get" [U32, PtrOut],
    11 FdFdstatSetFlags "fd_fdstat_set_flags" [U32, U32],
    12 FdFdstatSetRights "fd_fdstat_set_rights" [U32, U64, U64],
    13 FdFilestatGet "fd_filestat_get" [U32, PtrOut],
    14 FdFilestatSetSize "fd_filestat_set_size" [U32, U64],
    15 FdFilestatSetTimes "fd_filestat_set_times" [U32, U64, U64, U32],
    16 FdPread "fd_pread" [U32, PtrIn, U32, U64, PtrOut],
    17 FdPrestatGet "fd_prestat_get" [U32, PtrOut],
    18 FdPrestatDirName "fd_prestat_dir_name" [U32, PtrOut, U32],
    19 FdPwrite "fd_pwrite" [U32, PtrIn, U32, U64, PtrOut],
    20 FdRead "fd_read" [U32, PtrIn, U32, PtrOut],
    21 FdReaddir "fd_readdir" [U32, PtrOut, U32, U64, PtrOut],
    22 FdRenumber "fd_renumber" [U32, U32],
    23 FdSeek "fd_seek" [U32, U64, U32, PtrOut],
    24 FdSync "fd_sync" [U32],
    25 FdTell "fd_tell" [U32, PtrOut],
    26 FdWrite "fd_write" [U32, PtrIn, U32, PtrOut],
    27 PathCreateDirectory "path_create_directory" [U32, PtrIn, U32],
    28 PathFilestatGet "path_filestat_get" [U32, U32, PtrIn, U32, PtrOut],
    29 PathFilestatSetTimes "path_filestat_set_times" [U32, U32, PtrIn, U32, U64, U64, U32],
    30 PathLink "path_link" [U32, U32, PtrIn, U32, U32, PtrIn, U32],
    31 PathOpen "path_open" [U32, U32, PtrIn, U32, U32, U64, U64, U32, PtrOut],
    32 PathReadlink "path_readlink" [U32, PtrIn, U32, PtrOut, U32, PtrOut],
    33 PathRemoveDirectory "path_remove_directory" [U32, PtrIn, U32],
    34 PathRename "path_rename" [U32, PtrIn, U32, U32, PtrIn, U32],
    35 PathSymlink "path_symlink" [PtrIn, U32, U32, PtrIn, U32],
    36 PathUnlinkFile "path_unlink_file" [U32, PtrIn, U32],
    37 PollOneoff "poll_oneoff" [PtrIn, PtrOut, U32, PtrOut],
    38 ProcExit "proc_exit" [U32],
    39 ProcRaise "proc_raise" [U32],
    40 RandomGet "random_get" [PtrOut, U32],
    41 SchedYield "sched_yield" [],
    42 SockAccept "sock_accept" [U32, U32],
    43 SockRecv "sock_recv" [U32, PtrIn, U32, U32],
    44 SockSend "sock_send" [U32, PtrIn, U32, U32],
    45 SockShutdown "sock_shutdown" [U32, U32],
    46 ThreadSpawn "thread_spawn" [PtrOut, U32],
    47 ThreadExit "thread_exit" [U32],
}

/// Encode call arguments into the parameter area per the signature.
pub fn encode_params(signature: &Signature, args: &[u64]) -> Option<Vec<u8>> {
    if args.len() != signature.params.len() {
        return None;
    }
    let mut bytes = Vec::with_capacity(signature.byte_len());
    for (arg, value) in signature.params.iter().zip(args) {
        match arg {
            AbiArg::U64 => bytes.extend_from_slice(&value.to_le_bytes()),
            _ => bytes.extend_from_slice(&u32::try_from(*value).ok()?.to_le_bytes()),
        }
    }
    Some(bytes)
}

/// Decode the parameter area per the signature; `None` marks a transport
/// error the handler reports as `inval`.
pub fn decode_params(signature: &Signature, bytes: &[u8]) -> Option<Vec<u64>> {
    let mut args = Vec::with_capacity(signature.params.len());
    let mut offset = 0usize;
    for arg in signature.params {
        let size = arg.size();
        let slice = bytes.get(offset..offset + size)?;
        let value = match arg {
            AbiArg::U64 => u64::from_le_bytes(slice.try_into().unwrap()),
            _ => u32::from_le_bytes(slice.try_into().unwrap()) as u64,
        };
        args.push(value);
        offset += size;
    }
    Some(args)
}

/// The shared region one guest worker and the host rendezvous on. The
/// sync word uses sequentially consistent ordering; both sides retry
/// their load on a spurious wake.
pub struct CallBuffer {
    sync: AtomicU32,
    errno: AtomicU32,
    method: AtomicU32,
    params: Mutex<[u8; PARAM_AREA_SIZE]>,
    /// Pass-through byte arguments staged by the guest stub, referenced
    /// from the parameter area by offset.
    data: Mutex<Vec<u8>>,
    closed: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl CallBuffer {
    pub fn new() -> Arc<CallBuffer> {
        Arc::new(CallBuffer {
            sync: AtomicU32::new(SYNC_REPLY),
            errno: AtomicU32::new(0),
            method: AtomicU32::new(0),
            params: Mutex::new([0; PARAM_AREA_SIZE]),
            data: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        })
    }

    /// Tear the channel down; a blocked host handler wakes up and stops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stage pass-through bytes and return their offset in the data
    /// region.
    pub fn stage_data(&self, bytes: &[u8]) -> u32 {
        let mut data = self.data.lock();
        let offset = data.len() as u32;
        data.extend_from_slice(bytes);
        offset
    }

    pub fn read_data(&self, offset: u32, len: u32) -> WasiResult<Vec<u8>> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + len as usize;
        if end > data.len() {
            return Err(Error::inval());
        }
        Ok(data[start..end].to_vec())
    }

    /// The guest stub: write the request, flip the sync word to 0, wake
    /// the host and block until the reply flips it back to 1.
    pub fn call(&self, method: Syscall, args: &[u64]) -> u16 {
        let encoded = match encode_params(&method.signature(), args) {
            Some(encoded) => encoded,
            None => return Errno::Inval.raw(),
        };
        {
            let mut params = self.params.lock();
            params[..encoded.len()].copy_from_slice(&encoded);
        }
        self.method.store(method as u32, Ordering::SeqCst);
        {
            let mut guard = self.wake_lock.lock();
            self.sync.store(SYNC_REQUEST, Ordering::SeqCst);
            self.wake.notify_all();
            while self.sync.load(Ordering::SeqCst) == SYNC_REQUEST && !self.is_closed() {
                self.wake.wait(&mut guard);
            }
        }
        self.errno.load(Ordering::SeqCst) as u16
    }

    /// Host side: block until a request arrives. `None` when the channel
    /// closed instead.
    fn next_request(&self) -> Option<(u32, [u8; PARAM_AREA_SIZE])> {
        let mut guard = self.wake_lock.lock();
        while self.sync.load(Ordering::SeqCst) != SYNC_REQUEST {
            if self.is_closed() {
                return None;
            }
            self.wake.wait(&mut guard);
        }
        drop(guard);
        let method = self.method.load(Ordering::SeqCst);
        let params = *self.params.lock();
        Some((method, params))
    }

    /// Host side: publish the reply and wake the guest.
    fn complete(&self, errno: u16) {
        self.errno.store(errno as u32, Ordering::SeqCst);
        let _guard = self.wake_lock.lock();
        self.sync.store(SYNC_REPLY, Ordering::SeqCst);
        self.wake.notify_all();
    }
}

/// Decode and run one call against the service. Unknown methods and
/// malformed parameter areas surface as `inval`.
pub async fn dispatch(
    service: &WasiService,
    memory: &GuestMemory,
    method: u32,
    params: &[u8],
) -> Errno {
    let Some(call) = Syscall::from_raw(method) else {
        debug!(method, "unknown method index on call bridge");
        return Errno::Inval;
    };
    let Some(a) = decode_params(&call.signature(), params) else {
        debug!(call = call.name(), "parameter decode failed");
        return Errno::Inval;
    };
    let m = memory;
    match call {
        Syscall::ArgsSizesGet => service.args_sizes_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::ArgsGet => service.args_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::EnvironSizesGet => service.environ_sizes_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::EnvironGet => service.environ_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::ClockResGet => service.clock_res_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::ClockTimeGet => {
            service
                .clock_time_get(m, a[0] as u32, a[1], a[2] as u32)
                .await
        }
        Syscall::FdAdvise => {
            service
                .fd_advise(a[0] as u32, a[1], a[2], a[3] as u8)
                .await
        }
        Syscall::FdAllocate => service.fd_allocate(a[0] as u32, a[1], a[2]).await,
        Syscall::FdClose => service.fd_close(a[0] as u32).await,
        Syscall::FdDatasync => service.fd_datasync(a[0] as u32).await,
        Syscall::FdFdstatGet => service.fd_fdstat_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::FdFdstatSetFlags => {
            service
                .fd_fdstat_set_flags(a[0] as u32, a[1] as u16)
                .await
        }
        Syscall::FdFdstatSetRights => {
            service
                .fd_fdstat_set_rights(a[0] as u32, a[1], a[2])
                .await
        }
        Syscall::FdFilestatGet => service.fd_filestat_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::FdFilestatSetSize => service.fd_filestat_set_size(a[0] as u32, a[1]).await,
        Syscall::FdFilestatSetTimes => {
            service
                .fd_filestat_set_times(a[0] as u32, a[1], a[2], a[3] as u16)
                .await
        }
        Syscall::FdPread => {
            service
                .fd_pread(m, a[0] as u32, a[1] as u32, a[2] as u32, a[3], a[4] as u32)
                .await
        }
        Syscall::FdPrestatGet => service.fd_prestat_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::FdPrestatDirName => {
            service
                .fd_prestat_dir_name(m, a[0] as u32, a[1] as u32, a[2] as u32)
                .await
        }
        Syscall::FdPwrite => {
            service
                .fd_pwrite(m, a[0] as u32, a[1] as u32, a[2] as u32, a[3], a[4] as u32)
                .await
        }
        Syscall::FdRead => {
            service
                .fd_read(m, a[0] as u32, a[1] as u32, a[2] as u32, a[3] as u32)
                .await
        }
        Syscall::FdReaddir => {
            service
                .fd_readdir(m, a[0] as u32, a[1] as u32, a[2] as u32, a[3], a[4] as u32)
                .await
        }
        Syscall::FdRenumber => service.fd_renumber(a[0] as u32, a[1] as u32).await,
        Syscall::FdSeek => {
            service
                .fd_seek(m, a[0] as u32, a[1] as i64, a[2] as u8, a[3] as u32)
                .await
        }
        Syscall::FdSync => service.fd_sync(a[0] as u32).await,
        Syscall::FdTell => service.fd_tell(m, a[0] as u32, a[1] as u32).await,
        Syscall::FdWrite => {
            service
                .fd_write(m, a[0] as u32, a[1] as u32, a[2] as u32, a[3] as u32)
                .await
        }
        Syscall::PathCreateDirectory => {
            service
                .path_create_directory(m, a[0] as u32, a[1] as u32, a[2] as u32)
                .await
        }
        Syscall::PathFilestatGet => {
            service
                .path_filestat_get(
                    m,
                    a[0] as u32,
                    a[1] as u32,
                    a[2] as u32,
                    a[3] as u32,
                    a[4] as u32,
                )
                .await
        }
        Syscall::PathFilestatSetTimes => {
            service
                .path_filestat_set_times(
                    a[0] as u32,
                    a[1] as u32,
                    a[2] as u32,
                    a[3] as u32,
                    a[4],
                    a[5],
                    a[6] as u16,
                )
                .await
        }
        Syscall::PathLink => {
            service
                .path_link(
                    a[0] as u32,
                    a[1] as u32,
                    a[2] as u32,
                    a[3] as u32,
                    a[4] as u32,
                    a[5] as u32,
                    a[6] as u32,
                )
                .await
        }
        Syscall::PathOpen => {
            service
                .path_open(
                    m,
                    a[0] as u32,
                    a[1] as u32,
                    a[2] as u32,
                    a[3] as u32,
                    a[4] as u16,
                    a[5],
                    a[6],
                    a[7] as u16,
                    a[8] as u32,
                )
                .await
        }
        Syscall::PathReadlink => {
            service
                .path_readlink(
                    m,
                    a[0] as u32,
                    a[1] as u32,
                    a[2] as u32,
                    a[3] as u32,
                    a[4] as u32,
                    a[5] as u32,
                )
                .await
        }
        Syscall::PathRemoveDirectory => {
            service
                .path_remove_directory(m, a[0] as u32, a[1] as u32, a[2] as u32)
                .await
        }
        Syscall::PathRename => {
            service
                .path_rename(
                    m,
                    a[0] as u32,
                    a[1] as u32,
                    a[2] as u32,
                    a[3] as u32,
                    a[4] as u32,
                    a[5] as u32,
                )
                .await
        }
        Syscall::PathSymlink => {
            service
                .path_symlink(
                    a[0] as u32,
                    a[1] as u32,
                    a[2] as u32,
                    a[3] as u32,
                    a[4] as u32,
                )
                .await
        }
        Syscall::PathUnlinkFile => {
            service
                .path_unlink_file(m, a[0] as u32, a[1] as u32, a[2] as u32)
                .await
        }
        Syscall::PollOneoff => {
            service
                .poll_oneoff(m, a[0] as u32, a[1] as u32, a[2] as u32, a[3] as u32)
                .await
        }
        Syscall::ProcExit => service.proc_exit(a[0] as u32).await,
        Syscall::ProcRaise => service.proc_raise(a[0] as u8).await,
        Syscall::RandomGet => service.random_get(m, a[0] as u32, a[1] as u32).await,
        Syscall::SchedYield => service.sched_yield().await,
        Syscall::SockAccept => service.sock_accept(a[0] as u32, a[1] as u16).await,
        Syscall::SockRecv => {
            service
                .sock_recv(a[0] as u32, a[1] as u32, a[2] as u32, a[3] as u16)
                .await
        }
        Syscall::SockSend => {
            service
                .sock_send(a[0] as u32, a[1] as u32, a[2] as u32, a[3] as u16)
                .await
        }
        Syscall::SockShutdown => service.sock_shutdown(a[0] as u32, a[1] as u8).await,
        Syscall::ThreadSpawn => service.thread_spawn(m, a[0] as u32, a[1] as u32).await,
        Syscall::ThreadExit => service.thread_exit(a[0] as u32).await,
    }
}

/// Worker lifecycle, surfaced through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    /// The worker's linkage is up.
    Ready,
    /// The one-time memory/prestat handshake is in progress.
    Initializing,
    Running,
    Exited,
}

/// Host-side endpoint of one guest worker: the shared call buffer plus
/// the handler thread that services it.
pub struct GuestWorker {
    tid: u32,
    buffer: Arc<CallBuffer>,
    state_tx: watch::Sender<WorkerState>,
}

impl GuestWorker {
    /// Main-thread tid; spawned threads count up from 2.
    pub const MAIN_TID: u32 = 1;

    /// Start the handler loop for a worker on a dedicated thread. The
    /// loop blocks on the call buffer, runs each call on `runtime`, and
    /// stops when the process exits or the buffer closes.
    pub fn spawn(
        tid: u32,
        service: WasiService,
        memory: GuestMemory,
        runtime: tokio::runtime::Handle,
    ) -> GuestWorker {
        let buffer = CallBuffer::new();
        let (state_tx, _state_rx) = watch::channel(WorkerState::Created);
        let worker = GuestWorker {
            tid,
            buffer: buffer.clone(),
            state_tx: state_tx.clone(),
        };
        std::thread::Builder::new()
            .name(format!("wasi-host-{tid}"))
            .spawn(move || {
                while let Some((method, params)) = buffer.next_request() {
                    let errno = runtime.block_on(dispatch(&service, &memory, method, &params));
                    buffer.complete(errno.raw());
                    if service.is_exited() {
                        break;
                    }
                }
                service.log_summary();
                let _ = state_tx.send(WorkerState::Exited);
            })
            .expect("spawn wasi host handler thread");
        worker
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn buffer(&self) -> Arc<CallBuffer> {
        self.buffer.clone()
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn mark_ready(&self) {
        let _ = self.state_tx.send(WorkerState::Ready);
    }

    pub fn mark_initializing(&self) {
        let _ = self.state_tx.send(WorkerState::Initializing);
    }

    pub fn mark_running(&self) {
        let _ = self.state_tx.send(WorkerState::Running);
    }

    /// Stop the handler; a pending guest call unblocks with its reply
    /// already written.
    pub fn shut_down(&self) {
        self.buffer.close();
        let _ = self.state_tx.send(WorkerState::Exited);
    }
}
