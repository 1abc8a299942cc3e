//! A WASI preview-1 host runtime for programs sandboxed inside an editor.
//! Guest syscalls are serviced against a virtualised filesystem composed
//! of mounted back-ends (editor filesystems, read-only extension bundles,
//! in-memory trees) and virtualised character devices (console,
//! pseudoterminals, pipes). Guest threads block on a shared-buffer call
//! bridge while the host performs the asynchronous work.

pub mod abi;
pub mod bridge;
pub mod chardev;
pub mod clocks;
pub mod driver;
pub mod editorfs;
mod error;
pub mod fd;
pub mod memfs;
pub mod memory;
pub mod pipe;
pub mod process;
pub mod pty;
pub mod rootfs;
pub mod service;
pub mod table;

pub use abi::{Errno, Filetype, Rights};
pub use bridge::{CallBuffer, GuestWorker, Syscall, WorkerState};
pub use driver::{DeviceDriver, DeviceId, DeviceKind, DeviceRegistry, ReadOnly};
pub use editorfs::{EditorError, EditorFileSystem, EditorFileType, EditorStat};
pub use error::{Error, WasiResult};
pub use memfs::MemoryFileSystem;
pub use memory::GuestMemory;
pub use pipe::PipeBuffer;
pub use process::{
    MountDescriptor, RootFileSystem, StdioDescriptor, StdioStreams, WasiProcess,
    WasiProcessBuilder,
};
pub use pty::{Pseudoterminal, PseudoterminalOptions, TerminalEvent, TerminalMode};
pub use service::{WasiService, WorkerHost};
pub use table::FdTable;
