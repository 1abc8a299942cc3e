//! Character-device drivers: the console sink, the pseudoterminal binding
//! and in-memory pipe stdio. All three report the same synthetic filestat
//! (a character device of size 101 stamped with the current time).

use crate::abi::{Fdflags, Filestat, Filetype, Rights};
use crate::driver::{DeviceDriver, DeviceId, DeviceKind, DeviceRegistry};
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use crate::pipe::PipeBuffer;
use crate::pty::{Pseudoterminal, TerminalMode};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn character_stat(device: DeviceId) -> Filestat {
    let now = now_ns();
    Filestat {
        dev: device.raw(),
        ino: 0,
        filetype: Filetype::CharacterDevice,
        nlink: 0,
        size: 101,
        atim: now,
        mtim: now,
        ctim: now,
    }
}

fn stdio_descriptor(device: DeviceId, fd: u32, inode: u64) -> WasiResult<Arc<FileDescriptor>> {
    if fd > 2 {
        return Err(Error::inval());
    }
    Ok(Arc::new(FileDescriptor::character_device(
        device,
        fd,
        Rights::character_device_base(),
        Fdflags::empty(),
        inode,
    )))
}

pub type ConsoleSink = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Write-only device forwarding output to a host callback; reads report
/// end-of-stream.
pub struct ConsoleDriver {
    id: DeviceId,
    uri: Url,
    sink: ConsoleSink,
}

impl ConsoleDriver {
    pub fn new(registry: &DeviceRegistry, sink: ConsoleSink) -> ConsoleDriver {
        let id = registry.allocate_id();
        let uri = Url::parse(&format!("console:/{}", id.raw())).expect("console uri");
        ConsoleDriver { id, uri, sink }
    }
}

#[async_trait]
impl DeviceDriver for ConsoleDriver {
    fn id(&self) -> DeviceId {
        self.id
    }
    fn uri(&self) -> &Url {
        &self.uri
    }
    fn kind(&self) -> DeviceKind {
        DeviceKind::Character
    }

    async fn fd_read(&self, _fd: &FileDescriptor, _len: u64) -> WasiResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn fd_write(&self, _fd: &FileDescriptor, bytes: &[u8]) -> WasiResult<u64> {
        (self.sink)(bytes);
        Ok(bytes.len() as u64)
    }

    async fn fd_bytes_available(&self, _fd: &FileDescriptor) -> WasiResult<u64> {
        Ok(0)
    }

    async fn fd_filestat_get(&self, _fd: &FileDescriptor) -> WasiResult<Filestat> {
        Ok(character_stat(self.id))
    }

    async fn create_stdio_fd(
        &self,
        fd: u32,
        _path: Option<&str>,
        _fdflags: Fdflags,
    ) -> WasiResult<Arc<FileDescriptor>> {
        stdio_descriptor(self.id, fd, fd as u64)
    }
}

/// Binds a [`Pseudoterminal`] as interactive stdio. Reads hand out
/// committed lines, carrying any tail a short read leaves behind.
pub struct TerminalDriver {
    id: DeviceId,
    uri: Url,
    terminal: Arc<Pseudoterminal>,
    readbuf: Mutex<Vec<u8>>,
}

impl TerminalDriver {
    pub fn new(registry: &DeviceRegistry, terminal: Arc<Pseudoterminal>) -> TerminalDriver {
        let id = registry.allocate_id();
        let uri = Url::parse(&format!("pty:/{}", id.raw())).expect("pty uri");
        TerminalDriver {
            id,
            uri,
            terminal,
            readbuf: Mutex::new(Vec::new()),
        }
    }

    pub fn terminal(&self) -> &Arc<Pseudoterminal> {
        &self.terminal
    }
}

#[async_trait]
impl DeviceDriver for TerminalDriver {
    fn id(&self) -> DeviceId {
        self.id
    }
    fn uri(&self) -> &Url {
        &self.uri
    }
    fn kind(&self) -> DeviceKind {
        DeviceKind::Character
    }

    async fn fd_read(&self, _fd: &FileDescriptor, len: u64) -> WasiResult<Vec<u8>> {
        let len = len as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        {
            let mut buf = self.readbuf.lock();
            if !buf.is_empty() {
                let take = std::cmp::min(len, buf.len());
                return Ok(buf.drain(..take).collect());
            }
        }
        self.terminal.set_mode(TerminalMode::Idle);
        let line = self.terminal.readline().await;
        self.terminal.set_mode(TerminalMode::Busy);
        let mut bytes = line.into_bytes();
        if bytes.len() > len {
            let rest = bytes.split_off(len);
            *self.readbuf.lock() = rest;
        }
        Ok(bytes)
    }

    async fn fd_write(&self, _fd: &FileDescriptor, bytes: &[u8]) -> WasiResult<u64> {
        self.terminal.write(bytes);
        Ok(bytes.len() as u64)
    }

    async fn fd_bytes_available(&self, _fd: &FileDescriptor) -> WasiResult<u64> {
        Ok(self.readbuf.lock().len() as u64 + self.terminal.bytes_pending())
    }

    async fn fd_filestat_get(&self, _fd: &FileDescriptor) -> WasiResult<Filestat> {
        Ok(character_stat(self.id))
    }

    async fn create_stdio_fd(
        &self,
        fd: u32,
        _path: Option<&str>,
        _fdflags: Fdflags,
    ) -> WasiResult<Arc<FileDescriptor>> {
        stdio_descriptor(self.id, fd, fd as u64)
    }
}

/// Pipe stdio: each stream the host asked for is backed by a bounded
/// in-memory buffer. The descriptor's inode selects the stream.
pub struct PipeDriver {
    id: DeviceId,
    uri: Url,
    stdin: Option<Arc<PipeBuffer>>,
    stdout: Option<Arc<PipeBuffer>>,
    stderr: Option<Arc<PipeBuffer>>,
}

impl PipeDriver {
    pub fn new(
        registry: &DeviceRegistry,
        stdin: Option<Arc<PipeBuffer>>,
        stdout: Option<Arc<PipeBuffer>>,
        stderr: Option<Arc<PipeBuffer>>,
    ) -> PipeDriver {
        let id = registry.allocate_id();
        let uri = Url::parse(&format!("pipe:/{}", id.raw())).expect("pipe uri");
        PipeDriver {
            id,
            uri,
            stdin,
            stdout,
            stderr,
        }
    }

    fn stream(&self, inode: u64) -> WasiResult<&Arc<PipeBuffer>> {
        let stream = match inode {
            0 => self.stdin.as_ref(),
            1 => self.stdout.as_ref(),
            2 => self.stderr.as_ref(),
            _ => None,
        };
        stream.ok_or_else(Error::badf)
    }
}

#[async_trait]
impl DeviceDriver for PipeDriver {
    fn id(&self) -> DeviceId {
        self.id
    }
    fn uri(&self) -> &Url {
        &self.uri
    }
    fn kind(&self) -> DeviceKind {
        DeviceKind::Character
    }

    async fn fd_read(&self, fd: &FileDescriptor, len: u64) -> WasiResult<Vec<u8>> {
        if fd.inode != 0 {
            return Err(Error::badf());
        }
        Ok(self.stream(0)?.read(len as usize).await)
    }

    async fn fd_write(&self, fd: &FileDescriptor, bytes: &[u8]) -> WasiResult<u64> {
        if fd.inode != 1 && fd.inode != 2 {
            return Err(Error::badf());
        }
        Ok(self.stream(fd.inode)?.write(bytes).await)
    }

    async fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        Ok(self.stream(fd.inode)?.available())
    }

    async fn fd_filestat_get(&self, _fd: &FileDescriptor) -> WasiResult<Filestat> {
        Ok(character_stat(self.id))
    }

    async fn create_stdio_fd(
        &self,
        fd: u32,
        _path: Option<&str>,
        _fdflags: Fdflags,
    ) -> WasiResult<Arc<FileDescriptor>> {
        // The stream must actually exist for the requested slot.
        self.stream(fd as u64)?;
        stdio_descriptor(self.id, fd, fd as u64)
    }

    async fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        if let Ok(stream) = self.stream(fd.inode) {
            if fd.inode == 1 || fd.inode == 2 {
                stream.close();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pty::PseudoterminalOptions;

    #[tokio::test]
    async fn console_writes_reach_the_sink() {
        let registry = DeviceRegistry::new();
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let console = ConsoleDriver::new(
            &registry,
            Box::new(move |bytes| sink_seen.lock().extend_from_slice(bytes)),
        );
        let fd = console
            .create_stdio_fd(1, None, Fdflags::empty())
            .await
            .unwrap();
        assert_eq!(console.fd_write(&fd, b"out").await.unwrap(), 3);
        assert_eq!(&*seen.lock(), b"out");
        assert_eq!(console.fd_read(&fd, 8).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn terminal_read_keeps_the_tail() {
        let registry = DeviceRegistry::new();
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        let driver = TerminalDriver::new(&registry, pty.clone());
        pty.input(b"abcdef\r");
        let fd = driver
            .create_stdio_fd(0, None, Fdflags::empty())
            .await
            .unwrap();
        assert_eq!(driver.fd_read(&fd, 4).await.unwrap(), b"abcd");
        assert_eq!(driver.fd_bytes_available(&fd).await.unwrap(), 3);
        assert_eq!(driver.fd_read(&fd, 8).await.unwrap(), b"ef\n");
    }

    #[tokio::test]
    async fn pipe_streams_are_selected_by_inode() {
        let registry = DeviceRegistry::new();
        let stdin = PipeBuffer::new();
        let stdout = PipeBuffer::new();
        let driver = PipeDriver::new(&registry, Some(stdin.clone()), Some(stdout.clone()), None);

        let in_fd = driver
            .create_stdio_fd(0, None, Fdflags::empty())
            .await
            .unwrap();
        let out_fd = driver
            .create_stdio_fd(1, None, Fdflags::empty())
            .await
            .unwrap();
        assert!(driver.create_stdio_fd(2, None, Fdflags::empty()).await.is_err());

        stdin.write(b"in").await;
        assert_eq!(driver.fd_read(&in_fd, 8).await.unwrap(), b"in");
        driver.fd_write(&out_fd, b"out").await.unwrap();
        assert_eq!(stdout.read(8).await, b"out");
        // Reading the write end is refused.
        assert!(driver.fd_read(&out_fd, 8).await.is_err());
    }

    #[tokio::test]
    async fn synthetic_stat_is_a_character_device() {
        let registry = DeviceRegistry::new();
        let console = ConsoleDriver::new(&registry, Box::new(|_| {}));
        let fd = console
            .create_stdio_fd(2, None, Fdflags::empty())
            .await
            .unwrap();
        let stat = console.fd_filestat_get(&fd).await.unwrap();
        assert_eq!(stat.filetype, Filetype::CharacterDevice);
        assert_eq!(stat.size, 101);
        assert!(stat.mtim > 0);
    }
}
