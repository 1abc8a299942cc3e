//! Host-facing assembly: mount descriptors, stdio redirection, and the
//! process object the embedder drives. The WASM engine and the worker
//! spawner stay outside; this module wires the fd table, devices and
//! per-thread services together and hands out bridge endpoints.

use crate::abi::{Fdflags, Filetype};
use crate::bridge::GuestWorker;
use crate::chardev::{ConsoleDriver, PipeDriver, TerminalDriver};
use crate::clocks::Clocks;
use crate::driver::{DeviceDriver, DeviceId, DeviceRegistry, ReadOnly};
use crate::editorfs::{EditorFileSystem, EditorFsDriver};
use crate::error::{Error, WasiResult};
use crate::fd::FileDescriptor;
use crate::memfs::{MemoryFileSystem, MemoryFsDriver};
use crate::memory::GuestMemory;
use crate::pipe::PipeBuffer;
use crate::pty::Pseudoterminal;
use crate::rootfs::{Find, VirtualRootDriver};
use crate::service::{default_rng, ExitSignal, Preopen, ProcessShared, WasiService, WorkerHost};
use crate::table::FdTable;
use anyhow::{bail, Context};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Exit code reported when the host terminates the process.
pub const TERMINATED_EXIT_CODE: u32 = 130;

/// Where one stdio stream goes.
pub enum StdioDescriptor {
    /// Forward output to the host console channel; reads see EOF.
    Console,
    /// Interactive cooked-mode terminal.
    Terminal(Arc<Pseudoterminal>),
    /// In-memory pipe exposed to the host.
    Pipe,
    /// A file inside the mounted namespace, by absolute virtual path.
    File(String),
}

/// A back-end to graft into the process's namespace.
pub enum MountDescriptor {
    /// An editor workspace folder. Mounted at `/workspace` when it is the
    /// only workspace folder, else at `/workspaces/<name>`.
    WorkspaceFolder {
        name: String,
        uri: Url,
        fs: Arc<dyn EditorFileSystem>,
    },
    /// A read-only extension bundle enumerated through its sidecar
    /// manifest (`<basename>.dir.json` adjacent to the bundle).
    ExtensionLocation {
        location: String,
        uri: Url,
        fs: Arc<dyn EditorFileSystem>,
        mount_point: String,
    },
    /// An editor filesystem mounted verbatim.
    EditorFs {
        uri: Url,
        fs: Arc<dyn EditorFileSystem>,
        mount_point: String,
        readonly: bool,
    },
    /// An in-memory filesystem instance.
    MemoryFs {
        fs: Arc<MemoryFileSystem>,
        mount_point: String,
        readonly: bool,
    },
}

#[derive(Debug, Deserialize)]
struct DirectoryManifest {
    #[serde(default)]
    directories: Vec<String>,
    #[serde(default)]
    files: Vec<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    path: String,
    #[serde(default)]
    size: u64,
}

/// Resolve mount descriptors into `(mount point, driver)` pairs, in
/// declaration order.
async fn resolve_mounts(
    registry: &Arc<DeviceRegistry>,
    descriptors: Vec<MountDescriptor>,
) -> anyhow::Result<Vec<(String, Arc<dyn DeviceDriver>)>> {
    let workspace_folders = descriptors
        .iter()
        .filter(|d| matches!(d, MountDescriptor::WorkspaceFolder { .. }))
        .count();

    let mut mounts: Vec<(String, Arc<dyn DeviceDriver>)> = Vec::new();
    for descriptor in descriptors {
        let (point, driver): (String, Arc<dyn DeviceDriver>) = match descriptor {
            MountDescriptor::WorkspaceFolder { name, uri, fs } => {
                let point = if workspace_folders == 1 {
                    "/workspace".to_string()
                } else {
                    format!("/workspaces/{name}")
                };
                (point, Arc::new(EditorFsDriver::new(registry, uri, fs)))
            }
            MountDescriptor::ExtensionLocation {
                location,
                uri,
                fs,
                mount_point,
            } => {
                let driver = extension_location_driver(registry, &location, uri, fs)
                    .await
                    .with_context(|| format!("loading extension bundle at {location}"))?;
                (mount_point, driver)
            }
            MountDescriptor::EditorFs {
                uri,
                fs,
                mount_point,
                readonly,
            } => {
                let inner = EditorFsDriver::new(registry, uri, fs);
                let driver: Arc<dyn DeviceDriver> = if readonly {
                    Arc::new(ReadOnly::new(inner))
                } else {
                    Arc::new(inner)
                };
                (mount_point, driver)
            }
            MountDescriptor::MemoryFs {
                fs,
                mount_point,
                readonly,
            } => {
                let inner = MemoryFsDriver::new(registry, &fs);
                let driver: Arc<dyn DeviceDriver> = if readonly {
                    Arc::new(ReadOnly::new(inner))
                } else {
                    Arc::new(inner)
                };
                (mount_point, driver)
            }
        };
        let normalized = if point == "/" {
            point
        } else {
            format!("/{}", point.trim_matches('/'))
        };
        mounts.push((normalized, registry.register(driver)));
    }

    if mounts.iter().any(|(p, _)| p == "/") && mounts.len() > 1 {
        bail!("a mount at \"/\" cannot be combined with other mounts");
    }
    Ok(mounts)
}

/// Build the read-only driver for an extension bundle: a memory tree
/// whose files materialise through the editor capability on first read.
async fn extension_location_driver(
    registry: &Arc<DeviceRegistry>,
    location: &str,
    uri: Url,
    fs: Arc<dyn EditorFileSystem>,
) -> anyhow::Result<Arc<dyn DeviceDriver>> {
    let manifest_path = format!("{}.dir.json", location.trim_end_matches('/'));
    let manifest_bytes = fs
        .read_file(&manifest_path)
        .await
        .map_err(|err| anyhow::anyhow!("reading {manifest_path}: {err}"))?;
    let manifest: DirectoryManifest =
        serde_json::from_slice(&manifest_bytes).context("parsing bundle manifest")?;

    let tree = MemoryFileSystem::new();
    for directory in &manifest.directories {
        // Intermediates appear implicitly; ignore duplicates.
        let _ = tree.create_directory(directory);
    }
    for file in &manifest.files {
        let backend_path = format!("{}/{}", location.trim_end_matches('/'), file.path);
        let fs = fs.clone();
        tree.create_lazy_file(
            &file.path,
            file.size,
            Box::new(move || {
                let fs = fs.clone();
                let backend_path = backend_path.clone();
                Box::pin(async move {
                    fs.read_file(&backend_path).await.map_err(Error::from)
                })
            }),
        )
        .map_err(|err| anyhow::anyhow!("manifest entry {}: {err}", file.path))?;
    }
    // The bundle keeps its editor locator so path mapping round-trips.
    Ok(Arc::new(ReadOnly::new(MemoryFsDriver::with_uri(
        registry, &tree, uri,
    ))))
}

/// Pipes and channels the host reads or writes when stdio is redirected.
pub struct StdioStreams {
    pub stdin: Option<Arc<PipeBuffer>>,
    pub stdout: Option<Arc<PipeBuffer>>,
    pub stderr: Option<Arc<PipeBuffer>>,
    pub console: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

pub struct WasiProcessBuilder {
    name: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    mounts: Vec<MountDescriptor>,
    stdin: StdioDescriptor,
    stdout: StdioDescriptor,
    stderr: StdioDescriptor,
    trace: bool,
    memory: Option<GuestMemory>,
}

impl WasiProcessBuilder {
    pub fn new(name: impl Into<String>) -> WasiProcessBuilder {
        WasiProcessBuilder {
            name: name.into(),
            args: Vec::new(),
            env: Vec::new(),
            mounts: Vec::new(),
            stdin: StdioDescriptor::Console,
            stdout: StdioDescriptor::Console,
            stderr: StdioDescriptor::Console,
            trace: false,
            memory: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn mount(mut self, descriptor: MountDescriptor) -> Self {
        self.mounts.push(descriptor);
        self
    }

    pub fn stdin(mut self, descriptor: StdioDescriptor) -> Self {
        self.stdin = descriptor;
        self
    }

    pub fn stdout(mut self, descriptor: StdioDescriptor) -> Self {
        self.stdout = descriptor;
        self
    }

    pub fn stderr(mut self, descriptor: StdioDescriptor) -> Self {
        self.stderr = descriptor;
        self
    }

    /// Use one pseudoterminal for all three streams.
    pub fn terminal(self, terminal: Arc<Pseudoterminal>) -> Self {
        self.stdin(StdioDescriptor::Terminal(terminal.clone()))
            .stdout(StdioDescriptor::Terminal(terminal.clone()))
            .stderr(StdioDescriptor::Terminal(terminal))
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn memory(mut self, memory: GuestMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub async fn build(self) -> anyhow::Result<WasiProcess> {
        let registry = Arc::new(DeviceRegistry::new());
        let table = Arc::new(FdTable::new());
        let mounts = resolve_mounts(&registry, self.mounts).await?;

        // One namespace: a lone mount at "/" binds its driver directly,
        // anything else goes through the virtual root.
        let single_root = mounts.len() == 1 && mounts[0].0 == "/";
        let vroot = if single_root || mounts.is_empty() {
            None
        } else {
            let vroot = Arc::new(VirtualRootDriver::new(&registry));
            for (point, driver) in &mounts {
                vroot
                    .add_mount(point, driver.clone())
                    .with_context(|| format!("mounting {point}"))?;
            }
            registry.register(vroot.clone());
            Some(vroot)
        };

        // Stdio devices for fds 0..=2.
        let mut console_channel = None;
        let mut console_driver: Option<Arc<dyn DeviceDriver>> = None;
        let mut terminal_drivers: Vec<(Arc<Pseudoterminal>, Arc<dyn DeviceDriver>)> = Vec::new();
        let mut pipes: [Option<Arc<PipeBuffer>>; 3] = [None, None, None];

        let slots = [(0u32, &self.stdin), (1u32, &self.stdout), (2u32, &self.stderr)];
        for (fd, descriptor) in &slots {
            if matches!(descriptor, StdioDescriptor::Pipe) {
                pipes[*fd as usize] = Some(PipeBuffer::new());
            }
        }
        let pipe_driver: Option<Arc<dyn DeviceDriver>> = if pipes.iter().any(Option::is_some) {
            Some(registry.register(Arc::new(PipeDriver::new(
                &registry,
                pipes[0].clone(),
                pipes[1].clone(),
                pipes[2].clone(),
            ))))
        } else {
            None
        };

        for (fd, descriptor) in slots {
            let allocated = table.next_fd()?;
            debug_assert_eq!(allocated, fd);
            let stdio_fd = match descriptor {
                StdioDescriptor::Console => {
                    let driver = match &console_driver {
                        Some(driver) => driver.clone(),
                        None => {
                            let (tx, rx) = mpsc::unbounded_channel();
                            console_channel = Some(rx);
                            let driver = registry.register(Arc::new(ConsoleDriver::new(
                                &registry,
                                Box::new(move |bytes| {
                                    let _ = tx.send(bytes.to_vec());
                                }),
                            )));
                            console_driver = Some(driver.clone());
                            driver
                        }
                    };
                    driver.create_stdio_fd(fd, None, Fdflags::empty()).await
                }
                StdioDescriptor::Terminal(terminal) => {
                    let driver = match terminal_drivers
                        .iter()
                        .find(|(t, _)| Arc::ptr_eq(t, terminal))
                    {
                        Some((_, driver)) => driver.clone(),
                        None => {
                            let driver = registry.register(Arc::new(TerminalDriver::new(
                                &registry,
                                terminal.clone(),
                            )));
                            terminal_drivers.push((terminal.clone(), driver.clone()));
                            driver
                        }
                    };
                    driver.create_stdio_fd(fd, None, Fdflags::empty()).await
                }
                StdioDescriptor::Pipe => {
                    let driver = pipe_driver.clone().expect("pipe driver exists");
                    driver.create_stdio_fd(fd, None, Fdflags::empty()).await
                }
                StdioDescriptor::File(path) => {
                    let (driver, rest) = match &vroot {
                        Some(vroot) => {
                            match vroot.find(1, path.trim_start_matches('/')).map_err(|err| {
                                anyhow::anyhow!("stdio path {path}: {err}")
                            })? {
                                Find::Mount { driver, rest } => (driver, rest),
                                Find::Virtual(_) => {
                                    bail!("stdio path {path} names a virtual directory")
                                }
                            }
                        }
                        None => {
                            let (_, driver) = mounts
                                .first()
                                .with_context(|| format!("no mount for stdio path {path}"))?;
                            (driver.clone(), path.trim_start_matches('/').to_string())
                        }
                    };
                    let fdflags = if fd == 0 {
                        Fdflags::empty()
                    } else {
                        Fdflags::APPEND
                    };
                    driver.create_stdio_fd(fd, Some(&rest), fdflags).await
                }
            }
            .map_err(|err| anyhow::anyhow!("creating stdio fd {fd}: {err}"))?;
            table.add(stdio_fd);
        }

        // Preopens, in mount declaration order.
        let mut preopens = Vec::new();
        for (point, driver) in &mounts {
            let fd = table.next_fd()?;
            let root = driver
                .prestat_fd(fd)
                .await
                .map_err(|err| anyhow::anyhow!("preopening {point}: {err}"))?;
            table.add(root.clone());
            table.set_root(driver.id(), root);
            preopens.push(Preopen {
                fd,
                point: point.clone(),
                device: driver.id(),
            });
        }

        let (exit, exit_rx) = ExitSignal::new();
        let shared = Arc::new(ProcessShared {
            program_name: self.name.clone(),
            args: self.args,
            env: self.env,
            table,
            registry,
            preopens,
            vroot,
            clocks: Clocks::new(),
            exit,
            random: Mutex::new(default_rng()),
            prestat_cursor: Mutex::new(0),
            next_tid: AtomicU32::new(GuestWorker::MAIN_TID + 1),
            worker_host: Mutex::new(None),
            trace: self.trace,
        });

        Ok(WasiProcess {
            name: self.name,
            memory: self.memory.unwrap_or_else(|| GuestMemory::new(1 << 20)),
            shared,
            exit_rx: Mutex::new(Some(exit_rx)),
            workers: Mutex::new(Vec::new()),
            streams: Mutex::new(Some(StdioStreams {
                stdin: pipes[0].clone(),
                stdout: pipes[1].clone(),
                stderr: pipes[2].clone(),
                console: console_channel,
            })),
        })
    }
}

pub struct WasiProcess {
    name: String,
    memory: GuestMemory,
    shared: Arc<ProcessShared>,
    exit_rx: Mutex<Option<oneshot::Receiver<u32>>>,
    workers: Mutex<Vec<GuestWorker>>,
    streams: Mutex<Option<StdioStreams>>,
}

impl std::fmt::Debug for WasiProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasiProcess")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl WasiProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// The syscall service for the main thread; embedders that link the
    /// engine in-process can call it directly, bypassing the bridge.
    pub fn service(&self) -> WasiService {
        WasiService::new(self.shared.clone())
    }

    /// Take the redirected stdio endpoints (pipes, console channel).
    pub fn take_streams(&self) -> Option<StdioStreams> {
        self.streams.lock().take()
    }

    /// Register the collaborator that actually starts guest workers for
    /// `thread_spawn`.
    pub fn set_worker_host(&self, host: Arc<dyn WorkerHost>) {
        *self.shared.worker_host.lock() = Some(host);
    }

    /// Start the host-side handler for one guest worker and return its
    /// bridge endpoint. `tid` 1 is the main thread.
    pub fn start_worker(&self, tid: u32, runtime: tokio::runtime::Handle) -> Arc<crate::bridge::CallBuffer> {
        let worker = GuestWorker::spawn(tid, self.service(), self.memory.clone(), runtime);
        let buffer = worker.buffer();
        worker.mark_ready();
        self.workers.lock().push(worker);
        buffer
    }

    /// Wait for the guest to exit and return its exit code.
    pub async fn run(&self) -> u32 {
        let receiver = self.exit_rx.lock().take();
        let code = match receiver {
            Some(receiver) => receiver.await.unwrap_or(TERMINATED_EXIT_CODE),
            None => TERMINATED_EXIT_CODE,
        };
        self.shut_down_workers();
        code
    }

    /// Tear the process down; `run` resolves with the terminated code.
    pub fn terminate(&self) {
        self.shared.exit.exit(TERMINATED_EXIT_CODE);
        self.shut_down_workers();
    }

    fn shut_down_workers(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.shut_down();
        }
    }
}

enum RootTarget {
    Composite(Arc<VirtualRootDriver>),
    Single(Arc<dyn DeviceDriver>),
}

/// Path mapping over a set of mounts without a running process:
/// virtual path → native locator and back, plus stat.
pub struct RootFileSystem {
    mounts: Vec<(String, Arc<dyn DeviceDriver>)>,
    target: RootTarget,
    roots: HashMap<DeviceId, Arc<FileDescriptor>>,
}

impl RootFileSystem {
    pub async fn new(descriptors: Vec<MountDescriptor>) -> anyhow::Result<RootFileSystem> {
        let registry = Arc::new(DeviceRegistry::new());
        let mounts = resolve_mounts(&registry, descriptors).await?;
        if mounts.is_empty() {
            bail!("a root filesystem needs at least one mount");
        }
        let target = if mounts.len() == 1 && mounts[0].0 == "/" {
            RootTarget::Single(mounts[0].1.clone())
        } else {
            let vroot = Arc::new(VirtualRootDriver::new(&registry));
            for (point, driver) in &mounts {
                vroot
                    .add_mount(point, driver.clone())
                    .with_context(|| format!("mounting {point}"))?;
            }
            registry.register(vroot.clone());
            RootTarget::Composite(vroot)
        };
        let mut roots = HashMap::new();
        for (_, driver) in &mounts {
            let root = driver
                .prestat_fd(u32::MAX)
                .await
                .map_err(|err| anyhow::anyhow!("opening mount root: {err}"))?;
            roots.insert(driver.id(), root);
        }
        Ok(RootFileSystem {
            mounts,
            target,
            roots,
        })
    }

    /// Resolve a virtual path to the mounted driver owning it; `None` for
    /// paths ending inside the purely virtual tree.
    fn resolve_mount(&self, path: &str) -> WasiResult<Option<(Arc<dyn DeviceDriver>, String)>> {
        let rel = path.trim_start_matches('/');
        match &self.target {
            RootTarget::Single(driver) => Ok(Some((driver.clone(), rel.to_string()))),
            RootTarget::Composite(vroot) => match vroot.find(1, rel)? {
                Find::Mount { driver, rest } => Ok(Some((driver, rest))),
                Find::Virtual(_) => Ok(None),
            },
        }
    }

    /// The back-end locator a virtual path maps to, if it lands inside a
    /// mount.
    pub fn to_native(&self, path: &str) -> Option<Url> {
        let (driver, rest) = self.resolve_mount(path).ok()??;
        let segments: Vec<&str> = rest
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        driver.join_path(&segments).ok()
    }

    /// The virtual path a back-end locator maps to, if its device is
    /// mounted.
    pub fn to_wasi(&self, locator: &Url) -> Option<String> {
        for (_, driver) in &self.mounts {
            let base = driver.uri().as_str().trim_end_matches('/');
            let Some(remainder) = locator.as_str().strip_prefix(base) else {
                continue;
            };
            if !remainder.is_empty() && !remainder.starts_with('/') {
                continue; // prefix collision with a longer device uri
            }
            let rel = remainder.trim_start_matches('/');
            return match &self.target {
                RootTarget::Single(_) => {
                    if rel.is_empty() {
                        Some("/".to_string())
                    } else {
                        Some(format!("/{rel}"))
                    }
                }
                RootTarget::Composite(vroot) => vroot.make_virtual_path(driver.id(), rel),
            };
        }
        None
    }

    /// Filetype of the node at a virtual path.
    pub async fn stat(&self, path: &str) -> WasiResult<Filetype> {
        match (self.resolve_mount(path)?, &self.target) {
            (Some((driver, rest)), _) => {
                let parent = self
                    .roots
                    .get(&driver.id())
                    .cloned()
                    .ok_or_else(Error::badf)?;
                let stat = driver
                    .path_filestat_get(&parent, crate::abi::Lookupflags::empty(), &rest)
                    .await?;
                Ok(stat.filetype)
            }
            // The walk ended inside the virtual tree.
            (None, RootTarget::Composite(vroot)) => {
                let parent = vroot.root_descriptor();
                let stat = vroot
                    .path_filestat_get(
                        &parent,
                        crate::abi::Lookupflags::empty(),
                        path.trim_start_matches('/'),
                    )
                    .await?;
                Ok(stat.filetype)
            }
            (None, RootTarget::Single(_)) => Err(Error::noent()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::abi::Rights;
    use crate::editorfs::test::MockEditorFs;

    fn mem_mount(point: &str) -> (Arc<MemoryFileSystem>, MountDescriptor) {
        let fs = MemoryFileSystem::new();
        let descriptor = MountDescriptor::MemoryFs {
            fs: fs.clone(),
            mount_point: point.to_string(),
            readonly: false,
        };
        (fs, descriptor)
    }

    #[tokio::test]
    async fn single_workspace_folder_lands_at_workspace() {
        let editor = MockEditorFs::new();
        let process = WasiProcessBuilder::new("proc")
            .mount(MountDescriptor::WorkspaceFolder {
                name: "proj".to_string(),
                uri: Url::parse("editor:/ws/proj").unwrap(),
                fs: editor,
            })
            .build()
            .await
            .unwrap();
        assert_eq!(process.shared.preopens.len(), 1);
        assert_eq!(process.shared.preopens[0].point, "/workspace");
        assert_eq!(process.shared.preopens[0].fd, 3);
    }

    #[tokio::test]
    async fn multiple_workspace_folders_land_under_workspaces() {
        let process = WasiProcessBuilder::new("proc")
            .mount(MountDescriptor::WorkspaceFolder {
                name: "one".to_string(),
                uri: Url::parse("editor:/ws/one").unwrap(),
                fs: MockEditorFs::new(),
            })
            .mount(MountDescriptor::WorkspaceFolder {
                name: "two".to_string(),
                uri: Url::parse("editor:/ws/two").unwrap(),
                fs: MockEditorFs::new(),
            })
            .build()
            .await
            .unwrap();
        let points: Vec<&str> = process
            .shared
            .preopens
            .iter()
            .map(|p| p.point.as_str())
            .collect();
        assert_eq!(points, vec!["/workspaces/one", "/workspaces/two"]);
    }

    #[tokio::test]
    async fn root_mount_with_siblings_is_rejected() {
        let (_, a) = mem_mount("/");
        let (_, b) = mem_mount("/tmp");
        let err = WasiProcessBuilder::new("proc")
            .mount(a)
            .mount(b)
            .build()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot be combined"));
    }

    #[tokio::test]
    async fn extension_location_serves_manifest_entries_read_only() {
        let editor = MockEditorFs::new();
        editor.add_file(
            "/ext/bundle.dir.json",
            br#"{"directories":["lib"],"files":[{"path":"lib/data.txt","size":9}]}"#,
        );
        editor.add_file("/ext/bundle/lib/data.txt", b"from-disk");

        let process = WasiProcessBuilder::new("proc")
            .mount(MountDescriptor::ExtensionLocation {
                location: "/ext/bundle".to_string(),
                uri: Url::parse("editor:/ext/bundle").unwrap(),
                fs: editor,
                mount_point: "/ext".to_string(),
            })
            .build()
            .await
            .unwrap();

        let service = process.service();
        let memory = process.memory().clone();
        service.fd_prestat_get(&memory, 3, 0).await;
        service.fd_prestat_get(&memory, 4, 0).await;

        memory.write_bytes(600, b"lib/data.txt").unwrap();
        assert_eq!(
            service
                .path_open(
                    &memory,
                    3,
                    0,
                    600,
                    12,
                    0,
                    Rights::all().bits(),
                    0,
                    0,
                    700,
                )
                .await,
            crate::abi::Errno::Success
        );
        let fd = memory.read_u32(700).unwrap();
        memory.write_u32(800, 900).unwrap();
        memory.write_u32(804, 16).unwrap();
        assert_eq!(
            service.fd_read(&memory, fd, 800, 1, 808).await,
            crate::abi::Errno::Success
        );
        assert_eq!(memory.read_u32(808).unwrap(), 9);
        assert_eq!(memory.read_bytes(900, 9).unwrap(), b"from-disk");

        // Writes are refused by the read-only overlay.
        memory.write_bytes(600, b"lib/new.txt").unwrap();
        assert_eq!(
            service
                .path_open(
                    &memory,
                    3,
                    0,
                    600,
                    11,
                    crate::abi::Oflags::CREAT.bits(),
                    Rights::all().bits(),
                    0,
                    0,
                    700,
                )
                .await,
            crate::abi::Errno::Perm
        );
    }

    #[tokio::test]
    async fn piped_stdio_round_trips() {
        let (_, mount) = mem_mount("/tmp");
        let process = WasiProcessBuilder::new("proc")
            .mount(mount)
            .stdin(StdioDescriptor::Pipe)
            .stdout(StdioDescriptor::Pipe)
            .build()
            .await
            .unwrap();
        let streams = process.take_streams().unwrap();
        let stdin = streams.stdin.unwrap();
        let stdout = streams.stdout.unwrap();

        let service = process.service();
        let memory = process.memory().clone();

        stdin.write(b"ping").await;
        memory.write_u32(800, 900).unwrap();
        memory.write_u32(804, 8).unwrap();
        assert_eq!(
            service.fd_read(&memory, 0, 800, 1, 808).await,
            crate::abi::Errno::Success
        );
        assert_eq!(memory.read_u32(808).unwrap(), 4);
        assert_eq!(memory.read_bytes(900, 4).unwrap(), b"ping");

        memory.write_bytes(900, b"pong").unwrap();
        memory.write_u32(800, 900).unwrap();
        memory.write_u32(804, 4).unwrap();
        assert_eq!(
            service.fd_write(&memory, 1, 800, 1, 808).await,
            crate::abi::Errno::Success
        );
        assert_eq!(stdout.read(8).await, b"pong");
    }

    #[tokio::test]
    async fn terminate_resolves_run() {
        let (_, mount) = mem_mount("/tmp");
        let process = Arc::new(
            WasiProcessBuilder::new("proc")
                .mount(mount)
                .build()
                .await
                .unwrap(),
        );
        let waiter = {
            let process = process.clone();
            tokio::spawn(async move { process.run().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        process.terminate();
        assert_eq!(waiter.await.unwrap(), TERMINATED_EXIT_CODE);
    }

    #[tokio::test]
    async fn root_filesystem_round_trips_paths() {
        let fs = MemoryFileSystem::new();
        fs.create_file("/a/b", b"x".to_vec()).unwrap();
        let root = RootFileSystem::new(vec![MountDescriptor::MemoryFs {
            fs: fs.clone(),
            mount_point: "/workspace".to_string(),
            readonly: false,
        }])
        .await
        .unwrap();

        let native = root.to_native("/workspace/a/b").unwrap();
        assert!(native.as_str().ends_with("/a/b"));
        assert_eq!(root.to_wasi(&native).unwrap(), "/workspace/a/b");

        assert_eq!(
            root.stat("/workspace/a/b").await.unwrap(),
            Filetype::RegularFile
        );
        assert_eq!(root.stat("/workspace/a").await.unwrap(), Filetype::Directory);
    }
}
