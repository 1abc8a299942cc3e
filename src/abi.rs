//! WASI preview-1 ABI surface: error numbers, file types, rights and flag
//! bitsets, and the little-endian on-memory layouts the guest reads and
//! writes. Multi-byte fields are little-endian; encoders produce fixed-size
//! byte arrays that callers copy into guest memory.

use bitflags::bitflags;

pub type Fd = u32;
pub type Filesize = u64;
pub type Filedelta = i64;
pub type Timestamp = u64;
pub type Inode = u64;
pub type Device = u64;
pub type Dircookie = u64;
pub type Linkcount = u64;
pub type Userdata = u64;
pub type Exitcode = u32;

/// First readdir cookie. Cookies are the 1-based ordinal of the last
/// returned entry, so enumeration restarts from here.
pub const DIRCOOKIE_START: Dircookie = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Errno {
    Success = 0,
    TooBig = 1,
    Acces = 2,
    Addrinuse = 3,
    Addrnotavail = 4,
    Afnosupport = 5,
    Again = 6,
    Already = 7,
    Badf = 8,
    Badmsg = 9,
    Busy = 10,
    Canceled = 11,
    Child = 12,
    Connaborted = 13,
    Connrefused = 14,
    Connreset = 15,
    Deadlk = 16,
    Destaddrreq = 17,
    Dom = 18,
    Dquot = 19,
    Exist = 20,
    Fault = 21,
    Fbig = 22,
    Hostunreach = 23,
    Idrm = 24,
    Ilseq = 25,
    Inprogress = 26,
    Intr = 27,
    Inval = 28,
    Io = 29,
    Isconn = 30,
    Isdir = 31,
    Loop = 32,
    Mfile = 33,
    Mlink = 34,
    Msgsize = 35,
    Multihop = 36,
    Nametoolong = 37,
    Netdown = 38,
    Netreset = 39,
    Netunreach = 40,
    Nfile = 41,
    Nobufs = 42,
    Nodev = 43,
    Noent = 44,
    Noexec = 45,
    Nolck = 46,
    Nolink = 47,
    Nomem = 48,
    Nomsg = 49,
    Noprotoopt = 50,
    Nospc = 51,
    Nosys = 52,
    Notconn = 53,
    Notdir = 54,
    Notempty = 55,
    Notrecoverable = 56,
    Notsock = 57,
    Notsup = 58,
    Notty = 59,
    Nxio = 60,
    Overflow = 61,
    Ownerdead = 62,
    Perm = 63,
    Pipe = 64,
    Proto = 65,
    Protonosupport = 66,
    Prototype = 67,
    Range = 68,
    Rofs = 69,
    Spipe = 70,
    Srch = 71,
    Stale = 72,
    Timedout = 73,
    Txtbsy = 74,
    Xdev = 75,
    Notcapable = 76,
}

impl Errno {
    pub fn raw(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {} ({:?})", *self as u16, self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Filetype {
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Rights: u64 {
        const FD_DATASYNC = 1 << 0;
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_FDSTAT_SET_FLAGS = 1 << 3;
        const FD_SYNC = 1 << 4;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const FD_ADVISE = 1 << 7;
        const FD_ALLOCATE = 1 << 8;
        const PATH_CREATE_DIRECTORY = 1 << 9;
        const PATH_CREATE_FILE = 1 << 10;
        const PATH_LINK_SOURCE = 1 << 11;
        const PATH_LINK_TARGET = 1 << 12;
        const PATH_OPEN = 1 << 13;
        const FD_READDIR = 1 << 14;
        const PATH_READLINK = 1 << 15;
        const PATH_RENAME_SOURCE = 1 << 16;
        const PATH_RENAME_TARGET = 1 << 17;
        const PATH_FILESTAT_GET = 1 << 18;
        const PATH_FILESTAT_SET_SIZE = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET = 1 << 21;
        const FD_FILESTAT_SET_SIZE = 1 << 22;
        const FD_FILESTAT_SET_TIMES = 1 << 23;
        const PATH_SYMLINK = 1 << 24;
        const PATH_REMOVE_DIRECTORY = 1 << 25;
        const PATH_UNLINK_FILE = 1 << 26;
        const POLL_FD_READWRITE = 1 << 27;
        const SOCK_SHUTDOWN = 1 << 28;
        const SOCK_ACCEPT = 1 << 29;
    }
}

impl Rights {
    /// Rights a preopened or opened directory descriptor carries itself.
    pub fn directory_base() -> Rights {
        Rights::FD_FDSTAT_SET_FLAGS
            | Rights::FD_SYNC
            | Rights::FD_ADVISE
            | Rights::PATH_CREATE_DIRECTORY
            | Rights::PATH_CREATE_FILE
            | Rights::PATH_LINK_SOURCE
            | Rights::PATH_LINK_TARGET
            | Rights::PATH_OPEN
            | Rights::FD_READDIR
            | Rights::PATH_READLINK
            | Rights::PATH_RENAME_SOURCE
            | Rights::PATH_RENAME_TARGET
            | Rights::PATH_FILESTAT_GET
            | Rights::PATH_FILESTAT_SET_SIZE
            | Rights::PATH_FILESTAT_SET_TIMES
            | Rights::FD_FILESTAT_GET
            | Rights::FD_FILESTAT_SET_TIMES
            | Rights::PATH_REMOVE_DIRECTORY
            | Rights::PATH_UNLINK_FILE
            | Rights::POLL_FD_READWRITE
    }

    /// Rights a directory hands down to descriptors opened through it.
    pub fn directory_inheriting() -> Rights {
        Rights::directory_base() | Rights::file_base()
    }

    pub fn file_base() -> Rights {
        Rights::FD_DATASYNC
            | Rights::FD_READ
            | Rights::FD_SEEK
            | Rights::FD_FDSTAT_SET_FLAGS
            | Rights::FD_SYNC
            | Rights::FD_TELL
            | Rights::FD_WRITE
            | Rights::FD_ADVISE
            | Rights::FD_ALLOCATE
            | Rights::FD_FILESTAT_GET
            | Rights::FD_FILESTAT_SET_SIZE
            | Rights::FD_FILESTAT_SET_TIMES
            | Rights::POLL_FD_READWRITE
    }

    pub fn file_inheriting() -> Rights {
        Rights::empty()
    }

    pub fn character_device_base() -> Rights {
        Rights::FD_READ
            | Rights::FD_WRITE
            | Rights::FD_FDSTAT_SET_FLAGS
            | Rights::FD_FILESTAT_GET
            | Rights::POLL_FD_READWRITE
    }

    /// Strip the rights that are meaningless for a descriptor of the given
    /// filetype: directory-only rights for files, file-only for directories.
    pub fn narrow_for(self, filetype: Filetype) -> Rights {
        match filetype {
            Filetype::Directory => self & Rights::directory_base(),
            Filetype::RegularFile => self & Rights::file_base(),
            Filetype::CharacterDevice => self & Rights::character_device_base(),
            _ => self,
        }
    }

    /// Rights that imply writing through the descriptor.
    pub fn write_implying() -> Rights {
        Rights::FD_WRITE
            | Rights::FD_ALLOCATE
            | Rights::FD_DATASYNC
            | Rights::FD_FILESTAT_SET_SIZE
            | Rights::PATH_CREATE_DIRECTORY
            | Rights::PATH_CREATE_FILE
            | Rights::PATH_RENAME_SOURCE
            | Rights::PATH_RENAME_TARGET
            | Rights::PATH_FILESTAT_SET_SIZE
            | Rights::PATH_REMOVE_DIRECTORY
            | Rights::PATH_UNLINK_FILE
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Fdflags: u16 {
        const APPEND = 1 << 0;
        const DSYNC = 1 << 1;
        const NONBLOCK = 1 << 2;
        const RSYNC = 1 << 3;
        const SYNC = 1 << 4;
    }
}

impl Fdflags {
    /// Flags that only make sense on a writable descriptor. Opening a
    /// read-only filesystem with any of these set fails `perm`.
    pub fn write_implying() -> Fdflags {
        Fdflags::APPEND | Fdflags::DSYNC | Fdflags::RSYNC | Fdflags::SYNC
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Oflags: u16 {
        const CREAT = 1 << 0;
        const DIRECTORY = 1 << 1;
        const EXCL = 1 << 2;
        const TRUNC = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Lookupflags: u32 {
        const SYMLINK_FOLLOW = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Fstflags: u16 {
        const ATIM = 1 << 0;
        const ATIM_NOW = 1 << 1;
        const MTIM = 1 << 2;
        const MTIM_NOW = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Eventrwflags: u16 {
        const FD_READWRITE_HANGUP = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Subclockflags: u16 {
        const SUBSCRIPTION_CLOCK_ABSTIME = 1 << 0;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    pub fn from_raw(raw: u8) -> Option<Whence> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Clockid {
    Realtime = 0,
    Monotonic = 1,
    ProcessCputimeId = 2,
    ThreadCputimeId = 3,
}

impl Clockid {
    pub fn from_raw(raw: u32) -> Option<Clockid> {
        match raw {
            0 => Some(Clockid::Realtime),
            1 => Some(Clockid::Monotonic),
            2 => Some(Clockid::ProcessCputimeId),
            3 => Some(Clockid::ThreadCputimeId),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Eventtype {
    Clock = 0,
    FdRead = 1,
    FdWrite = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Preopentype {
    Dir = 0,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Advice {
    Normal = 0,
    Sequential = 1,
    Random = 2,
    Willneed = 3,
    Dontneed = 4,
    Noreuse = 5,
}

impl Advice {
    pub fn from_raw(raw: u8) -> Option<Advice> {
        match raw {
            0 => Some(Advice::Normal),
            1 => Some(Advice::Sequential),
            2 => Some(Advice::Random),
            3 => Some(Advice::Willneed),
            4 => Some(Advice::Dontneed),
            5 => Some(Advice::Noreuse),
            _ => None,
        }
    }
}

/// `filestat`: 64 bytes.
///
/// | offset | field    | type |
/// |--------|----------|------|
/// | 0      | dev      | u64  |
/// | 8      | ino      | u64  |
/// | 16     | filetype | u8   |
/// | 24     | nlink    | u64  |
/// | 32     | size     | u64  |
/// | 40     | atim     | u64  |
/// | 48     | mtim     | u64  |
/// | 56     | ctim     | u64  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filestat {
    pub dev: Device,
    pub ino: Inode,
    pub filetype: Filetype,
    pub nlink: Linkcount,
    pub size: Filesize,
    pub atim: Timestamp,
    pub mtim: Timestamp,
    pub ctim: Timestamp,
}

impl Filestat {
    pub const SIZE: u32 = 64;

    pub fn encode(&self) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[0..8].copy_from_slice(&self.dev.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ino.to_le_bytes());
        buf[16] = self.filetype as u8;
        buf[24..32].copy_from_slice(&self.nlink.to_le_bytes());
        buf[32..40].copy_from_slice(&self.size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.atim.to_le_bytes());
        buf[48..56].copy_from_slice(&self.mtim.to_le_bytes());
        buf[56..64].copy_from_slice(&self.ctim.to_le_bytes());
        buf
    }
}

/// `fdstat`: 24 bytes. filetype at 0, flags at 2, rights base at 8,
/// rights inheriting at 16.
#[derive(Debug, Clone, Copy)]
pub struct Fdstat {
    pub fs_filetype: Filetype,
    pub fs_flags: Fdflags,
    pub fs_rights_base: Rights,
    pub fs_rights_inheriting: Rights,
}

impl Fdstat {
    pub const SIZE: u32 = 24;

    pub fn encode(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0] = self.fs_filetype as u8;
        buf[2..4].copy_from_slice(&self.fs_flags.bits().to_le_bytes());
        buf[8..16].copy_from_slice(&self.fs_rights_base.bits().to_le_bytes());
        buf[16..24].copy_from_slice(&self.fs_rights_inheriting.bits().to_le_bytes());
        buf
    }
}

/// `prestat`: 8 bytes. Tag at 0 (`Preopentype::Dir`), name length at 4.
#[derive(Debug, Clone, Copy)]
pub struct PrestatDir {
    pub pr_name_len: u32,
}

impl PrestatDir {
    pub const SIZE: u32 = 8;

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = Preopentype::Dir as u8;
        buf[4..8].copy_from_slice(&self.pr_name_len.to_le_bytes());
        buf
    }
}

/// `dirent` header: 24 bytes, followed by the name bytes. d_next at 0,
/// d_ino at 8, d_namlen at 16, d_type at 20.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub d_next: Dircookie,
    pub d_ino: Inode,
    pub d_namlen: u32,
    pub d_type: Filetype,
}

impl Dirent {
    pub const SIZE: u32 = 24;

    pub fn encode(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&self.d_next.to_le_bytes());
        buf[8..16].copy_from_slice(&self.d_ino.to_le_bytes());
        buf[16..20].copy_from_slice(&self.d_namlen.to_le_bytes());
        buf[20] = self.d_type as u8;
        buf
    }
}

/// `iovec` / `ciovec`: 8 bytes, buffer pointer at 0 and length at 4.
#[derive(Debug, Clone, Copy)]
pub struct Iovec {
    pub buf: u32,
    pub buf_len: u32,
}

impl Iovec {
    pub const SIZE: u32 = 8;
}

/// A decoded `subscription` (48 bytes on the wire): userdata at 0, union
/// tag at 8, union content at 16.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub userdata: Userdata,
    pub u: SubscriptionU,
}

#[derive(Debug, Clone, Copy)]
pub enum SubscriptionU {
    Clock {
        id: Clockid,
        timeout: Timestamp,
        precision: Timestamp,
        flags: Subclockflags,
    },
    FdRead {
        fd: Fd,
    },
    FdWrite {
        fd: Fd,
    },
}

impl Subscription {
    pub const SIZE: u32 = 48;

    pub fn decode(buf: &[u8]) -> Option<Subscription> {
        if buf.len() < Self::SIZE as usize {
            return None;
        }
        let userdata = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let u = match buf[8] {
            0 => {
                let id = Clockid::from_raw(u32::from_le_bytes(buf[16..20].try_into().unwrap()))?;
                let timeout = u64::from_le_bytes(buf[24..32].try_into().unwrap());
                let precision = u64::from_le_bytes(buf[32..40].try_into().unwrap());
                let flags = Subclockflags::from_bits_truncate(u16::from_le_bytes(
                    buf[40..42].try_into().unwrap(),
                ));
                SubscriptionU::Clock {
                    id,
                    timeout,
                    precision,
                    flags,
                }
            }
            1 => SubscriptionU::FdRead {
                fd: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            },
            2 => SubscriptionU::FdWrite {
                fd: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            },
            _ => return None,
        };
        Some(Subscription { userdata, u })
    }
}

/// `event`: 32 bytes. userdata at 0, errno at 8, type at 10, fd_readwrite
/// payload (nbytes at 16, flags at 24) for read/write events.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub userdata: Userdata,
    pub error: Errno,
    pub type_: Eventtype,
    pub fd_readwrite: Option<EventFdReadwrite>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventFdReadwrite {
    pub nbytes: Filesize,
    pub flags: Eventrwflags,
}

impl Event {
    pub const SIZE: u32 = 32;

    pub fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.userdata.to_le_bytes());
        buf[8..10].copy_from_slice(&self.error.raw().to_le_bytes());
        buf[10] = self.type_ as u8;
        if let Some(rw) = self.fd_readwrite {
            buf[16..24].copy_from_slice(&rw.nbytes.to_le_bytes());
            buf[24..26].copy_from_slice(&rw.flags.bits().to_le_bytes());
        }
        buf
    }
}
