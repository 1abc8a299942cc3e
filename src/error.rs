use crate::abi::Errno;

/// The crate-wide error type. Drivers and the syscall service surface WASI
/// errors as `Error::Wasi`; everything else is a host-side condition that
/// the syscall boundary collapses to a wire errno (`inval` unless a call
/// documents a different default).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Wasi(Errno),
    #[error("integer out of range: {0}")]
    TryFromInt(#[from] std::num::TryFromIntError),
    #[error("invalid utf8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("guest memory access out of bounds: ptr {ptr:#x} len {len}")]
    MemoryFault { ptr: u32, len: u32 },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::Wasi(errno)
    }
}

impl Error {
    pub fn badf() -> Error {
        Error::Wasi(Errno::Badf)
    }
    pub fn noent() -> Error {
        Error::Wasi(Errno::Noent)
    }
    pub fn exist() -> Error {
        Error::Wasi(Errno::Exist)
    }
    pub fn inval() -> Error {
        Error::Wasi(Errno::Inval)
    }
    pub fn isdir() -> Error {
        Error::Wasi(Errno::Isdir)
    }
    pub fn notdir() -> Error {
        Error::Wasi(Errno::Notdir)
    }
    pub fn nosys() -> Error {
        Error::Wasi(Errno::Nosys)
    }
    pub fn notsup() -> Error {
        Error::Wasi(Errno::Notsup)
    }
    pub fn perm() -> Error {
        Error::Wasi(Errno::Perm)
    }

    /// The wire errno for this error. Host-side conditions become
    /// `default`; memory faults are always `fault`.
    pub fn into_errno(self, default: Errno) -> Errno {
        match self {
            Error::Wasi(errno) => errno,
            Error::TryFromInt(_) => Errno::Overflow,
            Error::Utf8(_) => Errno::Ilseq,
            Error::MemoryFault { .. } => Errno::Fault,
            Error::Unsupported(_) => default,
        }
    }
}

pub type WasiResult<T> = Result<T, Error>;
