//! A byte-addressed, little-endian view of the guest's linear memory. All
//! syscall argument and result traffic goes through this view; out-of-range
//! accesses surface as `fault` rather than panicking.

use crate::abi::Iovec;
use crate::error::{Error, WasiResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared handle onto a guest linear memory. Clones view the same bytes.
///
/// Mutation happens only on the host execution context, which serialises
/// syscall handling per process, so a reader/writer lock is sufficient.
#[derive(Clone)]
pub struct GuestMemory {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl GuestMemory {
    pub fn new(size: usize) -> GuestMemory {
        GuestMemory {
            bytes: Arc::new(RwLock::new(vec![0; size])),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> GuestMemory {
        GuestMemory {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, ptr: u32, len: u32, total: usize) -> WasiResult<usize> {
        let end = (ptr as u64) + (len as u64);
        if end > total as u64 {
            return Err(Error::MemoryFault { ptr, len });
        }
        Ok(ptr as usize)
    }

    pub fn read_bytes(&self, ptr: u32, len: u32) -> WasiResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let start = self.check(ptr, len, bytes.len())?;
        Ok(bytes[start..start + len as usize].to_vec())
    }

    pub fn write_bytes(&self, ptr: u32, data: &[u8]) -> WasiResult<()> {
        let mut bytes = self.bytes.write();
        let len = u32::try_from(data.len())?;
        let start = self.check(ptr, len, bytes.len())?;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u8(&self, ptr: u32) -> WasiResult<u8> {
        Ok(self.read_bytes(ptr, 1)?[0])
    }

    pub fn read_u16(&self, ptr: u32) -> WasiResult<u16> {
        let b = self.read_bytes(ptr, 2)?;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u32(&self, ptr: u32) -> WasiResult<u32> {
        let b = self.read_bytes(ptr, 4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&self, ptr: u32) -> WasiResult<u64> {
        let b = self.read_bytes(ptr, 8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn write_u8(&self, ptr: u32, value: u8) -> WasiResult<()> {
        self.write_bytes(ptr, &[value])
    }

    pub fn write_u16(&self, ptr: u32, value: u16) -> WasiResult<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, ptr: u32, value: u32) -> WasiResult<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, ptr: u32, value: u64) -> WasiResult<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Decode a guest path argument: `path_len` bytes of UTF-8, not
    /// NUL-terminated.
    pub fn read_string(&self, ptr: u32, len: u32) -> WasiResult<String> {
        let bytes = self.read_bytes(ptr, len)?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Decode an `iovec`/`ciovec` array.
    pub fn read_iovecs(&self, ptr: u32, count: u32) -> WasiResult<Vec<Iovec>> {
        let mut iovs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let base = ptr
                .checked_add(i.checked_mul(Iovec::SIZE).ok_or_else(Error::inval)?)
                .ok_or_else(Error::inval)?;
            iovs.push(Iovec {
                buf: self.read_u32(base)?,
                buf_len: self.read_u32(base + 4)?,
            });
        }
        Ok(iovs)
    }

    /// Gather the bytes described by a ciovec array, in order.
    pub fn gather(&self, iovs: &[Iovec]) -> WasiResult<Vec<u8>> {
        let mut out = Vec::new();
        for iov in iovs {
            out.extend_from_slice(&self.read_bytes(iov.buf, iov.buf_len)?);
        }
        Ok(out)
    }

    /// Scatter `data` across an iovec array, filling each buffer in turn.
    /// Returns the number of bytes written.
    pub fn scatter(&self, iovs: &[Iovec], data: &[u8]) -> WasiResult<u32> {
        let mut offset = 0usize;
        for iov in iovs {
            if offset == data.len() {
                break;
            }
            let take = std::cmp::min(iov.buf_len as usize, data.len() - offset);
            self.write_bytes(iov.buf, &data[offset..offset + take])?;
            offset += take;
        }
        Ok(offset as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn little_endian_round_trip() {
        let mem = GuestMemory::new(64);
        mem.write_u32(0, 0xdeadbeef).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), 0xdeadbeef);
        assert_eq!(mem.read_u8(0).unwrap(), 0xef);
        mem.write_u64(8, u64::MAX - 1).unwrap();
        assert_eq!(mem.read_u64(8).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn out_of_bounds_is_fault() {
        let mem = GuestMemory::new(8);
        let err = mem.read_u32(6).unwrap_err();
        assert!(matches!(err, Error::MemoryFault { .. }));
        assert!(mem.write_bytes(7, &[0, 0]).is_err());
    }

    #[test]
    fn scatter_fills_iovecs_in_order() {
        let mem = GuestMemory::new(32);
        let iovs = [
            Iovec { buf: 0, buf_len: 3 },
            Iovec { buf: 8, buf_len: 8 },
        ];
        let n = mem.scatter(&iovs, b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(mem.read_bytes(0, 3).unwrap(), b"hel");
        assert_eq!(mem.read_bytes(8, 2).unwrap(), b"lo");
    }

    #[test]
    fn gather_concatenates() {
        let mem = GuestMemory::new(32);
        mem.write_bytes(0, b"ab").unwrap();
        mem.write_bytes(16, b"cd").unwrap();
        let iovs = [
            Iovec { buf: 0, buf_len: 2 },
            Iovec {
                buf: 16,
                buf_len: 2,
            },
        ];
        assert_eq!(mem.gather(&iovs).unwrap(), b"abcd");
    }
}
