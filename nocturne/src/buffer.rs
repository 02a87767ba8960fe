//! Growable byte buffer with separate read/write cursors and scatter reads.
//!
//! The readable region is `[read_pos, write_pos)`, the writable region is
//! `[write_pos, capacity)`, and `[0, read_pos)` is reclaimable. On a space
//! shortage the buffer first compacts the readable region to offset 0 and
//! only grows when compaction is still insufficient.

use std::io;
use std::os::unix::io::RawFd;

const INIT_SIZE: usize = 1024;
const SPILL_SIZE: usize = 65535;

pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INIT_SIZE)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0; cap],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes available to read.
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes of space left after the write cursor.
    pub fn writable(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Reclaimable bytes in front of the read cursor.
    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    /// View of the readable region. Valid until the next mutation.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `len` bytes.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable());
        self.read_pos += len.min(self.readable());
    }

    /// Advance the read cursor to the absolute position `pos`.
    pub fn retrieve_until(&mut self, pos: usize) {
        debug_assert!(pos >= self.read_pos && pos <= self.write_pos);
        self.read_pos = pos.clamp(self.read_pos, self.write_pos);
    }

    /// Reset both cursors.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Drain the readable region into an owned string (lossy).
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Append bytes, compacting or growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// The absolute position of the read cursor, for `retrieve_until`.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable() >= len);
    }

    /// Reclaim the prefix first; grow only when compaction is not enough.
    fn make_space(&mut self, len: usize) {
        let readable = self.readable();
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.read_pos = 0;
        self.write_pos = readable;
        if self.writable() < len {
            self.data.resize(self.write_pos + len + 1, 0);
        }
    }

    /// One scatter read from `fd`: vector 0 is the writable region, vector 1
    /// a stack spill buffer, so a single syscall can drain the socket without
    /// pre-sizing the heap buffer. `Ok(0)` is EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut spill = [0u8; SPILL_SIZE];
        let writable = self.writable();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.write_pos) } as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: spill.as_mut_ptr() as *mut libc::c_void,
                iov_len: spill.len(),
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&spill[..n - writable]);
        }
        Ok(n)
    }

    /// One plain write of the readable region to `fd`.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable();
        let n = unsafe {
            libc::write(
                fd,
                self.data.as_ptr().add(self.read_pos) as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pos += n as usize;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
