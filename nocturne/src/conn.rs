//! Per-connection state and I/O.
//!
//! A connection owns its two buffers and the request/response state. The
//! reactor observes readiness and hands the connection to a worker; the
//! one-shot arming guarantees at most one outstanding task per fd, and the
//! surrounding `Mutex` plus the idempotent `close` make the remaining
//! timeout-vs-worker race benign.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nocturne_mysql::SqlPool;
use tracing::info;

use crate::buffer::Buffer;
use crate::request::{HttpRequest, ParseOutcome};
use crate::response::HttpResponse;

/// State shared by every connection: document root, trigger mode for the
/// connection side, the live-connection counter, and the database pool.
pub struct ConnContext {
    pub src_dir: PathBuf,
    pub is_et: bool,
    pub user_count: AtomicUsize,
    pub db: SqlPool,
}

impl ConnContext {
    pub fn new(src_dir: PathBuf, is_et: bool, db: SqlPool) -> Self {
        Self {
            src_dir,
            is_et,
            user_count: AtomicUsize::new(0),
            db,
        }
    }
}

pub struct HttpConn {
    fd: RawFd,
    addr: Option<SocketAddr>,
    is_close: bool,
    /// Body bytes of the mapped file already written out.
    file_written: usize,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    ctx: Arc<ConnContext>,
}

impl HttpConn {
    pub fn new(ctx: Arc<ConnContext>) -> Self {
        Self {
            fd: -1,
            addr: None,
            is_close: true,
            file_written: 0,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            ctx,
        }
    }

    /// Take ownership of a freshly accepted socket.
    pub fn init(&mut self, fd: RawFd, addr: SocketAddr) {
        debug_assert!(fd > 0);
        self.fd = fd;
        self.addr = Some(addr);
        self.is_close = false;
        self.file_written = 0;
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        self.request.init();
        self.response.unmap_file();
        let count = self.ctx.user_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!("client[{}] from {} in, {} online", fd, addr, count);
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.is_close
    }

    /// Release the fd and the file mapping. Safe to call twice.
    pub fn close(&mut self) {
        if self.is_close {
            return;
        }
        self.is_close = true;
        self.response.unmap_file();
        unsafe {
            libc::close(self.fd);
        }
        let count = self.ctx.user_count.fetch_sub(1, Ordering::Relaxed) - 1;
        info!("client[{}] quit, {} online", self.fd, count);
    }

    /// The keep-alive decision latched into the response at build time (the
    /// request itself is reset once the response drains).
    pub fn is_keep_alive(&self) -> bool {
        self.response.is_keep_alive()
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Bytes still owed to the socket: headers remainder + file remainder.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + (self.response.file_len() - self.file_written)
    }

    /// Drain the socket into the input buffer. Loops until EAGAIN under
    /// edge-triggering; one scatter read otherwise. `Ok(0)` is EOF.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(0);
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !self.ctx.is_et {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Parse whatever is buffered; on a complete (or completely malformed)
    /// request, build the response and return true (ready to write).
    pub fn process(&mut self) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }
        match self.request.parse(&mut self.read_buf, &self.ctx.db) {
            ParseOutcome::Complete => {
                self.response.init(
                    &self.ctx.src_dir,
                    self.request.path(),
                    self.request.is_keep_alive(),
                    200,
                );
            }
            ParseOutcome::Incomplete => return false,
            ParseOutcome::Error => {
                self.response
                    .init(&self.ctx.src_dir, self.request.path(), false, 400);
            }
        }
        self.write_buf.retrieve_all();
        self.file_written = 0;
        self.response.make_response(&mut self.write_buf);
        true
    }

    /// Scatter-write the pending response: vector 0 is the header bytes in
    /// the output buffer, vector 1 the remainder of the mapped file. Loops
    /// under edge-triggering (and for large responses) until EAGAIN or done.
    /// On full drain the file is unmapped and, for keep-alive, the parser
    /// and output buffer are reset for the next request.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let n = self.writev_once()?;
            total += n;
            if self.to_write_bytes() == 0 || n == 0 {
                break;
            }
            if !self.ctx.is_et && self.to_write_bytes() <= 10240 {
                break;
            }
        }
        if self.to_write_bytes() == 0 {
            self.response.unmap_file();
            self.file_written = 0;
            if self.response.is_keep_alive() {
                self.request.init();
                self.write_buf.retrieve_all();
            }
        }
        Ok(total)
    }

    fn writev_once(&mut self) -> io::Result<usize> {
        let head = self.write_buf.peek();
        let head_ptr = head.as_ptr();
        let head_len = head.len();

        let (file_ptr, file_len) = match self.response.file() {
            Some(map) => {
                let rest = &map.as_slice()[self.file_written..];
                (rest.as_ptr(), rest.len())
            }
            None => (std::ptr::NonNull::<u8>::dangling().as_ptr() as *const u8, 0),
        };

        let iov = [
            libc::iovec {
                iov_base: head_ptr as *mut libc::c_void,
                iov_len: head_len,
            },
            libc::iovec {
                iov_base: file_ptr as *mut libc::c_void,
                iov_len: file_len,
            },
        ];

        let n = unsafe { libc::writev(self.fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;

        // The header vector drains before the file vector.
        if n > head_len {
            self.file_written += n - head_len;
            self.write_buf.retrieve_all();
        } else {
            self.write_buf.retrieve(n);
        }
        Ok(n)
    }
}
